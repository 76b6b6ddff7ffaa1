//! Coordinator error types.
//!
//! Structured error handling for the coordinator core using `thiserror`.
//!
//! # Error Categories
//!
//! - **Session errors**: unknown xid, closed global, lock conflicts
//! - **Branch errors**: retryable and unretryable phase-two failures
//! - **Store errors**: session-store backend failures
//! - **Consensus errors**: propose/apply failures, non-leader writes
//! - **Codec errors**: JSON / binary encoding failures

use std::io;

use thiserror::Error;

use crate::common::BranchId;
use crate::session::{BranchStatus, GlobalStatus};

/// Result type alias for coordinator operations.
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// Error type for coordinator operations.
///
/// Capability-level branch failures are absorbed by the state machine on the
/// first attempt (the retry queues are the recovery path); store and
/// consensus errors propagate to the caller.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Operation references an unknown global transaction.
    #[error("global transaction '{0}' does not exist")]
    TransactionNotExist(String),

    /// Branch registration against a global closed to new branches.
    #[error("global transaction '{xid}' is not active in status {status:?}")]
    GlobalTransactionNotActive { xid: String, status: GlobalStatus },

    /// Operation references a branch its global does not own.
    #[error("branch {branch_id} of global transaction '{xid}' does not exist")]
    BranchNotExist { xid: String, branch_id: BranchId },

    /// The lock capability refused the branch's lock keys.
    #[error("lock conflict on resource '{resource_id}' for global transaction '{xid}'")]
    LockConflict { xid: String, resource_id: String },

    /// A branch capability call failed in a retryable way.
    #[error("branch {branch_id} of '{xid}' failed: {reason}")]
    BranchExecution {
        xid: String,
        branch_id: BranchId,
        reason: String,
    },

    /// A branch capability returned an unretryable status.
    #[error("branch {branch_id} of '{xid}' failed unretryably with {status:?}")]
    UnretryableFailure {
        xid: String,
        branch_id: BranchId,
        status: BranchStatus,
    },

    /// Session store failure; the caller must not assume the write took effect.
    #[error("session store error: {0}")]
    Store(String),

    /// Consensus propose/apply failure; the entry must not be treated as applied.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// A replicated-mode write was attempted on a non-leader node.
    #[error("not the consensus leader")]
    NotLeader,

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O failure (snapshot files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Creates a transaction-not-exist error.
    pub fn not_exist(xid: impl Into<String>) -> Self {
        CoordinatorError::TransactionNotExist(xid.into())
    }

    /// Creates a not-active error.
    pub fn not_active(xid: impl Into<String>, status: GlobalStatus) -> Self {
        CoordinatorError::GlobalTransactionNotActive {
            xid: xid.into(),
            status,
        }
    }

    /// Creates a lock conflict error.
    pub fn lock_conflict(xid: impl Into<String>, resource_id: impl Into<String>) -> Self {
        CoordinatorError::LockConflict {
            xid: xid.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Creates a branch execution error.
    pub fn branch_execution(
        xid: impl Into<String>,
        branch_id: BranchId,
        reason: impl Into<String>,
    ) -> Self {
        CoordinatorError::BranchExecution {
            xid: xid.into(),
            branch_id,
            reason: reason.into(),
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        CoordinatorError::Store(message.into())
    }

    /// Creates a consensus error.
    pub fn consensus(message: impl Into<String>) -> Self {
        CoordinatorError::Consensus(message.into())
    }

    /// Returns true if the retry sweepers are expected to recover from this.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoordinatorError::BranchExecution { .. })
    }

    /// Returns the xid this error is associated with, if any.
    pub fn xid(&self) -> Option<&str> {
        match self {
            CoordinatorError::TransactionNotExist(xid) => Some(xid),
            CoordinatorError::GlobalTransactionNotActive { xid, .. } => Some(xid),
            CoordinatorError::BranchNotExist { xid, .. } => Some(xid),
            CoordinatorError::LockConflict { xid, .. } => Some(xid),
            CoordinatorError::BranchExecution { xid, .. } => Some(xid),
            CoordinatorError::UnretryableFailure { xid, .. } => Some(xid),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for CoordinatorError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoordinatorError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

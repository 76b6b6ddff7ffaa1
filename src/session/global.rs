// Global sessions and their persisted forms.

use serde::{Deserialize, Serialize};

use crate::common::{now_millis, BranchId, TransactionId};
use crate::error::{CoordinatorError, CoordinatorResult};

use super::branch::BranchSession;
use super::types::GlobalStatus;

/// One global transaction on this coordinator.
///
/// # Invariants
///
/// - Branches are owned by exactly one global; deleting the global deletes
///   all of them.
/// - While `active` is true new branches may register; once false,
///   registration must fail.
/// - Branch order is registration order; it defines commit order and its
///   reverse defines rollback order.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSession {
    pub xid: String,
    pub transaction_id: TransactionId,
    pub application_id: String,
    pub transaction_service_group: String,
    pub transaction_name: String,
    pub timeout_ms: i32,
    /// Epoch milliseconds at `begin`.
    pub begin_time: i64,
    pub application_data: Option<String>,
    pub status: GlobalStatus,
    /// False once the session is closed to new branch registrations.
    pub active: bool,
    branches: Vec<BranchSession>,
}

impl GlobalSession {
    /// Creates a session in status `Begin`, open to registration.
    pub fn new(
        xid: impl Into<String>,
        transaction_id: TransactionId,
        application_id: impl Into<String>,
        transaction_service_group: impl Into<String>,
        transaction_name: impl Into<String>,
        timeout_ms: i32,
    ) -> Self {
        Self {
            xid: xid.into(),
            transaction_id,
            application_id: application_id.into(),
            transaction_service_group: transaction_service_group.into(),
            transaction_name: transaction_name.into(),
            timeout_ms,
            begin_time: now_millis(),
            application_data: None,
            status: GlobalStatus::Begin,
            active: true,
            branches: Vec::new(),
        }
    }

    /// Branches in registration order.
    pub fn branches(&self) -> &[BranchSession] {
        &self.branches
    }

    /// Looks up a branch by id.
    pub fn branch(&self, branch_id: BranchId) -> Option<&BranchSession> {
        self.branches.iter().find(|b| b.branch_id == branch_id)
    }

    /// Looks up a branch by id, mutably.
    pub fn branch_mut(&mut self, branch_id: BranchId) -> Option<&mut BranchSession> {
        self.branches.iter_mut().find(|b| b.branch_id == branch_id)
    }

    /// Appends a branch, or replaces it in place if the id is already
    /// present (replayed log entries must not duplicate branches).
    pub fn add_branch(&mut self, branch: BranchSession) {
        match self.branch_mut(branch.branch_id) {
            Some(existing) => *existing = branch,
            None => self.branches.push(branch),
        }
    }

    /// Removes a branch by id, returning it.
    pub fn remove_branch(&mut self, branch_id: BranchId) -> Option<BranchSession> {
        let index = self.branches.iter().position(|b| b.branch_id == branch_id)?;
        Some(self.branches.remove(index))
    }

    /// Closes the session to new branch registrations.
    pub fn close(&mut self) {
        self.active = false;
    }

    /// Drops the materialized branches (reads without branches).
    pub fn clear_branches(&mut self) {
        self.branches.clear();
    }

    /// Whether phase-two commit of the whole session may be deferred to the
    /// async sweeper. A session with no branches commits synchronously (and
    /// trivially), so it does not qualify.
    pub fn can_be_committed_async(&self) -> bool {
        !self.branches.is_empty() && self.branches.iter().all(|b| b.can_be_committed_async())
    }

    /// Whether the session has outlived its timeout.
    pub fn is_timed_out(&self) -> bool {
        now_millis() - self.begin_time > i64::from(self.timeout_ms)
    }

    /// Binary form used by consensus entries and snapshots. Branches are
    /// stored flat beside their globals and are not part of this encoding.
    pub fn encode(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(
            GlobalTransactionDo::from_session(self),
            bincode::config::standard(),
        )?)
    }

    /// Inverse of [`encode`](Self::encode); yields a session with no branches.
    pub fn decode(bytes: &[u8]) -> CoordinatorResult<Self> {
        let (stored, _): (GlobalTransactionDo, _) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        stored.into_session()
    }
}

/// Stored value of a global session in the key-value backend.
///
/// Field names and the integer status code are the JSON contract shared with
/// existing deployments.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTransactionDo {
    pub xid: String,
    pub transaction_id: TransactionId,
    pub status: i32,
    pub application_id: String,
    pub begin_time: i64,
    pub timeout: i32,
    pub transaction_name: String,
    pub transaction_service_group: String,
    pub application_data: Option<String>,
}

impl GlobalTransactionDo {
    /// Builds the stored value from a live session.
    pub fn from_session(session: &GlobalSession) -> Self {
        Self {
            xid: session.xid.clone(),
            transaction_id: session.transaction_id,
            status: session.status.code(),
            application_id: session.application_id.clone(),
            begin_time: session.begin_time,
            timeout: session.timeout_ms,
            transaction_name: session.transaction_name.clone(),
            transaction_service_group: session.transaction_service_group.clone(),
            application_data: session.application_data.clone(),
        }
    }

    /// Rebuilds a session (with no branches) from the stored value.
    ///
    /// Stored sessions are never in `Begin`-only volatile state that would
    /// make them unregisterable; `active` is derived from the status: only a
    /// `Begin` session is open to registration.
    pub fn into_session(self) -> CoordinatorResult<GlobalSession> {
        let status = GlobalStatus::from_code(self.status).ok_or_else(|| {
            CoordinatorError::Serialization(format!("unknown global status code {}", self.status))
        })?;
        Ok(GlobalSession {
            xid: self.xid,
            transaction_id: self.transaction_id,
            application_id: self.application_id,
            transaction_service_group: self.transaction_service_group,
            transaction_name: self.transaction_name,
            timeout_ms: self.timeout,
            begin_time: self.begin_time,
            application_data: self.application_data,
            status,
            active: status == GlobalStatus::Begin,
            branches: Vec::new(),
        })
    }
}

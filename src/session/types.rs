// Status and branch-type enums.
//
// The integer codes are part of the stored-value contract shared with
// existing deployments and must not change.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a global transaction.
///
/// `Begin` is the only status that may transition directly into the
/// phase-two statuses; the terminal statuses are sinks.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum GlobalStatus {
    /// Open to branch registration, phase one running.
    Begin,
    /// Synchronous phase-two commit in progress.
    Committing,
    /// Commit hit a retryable branch failure; queued for the retry sweeper.
    CommitRetrying,
    /// All branches support deferred commit; queued for the async sweeper.
    AsyncCommitting,
    /// Phase-two commit finished on every branch.
    Committed,
    /// A branch failed commit unretryably.
    CommitFailed,
    /// Synchronous phase-two rollback in progress.
    Rollbacking,
    /// Rollback hit a retryable branch failure; queued for the retry sweeper.
    RollbackRetrying,
    /// Rollback driven by the timeout sweeper.
    TimeoutRollbacking,
    /// Timeout rollback queued for the retry sweeper.
    TimeoutRollbackRetrying,
    /// Phase-two rollback finished on every branch.
    Rollbacked,
    /// A branch failed rollback unretryably.
    RollbackFailed,
    /// Session is gone; also reported for unknown xids.
    Finished,
}

impl GlobalStatus {
    /// Stable wire code of this status.
    pub fn code(&self) -> i32 {
        match self {
            GlobalStatus::Begin => 1,
            GlobalStatus::Committing => 2,
            GlobalStatus::CommitRetrying => 3,
            GlobalStatus::Rollbacking => 4,
            GlobalStatus::RollbackRetrying => 5,
            GlobalStatus::TimeoutRollbacking => 6,
            GlobalStatus::TimeoutRollbackRetrying => 7,
            GlobalStatus::AsyncCommitting => 8,
            GlobalStatus::Committed => 9,
            GlobalStatus::CommitFailed => 10,
            GlobalStatus::Rollbacked => 11,
            GlobalStatus::RollbackFailed => 12,
            GlobalStatus::Finished => 15,
        }
    }

    /// Resolves a stable wire code back to a status.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(GlobalStatus::Begin),
            2 => Some(GlobalStatus::Committing),
            3 => Some(GlobalStatus::CommitRetrying),
            4 => Some(GlobalStatus::Rollbacking),
            5 => Some(GlobalStatus::RollbackRetrying),
            6 => Some(GlobalStatus::TimeoutRollbacking),
            7 => Some(GlobalStatus::TimeoutRollbackRetrying),
            8 => Some(GlobalStatus::AsyncCommitting),
            9 => Some(GlobalStatus::Committed),
            10 => Some(GlobalStatus::CommitFailed),
            11 => Some(GlobalStatus::Rollbacked),
            12 => Some(GlobalStatus::RollbackFailed),
            15 => Some(GlobalStatus::Finished),
            _ => None,
        }
    }

    /// Returns true for sink statuses with no outgoing transitions.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Committed
                | GlobalStatus::Rollbacked
                | GlobalStatus::CommitFailed
                | GlobalStatus::RollbackFailed
                | GlobalStatus::Finished
        )
    }

    /// Returns true for the rollback statuses a new leader must resume.
    #[inline]
    pub fn is_rollback_in_flight(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Rollbacking
                | GlobalStatus::RollbackRetrying
                | GlobalStatus::TimeoutRollbacking
                | GlobalStatus::TimeoutRollbackRetrying
        )
    }

    /// Returns true while the session is driven by the timeout sweeper.
    #[inline]
    pub fn is_timeout_rollback(&self) -> bool {
        matches!(
            self,
            GlobalStatus::TimeoutRollbacking | GlobalStatus::TimeoutRollbackRetrying
        )
    }
}

/// Lifecycle status of a branch session.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum BranchStatus {
    /// Enlisted under its global, phase one not yet reported.
    Registered,
    /// Phase-one work finished on the resource manager.
    PhaseOneDone,
    /// Phase-one work failed; the branch never took effect.
    PhaseOneFailed,
    /// Phase-two commit finished.
    PhaseTwoCommitted,
    /// Phase-two commit failed but may be retried.
    PhaseTwoCommitFailedRetryable,
    /// Phase-two commit failed permanently.
    PhaseTwoCommitFailedUnretryable,
    /// Phase-two rollback finished.
    PhaseTwoRollbacked,
    /// Phase-two rollback failed but may be retried.
    PhaseTwoRollbackFailedRetryable,
    /// Phase-two rollback failed permanently.
    PhaseTwoRollbackFailedUnretryable,
}

impl BranchStatus {
    /// Stable wire code of this status.
    pub fn code(&self) -> i32 {
        match self {
            BranchStatus::Registered => 1,
            BranchStatus::PhaseOneDone => 2,
            BranchStatus::PhaseOneFailed => 3,
            BranchStatus::PhaseTwoCommitted => 5,
            BranchStatus::PhaseTwoCommitFailedRetryable => 6,
            BranchStatus::PhaseTwoCommitFailedUnretryable => 7,
            BranchStatus::PhaseTwoRollbacked => 8,
            BranchStatus::PhaseTwoRollbackFailedRetryable => 9,
            BranchStatus::PhaseTwoRollbackFailedUnretryable => 10,
        }
    }

    /// Resolves a stable wire code back to a status.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(BranchStatus::Registered),
            2 => Some(BranchStatus::PhaseOneDone),
            3 => Some(BranchStatus::PhaseOneFailed),
            5 => Some(BranchStatus::PhaseTwoCommitted),
            6 => Some(BranchStatus::PhaseTwoCommitFailedRetryable),
            7 => Some(BranchStatus::PhaseTwoCommitFailedUnretryable),
            8 => Some(BranchStatus::PhaseTwoRollbacked),
            9 => Some(BranchStatus::PhaseTwoRollbackFailedRetryable),
            10 => Some(BranchStatus::PhaseTwoRollbackFailedUnretryable),
            _ => None,
        }
    }
}

/// Protocol governing a branch.
///
/// The coordinator treats the two-phase types uniformly; the distinction
/// matters only for the async-commit capability.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum BranchType {
    /// Automatic (undo-log) branches; phase-two commit is idempotent and
    /// may be deferred.
    At,
    /// Try-confirm-cancel branches.
    Tcc,
    /// XA protocol branches.
    Xa,
}

impl BranchType {
    /// Stored string form of this branch type.
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchType::At => "AT",
            BranchType::Tcc => "TCC",
            BranchType::Xa => "XA",
        }
    }

    /// Resolves a stored string form back to a branch type.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AT" => Some(BranchType::At),
            "TCC" => Some(BranchType::Tcc),
            "XA" => Some(BranchType::Xa),
            _ => None,
        }
    }

    /// Whether phase-two commit of this branch type may be deferred to the
    /// async sweeper.
    #[inline]
    pub fn can_be_committed_async(&self) -> bool {
        matches!(self, BranchType::At)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_status_codes_round_trip() {
        for status in [
            GlobalStatus::Begin,
            GlobalStatus::Committing,
            GlobalStatus::CommitRetrying,
            GlobalStatus::AsyncCommitting,
            GlobalStatus::Committed,
            GlobalStatus::CommitFailed,
            GlobalStatus::Rollbacking,
            GlobalStatus::RollbackRetrying,
            GlobalStatus::TimeoutRollbacking,
            GlobalStatus::TimeoutRollbackRetrying,
            GlobalStatus::Rollbacked,
            GlobalStatus::RollbackFailed,
            GlobalStatus::Finished,
        ] {
            assert_eq!(GlobalStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_global_status_wire_codes_stable() {
        assert_eq!(GlobalStatus::Begin.code(), 1);
        assert_eq!(GlobalStatus::AsyncCommitting.code(), 8);
        assert_eq!(GlobalStatus::Committed.code(), 9);
        assert_eq!(GlobalStatus::Rollbacked.code(), 11);
        assert_eq!(GlobalStatus::Finished.code(), 15);
    }

    #[test]
    fn test_terminal_statuses_are_sinks() {
        assert!(GlobalStatus::Committed.is_terminal());
        assert!(GlobalStatus::Rollbacked.is_terminal());
        assert!(GlobalStatus::CommitFailed.is_terminal());
        assert!(GlobalStatus::RollbackFailed.is_terminal());
        assert!(GlobalStatus::Finished.is_terminal());
        assert!(!GlobalStatus::Begin.is_terminal());
        assert!(!GlobalStatus::AsyncCommitting.is_terminal());
    }

    #[test]
    fn test_rollback_in_flight_set() {
        assert!(GlobalStatus::Rollbacking.is_rollback_in_flight());
        assert!(GlobalStatus::RollbackRetrying.is_rollback_in_flight());
        assert!(GlobalStatus::TimeoutRollbacking.is_rollback_in_flight());
        assert!(GlobalStatus::TimeoutRollbackRetrying.is_rollback_in_flight());
        assert!(!GlobalStatus::Committing.is_rollback_in_flight());
        assert!(!GlobalStatus::Rollbacked.is_rollback_in_flight());
    }

    #[test]
    fn test_branch_status_codes_round_trip() {
        for status in [
            BranchStatus::Registered,
            BranchStatus::PhaseOneDone,
            BranchStatus::PhaseOneFailed,
            BranchStatus::PhaseTwoCommitted,
            BranchStatus::PhaseTwoCommitFailedRetryable,
            BranchStatus::PhaseTwoCommitFailedUnretryable,
            BranchStatus::PhaseTwoRollbacked,
            BranchStatus::PhaseTwoRollbackFailedRetryable,
            BranchStatus::PhaseTwoRollbackFailedUnretryable,
        ] {
            assert_eq!(BranchStatus::from_code(status.code()), Some(status));
        }
        // 4 is reserved by the shared contract and never stored by this core.
        assert_eq!(BranchStatus::from_code(4), None);
    }

    #[test]
    fn test_branch_type_strings() {
        assert_eq!(BranchType::At.as_str(), "AT");
        assert_eq!(BranchType::from_name("TCC"), Some(BranchType::Tcc));
        assert_eq!(BranchType::from_name("SAGA"), None);
    }

    #[test]
    fn test_async_commit_capability() {
        assert!(BranchType::At.can_be_committed_async());
        assert!(!BranchType::Tcc.can_be_committed_async());
        assert!(!BranchType::Xa.can_be_committed_async());
    }
}

// Session store.
//
// Two concrete backends behind one contract: a key-value store over a shared
// remote KV service, and an in-memory store replicated by a consensus log.
// The coordinator issues logical mutations against the contract; each
// backend decides how they take effect.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`kv`] | KV primitives contract and the key-value backend |
// | [`memkv`] | In-process KV used by tests and single-node deployments |
// | [`replicated`] | Consensus-replicated in-memory backend |

pub mod kv;
pub mod memkv;
pub mod replicated;

pub use kv::{KvSessionStore, KvStore};
pub use memkv::MemoryKv;
pub use replicated::{ReplicatedSessionStore, ReplicatedState, SnapshotPayload};

use crate::error::CoordinatorResult;
use crate::session::{BranchSession, BranchStatus, GlobalSession, GlobalStatus};

/// The root live set plus the three side queues swept in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionQueue {
    /// Every live session.
    Root,
    /// Sessions whose phase-two commit is deferred.
    AsyncCommitting,
    /// Sessions whose commit hit a retryable branch failure.
    RetryCommitting,
    /// Sessions whose rollback hit a retryable branch failure.
    RetryRollbacking,
}

impl SessionQueue {
    /// Name of the destination map carried in replication entries.
    pub fn name(&self) -> &'static str {
        match self {
            SessionQueue::Root => "root",
            SessionQueue::AsyncCommitting => "asyncCommitting",
            SessionQueue::RetryCommitting => "retryCommitting",
            SessionQueue::RetryRollbacking => "retryRollbacking",
        }
    }

    /// Resolves a replication entry's destination name; absent means root.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("asyncCommitting") => SessionQueue::AsyncCommitting,
            Some("retryCommitting") => SessionQueue::RetryCommitting,
            Some("retryRollbacking") => SessionQueue::RetryRollbacking,
            _ => SessionQueue::Root,
        }
    }

    /// The statuses that place a session in this queue.
    ///
    /// The KV backend has no queue sets of its own; membership is carried by
    /// the session status and queue reads are status scans.
    pub fn statuses(&self) -> &'static [GlobalStatus] {
        match self {
            SessionQueue::Root => &[
                GlobalStatus::Begin,
                GlobalStatus::Committing,
                GlobalStatus::CommitRetrying,
                GlobalStatus::AsyncCommitting,
                GlobalStatus::Rollbacking,
                GlobalStatus::RollbackRetrying,
                GlobalStatus::TimeoutRollbacking,
                GlobalStatus::TimeoutRollbackRetrying,
            ],
            SessionQueue::AsyncCommitting => &[GlobalStatus::AsyncCommitting],
            SessionQueue::RetryCommitting => &[GlobalStatus::CommitRetrying],
            SessionQueue::RetryRollbacking => &[
                GlobalStatus::Rollbacking,
                GlobalStatus::RollbackRetrying,
                GlobalStatus::TimeoutRollbacking,
                GlobalStatus::TimeoutRollbackRetrying,
            ],
        }
    }
}

/// Query condition for [`SessionStore::find_by_condition`].
///
/// `xid` takes precedence, then `transaction_id`, then `statuses`.
#[derive(Debug, Clone, Default)]
pub struct SessionCondition {
    pub xid: Option<String>,
    pub transaction_id: Option<i64>,
    pub statuses: Option<Vec<GlobalStatus>>,
}

impl SessionCondition {
    /// Condition selecting one session by xid.
    pub fn by_xid(xid: impl Into<String>) -> Self {
        Self {
            xid: Some(xid.into()),
            ..Self::default()
        }
    }

    /// Condition selecting one session by transaction id.
    pub fn by_transaction_id(transaction_id: i64) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            ..Self::default()
        }
    }

    /// Condition selecting every session in one of the given statuses.
    pub fn by_statuses(statuses: impl Into<Vec<GlobalStatus>>) -> Self {
        Self {
            statuses: Some(statuses.into()),
            ..Self::default()
        }
    }
}

/// Persistence contract of the coordinator.
///
/// All mutations refer to state the caller already updated in memory under
/// the session mutex; a failed write means the caller must not assume the
/// mutation took effect.
pub trait SessionStore: Send + Sync {
    /// Persists a freshly begun global session.
    fn add_global(&self, session: &GlobalSession) -> CoordinatorResult<()>;

    /// Persists a status transition of a global session.
    fn update_global_status(
        &self,
        session: &GlobalSession,
        status: GlobalStatus,
    ) -> CoordinatorResult<()>;

    /// Removes a global session and every record belonging to it.
    fn remove_global(&self, session: &GlobalSession) -> CoordinatorResult<()>;

    /// Persists a freshly registered branch.
    fn add_branch(
        &self,
        session: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()>;

    /// Persists a status transition of a branch.
    fn update_branch_status(
        &self,
        session: &GlobalSession,
        branch: &BranchSession,
        status: BranchStatus,
    ) -> CoordinatorResult<()>;

    /// Removes one branch of a global session.
    fn remove_branch(
        &self,
        session: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()>;

    /// Reads one global session, optionally materializing its branches.
    fn find_global(
        &self,
        xid: &str,
        with_branches: bool,
    ) -> CoordinatorResult<Option<GlobalSession>>;

    /// Reads every session whose status is in the given set, with branches.
    fn find_by_statuses(
        &self,
        statuses: &[GlobalStatus],
    ) -> CoordinatorResult<Vec<GlobalSession>>;

    /// Reads sessions matching the condition, with branches.
    fn find_by_condition(
        &self,
        condition: &SessionCondition,
    ) -> CoordinatorResult<Vec<GlobalSession>>;

    /// Adds the session to a side queue.
    fn enqueue(&self, queue: SessionQueue, session: &GlobalSession) -> CoordinatorResult<()>;

    /// Removes the session from a side queue.
    fn dequeue(&self, queue: SessionQueue, xid: &str) -> CoordinatorResult<()>;

    /// Reads the members of a queue, with branches.
    fn queue_sessions(&self, queue: SessionQueue) -> CoordinatorResult<Vec<GlobalSession>>;
}

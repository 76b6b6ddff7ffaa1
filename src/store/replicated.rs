// Consensus-replicated session store.
//
// Every replica of the group holds the same four in-memory session maps.
// On the leader, writes go through the consensus bridge and take effect
// when the log entry is applied locally; on followers they arrive through
// log apply alone. Durability comes from the log plus periodic snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::common::BranchId;
use crate::error::CoordinatorResult;
use crate::integration::LockCapability;
use crate::replication::consensus::{ConsensusService, SessionSyncProposer};
use crate::replication::message::{PhaseTwoDo, SessionSyncMessage};
use crate::session::{BranchSession, BranchStatus, GlobalSession, GlobalStatus};

use super::{SessionCondition, SessionQueue, SessionStore};

/// Serialized form of the replicated state, written as the snapshot file.
///
/// Globals are keyed by xid; branches are stored flat, keyed by branch id,
/// and reattached to their owning global at load time.
#[derive(Debug, bincode::Encode, bincode::Decode)]
pub struct SnapshotPayload {
    pub root_sessions: HashMap<String, Vec<u8>>,
    pub branch_sessions: HashMap<BranchId, Vec<u8>>,
}

/// The in-memory session maps of one replica.
///
/// All mutation goes through the `apply_*` handlers, which are driven by
/// log apply and are idempotent: adding an existing id updates it, removing
/// a missing id is a no-op, and a status update to the current status
/// changes nothing. Replaying any log suffix therefore converges to the
/// same state.
pub struct ReplicatedState {
    root: DashMap<String, GlobalSession>,
    async_committing: DashMap<String, GlobalSession>,
    retry_committing: DashMap<String, GlobalSession>,
    retry_rollbacking: DashMap<String, GlobalSession>,
}

impl ReplicatedState {
    /// Creates empty session maps.
    pub fn new() -> Self {
        Self {
            root: DashMap::new(),
            async_committing: DashMap::new(),
            retry_committing: DashMap::new(),
            retry_rollbacking: DashMap::new(),
        }
    }

    fn map(&self, queue: SessionQueue) -> &DashMap<String, GlobalSession> {
        match queue {
            SessionQueue::Root => &self.root,
            SessionQueue::AsyncCommitting => &self.async_committing,
            SessionQueue::RetryCommitting => &self.retry_committing,
            SessionQueue::RetryRollbacking => &self.retry_rollbacking,
        }
    }

    // ------------------------------------------------------------------
    // Apply handlers
    // ------------------------------------------------------------------

    /// Inserts a session into the named map, or updates it in place.
    /// Branches already attached to a root entry survive the update.
    pub fn apply_add_global(&self, queue: SessionQueue, session: GlobalSession) {
        let map = self.map(queue);
        match map.get_mut(&session.xid) {
            Some(mut existing) => {
                existing.status = session.status;
                existing.active = session.active;
                existing.timeout_ms = session.timeout_ms;
                existing.application_data = session.application_data;
            }
            None => {
                map.insert(session.xid.clone(), session);
            }
        }
    }

    pub fn apply_update_global_status(&self, xid: &str, status: GlobalStatus) {
        if let Some(mut session) = self.root.get_mut(xid) {
            if session.status != status {
                session.status = status;
                if status != GlobalStatus::Begin {
                    session.active = false;
                }
            }
        }
    }

    pub fn apply_remove_global(&self, queue: SessionQueue, xid: &str) {
        self.map(queue).remove(xid);
    }

    pub fn apply_add_branch(&self, branch: BranchSession) {
        match self.root.get_mut(&branch.xid) {
            Some(mut session) => session.add_branch(branch),
            None => warn!(
                xid = %branch.xid,
                branch_id = branch.branch_id,
                "branch apply references an unknown global; entry dropped"
            ),
        }
    }

    pub fn apply_update_branch_status(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) {
        if let Some(mut session) = self.root.get_mut(xid) {
            if let Some(branch) = session.branch_mut(branch_id) {
                branch.status = status;
            }
        }
    }

    pub fn apply_remove_branch(&self, xid: &str, branch_id: BranchId) {
        if let Some(mut session) = self.root.get_mut(xid) {
            session.remove_branch(branch_id);
        }
    }

    /// Applies a phase-two outcome observed on the leader: the terminal
    /// branch statuses and the resulting global status.
    pub fn apply_phase_two(&self, outcome: &PhaseTwoDo) {
        if let Some(mut session) = self.root.get_mut(&outcome.xid) {
            for (branch_id, status) in &outcome.branch_statuses {
                if let Some(branch) = session.branch_mut(*branch_id) {
                    branch.status = *status;
                }
            }
            session.status = outcome.status;
            session.active = false;
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn find_global(&self, xid: &str, with_branches: bool) -> Option<GlobalSession> {
        let mut session = self.root.get(xid)?.clone();
        if !with_branches {
            session.clear_branches();
        }
        Some(session)
    }

    pub fn find_by_statuses(&self, statuses: &[GlobalStatus]) -> Vec<GlobalSession> {
        self.root
            .iter()
            .filter(|entry| statuses.contains(&entry.value().status))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn find_by_transaction_id(&self, transaction_id: i64) -> Option<GlobalSession> {
        self.root
            .iter()
            .find(|entry| entry.value().transaction_id == transaction_id)
            .map(|entry| entry.value().clone())
    }

    /// Queue members. Side-queue entries are materialized from the root map
    /// so the caller always sees the branches.
    pub fn queue_sessions(&self, queue: SessionQueue) -> Vec<GlobalSession> {
        match queue {
            SessionQueue::Root => self.root.iter().map(|entry| entry.value().clone()).collect(),
            side => self
                .map(side)
                .iter()
                .map(|entry| {
                    self.root
                        .get(entry.key())
                        .map(|root| root.value().clone())
                        .unwrap_or_else(|| entry.value().clone())
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Leader handover and snapshots
    // ------------------------------------------------------------------

    /// Re-inserts every in-flight rollback into the retry-rollbacking map so
    /// the sweeper resumes it. Called when this node becomes leader.
    pub fn reinsert_in_flight_rollbacks(&self) -> usize {
        let mut count = 0;
        for entry in self.root.iter() {
            if entry.value().status.is_rollback_in_flight() {
                self.retry_rollbacking
                    .insert(entry.key().clone(), entry.value().clone());
                count += 1;
            }
        }
        count
    }

    /// Consistent serialized copy of the state, taken synchronously.
    pub fn snapshot_payload(&self) -> CoordinatorResult<SnapshotPayload> {
        let mut root_sessions = HashMap::new();
        let mut branch_sessions = HashMap::new();
        for entry in self.root.iter() {
            let session = entry.value();
            root_sessions.insert(session.xid.clone(), session.encode()?);
            for branch in session.branches() {
                branch_sessions.insert(branch.branch_id, branch.encode()?);
            }
        }
        Ok(SnapshotPayload {
            root_sessions,
            branch_sessions,
        })
    }

    /// Rebuilds the maps from a snapshot.
    ///
    /// Branch locks are re-acquired through the lock capability; a failure
    /// is logged and restoration continues, leaving the transaction to fail
    /// later lock checks instead of blocking the whole load.
    pub fn restore(
        &self,
        payload: SnapshotPayload,
        locks: &dyn LockCapability,
    ) -> CoordinatorResult<()> {
        self.root.clear();
        self.async_committing.clear();
        self.retry_committing.clear();
        self.retry_rollbacking.clear();

        for encoded in payload.root_sessions.values() {
            let session = GlobalSession::decode(encoded)?;
            self.root.insert(session.xid.clone(), session);
        }

        // Branch ids are handed out monotonically, so ordering by id
        // restores registration order within each global.
        let mut branches: Vec<BranchSession> = Vec::with_capacity(payload.branch_sessions.len());
        for encoded in payload.branch_sessions.values() {
            branches.push(BranchSession::decode(encoded)?);
        }
        branches.sort_by_key(|branch| branch.branch_id);

        for branch in branches {
            match locks.acquire(&branch) {
                Ok(true) => {}
                Ok(false) => warn!(
                    xid = %branch.xid,
                    branch_id = branch.branch_id,
                    "failed to restore lock: conflict"
                ),
                Err(err) => warn!(
                    xid = %branch.xid,
                    branch_id = branch.branch_id,
                    error = %err,
                    "failed to restore lock"
                ),
            }
            self.apply_add_branch(branch);
        }

        for entry in self.root.iter() {
            let session = entry.value();
            match session.status {
                GlobalStatus::AsyncCommitting => {
                    self.async_committing
                        .insert(session.xid.clone(), session.clone());
                }
                GlobalStatus::CommitRetrying => {
                    self.retry_committing
                        .insert(session.xid.clone(), session.clone());
                }
                GlobalStatus::RollbackRetrying | GlobalStatus::TimeoutRollbackRetrying => {
                    self.retry_rollbacking
                        .insert(session.xid.clone(), session.clone());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for ReplicatedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Leader-side session store: every mutation is proposed to the consensus
/// log and takes effect through local apply; reads come from the maps.
pub struct ReplicatedSessionStore {
    state: Arc<ReplicatedState>,
    proposer: SessionSyncProposer,
}

impl ReplicatedSessionStore {
    pub fn new(state: Arc<ReplicatedState>, service: Arc<dyn ConsensusService>) -> Self {
        Self {
            state,
            proposer: SessionSyncProposer::new(service),
        }
    }

    /// The replica state backing this store.
    pub fn state(&self) -> &Arc<ReplicatedState> {
        &self.state
    }
}

impl SessionStore for ReplicatedSessionStore {
    fn add_global(&self, session: &GlobalSession) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::add_global(SessionQueue::Root, session)?)
    }

    fn update_global_status(
        &self,
        session: &GlobalSession,
        status: GlobalStatus,
    ) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::update_global_status(&session.xid, status)?)
    }

    fn remove_global(&self, session: &GlobalSession) -> CoordinatorResult<()> {
        self.proposer.propose_sync(&SessionSyncMessage::remove_global(
            SessionQueue::Root,
            &session.xid,
        )?)
    }

    fn add_branch(
        &self,
        _session: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::add_branch(branch)?)
    }

    fn update_branch_status(
        &self,
        session: &GlobalSession,
        branch: &BranchSession,
        status: BranchStatus,
    ) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::update_branch_status(
                &session.xid,
                branch.branch_id,
                status,
            )?)
    }

    fn remove_branch(
        &self,
        session: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::remove_branch(
                &session.xid,
                branch.branch_id,
            )?)
    }

    fn find_global(
        &self,
        xid: &str,
        with_branches: bool,
    ) -> CoordinatorResult<Option<GlobalSession>> {
        Ok(self.state.find_global(xid, with_branches))
    }

    fn find_by_statuses(
        &self,
        statuses: &[GlobalStatus],
    ) -> CoordinatorResult<Vec<GlobalSession>> {
        Ok(self.state.find_by_statuses(statuses))
    }

    fn find_by_condition(
        &self,
        condition: &SessionCondition,
    ) -> CoordinatorResult<Vec<GlobalSession>> {
        if let Some(xid) = &condition.xid {
            return Ok(self.state.find_global(xid, true).into_iter().collect());
        }
        if let Some(transaction_id) = condition.transaction_id {
            return Ok(self
                .state
                .find_by_transaction_id(transaction_id)
                .into_iter()
                .collect());
        }
        if let Some(statuses) = &condition.statuses {
            return Ok(self.state.find_by_statuses(statuses));
        }
        Ok(Vec::new())
    }

    fn enqueue(&self, queue: SessionQueue, session: &GlobalSession) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::add_global(queue, session)?)
    }

    fn dequeue(&self, queue: SessionQueue, xid: &str) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::remove_global(queue, xid)?)
    }

    fn queue_sessions(&self, queue: SessionQueue) -> CoordinatorResult<Vec<GlobalSession>> {
        Ok(self.state.queue_sessions(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::UnrestrictedLocks;
    use crate::session::BranchType;

    fn global(xid: &str, transaction_id: i64) -> GlobalSession {
        GlobalSession::new(xid, transaction_id, "app", "group", "tx", 60_000)
    }

    fn branch(xid: &str, branch_id: BranchId) -> BranchSession {
        BranchSession::new(xid, branch_id, 1, BranchType::At, "res1")
    }

    #[test]
    fn test_apply_handlers_idempotent() {
        let state = ReplicatedState::new();
        state.apply_add_global(SessionQueue::Root, global("x1", 1));
        state.apply_add_branch(branch("x1", 1));

        // Replaying every entry leaves the state unchanged.
        state.apply_add_global(SessionQueue::Root, global("x1", 1));
        state.apply_add_branch(branch("x1", 1));
        state.apply_update_branch_status("x1", 1, BranchStatus::PhaseOneDone);
        state.apply_update_branch_status("x1", 1, BranchStatus::PhaseOneDone);
        state.apply_remove_branch("x1", 99);
        state.apply_remove_global(SessionQueue::RetryCommitting, "x1");

        let session = state.find_global("x1", true).unwrap();
        assert_eq!(session.branches().len(), 1);
        assert_eq!(session.branch(1).unwrap().status, BranchStatus::PhaseOneDone);
    }

    #[test]
    fn test_add_global_update_preserves_branches() {
        let state = ReplicatedState::new();
        state.apply_add_global(SessionQueue::Root, global("x1", 1));
        state.apply_add_branch(branch("x1", 1));

        let mut update = global("x1", 1);
        update.status = GlobalStatus::Committing;
        update.active = false;
        state.apply_add_global(SessionQueue::Root, update);

        let session = state.find_global("x1", true).unwrap();
        assert_eq!(session.status, GlobalStatus::Committing);
        assert_eq!(session.branches().len(), 1);
    }

    #[test]
    fn test_phase_two_applies_terminal_transitions() {
        let state = ReplicatedState::new();
        state.apply_add_global(SessionQueue::Root, global("x1", 1));
        state.apply_add_branch(branch("x1", 1));
        state.apply_add_branch(branch("x1", 2));

        state.apply_phase_two(&PhaseTwoDo {
            xid: "x1".to_string(),
            status: GlobalStatus::Committed,
            branch_statuses: vec![
                (1, BranchStatus::PhaseTwoCommitted),
                (2, BranchStatus::PhaseTwoCommitted),
            ],
        });

        let session = state.find_global("x1", true).unwrap();
        assert_eq!(session.status, GlobalStatus::Committed);
        assert!(!session.active);
        assert_eq!(
            session.branch(1).unwrap().status,
            BranchStatus::PhaseTwoCommitted
        );
    }

    #[test]
    fn test_queue_sessions_materialize_from_root() {
        let state = ReplicatedState::new();
        state.apply_add_global(SessionQueue::Root, global("x1", 1));
        state.apply_add_branch(branch("x1", 1));
        state.apply_add_global(SessionQueue::RetryRollbacking, global("x1", 1));

        let queued = state.queue_sessions(SessionQueue::RetryRollbacking);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].branches().len(), 1);
    }

    #[test]
    fn test_leader_handover_reinserts_rollbacks() {
        let state = ReplicatedState::new();
        let mut rollbacking = global("x1", 1);
        rollbacking.status = GlobalStatus::RollbackRetrying;
        state.apply_add_global(SessionQueue::Root, rollbacking);

        let mut committing = global("x2", 2);
        committing.status = GlobalStatus::Committing;
        state.apply_add_global(SessionQueue::Root, committing);

        assert_eq!(state.reinsert_in_flight_rollbacks(), 1);
        let queued = state.queue_sessions(SessionQueue::RetryRollbacking);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].xid, "x1");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let state = ReplicatedState::new();
        let mut retrying = global("x1", 1);
        retrying.status = GlobalStatus::CommitRetrying;
        state.apply_add_global(SessionQueue::Root, retrying);
        state.apply_add_branch(branch("x1", 1));
        state.apply_add_branch(branch("x1", 2));
        state.apply_add_global(SessionQueue::Root, global("x2", 2));

        let payload = state.snapshot_payload().unwrap();
        let restored = ReplicatedState::new();
        restored.restore(payload, &UnrestrictedLocks).unwrap();

        let session = restored.find_global("x1", true).unwrap();
        let ids: Vec<_> = session.branches().iter().map(|b| b.branch_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(session.status, GlobalStatus::CommitRetrying);
        // Sessions in a retry status land back in their side map.
        assert_eq!(
            restored.queue_sessions(SessionQueue::RetryCommitting).len(),
            1
        );
        assert!(restored.find_global("x2", true).is_some());
    }
}

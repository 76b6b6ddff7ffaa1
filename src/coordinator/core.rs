// Coordinator API and phase-two drivers.
//
// Every mutation of a global session happens under that session's mutex,
// held across the branch capability calls so ordering between concurrent
// commit/rollback callers is total. An explicit status comparison under the
// mutex selects the single phase-two driver for a session.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::common::{build_xid, now_millis, transaction_id_from_xid, BranchId, CoordinatorConfig, IdGenerator, StoreMode};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::integration::{BranchResource, EventSink, GlobalTransactionEvent, LockCapability, TC_ROLE};
use crate::replication::{ConsensusService, SessionSyncMessage, SessionSyncProposer, SyncMsgType};
use crate::session::{
    BranchSession, BranchStatus, BranchType, GlobalSession, GlobalStatus, SessionHolder,
    SessionLifecycleListener, SessionRef,
};
use crate::store::{SessionQueue, SessionStore};

/// The transaction coordinator core.
///
/// Constructed once at startup and threaded through the serving layer; it
/// keeps no module-level state.
pub struct TransactionCoordinator {
    pub(crate) config: CoordinatorConfig,
    ids: IdGenerator,
    pub(crate) holder: SessionHolder,
    pub(crate) store: Arc<dyn SessionStore>,
    locks: Arc<dyn LockCapability>,
    resources: Arc<dyn BranchResource>,
    events: Arc<dyn EventSink>,
    pub(crate) consensus: Option<SessionSyncProposer>,
    listeners: RwLock<Vec<Arc<dyn SessionLifecycleListener>>>,
    pub(crate) eviction_registered: AtomicBool,
}

impl TransactionCoordinator {
    /// Creates a coordinator over the given store and capabilities.
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn SessionStore>,
        locks: Arc<dyn LockCapability>,
        resources: Arc<dyn BranchResource>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            ids: IdGenerator::new(),
            holder: SessionHolder::new(),
            store,
            locks,
            resources,
            events,
            consensus: None,
            listeners: RwLock::new(Vec::new()),
            eviction_registered: AtomicBool::new(false),
        }
    }

    /// Attaches the consensus service; phase-two outcomes are then proposed
    /// to the log and client-driven rollback is refused on non-leaders.
    pub fn with_consensus(mut self, service: Arc<dyn ConsensusService>) -> Self {
        self.consensus = Some(SessionSyncProposer::new(service));
        self
    }

    /// Registers a session lifecycle listener.
    pub fn register_listener(&self, listener: Arc<dyn SessionLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Begins a global transaction and returns its xid.
    ///
    /// A caller-supplied xid is used verbatim (replicas re-driving a
    /// transaction); otherwise a fresh one is assigned.
    pub fn begin(
        &self,
        application_id: &str,
        transaction_service_group: &str,
        transaction_name: &str,
        timeout_ms: i32,
        xid: Option<String>,
    ) -> CoordinatorResult<String> {
        let transaction_id = xid
            .as_deref()
            .and_then(transaction_id_from_xid)
            .unwrap_or_else(|| self.ids.next_id());
        let xid = xid.unwrap_or_else(|| build_xid(&self.config.instance_id, transaction_id));
        let timeout_ms = if timeout_ms > 0 {
            timeout_ms
        } else {
            self.config.default_timeout_ms
        };

        let session = GlobalSession::new(
            &xid,
            transaction_id,
            application_id,
            transaction_service_group,
            transaction_name,
            timeout_ms,
        );
        self.store.add_global(&session)?;
        self.publish_event(&session, false);
        info!(xid = %xid, name = transaction_name, "global transaction begun");
        self.holder.register(session);
        Ok(xid)
    }

    /// Registers a branch under a global transaction and returns its id.
    pub fn branch_register(
        &self,
        xid: &str,
        branch_type: BranchType,
        resource_id: &str,
        client_id: Option<&str>,
        application_data: Option<&str>,
        lock_key: Option<&str>,
        branch_id: Option<BranchId>,
    ) -> CoordinatorResult<BranchId> {
        let handle = self
            .live_session(xid)?
            .ok_or_else(|| CoordinatorError::not_exist(xid))?;
        let mut session = handle.lock();
        if !session.active || session.status != GlobalStatus::Begin {
            return Err(CoordinatorError::not_active(xid, session.status));
        }

        let branch_id = branch_id.unwrap_or_else(|| self.ids.next_id());
        let mut branch = BranchSession::new(
            xid,
            branch_id,
            session.transaction_id,
            branch_type,
            resource_id,
        );
        branch.client_id = client_id.map(str::to_string);
        branch.application_data = application_data.map(str::to_string);
        branch.lock_key = lock_key.map(str::to_string);

        if !self.locks.acquire(&branch)? {
            return Err(CoordinatorError::lock_conflict(xid, resource_id));
        }
        if let Err(err) = self.store.add_branch(&session, &branch) {
            // The registration never landed; give the locks back.
            if let Err(release_err) = self.locks.release(&branch) {
                warn!(xid = %xid, branch_id, error = %release_err, "lock release after failed registration");
            }
            return Err(err);
        }
        session.add_branch(branch);
        debug!(xid = %xid, branch_id, resource_id, "branch registered");
        Ok(branch_id)
    }

    /// Records a phase-one outcome reported by the resource manager.
    pub fn branch_report(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
        application_data: Option<&str>,
    ) -> CoordinatorResult<()> {
        let handle = self
            .live_session(xid)?
            .ok_or_else(|| CoordinatorError::not_exist(xid))?;
        let mut session = handle.lock();
        {
            let Some(branch) = session.branch(branch_id) else {
                return Err(CoordinatorError::BranchNotExist {
                    xid: xid.to_string(),
                    branch_id,
                });
            };
            let mut updated = branch.clone();
            updated.status = status;
            if let Some(data) = application_data {
                updated.application_data = Some(data.to_string());
            }
            self.store.update_branch_status(&session, &updated, status)?;
        }
        if let Some(branch) = session.branch_mut(branch_id) {
            branch.status = status;
            if let Some(data) = application_data {
                branch.application_data = Some(data.to_string());
            }
        }
        Ok(())
    }

    /// Probes the lock capability for the given keys.
    pub fn lock_query(
        &self,
        branch_type: BranchType,
        resource_id: &str,
        xid: &str,
        lock_keys: &str,
    ) -> CoordinatorResult<bool> {
        self.locks.query(branch_type, resource_id, xid, lock_keys)
    }

    /// Drives phase-two commit of a global transaction.
    pub fn commit(&self, xid: &str) -> CoordinatorResult<GlobalStatus> {
        let Some(handle) = self.live_session(xid)? else {
            return Ok(GlobalStatus::Finished);
        };
        let mut session = handle.lock();
        session.close();
        if session.status != GlobalStatus::Begin {
            return Ok(match session.status {
                GlobalStatus::AsyncCommitting => GlobalStatus::Committed,
                status => status,
            });
        }

        if session.can_be_committed_async() {
            // Phase-two commit of every branch is idempotent and deferrable;
            // the async sweeper finishes the work.
            if !self.cas_status(&mut session, GlobalStatus::Begin, GlobalStatus::AsyncCommitting)? {
                return Ok(session.status);
            }
            self.publish_event(&session, false);
            self.store
                .enqueue(SessionQueue::AsyncCommitting, &session)?;
            return Ok(GlobalStatus::Committed);
        }

        if !self.cas_status(&mut session, GlobalStatus::Begin, GlobalStatus::Committing)? {
            return Ok(session.status);
        }
        self.publish_event(&session, false);

        match self.drive_commit(&mut session, false) {
            Ok(true) => Ok(GlobalStatus::Committed),
            Ok(false) => {
                if session.status.is_terminal() {
                    return Ok(session.status);
                }
                if session.status == GlobalStatus::Committing
                    && session.branches().iter().all(BranchSession::can_be_committed_async)
                {
                    // Only deferred-commit branches remain after the
                    // synchronous pass; hand them to the async sweeper.
                    self.transition(&mut session, GlobalStatus::AsyncCommitting)?;
                    self.store
                        .enqueue(SessionQueue::AsyncCommitting, &session)?;
                    return Ok(GlobalStatus::Committed);
                }
                Ok(GlobalStatus::Committing)
            }
            Err(err) if err.is_retriable() => {
                // Absorbed on the first attempt; the retry queue owns it now.
                warn!(xid = %xid, error = %err, "branch failure absorbed into the commit retry queue");
                Ok(GlobalStatus::Committing)
            }
            Err(err) => Err(err),
        }
    }

    /// Drives phase-two rollback of a global transaction.
    pub fn rollback(&self, xid: &str) -> CoordinatorResult<GlobalStatus> {
        if let Some(consensus) = &self.consensus {
            if !consensus.is_leader() {
                // A non-leader must not execute the rollback; the caller is
                // redirected to the leader at a higher layer.
                info!(xid = %xid, "rollback received on a non-leader node; not executing");
                return self.get_status(xid);
            }
        }
        let Some(handle) = self.live_session(xid)? else {
            return Ok(GlobalStatus::Finished);
        };
        let mut session = handle.lock();
        session.close();
        if session.status != GlobalStatus::Begin {
            return Ok(session.status);
        }
        if !self.cas_status(&mut session, GlobalStatus::Begin, GlobalStatus::Rollbacking)? {
            return Ok(session.status);
        }
        self.publish_event(&session, false);

        match self.drive_rollback(&mut session, false) {
            Ok(true) => Ok(GlobalStatus::Rollbacked),
            Ok(false) => {
                if session.status.is_terminal() {
                    return Ok(session.status);
                }
                Ok(GlobalStatus::Rollbacking)
            }
            Err(err) if err.is_retriable() => {
                warn!(xid = %xid, error = %err, "branch failure absorbed into the rollback retry queue");
                Ok(GlobalStatus::Rollbacking)
            }
            Err(err) => Err(err),
        }
    }

    /// Current status of a global transaction; `Finished` when unknown.
    pub fn get_status(&self, xid: &str) -> CoordinatorResult<GlobalStatus> {
        Ok(self
            .live_session(xid)?
            .map(|handle| handle.lock().status)
            .unwrap_or(GlobalStatus::Finished))
    }

    /// Records a client-asserted final status.
    ///
    /// Meaningful only for compensation-style branches, which this core does
    /// not drive; kept as a hook so the serving layer has a stable surface.
    pub fn global_report(
        &self,
        xid: &str,
        status: GlobalStatus,
    ) -> CoordinatorResult<GlobalStatus> {
        debug!(xid = %xid, asserted = ?status, "global report received");
        self.get_status(xid)
    }

    // ------------------------------------------------------------------
    // Session lookup
    // ------------------------------------------------------------------

    /// Finds the live handle for a session, rehydrating it from the store
    /// when another instance (or an earlier leadership term) created it.
    pub(crate) fn live_session(&self, xid: &str) -> CoordinatorResult<Option<SessionRef>> {
        if let Some(handle) = self.holder.get(xid) {
            return Ok(Some(handle));
        }
        match self.store.find_global(xid, true)? {
            Some(session) => Ok(Some(self.holder.register(session))),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Phase-two drivers
    // ------------------------------------------------------------------

    /// Walks the branches in insertion order and commits each one.
    ///
    /// Returns true when every branch reached a terminal state and the
    /// session was ended. Must be called with the session mutex held.
    pub(crate) fn drive_commit(
        &self,
        session: &mut GlobalSession,
        retrying: bool,
    ) -> CoordinatorResult<bool> {
        let branch_ids: Vec<BranchId> =
            session.branches().iter().map(|b| b.branch_id).collect();
        let mut observed: Vec<(BranchId, BranchStatus)> = Vec::new();

        for branch_id in branch_ids {
            let Some(branch) = session.branch(branch_id).cloned() else {
                continue;
            };
            if !retrying && branch.can_be_committed_async() {
                // Swept later by the async driver.
                continue;
            }
            if branch.status == BranchStatus::PhaseOneFailed {
                // Never enlisted successfully on the resource.
                self.drop_branch(session, &branch)?;
                continue;
            }
            match self.resources.branch_commit(session, &branch) {
                Ok(BranchStatus::PhaseTwoCommitted) => {
                    observed.push((branch_id, BranchStatus::PhaseTwoCommitted));
                    self.drop_branch(session, &branch)?;
                }
                Ok(status @ BranchStatus::PhaseTwoCommitFailedUnretryable) => {
                    observed.push((branch_id, status));
                    self.record_branch_status(session, branch_id, status)?;
                    if branch.can_be_committed_async() {
                        error!(
                            xid = %session.xid,
                            branch_id,
                            "deferred branch failed commit unretryably; orphaned until operator action"
                        );
                        continue;
                    }
                    self.fail_session(session, GlobalStatus::CommitFailed)?;
                    return Ok(false);
                }
                Ok(status) => {
                    observed.push((branch_id, status));
                    self.record_branch_status(session, branch_id, status)?;
                    if !retrying {
                        self.queue_commit_retry(session)?;
                        return Ok(false);
                    }
                    if branch.can_be_committed_async() {
                        warn!(
                            xid = %session.xid,
                            branch_id,
                            status = ?status,
                            "deferred branch commit not done; kept for the next sweep"
                        );
                        continue;
                    }
                    return Ok(false);
                }
                Err(err) => {
                    if !retrying {
                        self.queue_commit_retry(session)?;
                        return Err(err);
                    }
                    error!(
                        xid = %session.xid,
                        branch_id,
                        error = %err,
                        "branch commit failed; kept for the next sweep"
                    );
                    continue;
                }
            }
        }

        if !session.branches().is_empty() {
            return Ok(false);
        }
        self.end_session(session, GlobalStatus::Committed)?;
        if !retrying {
            self.propose_phase_two(SyncMsgType::DoCommit, session, observed);
        }
        Ok(true)
    }

    /// Walks the branches in reverse insertion order and rolls each back.
    ///
    /// Returns true when every branch was rolled back and the session was
    /// ended. Must be called with the session mutex held.
    pub(crate) fn drive_rollback(
        &self,
        session: &mut GlobalSession,
        retrying: bool,
    ) -> CoordinatorResult<bool> {
        let branch_ids: Vec<BranchId> =
            session.branches().iter().map(|b| b.branch_id).rev().collect();
        let mut observed: Vec<(BranchId, BranchStatus)> = Vec::new();

        for branch_id in branch_ids {
            let Some(branch) = session.branch(branch_id).cloned() else {
                continue;
            };
            if branch.status == BranchStatus::PhaseOneFailed {
                self.drop_branch(session, &branch)?;
                continue;
            }
            match self.resources.branch_rollback(session, &branch) {
                Ok(BranchStatus::PhaseTwoRollbacked) => {
                    observed.push((branch_id, BranchStatus::PhaseTwoRollbacked));
                    self.drop_branch(session, &branch)?;
                }
                Ok(status @ BranchStatus::PhaseTwoRollbackFailedUnretryable) => {
                    observed.push((branch_id, status));
                    self.record_branch_status(session, branch_id, status)?;
                    self.fail_session(session, GlobalStatus::RollbackFailed)?;
                    return Ok(false);
                }
                Ok(status) => {
                    observed.push((branch_id, status));
                    self.record_branch_status(session, branch_id, status)?;
                    if !retrying {
                        self.queue_rollback_retry(session)?;
                    }
                    return Ok(false);
                }
                Err(err) => {
                    if !retrying {
                        self.queue_rollback_retry(session)?;
                        return Err(err);
                    }
                    error!(
                        xid = %session.xid,
                        branch_id,
                        error = %err,
                        "branch rollback failed; kept for the next sweep"
                    );
                    continue;
                }
            }
        }

        if !session.branches().is_empty() {
            return Ok(false);
        }

        // Workaround for replica staleness in the shared KV service: a
        // branch registered on another instance between our in-memory view
        // and this second read forces another pass. The replicated backend
        // reads its own memory and skips this.
        if self.config.store.mode == StoreMode::Kv {
            if let Some(stored) = self.store.find_global(&session.xid, true)? {
                for branch in stored.branches() {
                    if session.branch(branch.branch_id).is_none() {
                        session.add_branch(branch.clone());
                    }
                }
                if !session.branches().is_empty() {
                    warn!(
                        xid = %session.xid,
                        "branches appeared during rollback; queueing another pass"
                    );
                    if !retrying {
                        self.queue_rollback_retry(session)?;
                    }
                    return Ok(false);
                }
            }
        }

        self.end_session(session, GlobalStatus::Rollbacked)?;
        if !retrying {
            self.propose_phase_two(SyncMsgType::DoRollback, session, observed);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Transition helpers
    // ------------------------------------------------------------------

    /// Persists and applies a status transition.
    fn transition(&self, session: &mut GlobalSession, to: GlobalStatus) -> CoordinatorResult<()> {
        self.store.update_global_status(session, to)?;
        session.status = to;
        if to != GlobalStatus::Begin {
            session.active = false;
        }
        self.notify_status_change(session, to);
        Ok(())
    }

    /// The status comparison that arbitrates between concurrent phase-two
    /// drivers: the transition happens only when the current status matches.
    fn cas_status(
        &self,
        session: &mut GlobalSession,
        expected: GlobalStatus,
        to: GlobalStatus,
    ) -> CoordinatorResult<bool> {
        if session.status != expected {
            return Ok(false);
        }
        self.transition(session, to)?;
        Ok(true)
    }

    /// Releases a finished branch's locks and removes it everywhere.
    fn drop_branch(
        &self,
        session: &mut GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()> {
        if let Err(err) = self.locks.release(branch) {
            warn!(
                xid = %session.xid,
                branch_id = branch.branch_id,
                error = %err,
                "branch lock release failed"
            );
        }
        self.store.remove_branch(session, branch)?;
        session.remove_branch(branch.branch_id);
        Ok(())
    }

    /// Persists and applies a branch status observed during phase two.
    fn record_branch_status(
        &self,
        session: &mut GlobalSession,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> CoordinatorResult<()> {
        if let Some(branch) = session.branch(branch_id).cloned() {
            self.store.update_branch_status(session, &branch, status)?;
        }
        if let Some(branch) = session.branch_mut(branch_id) {
            branch.status = status;
        }
        Ok(())
    }

    fn queue_commit_retry(&self, session: &mut GlobalSession) -> CoordinatorResult<()> {
        self.transition(session, GlobalStatus::CommitRetrying)?;
        self.store.enqueue(SessionQueue::RetryCommitting, session)?;
        Ok(())
    }

    fn queue_rollback_retry(&self, session: &mut GlobalSession) -> CoordinatorResult<()> {
        let target = if session.status.is_timeout_rollback() {
            GlobalStatus::TimeoutRollbackRetrying
        } else {
            GlobalStatus::RollbackRetrying
        };
        self.transition(session, target)?;
        self.store.enqueue(SessionQueue::RetryRollbacking, session)?;
        Ok(())
    }

    /// Ends a fully driven session: terminal status, lock release, store
    /// cleanup, queue eviction, end event.
    fn end_session(
        &self,
        session: &mut GlobalSession,
        terminal: GlobalStatus,
    ) -> CoordinatorResult<()> {
        let origin_queue = side_queue_of(session.status);
        session.status = terminal;
        session.active = false;
        self.notify_status_change(session, terminal);
        self.locks
            .release_global(&session.xid, session.branches())?;
        self.store.remove_global(session)?;
        if let Some(queue) = origin_queue {
            self.store.dequeue(queue, &session.xid)?;
        }
        self.holder.remove(&session.xid, session.transaction_id);
        self.publish_event(session, true);
        self.notify_end(session);
        info!(xid = %session.xid, status = ?terminal, "global transaction ended");
        Ok(())
    }

    /// Parks a session in a terminal failure status. The session and its
    /// branches stay in the store for operator inspection.
    fn fail_session(
        &self,
        session: &mut GlobalSession,
        terminal: GlobalStatus,
    ) -> CoordinatorResult<()> {
        let origin_queue = side_queue_of(session.status);
        self.transition(session, terminal)?;
        if let Some(queue) = origin_queue {
            self.store.dequeue(queue, &session.xid)?;
        }
        self.holder.remove(&session.xid, session.transaction_id);
        self.publish_event(session, true);
        self.notify_end(session);
        error!(xid = %session.xid, status = ?terminal, "global transaction failed");
        Ok(())
    }

    /// Replicates the phase-two outcome observed by this (leader) driver.
    ///
    /// Informational on top of the per-branch entries already proposed, so a
    /// failure is logged rather than propagated.
    fn propose_phase_two(
        &self,
        msg_type: SyncMsgType,
        session: &GlobalSession,
        observed: Vec<(BranchId, BranchStatus)>,
    ) {
        let Some(consensus) = &self.consensus else {
            return;
        };
        if !consensus.is_leader() {
            return;
        }
        let proposal =
            SessionSyncMessage::phase_two(msg_type, &session.xid, session.status, observed)
                .and_then(|message| consensus.propose_sync(&message));
        if let Err(err) = proposal {
            error!(xid = %session.xid, error = %err, "phase-two outcome proposal failed");
        }
    }

    // ------------------------------------------------------------------
    // Events and listeners
    // ------------------------------------------------------------------

    pub(crate) fn publish_event(&self, session: &GlobalSession, end: bool) {
        self.events.publish(GlobalTransactionEvent {
            transaction_id: session.transaction_id,
            role: TC_ROLE,
            name: session.transaction_name.clone(),
            begin_time: session.begin_time,
            end_time: end.then(now_millis),
            status: session.status,
        });
    }

    fn notify_status_change(&self, session: &GlobalSession, status: GlobalStatus) {
        for listener in self.listeners.read().iter() {
            listener.on_status_change(session, status);
        }
    }

    fn notify_end(&self, session: &GlobalSession) {
        for listener in self.listeners.read().iter() {
            listener.on_end(session);
        }
    }

    /// Transitions a timed-out `Begin` session into timeout rollback and
    /// queues it for the rollback sweeper. Safe under the session mutex.
    pub(crate) fn timeout_rollback(&self, session: &mut GlobalSession) -> CoordinatorResult<bool> {
        session.close();
        if !self.cas_status(
            session,
            GlobalStatus::Begin,
            GlobalStatus::TimeoutRollbacking,
        )? {
            return Ok(false);
        }
        self.publish_event(session, false);
        self.store
            .enqueue(SessionQueue::RetryRollbacking, session)?;
        warn!(xid = %session.xid, timeout_ms = session.timeout_ms, "global transaction timed out");
        Ok(true)
    }
}

/// The side queue a session in the given status lives in, if any.
fn side_queue_of(status: GlobalStatus) -> Option<SessionQueue> {
    match status {
        GlobalStatus::AsyncCommitting => Some(SessionQueue::AsyncCommitting),
        GlobalStatus::CommitRetrying => Some(SessionQueue::RetryCommitting),
        GlobalStatus::RollbackRetrying
        | GlobalStatus::TimeoutRollbacking
        | GlobalStatus::TimeoutRollbackRetrying => Some(SessionQueue::RetryRollbacking),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::{TracingEventSink, UnrestrictedLocks};
    use crate::store::{KvSessionStore, MemoryKv};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Branch resource that replays scripted outcomes and records call order.
    #[derive(Default)]
    struct ScriptedResource {
        commit_outcomes: Mutex<VecDeque<CoordinatorResult<BranchStatus>>>,
        rollback_outcomes: Mutex<VecDeque<CoordinatorResult<BranchStatus>>>,
        calls: Mutex<Vec<(String, BranchId)>>,
    }

    impl ScriptedResource {
        fn script_commit(&self, outcome: CoordinatorResult<BranchStatus>) {
            self.commit_outcomes.lock().unwrap().push_back(outcome);
        }

        fn script_rollback(&self, outcome: CoordinatorResult<BranchStatus>) {
            self.rollback_outcomes.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> Vec<(String, BranchId)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl BranchResource for ScriptedResource {
        fn branch_commit(
            &self,
            _global: &GlobalSession,
            branch: &BranchSession,
        ) -> CoordinatorResult<BranchStatus> {
            self.calls
                .lock()
                .unwrap()
                .push(("commit".to_string(), branch.branch_id));
            self.commit_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(BranchStatus::PhaseTwoCommitted))
        }

        fn branch_rollback(
            &self,
            _global: &GlobalSession,
            branch: &BranchSession,
        ) -> CoordinatorResult<BranchStatus> {
            self.calls
                .lock()
                .unwrap()
                .push(("rollback".to_string(), branch.branch_id));
            self.rollback_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(BranchStatus::PhaseTwoRollbacked))
        }
    }

    fn coordinator() -> (Arc<ScriptedResource>, TransactionCoordinator) {
        let resources = Arc::new(ScriptedResource::default());
        let config = CoordinatorConfig::default();
        let store = Arc::new(KvSessionStore::new(
            Arc::new(MemoryKv::new()),
            &config.store,
        ));
        let tc = TransactionCoordinator::new(
            config,
            store,
            Arc::new(UnrestrictedLocks),
            resources.clone(),
            Arc::new(TracingEventSink),
        );
        (resources, tc)
    }

    #[test]
    fn test_begin_assigns_fresh_xid() {
        let (_, tc) = coordinator();
        let xid1 = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        let xid2 = tc.begin("appA", "group", "tx2", 60_000, None).unwrap();
        assert_ne!(xid1, xid2);
        assert_eq!(tc.get_status(&xid1).unwrap(), GlobalStatus::Begin);
    }

    #[test]
    fn test_begin_honors_supplied_xid() {
        let (_, tc) = coordinator();
        let xid = tc
            .begin("appA", "group", "tx1", 60_000, Some("replica:42".to_string()))
            .unwrap();
        assert_eq!(xid, "replica:42");
    }

    #[test]
    fn test_register_against_unknown_xid() {
        let (_, tc) = coordinator();
        let result =
            tc.branch_register("missing", BranchType::At, "res1", None, None, None, None);
        assert!(matches!(
            result,
            Err(CoordinatorError::TransactionNotExist(_))
        ));
    }

    #[test]
    fn test_register_after_close_fails() {
        let (_, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.commit(&xid).unwrap();

        let result = tc.branch_register(&xid, BranchType::At, "res1", None, None, None, None);
        // The session ended with the commit, so the xid is simply unknown.
        assert!(matches!(
            result,
            Err(CoordinatorError::TransactionNotExist(_))
        ));
    }

    #[test]
    fn test_commit_without_branches_finishes_immediately() {
        let (_, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committed);
        assert!(tc.store.find_global(&xid, false).unwrap().is_none());
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::Finished);
    }

    #[test]
    fn test_commit_unknown_xid_is_finished() {
        let (_, tc) = coordinator();
        assert_eq!(tc.commit("missing").unwrap(), GlobalStatus::Finished);
    }

    #[test]
    fn test_synchronous_commit_drives_branch() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        let b1 = tc
            .branch_register(&xid, BranchType::Tcc, "res1", Some("cli1"), None, None, None)
            .unwrap();

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committed);
        assert_eq!(resources.calls(), vec![("commit".to_string(), b1)]);
        assert!(tc.store.find_global(&xid, false).unwrap().is_none());
    }

    #[test]
    fn test_all_deferrable_branches_commit_async() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::At, "res1", None, None, Some("k1"), None)
            .unwrap();

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committed);
        // Nothing driven synchronously; the session waits for the sweeper.
        assert!(resources.calls().is_empty());
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::AsyncCommitting);
    }

    #[test]
    fn test_retryable_commit_failure_queues_retry() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::Tcc, "res1", None, None, None, None)
            .unwrap();
        resources.script_commit(Ok(BranchStatus::PhaseTwoCommitFailedRetryable));

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committing);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::CommitRetrying);
        let queued = tc.store.queue_sessions(SessionQueue::RetryCommitting).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].xid, xid);
    }

    #[test]
    fn test_unretryable_commit_failure_is_terminal() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::Tcc, "res1", None, None, None, None)
            .unwrap();
        resources.script_commit(Ok(BranchStatus::PhaseTwoCommitFailedUnretryable));

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::CommitFailed);
        // Branches retained for operator inspection.
        let stored = tc.store.find_global(&xid, true).unwrap().unwrap();
        assert_eq!(stored.status, GlobalStatus::CommitFailed);
        assert_eq!(stored.branches().len(), 1);
    }

    #[test]
    fn test_phase_one_failed_branch_is_dropped_on_commit() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        let b1 = tc
            .branch_register(&xid, BranchType::Tcc, "res1", None, None, None, None)
            .unwrap();
        tc.branch_report(&xid, b1, BranchStatus::PhaseOneFailed, None)
            .unwrap();

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committed);
        assert!(resources.calls().is_empty());
    }

    #[test]
    fn test_rollback_walks_branches_in_reverse() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        let b1 = tc
            .branch_register(&xid, BranchType::At, "res1", None, None, None, None)
            .unwrap();
        let b2 = tc
            .branch_register(&xid, BranchType::At, "res2", None, None, None, None)
            .unwrap();
        let b3 = tc
            .branch_register(&xid, BranchType::At, "res3", None, None, None, None)
            .unwrap();

        assert_eq!(tc.rollback(&xid).unwrap(), GlobalStatus::Rollbacked);
        assert_eq!(
            resources.calls(),
            vec![
                ("rollback".to_string(), b3),
                ("rollback".to_string(), b2),
                ("rollback".to_string(), b1),
            ]
        );
        assert!(tc.store.find_global(&xid, false).unwrap().is_none());
    }

    #[test]
    fn test_retryable_rollback_failure_queues_retry() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::At, "res1", None, None, None, None)
            .unwrap();
        resources.script_rollback(Ok(BranchStatus::PhaseTwoRollbackFailedRetryable));

        assert_eq!(tc.rollback(&xid).unwrap(), GlobalStatus::Rollbacking);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::RollbackRetrying);
    }

    #[test]
    fn test_unretryable_rollback_failure_is_terminal() {
        let (resources, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::At, "res1", None, None, None, None)
            .unwrap();
        resources.script_rollback(Ok(BranchStatus::PhaseTwoRollbackFailedUnretryable));

        assert_eq!(tc.rollback(&xid).unwrap(), GlobalStatus::RollbackFailed);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::RollbackFailed);
    }

    #[test]
    fn test_branch_report_updates_status() {
        let (_, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        let b1 = tc
            .branch_register(&xid, BranchType::At, "res1", None, None, None, None)
            .unwrap();

        tc.branch_report(&xid, b1, BranchStatus::PhaseOneDone, Some("undo:7"))
            .unwrap();
        let stored = tc.store.find_global(&xid, true).unwrap().unwrap();
        assert_eq!(stored.branch(b1).unwrap().status, BranchStatus::PhaseOneDone);

        let missing = tc.branch_report(&xid, 999, BranchStatus::PhaseOneDone, None);
        assert!(matches!(
            missing,
            Err(CoordinatorError::BranchNotExist { .. })
        ));
    }

    #[test]
    fn test_supplied_branch_id_is_used() {
        let (_, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        let b1 = tc
            .branch_register(&xid, BranchType::At, "res1", None, None, None, Some(77))
            .unwrap();
        assert_eq!(b1, 77);
    }

    #[test]
    fn test_timeout_rollback_transition() {
        let (_, tc) = coordinator();
        let xid = tc.begin("appA", "group", "tx1", 1, None).unwrap();
        let handle = tc.live_session(&xid).unwrap().unwrap();
        {
            let mut session = handle.lock();
            session.begin_time = now_millis() - 10_000;
            assert!(tc.timeout_rollback(&mut session).unwrap());
            assert_eq!(session.status, GlobalStatus::TimeoutRollbacking);
            // A second transition attempt is a no-op.
            assert!(!tc.timeout_rollback(&mut session).unwrap());
        }
        assert_eq!(
            tc.get_status(&xid).unwrap(),
            GlobalStatus::TimeoutRollbacking
        );
    }
}

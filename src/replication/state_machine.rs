// Replication state machine.
//
// Driven by the consensus service: committed entries arrive at `on_apply`,
// leadership changes at `on_leader_start`/`on_leader_stop`, and snapshot
// requests at `on_snapshot_save`/`on_snapshot_load`. Every handler mutates
// the shared replica state idempotently so replaying any log suffix is safe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::common::StoreMode;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::integration::LockCapability;
use crate::session::{BranchSession, GlobalSession};
use crate::store::ReplicatedState;

use super::consensus::{ApplyEntry, CommitClosure};
use super::message::{
    BranchRefDo, BranchStatusDo, GlobalStatusDo, PhaseTwoDo, SessionSyncMessage, SyncMsgType,
    XidDo,
};
use super::snapshot::{self, SnapshotReader, SnapshotWriter};

/// Observer of leadership transitions on this node.
pub trait LeaderEventListener: Send + Sync {
    /// Called after this node became leader of the group.
    fn on_leader_start(&self, term: u64);

    /// Called after this node stopped leading the group.
    fn on_leader_stop(&self);
}

/// The coordinator-side state machine plugged into the consensus service.
pub struct ReplicationStateMachine {
    state: Arc<ReplicatedState>,
    /// The underlying lock capability, not the replicating wrapper: apply
    /// handlers run on every replica and must not re-propose.
    locks: Arc<dyn LockCapability>,
    mode: StoreMode,
    leader: AtomicBool,
    term: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn LeaderEventListener>>>,
}

impl ReplicationStateMachine {
    pub fn new(
        state: Arc<ReplicatedState>,
        locks: Arc<dyn LockCapability>,
        mode: StoreMode,
    ) -> Self {
        Self {
            state,
            locks,
            mode,
            leader: AtomicBool::new(false),
            term: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a leadership observer.
    pub fn register_leader_listener(&self, listener: Arc<dyn LeaderEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Whether this node currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Last term this node led.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    /// The replica state this machine mutates.
    pub fn state(&self) -> &Arc<ReplicatedState> {
        &self.state
    }

    /// Applies a batch of committed entries.
    ///
    /// A leader-side entry carries the closure of the original request; it
    /// completes with the apply outcome. A failed apply is logged and never
    /// treated as applied.
    pub fn on_apply(&self, entries: Vec<ApplyEntry>) {
        for entry in entries {
            let result = self.apply_one(&entry.data);
            if let Err(err) = &result {
                error!(error = %err, "log entry apply failed");
            }
            if let Some(done) = entry.done {
                done(result);
            }
        }
    }

    fn apply_one(&self, data: &[u8]) -> CoordinatorResult<()> {
        let message = SessionSyncMessage::decode(data)?;
        match message.msg_type {
            SyncMsgType::AddGlobalSession => {
                let session = GlobalSession::decode(&message.payload)?;
                self.state.apply_add_global(message.queue(), session);
            }
            SyncMsgType::UpdateGlobalSessionStatus => {
                let update: GlobalStatusDo = message.payload()?;
                self.state
                    .apply_update_global_status(&update.xid, update.status);
            }
            SyncMsgType::RemoveGlobalSession => {
                let remove: XidDo = message.payload()?;
                self.state.apply_remove_global(message.queue(), &remove.xid);
            }
            SyncMsgType::AddBranchSession => {
                let branch = BranchSession::decode(&message.payload)?;
                self.state.apply_add_branch(branch);
            }
            SyncMsgType::UpdateBranchSessionStatus => {
                let update: BranchStatusDo = message.payload()?;
                self.state
                    .apply_update_branch_status(&update.xid, update.branch_id, update.status);
            }
            SyncMsgType::RemoveBranchSession => {
                let remove: BranchRefDo = message.payload()?;
                // The branch's locks go with it on every replica; the leader
                // released them already, which the capability treats as a
                // no-op.
                if let Some(session) = self.state.find_global(&remove.xid, true) {
                    if let Some(branch) = session.branch(remove.branch_id) {
                        if let Err(err) = self.locks.release(branch) {
                            warn!(
                                xid = %remove.xid,
                                branch_id = remove.branch_id,
                                error = %err,
                                "branch lock release failed during apply"
                            );
                        }
                    }
                }
                self.state.apply_remove_branch(&remove.xid, remove.branch_id);
            }
            SyncMsgType::AcquireLock => {
                let branch = BranchSession::decode(&message.payload)?;
                match self.locks.acquire(&branch) {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        xid = %branch.xid,
                        branch_id = branch.branch_id,
                        "replicated lock acquisition reported a conflict"
                    ),
                    Err(err) => {
                        return Err(CoordinatorError::consensus(format!(
                            "lock apply failed: {err}"
                        )))
                    }
                }
            }
            SyncMsgType::ReleaseGlobalSessionLock => {
                let release: XidDo = message.payload()?;
                if let Some(session) = self.state.find_global(&release.xid, true) {
                    self.locks
                        .release_global(&release.xid, session.branches())
                        .map_err(|err| {
                            CoordinatorError::consensus(format!("lock release apply failed: {err}"))
                        })?;
                }
            }
            SyncMsgType::DoCommit | SyncMsgType::DoRollback => {
                let outcome: PhaseTwoDo = message.payload()?;
                self.state.apply_phase_two(&outcome);
            }
        }
        Ok(())
    }

    /// Called by the consensus service when this node becomes leader.
    ///
    /// Every in-flight rollback in the root set is re-inserted into the
    /// retry-rollbacking queue so the sweeper resumes it.
    pub fn on_leader_start(&self, term: u64) {
        self.term.store(term, Ordering::Release);
        self.leader.store(true, Ordering::Release);
        let resumed = self.state.reinsert_in_flight_rollbacks();
        info!(term, resumed, "leadership started");
        for listener in self.listeners.read().iter() {
            listener.on_leader_start(term);
        }
    }

    /// Called by the consensus service when this node stops leading.
    pub fn on_leader_stop(&self) {
        self.leader.store(false, Ordering::Release);
        info!("leadership stopped");
        for listener in self.listeners.read().iter() {
            listener.on_leader_stop();
        }
    }

    /// Takes a consistent copy of the state and writes it in the background.
    ///
    /// Skipped (completing successfully without writing) when the node is
    /// not running the replicated store.
    pub fn on_snapshot_save(&self, writer: Box<dyn SnapshotWriter>, done: CommitClosure) {
        if self.mode != StoreMode::Replicated {
            done(Ok(()));
            return;
        }
        match self.state.snapshot_payload() {
            Ok(payload) => snapshot::save_snapshot(payload, writer, done),
            Err(err) => done(Err(err)),
        }
    }

    /// Rebuilds the replica state from a snapshot. The leader refuses: its
    /// in-memory state is the source the followers converge to.
    pub fn on_snapshot_load(&self, reader: &dyn SnapshotReader) -> CoordinatorResult<()> {
        if self.is_leader() {
            return Err(CoordinatorError::Internal(
                "leader refuses to load a snapshot".to_string(),
            ));
        }
        let payload = snapshot::load_snapshot(reader)?;
        self.state.restore(payload, self.locks.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::UnrestrictedLocks;
    use crate::session::{BranchStatus, BranchType, GlobalStatus};
    use crate::store::SessionQueue;

    fn machine() -> ReplicationStateMachine {
        ReplicationStateMachine::new(
            Arc::new(ReplicatedState::new()),
            Arc::new(UnrestrictedLocks),
            StoreMode::Replicated,
        )
    }

    fn entry(message: SessionSyncMessage) -> ApplyEntry {
        ApplyEntry::from_bytes(message.encode().unwrap())
    }

    fn log_for_one_session() -> Vec<ApplyEntry> {
        let session = GlobalSession::new("x1", 1, "app", "group", "tx", 60_000);
        let branch = BranchSession::new("x1", 2, 1, BranchType::At, "res1");
        vec![
            entry(SessionSyncMessage::add_global(SessionQueue::Root, &session).unwrap()),
            entry(SessionSyncMessage::acquire_lock(&branch).unwrap()),
            entry(SessionSyncMessage::add_branch(&branch).unwrap()),
            entry(
                SessionSyncMessage::update_branch_status("x1", 2, BranchStatus::PhaseOneDone)
                    .unwrap(),
            ),
            entry(
                SessionSyncMessage::update_global_status("x1", GlobalStatus::Committing).unwrap(),
            ),
        ]
    }

    #[test]
    fn test_apply_rebuilds_session_state() {
        let sm = machine();
        sm.on_apply(log_for_one_session());

        let session = sm.state().find_global("x1", true).unwrap();
        assert_eq!(session.status, GlobalStatus::Committing);
        assert!(!session.active);
        assert_eq!(session.branch(2).unwrap().status, BranchStatus::PhaseOneDone);
    }

    #[test]
    fn test_replaying_a_suffix_converges() {
        let sm_once = machine();
        sm_once.on_apply(log_for_one_session());

        let sm_twice = machine();
        sm_twice.on_apply(log_for_one_session());
        // Replay the tail of the log a second time.
        let tail: Vec<ApplyEntry> = log_for_one_session().into_iter().skip(2).collect();
        sm_twice.on_apply(tail);

        assert_eq!(
            sm_once.state().find_global("x1", true),
            sm_twice.state().find_global("x1", true)
        );
    }

    #[test]
    fn test_leader_closure_receives_apply_outcome() {
        let sm = machine();
        let session = GlobalSession::new("x1", 1, "app", "group", "tx", 60_000);
        let message = SessionSyncMessage::add_global(SessionQueue::Root, &session).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        sm.on_apply(vec![ApplyEntry::with_closure(
            message.encode().unwrap(),
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        )]);
        done_rx.recv().unwrap().unwrap();
        assert!(sm.state().find_global("x1", false).is_some());
    }

    #[test]
    fn test_undecodable_entry_fails_closure() {
        let sm = machine();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        sm.on_apply(vec![ApplyEntry::with_closure(
            vec![0xff, 0xff, 0xff],
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        )]);
        assert!(done_rx.recv().unwrap().is_err());
    }

    #[test]
    fn test_leader_start_resumes_rollbacks_and_notifies() {
        struct Recorder(std::sync::Mutex<Vec<u64>>);
        impl LeaderEventListener for Recorder {
            fn on_leader_start(&self, term: u64) {
                self.0.lock().unwrap().push(term);
            }
            fn on_leader_stop(&self) {}
        }

        let sm = machine();
        let mut session = GlobalSession::new("x1", 1, "app", "group", "tx", 60_000);
        session.status = GlobalStatus::TimeoutRollbacking;
        sm.state().apply_add_global(SessionQueue::Root, session);

        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        sm.register_leader_listener(recorder.clone());
        sm.on_leader_start(7);

        assert!(sm.is_leader());
        assert_eq!(sm.term(), 7);
        assert_eq!(
            sm.state()
                .queue_sessions(SessionQueue::RetryRollbacking)
                .len(),
            1
        );
        assert_eq!(*recorder.0.lock().unwrap(), vec![7]);

        sm.on_leader_stop();
        assert!(!sm.is_leader());
    }

    #[test]
    fn test_leader_refuses_snapshot_load() {
        struct NoReader;
        impl SnapshotReader for NoReader {
            fn path(&self) -> &std::path::Path {
                std::path::Path::new("/nonexistent")
            }
        }

        let sm = machine();
        sm.on_leader_start(1);
        assert!(sm.on_snapshot_load(&NoReader).is_err());
    }

    #[test]
    fn test_snapshot_save_skipped_outside_replicated_mode() {
        struct NoWriter;
        impl SnapshotWriter for NoWriter {
            fn path(&self) -> &std::path::Path {
                std::path::Path::new("/nonexistent")
            }
            fn add_file(&mut self, _name: &str) -> bool {
                panic!("nothing must be written");
            }
        }

        let sm = ReplicationStateMachine::new(
            Arc::new(ReplicatedState::new()),
            Arc::new(UnrestrictedLocks),
            StoreMode::Kv,
        );
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        sm.on_snapshot_save(
            Box::new(NoWriter),
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        );
        done_rx.recv().unwrap().unwrap();
    }
}

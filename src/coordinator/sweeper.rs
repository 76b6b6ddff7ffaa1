// Sweep entry points.
//
// Background sweepers (scheduled by the serving layer) call these over the
// retry queues; each pass re-locks the session and re-runs the phase-two
// driver with `retrying` set. Leadership transitions of the replicated
// store also land here.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::CoordinatorResult;
use crate::replication::LeaderEventListener;
use crate::session::{GlobalSession, GlobalStatus, SessionLifecycleListener};
use crate::store::{SessionQueue, SessionStore};

use super::core::TransactionCoordinator;

impl TransactionCoordinator {
    /// Finishes deferred commits. Returns the number of sessions completed.
    pub fn sweep_async_committing(&self) -> CoordinatorResult<usize> {
        self.sweep(SessionQueue::AsyncCommitting, |status| {
            status == GlobalStatus::AsyncCommitting
        })
    }

    /// Retries commits that hit retryable branch failures.
    pub fn sweep_commit_retrying(&self) -> CoordinatorResult<usize> {
        self.sweep(SessionQueue::RetryCommitting, |status| {
            status == GlobalStatus::CommitRetrying
        })
    }

    /// Retries rollbacks, including those resumed after a leader handover.
    pub fn sweep_rollback_retrying(&self) -> CoordinatorResult<usize> {
        self.sweep(SessionQueue::RetryRollbacking, |status| {
            status.is_rollback_in_flight()
        })
    }

    /// Moves timed-out `Begin` sessions into timeout rollback.
    pub fn sweep_timeouts(&self) -> CoordinatorResult<usize> {
        let mut transitioned = 0;
        for stored in self.store.find_by_statuses(&[GlobalStatus::Begin])? {
            let handle = match self.holder.get(&stored.xid) {
                Some(handle) => handle,
                None => self.holder.register(stored),
            };
            let mut session = handle.lock();
            if session.status != GlobalStatus::Begin || !session.is_timed_out() {
                continue;
            }
            match self.timeout_rollback(&mut session) {
                Ok(true) => transitioned += 1,
                Ok(false) => {}
                Err(err) => error!(xid = %session.xid, error = %err, "timeout transition failed"),
            }
        }
        Ok(transitioned)
    }

    fn sweep(
        &self,
        queue: SessionQueue,
        eligible: fn(GlobalStatus) -> bool,
    ) -> CoordinatorResult<usize> {
        let rollback = queue == SessionQueue::RetryRollbacking;
        let mut completed = 0;
        for stored in self.store.queue_sessions(queue)? {
            let handle = match self.holder.get(&stored.xid) {
                Some(handle) => handle,
                None => self.holder.register(stored),
            };
            let mut session = handle.lock();
            if !eligible(session.status) {
                continue;
            }
            let driven = if rollback {
                self.drive_rollback(&mut session, true)
            } else {
                self.drive_commit(&mut session, true)
            };
            match driven {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(xid = %session.xid, error = %err, "sweep pass failed; session kept queued");
                }
            }
        }
        Ok(completed)
    }
}

/// Evicts ended sessions from every side queue.
///
/// Registered when this node becomes leader so that sessions re-inserted by
/// the handover leave the queues once they reach a terminal status.
pub(crate) struct QueueEvictionListener {
    pub(crate) store: Arc<dyn SessionStore>,
}

impl SessionLifecycleListener for QueueEvictionListener {
    fn on_status_change(&self, _session: &GlobalSession, _status: GlobalStatus) {}

    fn on_end(&self, session: &GlobalSession) {
        for queue in [
            SessionQueue::AsyncCommitting,
            SessionQueue::RetryCommitting,
            SessionQueue::RetryRollbacking,
        ] {
            if let Err(err) = self.store.dequeue(queue, &session.xid) {
                warn!(
                    xid = %session.xid,
                    queue = queue.name(),
                    error = %err,
                    "queue eviction failed"
                );
            }
        }
    }
}

impl LeaderEventListener for TransactionCoordinator {
    fn on_leader_start(&self, term: u64) {
        info!(term, "leadership acquired; in-flight rollbacks re-queued for sweeping");
        if !self.eviction_registered.swap(true, Ordering::SeqCst) {
            self.register_listener(Arc::new(QueueEvictionListener {
                store: self.store.clone(),
            }));
        }
    }

    fn on_leader_stop(&self) {
        info!("leadership lost; this node stops driving sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{now_millis, CoordinatorConfig};
    use crate::error::CoordinatorResult;
    use crate::integration::{BranchResource, TracingEventSink, UnrestrictedLocks};
    use crate::session::{BranchSession, BranchStatus, BranchType};
    use crate::store::{KvSessionStore, MemoryKv};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedResource {
        commit_outcomes: Mutex<VecDeque<CoordinatorResult<BranchStatus>>>,
    }

    impl BranchResource for ScriptedResource {
        fn branch_commit(
            &self,
            _global: &GlobalSession,
            _branch: &BranchSession,
        ) -> CoordinatorResult<BranchStatus> {
            self.commit_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(BranchStatus::PhaseTwoCommitted))
        }

        fn branch_rollback(
            &self,
            _global: &GlobalSession,
            _branch: &BranchSession,
        ) -> CoordinatorResult<BranchStatus> {
            Ok(BranchStatus::PhaseTwoRollbacked)
        }
    }

    fn coordinator(
        outcomes: Vec<CoordinatorResult<BranchStatus>>,
    ) -> TransactionCoordinator {
        let config = CoordinatorConfig::default();
        let store = Arc::new(KvSessionStore::new(
            Arc::new(MemoryKv::new()),
            &config.store,
        ));
        TransactionCoordinator::new(
            config,
            store,
            Arc::new(UnrestrictedLocks),
            Arc::new(ScriptedResource {
                commit_outcomes: Mutex::new(outcomes.into()),
            }),
            Arc::new(TracingEventSink),
        )
    }

    #[test]
    fn test_commit_retry_sweep_finishes_the_work() {
        // First commit attempt fails retryably, the sweep succeeds.
        let tc = coordinator(vec![Ok(BranchStatus::PhaseTwoCommitFailedRetryable)]);
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::Tcc, "res1", None, None, None, None)
            .unwrap();

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committing);
        assert_eq!(tc.sweep_commit_retrying().unwrap(), 1);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::Finished);
    }

    #[test]
    fn test_async_sweep_completes_deferred_commit() {
        let tc = coordinator(Vec::new());
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::At, "res1", None, None, None, None)
            .unwrap();

        assert_eq!(tc.commit(&xid).unwrap(), GlobalStatus::Committed);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::AsyncCommitting);
        assert_eq!(tc.sweep_async_committing().unwrap(), 1);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::Finished);
    }

    #[test]
    fn test_timeout_sweep_then_rollback_sweep() {
        let tc = coordinator(Vec::new());
        let xid = tc.begin("appA", "group", "tx1", 50, None).unwrap();
        tc.branch_register(&xid, BranchType::At, "res1", None, None, None, None)
            .unwrap();
        {
            let handle = tc.live_session(&xid).unwrap().unwrap();
            handle.lock().begin_time = now_millis() - 60_000;
        }

        assert_eq!(tc.sweep_timeouts().unwrap(), 1);
        assert_eq!(
            tc.get_status(&xid).unwrap(),
            GlobalStatus::TimeoutRollbacking
        );
        assert_eq!(tc.sweep_rollback_retrying().unwrap(), 1);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::Finished);
    }

    #[test]
    fn test_sweep_skips_ineligible_sessions() {
        let tc = coordinator(Vec::new());
        let xid = tc.begin("appA", "group", "tx1", 60_000, None).unwrap();
        tc.branch_register(&xid, BranchType::Tcc, "res1", None, None, None, None)
            .unwrap();

        // Still in Begin: no queue should pick it up.
        assert_eq!(tc.sweep_commit_retrying().unwrap(), 0);
        assert_eq!(tc.sweep_rollback_retrying().unwrap(), 0);
        assert_eq!(tc.sweep_async_committing().unwrap(), 0);
        assert_eq!(tc.get_status(&xid).unwrap(), GlobalStatus::Begin);
    }
}

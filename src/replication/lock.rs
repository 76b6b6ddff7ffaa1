// Replicating lock capability.
//
// Wraps the deployment's lock capability on the leader: successful
// acquisitions are proposed to the log so every replica's lock state tracks
// the leader's. Per-branch releases stay local; the matching follower
// releases ride on the branch-removal entries, and a global release entry
// covers whatever is still held when a session ends.

use std::sync::Arc;

use tracing::warn;

use crate::error::CoordinatorResult;
use crate::integration::LockCapability;
use crate::session::{BranchSession, BranchType};

use super::consensus::{ConsensusService, SessionSyncProposer};
use super::message::SessionSyncMessage;

/// Lock capability for the leader of a replicated group.
pub struct ReplicatedLockCapability {
    inner: Arc<dyn LockCapability>,
    proposer: SessionSyncProposer,
}

impl ReplicatedLockCapability {
    pub fn new(inner: Arc<dyn LockCapability>, service: Arc<dyn ConsensusService>) -> Self {
        Self {
            inner,
            proposer: SessionSyncProposer::new(service),
        }
    }
}

impl LockCapability for ReplicatedLockCapability {
    fn acquire(&self, branch: &BranchSession) -> CoordinatorResult<bool> {
        if !self.inner.acquire(branch)? {
            return Ok(false);
        }
        let message = SessionSyncMessage::acquire_lock(branch)?;
        if let Err(err) = self.proposer.propose_sync(&message) {
            // The acquisition never reached the log; undo it locally so the
            // leader and the log stay consistent.
            if let Err(release_err) = self.inner.release(branch) {
                warn!(
                    xid = %branch.xid,
                    branch_id = branch.branch_id,
                    error = %release_err,
                    "rollback of unreplicated lock failed"
                );
            }
            return Err(err);
        }
        Ok(true)
    }

    fn release(&self, branch: &BranchSession) -> CoordinatorResult<()> {
        self.inner.release(branch)
    }

    fn release_global(&self, xid: &str, branches: &[BranchSession]) -> CoordinatorResult<()> {
        self.proposer
            .propose_sync(&SessionSyncMessage::release_global_lock(xid)?)?;
        self.inner.release_global(xid, branches)
    }

    fn query(
        &self,
        branch_type: BranchType,
        resource_id: &str,
        xid: &str,
        lock_keys: &str,
    ) -> CoordinatorResult<bool> {
        self.inner.query(branch_type, resource_id, xid, lock_keys)
    }
}

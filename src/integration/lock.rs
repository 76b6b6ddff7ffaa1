// Write-set lock capability.
//
// Conflict detection is opaque to the coordinator: it only asks for a
// branch's lock keys to be taken, released, or probed.

use crate::error::CoordinatorResult;
use crate::session::{BranchSession, BranchType};

/// Lock arbitration for branch write sets.
pub trait LockCapability: Send + Sync {
    /// Attempts to take the locks named by the branch's lock keys.
    ///
    /// Returns false on conflict; no locks are held in that case.
    fn acquire(&self, branch: &BranchSession) -> CoordinatorResult<bool>;

    /// Releases the locks held by the branch. Releasing locks that are not
    /// held is a no-op.
    fn release(&self, branch: &BranchSession) -> CoordinatorResult<()>;

    /// Releases the locks of every given branch of one global transaction.
    fn release_global(&self, xid: &str, branches: &[BranchSession]) -> CoordinatorResult<()> {
        let _ = xid;
        for branch in branches {
            self.release(branch)?;
        }
        Ok(())
    }

    /// Probes whether the given keys are currently lockable.
    fn query(
        &self,
        branch_type: BranchType,
        resource_id: &str,
        xid: &str,
        lock_keys: &str,
    ) -> CoordinatorResult<bool>;
}

/// Lock capability that grants everything.
///
/// Used for deployments whose branch types carry no write-set locks, and as
/// the default in tests.
#[derive(Debug, Default)]
pub struct UnrestrictedLocks;

impl LockCapability for UnrestrictedLocks {
    fn acquire(&self, _branch: &BranchSession) -> CoordinatorResult<bool> {
        Ok(true)
    }

    fn release(&self, _branch: &BranchSession) -> CoordinatorResult<()> {
        Ok(())
    }

    fn query(
        &self,
        _branch_type: BranchType,
        _resource_id: &str,
        _xid: &str,
        _lock_keys: &str,
    ) -> CoordinatorResult<bool> {
        Ok(true)
    }
}

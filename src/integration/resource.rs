// Branch commit/rollback capability.

use crate::error::CoordinatorResult;
use crate::session::{BranchSession, BranchStatus, GlobalSession};

/// Phase-two callouts to the resource manager owning a branch.
///
/// The returned status feeds directly into the coordinator state machine: a
/// terminal phase-two status removes or fails the branch, anything else is
/// treated as retryable. Errors are absorbed into the retry queues on the
/// first attempt.
pub trait BranchResource: Send + Sync {
    /// Asks the resource manager to commit the branch.
    fn branch_commit(
        &self,
        global: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<BranchStatus>;

    /// Asks the resource manager to roll the branch back.
    fn branch_rollback(
        &self,
        global: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<BranchStatus>;
}

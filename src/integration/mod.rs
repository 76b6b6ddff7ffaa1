// External collaborator contracts.
//
// The coordinator core drives these capabilities but never implements them:
// write-set lock arbitration, the per-branch-type commit/rollback callouts,
// and the transaction event sink.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`lock`] | Write-set lock capability |
// | [`resource`] | Branch commit/rollback capability |
// | [`event`] | Transaction lifecycle event sink |

pub mod event;
pub mod lock;
pub mod resource;

pub use event::{EventSink, GlobalTransactionEvent, TracingEventSink, TC_ROLE};
pub use lock::{LockCapability, UnrestrictedLocks};
pub use resource::BranchResource;

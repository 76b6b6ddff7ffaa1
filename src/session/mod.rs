// Session domain model.
//
// A global session is the coordinator-side record of one global transaction;
// it owns an ordered sequence of branch sessions, one per enlisted resource.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | Status and branch-type enums with their stable wire codes |
// | [`branch`] | `BranchSession` and its persisted forms |
// | [`global`] | `GlobalSession` and its persisted forms |
// | [`holder`] | Process-scoped registry of live sessions and their mutexes |

pub mod branch;
pub mod global;
pub mod holder;
pub mod types;

pub use branch::{BranchSession, BranchTransactionDo};
pub use global::{GlobalSession, GlobalTransactionDo};
pub use holder::{SessionHolder, SessionLifecycleListener, SessionRef};
pub use types::{BranchStatus, BranchType, GlobalStatus};

// Consensus bridge.
//
// Thin adapter between coordinator mutations and an abstract consensus
// service. Leader-side writes become log entries; every replica rebuilds
// its in-memory session state by applying the log, and periodic snapshots
// bound replay.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`consensus`] | Consensus service contract and the blocking proposer |
// | [`message`] | Session-sync log entry format |
// | [`state_machine`] | Apply dispatch, leader transitions |
// | [`snapshot`] | Snapshot save/load |
// | [`lock`] | Lock capability wrapper that replicates acquisitions |

pub mod consensus;
pub mod lock;
pub mod message;
pub mod snapshot;
pub mod state_machine;

pub use consensus::{ApplyEntry, CommitClosure, ConsensusService, SessionSyncProposer};
pub use lock::ReplicatedLockCapability;
pub use message::{SessionSyncMessage, SyncMsgType};
pub use snapshot::{SnapshotReader, SnapshotWriter, SNAPSHOT_DATA_FILE};
pub use state_machine::{LeaderEventListener, ReplicationStateMachine};

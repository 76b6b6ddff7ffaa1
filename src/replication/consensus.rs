// Consensus service contract.
//
// The consensus implementation (leader election, log storage, transport) is
// an external collaborator; its contract here is total order across
// `propose` calls and at-least-once, in-order delivery to `on_apply` on
// every replica.

use std::sync::mpsc;
use std::sync::Arc;

use crate::error::{CoordinatorError, CoordinatorResult};

use super::message::SessionSyncMessage;

/// Closure invoked on the leader once its entry is committed and applied
/// locally. Must be invoked exactly once.
pub type CommitClosure = Box<dyn FnOnce(CoordinatorResult<()>) + Send>;

/// One committed log entry handed to the state machine.
///
/// On the leader the entry carries the closure of the original request; on
/// followers only the raw bytes arrive.
pub struct ApplyEntry {
    pub data: Vec<u8>,
    pub done: Option<CommitClosure>,
}

impl ApplyEntry {
    /// Follower-side entry carrying only bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, done: None }
    }

    /// Leader-side entry carrying the original request's closure.
    pub fn with_closure(data: Vec<u8>, done: CommitClosure) -> Self {
        Self {
            data,
            done: Some(done),
        }
    }
}

/// The replicated-log operations the bridge is written against.
pub trait ConsensusService: Send + Sync {
    /// Appends an entry to the replicated log. `done` fires on the leader
    /// after the entry is committed and applied locally.
    fn propose(&self, entry: Vec<u8>, done: CommitClosure) -> CoordinatorResult<()>;

    /// Whether this node currently leads the group.
    fn is_leader(&self) -> bool;
}

/// Encodes session-sync messages and proposes them, blocking until the
/// entry is committed and applied on this (leader) node.
pub struct SessionSyncProposer {
    service: Arc<dyn ConsensusService>,
}

impl SessionSyncProposer {
    pub fn new(service: Arc<dyn ConsensusService>) -> Self {
        Self { service }
    }

    /// Whether this node currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.service.is_leader()
    }

    /// Proposes one message and waits for local apply.
    ///
    /// A failed apply means the mutation must not be treated as taken.
    pub fn propose_sync(&self, message: &SessionSyncMessage) -> CoordinatorResult<()> {
        if !self.service.is_leader() {
            return Err(CoordinatorError::NotLeader);
        }
        let entry = message.encode()?;
        let (done_tx, done_rx) = mpsc::channel();
        self.service.propose(
            entry,
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        )?;
        done_rx
            .recv()
            .map_err(|_| CoordinatorError::consensus("apply closure dropped before completion"))?
    }
}

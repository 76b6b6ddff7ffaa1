// Process-scoped registry of live sessions.
//
// Every mutation of a global session happens under that session's mutex;
// the holder hands out the shared handle that carries it. The xid map and
// the transaction-id map always refer to the same object.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::common::TransactionId;

use super::global::GlobalSession;
use super::types::GlobalStatus;

/// Shared handle to a live session and its mutex.
pub type SessionRef = Arc<Mutex<GlobalSession>>;

/// Listener for session lifecycle transitions.
///
/// Used by the side queues to evict sessions once they reach a terminal
/// status.
pub trait SessionLifecycleListener: Send + Sync {
    /// Called after a session's status changed.
    fn on_status_change(&self, session: &GlobalSession, status: GlobalStatus);

    /// Called when a session ends (terminal status reached, cleanup done).
    fn on_end(&self, session: &GlobalSession);
}

/// Registry of live sessions, keyed by xid and by transaction id.
pub struct SessionHolder {
    by_xid: DashMap<String, SessionRef>,
    by_transaction_id: DashMap<TransactionId, SessionRef>,
}

impl SessionHolder {
    /// Creates an empty holder.
    pub fn new() -> Self {
        Self {
            by_xid: DashMap::new(),
            by_transaction_id: DashMap::new(),
        }
    }

    /// Registers a session and returns its shared handle. Registering an
    /// xid twice replaces the old handle in both maps.
    pub fn register(&self, session: GlobalSession) -> SessionRef {
        let xid = session.xid.clone();
        let transaction_id = session.transaction_id;
        let handle: SessionRef = Arc::new(Mutex::new(session));
        self.by_xid.insert(xid, handle.clone());
        self.by_transaction_id.insert(transaction_id, handle.clone());
        handle
    }

    /// Looks up a live session by xid.
    pub fn get(&self, xid: &str) -> Option<SessionRef> {
        self.by_xid.get(xid).map(|entry| entry.value().clone())
    }

    /// Looks up a live session by transaction id.
    pub fn get_by_transaction_id(&self, transaction_id: TransactionId) -> Option<SessionRef> {
        self.by_transaction_id
            .get(&transaction_id)
            .map(|entry| entry.value().clone())
    }

    /// Evicts a session from both maps.
    ///
    /// Takes the ids instead of locking the handle: callers hold the session
    /// mutex while evicting.
    pub fn remove(&self, xid: &str, transaction_id: TransactionId) {
        self.by_xid.remove(xid);
        self.by_transaction_id.remove(&transaction_id);
    }

    /// Snapshot of the live session handles.
    pub fn all(&self) -> Vec<SessionRef> {
        self.by_xid
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.by_xid.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.by_xid.is_empty()
    }
}

impl Default for SessionHolder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(xid: &str, transaction_id: TransactionId) -> GlobalSession {
        GlobalSession::new(xid, transaction_id, "app", "group", "tx", 60_000)
    }

    #[test]
    fn test_both_maps_refer_to_same_object() {
        let holder = SessionHolder::new();
        holder.register(session("x1", 1));

        let by_xid = holder.get("x1").unwrap();
        let by_id = holder.get_by_transaction_id(1).unwrap();
        assert!(Arc::ptr_eq(&by_xid, &by_id));
    }

    #[test]
    fn test_remove_clears_both_maps() {
        let holder = SessionHolder::new();
        holder.register(session("x1", 1));
        holder.remove("x1", 1);

        assert!(holder.get("x1").is_none());
        assert!(holder.get_by_transaction_id(1).is_none());
        assert!(holder.is_empty());
    }

    #[test]
    fn test_reregister_replaces_handle() {
        let holder = SessionHolder::new();
        holder.register(session("x1", 1));

        let mut replacement = session("x1", 1);
        replacement.status = GlobalStatus::Rollbacking;
        holder.register(replacement);

        assert_eq!(holder.len(), 1);
        assert_eq!(holder.get("x1").unwrap().lock().status, GlobalStatus::Rollbacking);
    }
}

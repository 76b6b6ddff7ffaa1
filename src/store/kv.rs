// Key-value session store.
//
// Implements the full session-store contract on top of seven KV primitives.
// The key schema is bit-for-bit compatible with existing deployments and
// must not change:
//
// - `SEATA_GLOBAL_<xid>` -> JSON of the global session
// - `SEATA_TRANSACTION_ID_GLOBAL_<transactionId>` -> same JSON (secondary index)
// - `SEATA_XID_BRANCHS_<xid>` -> list of branch keys, most recent first
// - `SEATA_BRANCH_<branchId>` -> JSON of the branch session

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::{BranchId, StoreConfig, TransactionId};
use crate::error::CoordinatorResult;
use crate::session::{
    BranchSession, BranchStatus, BranchTransactionDo, GlobalSession, GlobalStatus,
    GlobalTransactionDo,
};

use super::{SessionCondition, SessionQueue, SessionStore};

/// Prefix of the primary global-session keys.
pub const GLOBAL_KEY_PREFIX: &str = "SEATA_GLOBAL_";
/// Prefix of the transaction-id secondary index keys.
pub const TRANSACTION_ID_KEY_PREFIX: &str = "SEATA_TRANSACTION_ID_GLOBAL_";
/// Prefix of the per-global branch-list keys.
pub const BRANCH_LIST_KEY_PREFIX: &str = "SEATA_XID_BRANCHS_";
/// Prefix of the branch-session keys.
pub const BRANCH_KEY_PREFIX: &str = "SEATA_BRANCH_";

fn global_key(xid: &str) -> String {
    format!("{}{}", GLOBAL_KEY_PREFIX, xid)
}

fn transaction_id_key(transaction_id: TransactionId) -> String {
    format!("{}{}", TRANSACTION_ID_KEY_PREFIX, transaction_id)
}

fn branch_list_key(xid: &str) -> String {
    format!("{}{}", BRANCH_LIST_KEY_PREFIX, xid)
}

fn branch_key(branch_id: BranchId) -> String {
    format!("{}{}", BRANCH_KEY_PREFIX, branch_id)
}

/// The KV primitives the backend is written against.
///
/// Any remote KV service exposing these operations can carry the session
/// store; each operation is treated as atomic.
pub trait KvStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> CoordinatorResult<Option<String>>;

    /// Writes a value.
    fn set(&self, key: &str, value: String) -> CoordinatorResult<()>;

    /// Deletes the given keys in one call.
    fn del(&self, keys: &[String]) -> CoordinatorResult<()>;

    /// Pushes a value onto the head of a list.
    fn lpush(&self, key: &str, value: String) -> CoordinatorResult<()>;

    /// Reads the inclusive index window `[start, stop]` of a list.
    fn lrange(&self, key: &str, start: i64, stop: i64) -> CoordinatorResult<Vec<String>>;

    /// Removes every occurrence of `value` from a list, returning the count.
    fn lrem(&self, key: &str, value: &str) -> CoordinatorResult<usize>;

    /// Cursor scan over keys matching a `prefix*` pattern. Returns the next
    /// cursor (0 when the scan is complete) and a window of keys.
    fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> CoordinatorResult<(u64, Vec<String>)>;
}

/// Session store over a shared remote KV service.
pub struct KvSessionStore {
    kv: Arc<dyn KvStore>,
    query_limit: usize,
}

impl KvSessionStore {
    /// Creates a store over the given KV service.
    pub fn new(kv: Arc<dyn KvStore>, config: &StoreConfig) -> Self {
        Self {
            kv,
            query_limit: config.query_limit.max(1),
        }
    }

    /// Writes the primary key and the transaction-id secondary index in
    /// lock-step; both always deserialize to the same value.
    fn insert_or_update_global(&self, session: &GlobalSession) -> CoordinatorResult<()> {
        let payload = serde_json::to_string(&GlobalTransactionDo::from_session(session))?;
        self.kv.set(&global_key(&session.xid), payload.clone())?;
        self.kv
            .set(&transaction_id_key(session.transaction_id), payload)?;
        Ok(())
    }

    fn insert_or_update_branch(&self, branch: &BranchSession) -> CoordinatorResult<()> {
        let key = branch_key(branch.branch_id);
        // Push the key onto the owning global's list before the value lands:
        // the list only ever points at keys that exist or are about to.
        if self.kv.get(&key)?.is_none() {
            self.kv.lpush(&branch_list_key(&branch.xid), key.clone())?;
        }
        let payload = serde_json::to_string(&BranchTransactionDo::from_session(branch))?;
        self.kv.set(&key, payload)?;
        Ok(())
    }

    /// Reads the branch keys of a global in registration order.
    ///
    /// The list is paginated in windows of `query_limit`; an empty or short
    /// window is the end of the list. Keys are deduplicated while preserving
    /// first-seen order, then reversed: the list stores most-recent first.
    fn branch_keys(&self, xid: &str) -> CoordinatorResult<Vec<String>> {
        let list_key = branch_list_key(xid);
        let page = self.query_limit as i64;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut start = 0i64;
        loop {
            let window = self.kv.lrange(&list_key, start, start + page - 1)?;
            let len = window.len();
            for key in window {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            if len < self.query_limit {
                break;
            }
            start += page;
        }
        keys.reverse();
        Ok(keys)
    }

    /// Materializes the branches of a global in registration order.
    fn read_branches(&self, xid: &str) -> CoordinatorResult<Vec<BranchSession>> {
        let mut branches = Vec::new();
        for key in self.branch_keys(xid)? {
            // A key whose value is gone is a branch removed concurrently.
            if let Some(payload) = self.kv.get(&key)? {
                let stored: BranchTransactionDo = serde_json::from_str(&payload)?;
                branches.push(stored.into_session()?);
            }
        }
        Ok(branches)
    }

    fn read_global_value(
        &self,
        payload: &str,
        with_branches: bool,
    ) -> CoordinatorResult<GlobalSession> {
        let stored: GlobalTransactionDo = serde_json::from_str(payload)?;
        let mut session = stored.into_session()?;
        if with_branches {
            for branch in self.read_branches(&session.xid)? {
                session.add_branch(branch);
            }
        }
        Ok(session)
    }
}

impl SessionStore for KvSessionStore {
    fn add_global(&self, session: &GlobalSession) -> CoordinatorResult<()> {
        self.insert_or_update_global(session)
    }

    fn update_global_status(
        &self,
        session: &GlobalSession,
        status: GlobalStatus,
    ) -> CoordinatorResult<()> {
        let mut updated = session.clone();
        updated.status = status;
        self.insert_or_update_global(&updated)
    }

    fn remove_global(&self, session: &GlobalSession) -> CoordinatorResult<()> {
        let list_key = branch_list_key(&session.xid);
        let mut keys = vec![
            global_key(&session.xid),
            transaction_id_key(session.transaction_id),
        ];
        // The branch list goes only when it is already empty; a list with
        // entries still owns branch keys that must be removed one by one.
        if self.kv.lrange(&list_key, 0, 1)?.is_empty() {
            keys.push(list_key);
        }
        self.kv.del(&keys)
    }

    fn add_branch(
        &self,
        _session: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()> {
        self.insert_or_update_branch(branch)
    }

    fn update_branch_status(
        &self,
        _session: &GlobalSession,
        branch: &BranchSession,
        status: BranchStatus,
    ) -> CoordinatorResult<()> {
        let mut updated = branch.clone();
        updated.status = status;
        self.insert_or_update_branch(&updated)
    }

    fn remove_branch(
        &self,
        session: &GlobalSession,
        branch: &BranchSession,
    ) -> CoordinatorResult<()> {
        let key = branch_key(branch.branch_id);
        self.kv.lrem(&branch_list_key(&session.xid), &key)?;
        self.kv.del(&[key])
    }

    fn find_global(
        &self,
        xid: &str,
        with_branches: bool,
    ) -> CoordinatorResult<Option<GlobalSession>> {
        match self.kv.get(&global_key(xid))? {
            Some(payload) => Ok(Some(self.read_global_value(&payload, with_branches)?)),
            None => Ok(None),
        }
    }

    fn find_by_statuses(
        &self,
        statuses: &[GlobalStatus],
    ) -> CoordinatorResult<Vec<GlobalSession>> {
        let pattern = format!("{}*", GLOBAL_KEY_PREFIX);
        let mut seen = HashSet::new();
        let mut sessions = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self.kv.scan(cursor, &pattern, self.query_limit)?;
            for key in keys {
                if !seen.insert(key.clone()) {
                    continue;
                }
                // Keys may disappear between the scan window and the read.
                if let Some(payload) = self.kv.get(&key)? {
                    let stored: GlobalTransactionDo = serde_json::from_str(&payload)?;
                    if GlobalStatus::from_code(stored.status)
                        .is_some_and(|status| statuses.contains(&status))
                    {
                        sessions.push(self.read_global_value(&payload, true)?);
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(sessions)
    }

    fn find_by_condition(
        &self,
        condition: &SessionCondition,
    ) -> CoordinatorResult<Vec<GlobalSession>> {
        if let Some(xid) = &condition.xid {
            return Ok(self.find_global(xid, true)?.into_iter().collect());
        }
        if let Some(transaction_id) = condition.transaction_id {
            let key = transaction_id_key(transaction_id);
            return match self.kv.get(&key)? {
                Some(payload) => {
                    let stored: GlobalTransactionDo = serde_json::from_str(&payload)?;
                    Ok(self.find_global(&stored.xid, true)?.into_iter().collect())
                }
                None => Ok(Vec::new()),
            };
        }
        if let Some(statuses) = &condition.statuses {
            return self.find_by_statuses(statuses);
        }
        Ok(Vec::new())
    }

    // Queue membership in this backend is carried entirely by the session
    // status, which the coordinator persists before enqueueing; the queue
    // operations themselves have nothing to write.

    fn enqueue(&self, _queue: SessionQueue, _session: &GlobalSession) -> CoordinatorResult<()> {
        Ok(())
    }

    fn dequeue(&self, _queue: SessionQueue, _xid: &str) -> CoordinatorResult<()> {
        Ok(())
    }

    fn queue_sessions(&self, queue: SessionQueue) -> CoordinatorResult<Vec<GlobalSession>> {
        self.find_by_statuses(queue.statuses())
    }
}

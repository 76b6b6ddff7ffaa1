// # Common Types and Configuration
//
// Shared identifiers, the monotonic id source, xid helpers, and the
// configuration structs threaded through the coordinator at startup.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// 64-bit identifier assigned by the coordinator to each global transaction.
pub type TransactionId = i64;

/// 64-bit identifier of a branch within its global transaction.
pub type BranchId = i64;

/// Returns the current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Identity
// ============================================================================

/// Monotonic 64-bit id source for transaction and branch ids.
///
/// Seeded from the wall clock so ids stay monotonic across restarts of the
/// same coordinator instance; within a process every call is a plain atomic
/// increment.
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    /// Creates a generator seeded from the current time.
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(now_millis() << 12),
        }
    }

    /// Creates a generator starting at a fixed value (tests, replay).
    pub fn with_initial(initial: i64) -> Self {
        Self {
            next: AtomicI64::new(initial),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builds an xid from the coordinator instance id and a transaction id.
///
/// The xid is opaque to everything but this pair of helpers.
pub fn build_xid(instance_id: &str, transaction_id: TransactionId) -> String {
    format!("{}:{}", instance_id, transaction_id)
}

/// Extracts the transaction id from an xid produced by [`build_xid`].
pub fn transaction_id_from_xid(xid: &str) -> Option<TransactionId> {
    xid.rsplit(':').next()?.parse().ok()
}

// ============================================================================
// Configuration
// ============================================================================

/// Session-store backend selector.
///
/// The replicated backend is active only when the configured mode equals its
/// canonical name; every other value selects the key-value backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Key-value session store over a shared remote KV service.
    Kv,
    /// In-memory session store replicated by a consensus log.
    Replicated,
}

impl StoreMode {
    /// Canonical configuration name of this mode.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            StoreMode::Kv => "kv",
            StoreMode::Replicated => "raft",
        }
    }

    /// Parses a configured mode name. Unknown names select the KV backend.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("raft") {
            StoreMode::Replicated
        } else {
            StoreMode::Kv
        }
    }
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Kv
    }
}

/// Session-store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend selector (`store.mode`).
    pub mode: StoreMode,
    /// Branch-list page size for KV reads (`store.redis.queryLimit`).
    pub query_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            query_limit: 100,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identifier of this coordinator instance, embedded in assigned xids.
    pub instance_id: String,
    /// Default global timeout when the client supplies none.
    pub default_timeout_ms: i32,
    /// Session-store configuration.
    pub store: StoreConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().simple().to_string(),
            default_timeout_ms: 60_000,
            store: StoreConfig::default(),
        }
    }
}

// In-process KV store.
//
// Implements the KV primitives over sharded concurrent maps. Used by the
// test suites and by single-node deployments that want the KV backend
// without a remote service.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::error::CoordinatorResult;

use super::kv::KvStore;

/// In-memory implementation of the KV primitives.
///
/// Lists keep their head at index 0, so `lpush` prepends, matching the
/// remote service's ordering. `scan` walks keys in sorted order with the
/// cursor as an offset, which keeps windows stable enough for the
/// prefix scans the session store performs.
pub struct MemoryKv {
    entries: DashMap<String, String>,
    lists: DashMap<String, Vec<String>>,
    lrange_calls: AtomicUsize,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            lists: DashMap::new(),
            lrange_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `lrange` calls since the last reset. Test instrumentation.
    pub fn lrange_calls(&self) -> usize {
        self.lrange_calls.load(Ordering::Relaxed)
    }

    /// Resets the operation counters. Test instrumentation.
    pub fn reset_op_counts(&self) {
        self.lrange_calls.store(0, Ordering::Relaxed);
    }

    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> CoordinatorResult<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: String) -> CoordinatorResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, keys: &[String]) -> CoordinatorResult<()> {
        for key in keys {
            self.entries.remove(key);
            self.lists.remove(key);
        }
        Ok(())
    }

    fn lpush(&self, key: &str, value: String) -> CoordinatorResult<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .insert(0, value);
        Ok(())
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> CoordinatorResult<Vec<String>> {
        self.lrange_calls.fetch_add(1, Ordering::Relaxed);
        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let from = if start < 0 { (len + start).max(0) } else { start };
        let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if from > to || from >= len {
            return Ok(Vec::new());
        }
        Ok(list[from as usize..=(to as usize)].to_vec())
    }

    fn lrem(&self, key: &str, value: &str) -> CoordinatorResult<usize> {
        let Some(mut list) = self.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|entry| entry != value);
        Ok(before - list.len())
    }

    fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> CoordinatorResult<(u64, Vec<String>)> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.lists.iter().map(|entry| entry.key().clone()))
            .filter(|key| Self::matches(pattern, key))
            .collect();
        keys.sort();

        let offset = cursor as usize;
        let window: Vec<String> = keys.iter().skip(offset).take(count).cloned().collect();
        let next = offset + window.len();
        let next_cursor = if next >= keys.len() { 0 } else { next as u64 };
        Ok((next_cursor, window))
    }
}

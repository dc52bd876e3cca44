//! Post deduplication cache.
//!
//! This module provides the [`DedupeCache`] which tracks which post URIs have
//! already been matched, so a post reappearing in the stream (reconnect
//! overlap, duplicate commits) is not dispatched twice.
//!
//! # Key Design
//!
//! - Keys: post record URIs
//! - Values: sequence number at first sight
//! - Entries older than a fixed number of collate windows are purged at
//!   batch boundaries
//! - Shard-local and rebuildable from the stream, so purely in-memory
//!
//! Duplicate detection only has to cover the reconnect overlap horizon;
//! anything older than the retention window is gone from the stream anyway.

use std::collections::HashMap;

/// In-memory deduplication cache for post URIs.
#[derive(Debug, Default)]
pub struct DedupeCache {
    seen: HashMap<String, u64>,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and mark a post URI in one operation.
    ///
    /// Returns `true` if the URI is new (was not seen before), `false` if it
    /// was already seen. The stored sequence number is never refreshed; the
    /// first sighting decides when the entry expires.
    pub fn check_and_mark(&mut self, uri: &str, seq: u64) -> bool {
        if self.seen.contains_key(uri) {
            return false;
        }
        self.seen.insert(uri.to_string(), seq);
        true
    }

    /// Drop every entry first seen at or before `horizon`.
    pub fn purge(&mut self, horizon: u64) {
        self.seen.retain(|_, &mut first_seen| first_seen > horizon);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

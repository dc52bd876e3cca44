//! Persistence seam.
//!
//! Everything the pipeline reads from or writes to durable storage goes
//! through the [`Store`] trait: feed definitions, per-shard cursor records,
//! and the matcher's command batches. The production implementation is
//! [`mongo::MongoStore`]; tests use [`memory::MemoryStore`] to assert on
//! resulting state and replay idempotence.

pub mod memory;
pub mod mongo;

use crate::commands::PersistenceCommand;
use crate::feeds::FeedDoc;
use crate::Result;
use async_trait::async_trait;

/// Persisted consumption state of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRecord {
    /// Last acknowledged sequence number.
    pub cursor: i64,
    /// Exclusive upper bound for a catch-up shard; `-1` = unbounded (live).
    pub range_end: i64,
}

impl CursorRecord {
    pub const UNBOUNDED: i64 = -1;

    pub fn unbounded(cursor: i64) -> Self {
        Self {
            cursor,
            range_end: Self::UNBOUNDED,
        }
    }

    /// A shard is active while it has stream left to consume.
    pub fn is_active(&self) -> bool {
        self.range_end < 0 || self.cursor < self.range_end
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Load every feed definition document.
    async fn load_feeds(&self) -> Result<Vec<FeedDoc>>;

    /// Load a shard's cursor record, if one is persisted.
    async fn load_cursor(&self, shard: usize) -> Result<Option<CursorRecord>>;

    /// Persist a shard's cursor record (upsert).
    async fn save_cursor(&self, shard: usize, record: CursorRecord) -> Result<()>;

    /// Set only the catch-up ceiling of a shard's cursor record.
    async fn set_range_end(&self, shard: usize, range_end: i64) -> Result<()>;

    /// Remove a retired shard's cursor record.
    async fn delete_cursor(&self, shard: usize) -> Result<()>;

    /// Apply one batch of matcher commands. Implementations must be safe to
    /// call again with the same slice (all commands are keyed).
    async fn apply(&self, commands: &[PersistenceCommand]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_activity() {
        assert!(CursorRecord::unbounded(5).is_active());
        assert!(CursorRecord {
            cursor: 10,
            range_end: 20
        }
        .is_active());
        assert!(!CursorRecord {
            cursor: 20,
            range_end: 20
        }
        .is_active());
        assert!(!CursorRecord {
            cursor: 25,
            range_end: 20
        }
        .is_active());
    }
}

//! Firehose feed-indexing pipeline.
//!
//! Consumes the atproto repository-commit firehose, matches each event
//! against tenant-defined feed definitions, and writes idempotent batches of
//! persistence commands to the document store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  FirehoseClient  │  websocket subscription, per shard
//! └────────┬─────────┘
//!          │ commit events
//!          ▼
//! ┌──────────────────┐
//! │     Collator     │  typed records, batches at seq-window boundaries
//! └────────┬─────────┘
//!          │ one batch in flight
//!          ▼
//! ┌──────────────────┐
//! │     Matcher      │  feed gates, dedup, persistence commands
//! └────────┬─────────┘
//!          │ commands + batch result
//!          ▼
//! ┌──────────────────┐
//! │   Coordinator    │  acks, cursors, retirement, rebalancing
//! └──────────────────┘
//! ```
//!
//! Shards run this pipeline in parallel over disjoint stream ranges; the
//! coordinator owns all cross-shard state and persists one cursor record per
//! shard. Every persistence command is idempotent, so an unacknowledged batch
//! is simply replayed after a reconnect.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod dedupe;
pub mod error;
pub mod feeds;
pub mod firehose;
pub mod matcher;
pub mod metrics;
pub mod shard;
pub mod store;

// Re-export commonly used types at crate root
pub use config::Settings;
pub use coordinator::{Ack, Activation, BatchResult, Coordinator, CoordinatorMsg, ShardChannels};
pub use decode::{Collator, OpsBatch};
pub use dedupe::DedupeCache;
pub use error::{Error, Result};
pub use feeds::{FeedDefinition, FeedMode, FeedSet, ReloadFlag};
pub use firehose::{CommitEvent, FirehoseClient};
pub use matcher::Matcher;
pub use shard::{DispatchMsg, Shard, Worker};
pub use store::{mongo::MongoStore, CursorRecord, Store};

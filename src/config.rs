//! Runtime configuration for the ingestion pipeline.
//!
//! All tuning knobs are plain values gathered into [`Settings`]; nothing here
//! has dynamic behavior attached. `main.rs` builds this from CLI/env flags.

use chrono::FixedOffset;
use std::time::Duration;

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Firehose endpoint, e.g. `wss://bsky.network`.
    pub service: String,

    /// Number of parallel shard consumers.
    pub num_shards: usize,

    /// Batch boundary: an OpsBatch is dispatched whenever the event sequence
    /// number is a multiple of this window.
    pub collate_window: u64,

    /// Processing lag (now minus batch median createdAt) above which a batch
    /// is flagged as divergent.
    pub divergence_threshold: Duration,

    /// Consecutive divergent batches before the ring-successor shard is
    /// activated.
    pub rebalance_trigger: u32,

    /// Dedup-cache retention, in multiples of the collate window. Entries
    /// first seen more than `collate_window * dedup_retention_windows`
    /// sequence numbers ago are purged.
    pub dedup_retention_windows: u64,

    /// Delay before reconnecting after a generic stream error.
    pub reconnect_delay: Duration,

    /// Cool-down before reconnecting after an upstream overload (503).
    pub overload_cooldown: Duration,

    /// How long a shard waits for the coordinator's ack before aborting its
    /// connection.
    pub ack_timeout: Duration,

    /// WebSocket ping interval.
    pub heartbeat_interval: Duration,

    /// How often a shard worker checks the pending flag and reloads feed
    /// definitions.
    pub feed_reload_interval: Duration,

    /// Post documents expire this long after indexing.
    pub post_expiry: Duration,

    /// UTC offset used when printing human-readable pacing timestamps.
    /// Presentation only; `None` means UTC.
    pub log_utc_offset: Option<FixedOffset>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: "wss://bsky.network".to_string(),
            num_shards: 1,
            collate_window: 1000,
            divergence_threshold: Duration::from_secs(20 * 60),
            rebalance_trigger: 3,
            dedup_retention_windows: 30,
            reconnect_delay: Duration::from_secs(3),
            overload_cooldown: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(20),
            feed_reload_interval: Duration::from_secs(10 * 60),
            post_expiry: Duration::from_secs(7 * 24 * 60 * 60),
            log_utc_offset: None,
        }
    }
}

impl Settings {
    /// Dedup-cache retention expressed in sequence numbers.
    pub fn dedup_retention_seqs(&self) -> u64 {
        self.collate_window * self.dedup_retention_windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.num_shards >= 1);
        assert_eq!(s.dedup_retention_seqs(), s.collate_window * 30);
        assert_eq!(s.ack_timeout, Duration::from_secs(15));
        assert_eq!(s.reconnect_delay, Duration::from_secs(3));
        assert_eq!(s.overload_cooldown, Duration::from_secs(60));
    }
}

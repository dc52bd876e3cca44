//! Firehose feed-indexing daemon.
//!
//! Entry point for the stream consumer. It connects to the atproto firehose,
//! fans the commit stream out to shard consumers, matches events against the
//! feed definitions stored in MongoDB, and writes batched persistence
//! commands back.
//!
//! # Usage
//!
//! ```bash
//! # Run against the public relay with a local store
//! skyhose --db-uri mongodb://localhost:27017 --db-name feeds
//!
//! # Resume with more shards and a tighter collate window
//! skyhose --shards 4 --collate-window 500
//! ```
//!
//! Shard cursors are persisted per batch, so restarting the process resumes
//! from the last acknowledged positions.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use skyhose::metrics::{init_metrics, start_metrics_server};
use skyhose::{
    Coordinator, FeedSet, Matcher, MongoStore, ReloadFlag, Settings, Shard, ShardChannels, Store,
    Worker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Firehose feed-indexing daemon.
#[derive(Parser, Debug)]
#[command(name = "skyhose")]
#[command(about = "atproto firehose feed-indexing daemon")]
#[command(version)]
struct Args {
    /// Firehose endpoint
    #[arg(long, env = "FIREHOSE_SERVICE", default_value = "wss://bsky.network")]
    service: String,

    /// MongoDB connection string; a `<password>` placeholder is substituted
    /// with --db-password
    #[arg(long, env = "DB_URI", default_value = "mongodb://localhost:27017")]
    db_uri: String,

    /// MongoDB password, substituted into the connection string
    #[arg(long, env = "DB_PASSWORD")]
    db_password: Option<String>,

    /// Database name
    #[arg(long, env = "DB_NAME", default_value = "feeds")]
    db_name: String,

    /// Number of shard consumers
    #[arg(long, env = "NUM_SHARDS", default_value = "2")]
    shards: usize,

    /// Sequence numbers per batch window
    #[arg(long, default_value = "1000")]
    collate_window: u64,

    /// Processing-lag threshold in seconds before a batch counts as divergent
    #[arg(long, default_value = "1200")]
    divergence_threshold_secs: u64,

    /// Consecutive divergent batches before the next shard is activated
    #[arg(long, default_value = "3")]
    rebalance_trigger: u32,

    /// UTC offset in hours for human-readable pacing logs
    #[arg(long, env = "LOG_UTC_OFFSET_HOURS", allow_hyphen_values = true)]
    log_utc_offset_hours: Option<i32>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        ensure!(self.shards >= 1, "at least one shard is required");
        ensure!(self.collate_window >= 1, "collate window must be positive");

        let log_utc_offset = match self.log_utc_offset_hours {
            Some(hours) => Some(
                chrono::FixedOffset::east_opt(hours * 3600)
                    .context("log UTC offset out of range")?,
            ),
            None => None,
        };

        Ok(Settings {
            service: self.service.clone(),
            num_shards: self.shards,
            collate_window: self.collate_window,
            divergence_threshold: Duration::from_secs(self.divergence_threshold_secs),
            rebalance_trigger: self.rebalance_trigger,
            log_utc_offset,
            ..Settings::default()
        })
    }

    fn connection_string(&self) -> String {
        match &self.db_password {
            Some(password) => self.db_uri.replace("<password>", password),
            None => self.db_uri.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("skyhose=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let settings = args.settings()?;

    tracing::info!("firehose feed indexer starting...");

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle).await?;
    }

    let store = Arc::new(
        MongoStore::connect(&args.connection_string(), &args.db_name)
            .await
            .context("store connection failed")?,
    );
    let store_dyn: Arc<dyn Store> = store.clone();

    // One reload flag per worker; a feed change marks them all and each
    // worker's ticker drains only its own.
    let reload_flags: Vec<ReloadFlag> = (0..settings.num_shards)
        .map(|_| ReloadFlag::default())
        .collect();
    {
        let store = store.clone();
        let flags = reload_flags.clone();
        tokio::spawn(async move { store.watch_feeds(flags).await });
    }

    let docs = store_dyn
        .load_feeds()
        .await
        .context("initial feed load failed")?;
    tracing::info!(feeds = docs.len(), shards = settings.num_shards, "feed definitions loaded");
    metrics::gauge!("matcher_feeds_loaded").set(docs.len() as f64);

    let (coord_tx, coord_rx) = mpsc::channel(settings.num_shards * 8);
    let mut channels = Vec::with_capacity(settings.num_shards);
    for shard_id in 0..settings.num_shards {
        let (gate_tx, gate_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        channels.push(ShardChannels {
            gate_tx,
            control_tx,
        });

        let matcher = Matcher::new(FeedSet::from_docs(&docs), &settings);
        let worker = Worker::new(
            shard_id,
            settings.clone(),
            matcher,
            store_dyn.clone(),
            reload_flags[shard_id].clone(),
            dispatch_rx,
            coord_tx.clone(),
        );
        tokio::spawn(worker.run());

        let shard = Shard::new(
            shard_id,
            settings.clone(),
            coord_tx.clone(),
            control_rx,
            gate_rx,
            dispatch_tx,
        );
        tokio::spawn(shard.run());
    }
    drop(coord_tx);

    let coordinator = Coordinator::new(settings, store_dyn, coord_rx, channels);
    let coordinator = tokio::spawn(coordinator.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = coordinator => {
            match result {
                Ok(Ok(())) => tracing::info!("coordinator stopped"),
                Ok(Err(err)) => return Err(err).context("coordinator failed"),
                Err(err) => return Err(err).context("coordinator task panicked"),
            }
        }
    }
    Ok(())
}

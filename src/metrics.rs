//! Prometheus metrics helpers.
//!
//! Centralized recorder initialization and metric descriptions for the
//! pipeline. Components record through the `metrics` macros directly; this
//! module only installs the recorder and serves the `/metrics` endpoint.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `firehose_` (stream side), `matcher_`, `coordinator_`
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - The `shard` label is the only label in use; shard counts are small

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();
    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed. Used by tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves `/metrics` on the given port; spawns a background task and returns
/// immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("metrics server stopped: {err}");
        }
    });

    Ok(())
}

fn register_metrics() {
    describe_counter!(
        "firehose_events_total",
        "Commit events received from the firehose"
    );
    describe_counter!(
        "firehose_reconnects_total",
        "Stream reconnections (label: shard)"
    );
    describe_counter!(
        "firehose_overload_cooldowns_total",
        "Reconnections deferred by an upstream overload signal"
    );
    describe_counter!(
        "firehose_ack_timeouts_total",
        "Connections aborted by the ack watchdog (label: shard)"
    );

    describe_counter!("matcher_batches_total", "Batches dispatched and evaluated");
    describe_counter!(
        "matcher_batches_divergent_total",
        "Batches whose median post age exceeded the divergence threshold"
    );
    describe_counter!("matcher_posts_matched_total", "Posts matched into feeds");
    describe_counter!(
        "matcher_commands_total",
        "Persistence commands emitted by the matcher"
    );
    describe_gauge!("matcher_feeds_loaded", "Feed definitions currently loaded");

    describe_counter!(
        "coordinator_batches_acked_total",
        "Batch results acknowledged (label: shard)"
    );
    describe_counter!(
        "coordinator_stale_results_total",
        "Batch results dropped for a dispatch-timestamp mismatch"
    );
    describe_counter!(
        "coordinator_rebalances_total",
        "Ring-successor shards activated by sustained divergence"
    );
    describe_gauge!("coordinator_shards_active", "Shards currently consuming");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_metrics_is_idempotent() {
        ensure_metrics_init();
        register_metrics();
        register_metrics();
    }
}

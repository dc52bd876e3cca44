//! Shard coordination.
//!
//! The coordinator is the only owner of cross-shard state: which shards are
//! active, their persisted cursors and catch-up ceilings, and the outstanding
//! dispatch of each shard. Shards and workers talk to it exclusively through
//! [`CoordinatorMsg`]; it answers through each shard's capacity-1 gate
//! channel, which is what enforces the single-batch-in-flight contract.
//!
//! # Handshake
//!
//! A shard announces a dispatch (`Dispatched`, carrying the dispatch
//! timestamp), the worker later reports the stored result (`BatchDone` with
//! the same timestamp). A result whose timestamp does not match the
//! outstanding dispatch is dropped; the shard's ack watchdog then aborts the
//! connection and `Reconnected` resets the handshake to accept-next.
//!
//! # Rebalancing
//!
//! Consecutive divergent batches past the configured trigger activate the
//! shard's ring successor live at the current position. A catching-up shard
//! is bounded on the new shard's first result (the catch-up ceiling) and
//! retired once its cursor reaches that ceiling.

use crate::config::Settings;
use crate::store::{CursorRecord, Store};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything the coordinator can be told.
#[derive(Debug)]
pub enum CoordinatorMsg {
    /// A shard worker finished initializing.
    Ready { shard: usize },
    /// A shard handed a batch to its worker at `ts` (Unix millis).
    Dispatched { shard: usize, ts: i64 },
    /// A worker stored a batch's commands.
    BatchDone(BatchResult),
    /// A shard aborted its connection (ack watchdog) and will resubscribe
    /// from its last acknowledged cursor.
    Reconnected { shard: usize },
}

/// Outcome of one stored batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub shard: usize,
    /// Batch boundary sequence number.
    pub cursor: u64,
    /// Dispatch timestamp echoed from [`CoordinatorMsg::Dispatched`].
    pub dispatched_at: i64,
    pub divergent: bool,
    /// First result since the shard (re)started consuming.
    pub first_since_start: bool,
}

/// Coordinator's answer through the gate channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Cursor persisted; the shard may dispatch its next batch and should
    /// resume from `cursor` after any reconnect.
    Advance { cursor: u64 },
    /// The shard reached its catch-up ceiling; close the connection and park.
    Retire,
}

/// Tells a parked shard to start consuming.
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    /// Resume point; `None` subscribes live.
    pub cursor: Option<u64>,
}

/// Coordinator-side channel ends for one shard.
pub struct ShardChannels {
    pub gate_tx: mpsc::Sender<Ack>,
    pub control_tx: mpsc::Sender<Activation>,
}

struct ShardState {
    active: bool,
    cursor: i64,
    range_end: i64,
    /// Dispatch timestamp of the batch in flight.
    outstanding: Option<i64>,
    slow_count: u32,
    channels: ShardChannels,
}

impl ShardState {
    fn record(&self) -> CursorRecord {
        CursorRecord {
            cursor: self.cursor,
            range_end: self.range_end,
        }
    }
}

pub struct Coordinator {
    settings: Settings,
    store: Arc<dyn Store>,
    rx: mpsc::Receiver<CoordinatorMsg>,
    shards: Vec<ShardState>,
}

impl Coordinator {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        rx: mpsc::Receiver<CoordinatorMsg>,
        channels: Vec<ShardChannels>,
    ) -> Self {
        let shards = channels
            .into_iter()
            .map(|channels| ShardState {
                active: false,
                cursor: 0,
                range_end: CursorRecord::UNBOUNDED,
                outstanding: None,
                slow_count: 0,
                channels,
            })
            .collect();
        Self {
            settings,
            store,
            rx,
            shards,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.await_workers().await;
        self.reconcile().await?;

        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await?;
        }
        tracing::info!("coordinator channel closed, stopping");
        Ok(())
    }

    /// Wait for every shard worker to report ready before activating anyone.
    async fn await_workers(&mut self) {
        let mut ready = HashSet::new();
        while ready.len() < self.shards.len() {
            match self.rx.recv().await {
                Some(CoordinatorMsg::Ready { shard }) => {
                    ready.insert(shard);
                }
                Some(other) => {
                    tracing::warn!(?other, "unexpected message before workers ready");
                }
                None => return,
            }
        }
        tracing::info!(workers = ready.len(), "all shard workers ready");
    }

    /// Load persisted cursors and activate the shards with stream left to
    /// consume. A cold start (no active shard) brings up shard 0 live.
    async fn reconcile(&mut self) -> Result<()> {
        for shard in 0..self.shards.len() {
            if let Some(record) = self.store.load_cursor(shard).await? {
                let state = &mut self.shards[shard];
                state.cursor = record.cursor;
                state.range_end = record.range_end;
                state.active = record.is_active();
            }
        }

        if !self.shards.iter().any(|s| s.active) {
            tracing::info!("no active shard on startup, activating shard 0 live");
            let state = &mut self.shards[0];
            state.active = true;
            state.cursor = 0;
            state.range_end = CursorRecord::UNBOUNDED;
            self.store.save_cursor(0, self.shards[0].record()).await?;
        }

        for shard in 0..self.shards.len() {
            if !self.shards[shard].active {
                continue;
            }
            let cursor = u64::try_from(self.shards[shard].cursor)
                .ok()
                .filter(|&c| c > 0);
            tracing::info!(shard, ?cursor, range_end = self.shards[shard].range_end, "activating shard");
            self.activate(shard, Activation { cursor }).await;
        }
        self.publish_active_gauge();
        Ok(())
    }

    async fn handle(&mut self, msg: CoordinatorMsg) -> Result<()> {
        match msg {
            CoordinatorMsg::Ready { shard } => {
                tracing::debug!(shard, "late ready ignored");
            }
            CoordinatorMsg::Dispatched { shard, ts } => {
                self.shards[shard].outstanding = Some(ts);
            }
            CoordinatorMsg::Reconnected { shard } => {
                let state = &mut self.shards[shard];
                state.outstanding = None;
                state.slow_count = 0;
                tracing::info!(shard, "shard reconnected, handshake reset");
            }
            CoordinatorMsg::BatchDone(result) => self.on_batch_done(result).await?,
        }
        Ok(())
    }

    pub(crate) async fn on_batch_done(&mut self, result: BatchResult) -> Result<()> {
        let shard = result.shard;

        match self.shards[shard].outstanding {
            Some(ts) if ts != result.dispatched_at => {
                // Not the batch we are waiting for. Drop it; the shard's ack
                // watchdog recovers the stalled gate.
                metrics::counter!("coordinator_stale_results_total").increment(1);
                tracing::warn!(
                    shard,
                    expected = ts,
                    got = result.dispatched_at,
                    "stale batch result dropped"
                );
                return Ok(());
            }
            _ => self.shards[shard].outstanding = None,
        }

        if result.divergent {
            self.shards[shard].slow_count += 1;
        } else {
            self.shards[shard].slow_count = 0;
        }
        if self.shards[shard].slow_count >= self.settings.rebalance_trigger {
            self.shards[shard].slow_count = 0;
            self.rebalance_from(shard, result.cursor).await?;
        }

        if result.first_since_start && result.cursor > 0 {
            self.bound_catchup_shards(shard, result.cursor).await?;
        }

        let state = &self.shards[shard];
        if state.range_end >= 0 && result.cursor as i64 >= state.range_end {
            tracing::info!(shard, cursor = result.cursor, "shard caught up, retiring");
            self.store.delete_cursor(shard).await?;
            let state = &mut self.shards[shard];
            state.active = false;
            state.cursor = 0;
            state.range_end = CursorRecord::UNBOUNDED;
            self.send_ack(shard, Ack::Retire).await;
            self.publish_active_gauge();
            return Ok(());
        }

        let state = &mut self.shards[shard];
        state.cursor = result.cursor as i64;
        let record = state.record();
        self.store.save_cursor(shard, record).await?;
        metrics::counter!("coordinator_batches_acked_total", "shard" => shard.to_string())
            .increment(1);
        self.send_ack(
            shard,
            Ack::Advance {
                cursor: result.cursor,
            },
        )
        .await;
        Ok(())
    }

    /// Activate the ring successor of `shard`, live from the current stream
    /// position. No-op when the successor is already active (or there is no
    /// other shard).
    async fn rebalance_from(&mut self, shard: usize, cursor: u64) -> Result<()> {
        let successor = (shard + 1) % self.shards.len();
        if successor == shard || self.shards[successor].active {
            tracing::debug!(shard, successor, "divergence persists, successor already active");
            return Ok(());
        }

        tracing::info!(shard, successor, cursor, "sustained divergence, activating successor");
        metrics::counter!("coordinator_rebalances_total").increment(1);

        let state = &mut self.shards[successor];
        state.active = true;
        // The overloaded shard keeps its range; the successor takes the live
        // head and persists a just-behind cursor so a crash before its first
        // ack still resubscribes near the takeover point.
        state.cursor = cursor.saturating_sub(1) as i64;
        state.range_end = CursorRecord::UNBOUNDED;
        let record = state.record();
        self.store.save_cursor(successor, record).await?;
        self.activate(successor, Activation { cursor: None }).await;
        self.publish_active_gauge();
        Ok(())
    }

    /// A newly started shard's first result fences its ring successor: if
    /// the successor is active, unbounded, and behind this cursor, it gets
    /// the cursor as its catch-up ceiling.
    async fn bound_catchup_shards(&mut self, shard: usize, cursor: u64) -> Result<()> {
        let successor = (shard + 1) % self.shards.len();
        if successor == shard {
            return Ok(());
        }
        let state = &self.shards[successor];
        if !state.active
            || state.range_end != CursorRecord::UNBOUNDED
            || state.cursor <= 0
            || state.cursor >= cursor as i64
        {
            return Ok(());
        }
        tracing::info!(
            shard = successor,
            ceiling = cursor,
            "bounding catch-up shard at new shard's start"
        );
        self.shards[successor].range_end = cursor as i64;
        self.store.set_range_end(successor, cursor as i64).await?;
        Ok(())
    }

    async fn activate(&self, shard: usize, activation: Activation) {
        if self.shards[shard]
            .channels
            .control_tx
            .send(activation)
            .await
            .is_err()
        {
            tracing::error!(shard, "shard control channel closed");
        }
    }

    async fn send_ack(&self, shard: usize, ack: Ack) {
        if self.shards[shard].channels.gate_tx.send(ack).await.is_err() {
            tracing::error!(shard, "shard gate channel closed");
        }
    }

    fn publish_active_gauge(&self) {
        let active = self.shards.iter().filter(|s| s.active).count();
        metrics::gauge!("coordinator_shards_active").set(active as f64);
    }
}

//! Shard tasks.
//!
//! Each shard is a pair of tokio tasks joined by a capacity-1 dispatch
//! channel:
//!
//! - the **shard task** ([`Shard`]) owns the firehose connection, collates
//!   events into batches, and enforces the single-batch-in-flight contract
//!   against the coordinator's gate channel;
//! - the **worker task** ([`Worker`]) owns the matcher and the store handle,
//!   evaluates each dispatched batch, applies the resulting commands, and
//!   reports the outcome to the coordinator.
//!
//! Ordering invariant: the shard sends `Dispatched` to the coordinator
//! before handing the batch to the worker, so the coordinator always sees
//! the dispatch before its result.
//!
//! A shard parks between activations; the coordinator can retire it and
//! reactivate it later (rebalancing).

use crate::config::Settings;
use crate::coordinator::{Ack, Activation, BatchResult, CoordinatorMsg};
use crate::decode::{Collator, OpsBatch};
use crate::firehose::{classify_disconnect, DisconnectKind, FirehoseClient};
use crate::matcher::Matcher;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One collated batch handed from a shard to its worker.
#[derive(Debug)]
pub struct DispatchMsg {
    pub batch: OpsBatch,
    /// Batch boundary sequence number.
    pub cursor: u64,
    /// Dispatch timestamp, echoed back in the batch result.
    pub dispatched_at: i64,
    /// First dispatch since the shard started consuming.
    pub first_since_start: bool,
}

enum ShardExit {
    /// Coordinator retired the shard; park until the next activation.
    Retired,
    /// A channel closed; the process is shutting down.
    Closed,
}

pub struct Shard {
    pub id: usize,
    settings: Settings,
    coord_tx: mpsc::Sender<CoordinatorMsg>,
    control_rx: mpsc::Receiver<Activation>,
    gate_rx: mpsc::Receiver<Ack>,
    dispatch_tx: mpsc::Sender<DispatchMsg>,
}

impl Shard {
    pub fn new(
        id: usize,
        settings: Settings,
        coord_tx: mpsc::Sender<CoordinatorMsg>,
        control_rx: mpsc::Receiver<Activation>,
        gate_rx: mpsc::Receiver<Ack>,
        dispatch_tx: mpsc::Sender<DispatchMsg>,
    ) -> Self {
        Self {
            id,
            settings,
            coord_tx,
            control_rx,
            gate_rx,
            dispatch_tx,
        }
    }

    pub async fn run(mut self) {
        while let Some(activation) = self.control_rx.recv().await {
            tracing::info!(shard = self.id, cursor = ?activation.cursor, "shard activated");
            match self.consume(activation.cursor).await {
                ShardExit::Retired => {
                    tracing::info!(shard = self.id, "shard retired, parking");
                }
                ShardExit::Closed => break,
            }
        }
        tracing::debug!(shard = self.id, "shard task stopping");
    }

    async fn consume(&mut self, start: Option<u64>) -> ShardExit {
        let mut resume = start;
        let mut in_flight = false;
        let mut first_dispatch = true;

        loop {
            let mut client = match FirehoseClient::connect(
                &self.settings.service,
                resume,
                self.settings.heartbeat_interval,
            )
            .await
            {
                Ok(client) => client,
                Err(err) => {
                    let kind = classify_disconnect(&err);
                    tracing::warn!(shard = self.id, "subscribe failed ({kind:?}): {err}");
                    tokio::time::sleep(self.reconnect_delay(kind)).await;
                    continue;
                }
            };
            tracing::info!(shard = self.id, cursor = ?resume, "subscribed to firehose");
            let mut collator = Collator::new(self.settings.collate_window);

            let disconnect = loop {
                let event = match client.next_commit().await {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        tracing::warn!(shard = self.id, "stream closed by upstream");
                        break DisconnectKind::Other;
                    }
                    Err(err) => {
                        let kind = classify_disconnect(&err);
                        tracing::warn!(shard = self.id, "stream error ({kind:?}): {err}");
                        break kind;
                    }
                };
                metrics::counter!("firehose_events_total").increment(1);

                let Some(batch) = collator.ingest(&event, Utc::now().timestamp_millis()) else {
                    continue;
                };

                if in_flight {
                    match self.await_ack().await {
                        // The next dispatch below re-arms the in-flight flag.
                        AckOutcome::Advanced(cursor) => resume = Some(cursor),
                        AckOutcome::Retired => {
                            client.close().await;
                            return ShardExit::Retired;
                        }
                        AckOutcome::Closed => return ShardExit::Closed,
                        AckOutcome::TimedOut => {
                            // Watchdog: the gate never opened. Abort the
                            // connection, reset the handshake, and resume
                            // from the last acknowledged cursor.
                            metrics::counter!("firehose_ack_timeouts_total", "shard" => self.id.to_string()).increment(1);
                            tracing::warn!(shard = self.id, "ack watchdog fired, reconnecting");
                            if self
                                .coord_tx
                                .send(CoordinatorMsg::Reconnected { shard: self.id })
                                .await
                                .is_err()
                            {
                                return ShardExit::Closed;
                            }
                            in_flight = false;
                            break DisconnectKind::Other;
                        }
                    }
                }

                // Drain any ack that arrived after a handshake reset.
                loop {
                    match self.gate_rx.try_recv() {
                        Ok(Ack::Advance { cursor }) => resume = Some(cursor),
                        Ok(Ack::Retire) => {
                            client.close().await;
                            return ShardExit::Retired;
                        }
                        Err(_) => break,
                    }
                }

                let dispatched_at = Utc::now().timestamp_millis();
                if self
                    .coord_tx
                    .send(CoordinatorMsg::Dispatched {
                        shard: self.id,
                        ts: dispatched_at,
                    })
                    .await
                    .is_err()
                {
                    return ShardExit::Closed;
                }
                let msg = DispatchMsg {
                    batch,
                    cursor: event.seq,
                    dispatched_at,
                    first_since_start: first_dispatch,
                };
                if self.dispatch_tx.send(msg).await.is_err() {
                    return ShardExit::Closed;
                }
                first_dispatch = false;
                in_flight = true;
            };

            metrics::counter!("firehose_reconnects_total", "shard" => self.id.to_string())
                .increment(1);
            tokio::time::sleep(self.reconnect_delay(disconnect)).await;
        }
    }

    async fn await_ack(&mut self) -> AckOutcome {
        match tokio::time::timeout(self.settings.ack_timeout, self.gate_rx.recv()).await {
            Ok(Some(Ack::Advance { cursor })) => AckOutcome::Advanced(cursor),
            Ok(Some(Ack::Retire)) => AckOutcome::Retired,
            Ok(None) => AckOutcome::Closed,
            Err(_) => AckOutcome::TimedOut,
        }
    }

    fn reconnect_delay(&self, kind: DisconnectKind) -> std::time::Duration {
        match kind {
            DisconnectKind::Overload => {
                metrics::counter!("firehose_overload_cooldowns_total").increment(1);
                self.settings.overload_cooldown
            }
            DisconnectKind::Other => self.settings.reconnect_delay,
        }
    }
}

enum AckOutcome {
    Advanced(u64),
    Retired,
    TimedOut,
    Closed,
}

pub struct Worker {
    shard: usize,
    settings: Settings,
    matcher: Matcher,
    store: Arc<dyn Store>,
    reload: crate::feeds::ReloadFlag,
    dispatch_rx: mpsc::Receiver<DispatchMsg>,
    coord_tx: mpsc::Sender<CoordinatorMsg>,
}

impl Worker {
    pub fn new(
        shard: usize,
        settings: Settings,
        matcher: Matcher,
        store: Arc<dyn Store>,
        reload: crate::feeds::ReloadFlag,
        dispatch_rx: mpsc::Receiver<DispatchMsg>,
        coord_tx: mpsc::Sender<CoordinatorMsg>,
    ) -> Self {
        Self {
            shard,
            settings,
            matcher,
            store,
            reload,
            dispatch_rx,
            coord_tx,
        }
    }

    pub async fn run(mut self) {
        if self
            .coord_tx
            .send(CoordinatorMsg::Ready { shard: self.shard })
            .await
            .is_err()
        {
            return;
        }

        let mut reload_tick = tokio::time::interval(self.settings.feed_reload_interval);
        reload_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        reload_tick.tick().await; // immediate first tick

        loop {
            tokio::select! {
                msg = self.dispatch_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.process(msg).await;
                }
                _ = reload_tick.tick() => {
                    if self.reload.take() {
                        self.reload_feeds().await;
                    }
                }
            }
        }
        tracing::debug!(shard = self.shard, "worker task stopping");
    }

    async fn process(&mut self, msg: DispatchMsg) {
        let now = Utc::now();
        let evaluation = self
            .matcher
            .evaluate(&msg.batch, msg.cursor, now.timestamp_millis());

        metrics::counter!("matcher_batches_total").increment(1);
        metrics::counter!("matcher_posts_matched_total")
            .increment(evaluation.matched_posts as u64);
        metrics::counter!("matcher_commands_total").increment(evaluation.commands.len() as u64);
        if evaluation.divergent {
            metrics::counter!("matcher_batches_divergent_total").increment(1);
        }

        if let Err(err) = self.store.apply(&evaluation.commands).await {
            // No result is reported; the shard's watchdog aborts and the
            // batch is replayed from the last acknowledged cursor.
            tracing::error!(shard = self.shard, "batch store failed, forcing replay: {err}");
            return;
        }

        tracing::info!(
            shard = self.shard,
            cursor = msg.cursor,
            ops = msg.batch.op_count(),
            matched = evaluation.matched_posts,
            divergent = evaluation.divergent,
            at = %self.pacing_timestamp(),
            "batch stored"
        );

        let result = BatchResult {
            shard: self.shard,
            cursor: msg.cursor,
            dispatched_at: msg.dispatched_at,
            divergent: evaluation.divergent,
            first_since_start: msg.first_since_start,
        };
        let _ = self.coord_tx.send(CoordinatorMsg::BatchDone(result)).await;
    }

    async fn reload_feeds(&mut self) {
        match self.store.load_feeds().await {
            Ok(docs) => {
                let set = crate::feeds::FeedSet::from_docs(&docs);
                metrics::gauge!("matcher_feeds_loaded").set(set.len() as f64);
                self.matcher.replace_feeds(set);
            }
            Err(err) => {
                // Keep the current definitions; the flag stays consumed and
                // the change stream will mark it again on the next write.
                tracing::warn!(shard = self.shard, "feed reload failed: {err}");
                self.reload.mark();
            }
        }
    }

    /// Human-readable wall-clock time in the configured log offset.
    fn pacing_timestamp(&self) -> String {
        let now = Utc::now();
        match self.settings.log_utc_offset {
            Some(offset) => now.with_timezone(&offset).format("%H:%M:%S").to_string(),
            None => now.format("%H:%M:%S").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::PersistenceCommand;
    use crate::decode::CreateOp;
    use crate::decode::records::PostRecord;
    use crate::feeds::{FeedDoc, FeedSet, KeywordRule, ReloadFlag};
    use crate::store::memory::MemoryStore;
    use crate::Result;
    use async_trait::async_trait;

    fn feed_doc(id: &str, keyword: &str) -> FeedDoc {
        FeedDoc {
            id: id.to_string(),
            mode: Some("live".to_string()),
            allow_list: vec![],
            block_list: vec![],
            every_list: vec![],
            viewers: vec![],
            allow_list_sync: None,
            block_list_sync: None,
            every_list_sync: None,
            viewers_sync: None,
            keywords: vec![KeywordRule {
                word: keyword.to_string(),
                block: false,
            }],
            keywords_quote: vec![],
            every_list_block_keywords: vec![],
            search: vec![],
            media: vec![],
            post_levels: vec![],
            labels: vec![],
            must_labels: vec![],
            languages: vec![],
        }
    }

    fn post_batch(text: &str) -> OpsBatch {
        OpsBatch {
            post_creates: vec![CreateOp {
                uri: "at://did:plc:a/app.bsky.feed.post/3jt64ar2lvs2a".to_string(),
                author: "did:plc:a".to_string(),
                record: PostRecord {
                    text: text.to_string(),
                    langs: vec![String::new()],
                    created_at_ms: Utc::now().timestamp_millis() - 1000,
                    ..Default::default()
                },
            }],
            ..Default::default()
        }
    }

    fn worker_with_store(
        store: Arc<dyn Store>,
        docs: Vec<FeedDoc>,
    ) -> (Worker, mpsc::Sender<DispatchMsg>, mpsc::Receiver<CoordinatorMsg>) {
        let settings = Settings::default();
        let matcher = Matcher::new(FeedSet::from_docs(&docs), &settings);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        let (coord_tx, coord_rx) = mpsc::channel(16);
        let worker = Worker::new(
            0,
            settings,
            matcher,
            store,
            ReloadFlag::default(),
            dispatch_rx,
            coord_tx,
        );
        (worker, dispatch_tx, coord_rx)
    }

    #[tokio::test]
    async fn worker_stores_batch_and_reports_result() {
        let store = Arc::new(MemoryStore::new());
        let (mut worker, _tx, mut coord_rx) =
            worker_with_store(store.clone(), vec![feed_doc("cats", "cats")]);

        worker
            .process(DispatchMsg {
                batch: post_batch("cats everywhere"),
                cursor: 2000,
                dispatched_at: 55,
                first_since_start: true,
            })
            .await;

        let doc = store
            .post("at://did:plc:a/app.bsky.feed.post/3jt64ar2lvs2a")
            .unwrap();
        assert!(doc.tags.contains("cats-cats"));

        match coord_rx.try_recv().unwrap() {
            CoordinatorMsg::BatchDone(result) => {
                assert_eq!(result.cursor, 2000);
                assert_eq!(result.dispatched_at, 55);
                assert!(result.first_since_start);
                assert!(!result.divergent);
            }
            other => panic!("expected batch result, got {other:?}"),
        }
    }

    struct FailingStore;

    #[async_trait]
    impl Store for FailingStore {
        async fn load_feeds(&self) -> Result<Vec<FeedDoc>> {
            Ok(vec![])
        }
        async fn load_cursor(&self, _: usize) -> Result<Option<crate::store::CursorRecord>> {
            Ok(None)
        }
        async fn save_cursor(&self, _: usize, _: crate::store::CursorRecord) -> Result<()> {
            Ok(())
        }
        async fn set_range_end(&self, _: usize, _: i64) -> Result<()> {
            Ok(())
        }
        async fn delete_cursor(&self, _: usize) -> Result<()> {
            Ok(())
        }
        async fn apply(&self, _: &[PersistenceCommand]) -> Result<()> {
            Err(crate::Error::ChannelClosed("simulated store outage"))
        }
    }

    #[tokio::test]
    async fn worker_reports_nothing_when_the_store_fails() {
        let (mut worker, _tx, mut coord_rx) =
            worker_with_store(Arc::new(FailingStore), vec![feed_doc("cats", "cats")]);

        worker
            .process(DispatchMsg {
                batch: post_batch("cats everywhere"),
                cursor: 2000,
                dispatched_at: 55,
                first_since_start: false,
            })
            .await;

        // No result: the shard's watchdog will force a replay.
        assert!(coord_rx.try_recv().is_err());
    }
}

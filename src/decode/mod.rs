//! Commit-event decoding into collated operation batches.
//!
//! Each commit's record operations are resolved against its CAR block store,
//! parsed into typed records, and partitioned by collection into the running
//! [`OpsBatch`]. The batch is finalized at fixed sequence-number boundaries:
//! when an event's `seq` is a multiple of the collate window, the batch
//! (including that event's ops) is handed to the matcher and a fresh one is
//! started. Window alignment is absolute, so a shard resuming from a persisted
//! cursor rebuilds the same batch boundaries it used before.
//!
//! Per-record failures (missing block, bad shape, stale post, non-TID record
//! key) drop only the affected op.

pub mod records;

use crate::firehose::{CommitEvent, OpAction};
use records::{
    FollowRecord, GeneratorRecord, LikeRecord, ListItemRecord, PostRecord, RepostRecord,
};

/// A record creation, with its parsed payload.
#[derive(Debug, Clone)]
pub struct CreateOp<R> {
    /// `at://<did>/<collection>/<rkey>` record URI.
    pub uri: String,
    /// Repository (author) DID.
    pub author: String,
    pub record: R,
}

/// A record deletion. Deletes carry no payload on the wire.
#[derive(Debug, Clone)]
pub struct DeleteOp {
    pub uri: String,
    pub author: String,
}

/// Operations between two batch boundaries, partitioned by collection.
#[derive(Debug, Default)]
pub struct OpsBatch {
    pub post_creates: Vec<CreateOp<PostRecord>>,
    pub post_deletes: Vec<DeleteOp>,
    pub repost_creates: Vec<CreateOp<RepostRecord>>,
    pub repost_deletes: Vec<DeleteOp>,
    pub like_creates: Vec<CreateOp<LikeRecord>>,
    pub like_deletes: Vec<DeleteOp>,
    pub follow_creates: Vec<CreateOp<FollowRecord>>,
    pub follow_deletes: Vec<DeleteOp>,
    pub list_item_creates: Vec<CreateOp<ListItemRecord>>,
    pub list_item_deletes: Vec<DeleteOp>,
    pub list_deletes: Vec<DeleteOp>,
    pub feed_gen_creates: Vec<CreateOp<GeneratorRecord>>,
    pub feed_gen_updates: Vec<CreateOp<GeneratorRecord>>,
    pub feed_gen_deletes: Vec<DeleteOp>,
    /// Number of commit events absorbed into this batch.
    pub events: u64,
}

impl OpsBatch {
    pub fn op_count(&self) -> usize {
        self.post_creates.len()
            + self.post_deletes.len()
            + self.repost_creates.len()
            + self.repost_deletes.len()
            + self.like_creates.len()
            + self.like_deletes.len()
            + self.follow_creates.len()
            + self.follow_deletes.len()
            + self.list_item_creates.len()
            + self.list_item_deletes.len()
            + self.list_deletes.len()
            + self.feed_gen_creates.len()
            + self.feed_gen_updates.len()
            + self.feed_gen_deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op_count() == 0
    }
}

/// Accumulates commit events and finalizes an [`OpsBatch`] at every
/// collate-window boundary.
pub struct Collator {
    window: u64,
    batch: OpsBatch,
}

impl Collator {
    pub fn new(window: u64) -> Self {
        assert!(window > 0, "collate window must be positive");
        Self {
            window,
            batch: OpsBatch::default(),
        }
    }

    /// Absorb one commit event. Returns the finalized batch when the event's
    /// sequence number sits on a window boundary; the boundary event's own
    /// ops are included in that batch.
    pub fn ingest(&mut self, evt: &CommitEvent, now_ms: i64) -> Option<OpsBatch> {
        self.absorb(evt, now_ms);
        if evt.seq % self.window == 0 {
            Some(std::mem::take(&mut self.batch))
        } else {
            None
        }
    }

    fn absorb(&mut self, evt: &CommitEvent, now_ms: i64) {
        self.batch.events += 1;
        for op in &evt.ops {
            let Some((collection, rkey)) = op.path.split_once('/') else {
                continue;
            };
            let uri = format!("at://{}/{}", evt.repo, op.path);

            if op.action == OpAction::Delete {
                let del = DeleteOp {
                    uri,
                    author: evt.repo.clone(),
                };
                match collection {
                    records::collections::POST => self.batch.post_deletes.push(del),
                    records::collections::REPOST => self.batch.repost_deletes.push(del),
                    records::collections::LIKE => self.batch.like_deletes.push(del),
                    records::collections::FOLLOW => self.batch.follow_deletes.push(del),
                    records::collections::LIST_ITEM => self.batch.list_item_deletes.push(del),
                    records::collections::LIST => self.batch.list_deletes.push(del),
                    records::collections::FEED_GENERATOR => {
                        self.batch.feed_gen_deletes.push(del)
                    }
                    _ => {}
                }
                continue;
            }

            // Creates and updates need the record block.
            let Some(block) = op
                .cid
                .as_ref()
                .and_then(|cid| evt.blocks.get(cid))
            else {
                tracing::debug!(seq = evt.seq, path = %op.path, "record block missing");
                continue;
            };
            let Ok(value) = crate::firehose::cbor::Value::decode(block) else {
                tracing::debug!(seq = evt.seq, path = %op.path, "undecodable record block");
                continue;
            };

            match (collection, op.action) {
                (records::collections::POST, OpAction::Create) => {
                    if !records::is_valid_tid(rkey) {
                        continue;
                    }
                    if let Some(record) = records::parse_post(&value, now_ms) {
                        self.batch.post_creates.push(CreateOp {
                            uri,
                            author: evt.repo.clone(),
                            record,
                        });
                    }
                }
                (records::collections::REPOST, OpAction::Create) => {
                    if let Some(record) = records::parse_repost(&value) {
                        self.batch.repost_creates.push(CreateOp {
                            uri,
                            author: evt.repo.clone(),
                            record,
                        });
                    }
                }
                (records::collections::LIKE, OpAction::Create) => {
                    if let Some(record) = records::parse_like(&value) {
                        self.batch.like_creates.push(CreateOp {
                            uri,
                            author: evt.repo.clone(),
                            record,
                        });
                    }
                }
                (records::collections::FOLLOW, OpAction::Create) => {
                    if let Some(record) = records::parse_follow(&value) {
                        self.batch.follow_creates.push(CreateOp {
                            uri,
                            author: evt.repo.clone(),
                            record,
                        });
                    }
                }
                (records::collections::LIST_ITEM, OpAction::Create) => {
                    if let Some(record) = records::parse_list_item(&value) {
                        self.batch.list_item_creates.push(CreateOp {
                            uri,
                            author: evt.repo.clone(),
                            record,
                        });
                    }
                }
                (records::collections::FEED_GENERATOR, action) => {
                    if let Some(record) = records::parse_generator(&value) {
                        let op = CreateOp {
                            uri,
                            author: evt.repo.clone(),
                            record,
                        };
                        match action {
                            OpAction::Create => self.batch.feed_gen_creates.push(op),
                            OpAction::Update => self.batch.feed_gen_updates.push(op),
                            OpAction::Delete => unreachable!(),
                        }
                    }
                }
                // Updates to other collections carry nothing we track.
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::car::test_support::test_cid;
    use crate::firehose::cbor::Cid;
    use crate::firehose::frame::test_support::{build_commit_frame, TestOp};
    use crate::firehose::{frame, Frame};
    use minicbor::Encoder;

    fn post_block(text: &str) -> Vec<u8> {
        let created = chrono::Utc::now() - chrono::Duration::minutes(1);
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("text").unwrap().str(text).unwrap();
        enc.str("createdAt")
            .unwrap()
            .str(&created.to_rfc3339())
            .unwrap();
        buf
    }

    fn commit(seq: u64, repo: &str, ops: Vec<TestOp>, blocks: Vec<(Cid, Vec<u8>)>) -> CommitEvent {
        let bytes = build_commit_frame(seq, repo, &ops, &blocks);
        match frame::decode_frame(&bytes).unwrap() {
            Frame::Commit(evt) => evt,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    fn post_create(seq: u64, repo: &str, rkey: &str, text: &str, marker: u8) -> CommitEvent {
        let cid = test_cid(marker);
        commit(
            seq,
            repo,
            vec![TestOp {
                action: "create",
                path: format!("app.bsky.feed.post/{rkey}"),
                cid: Some(cid.clone()),
            }],
            vec![(cid, post_block(text))],
        )
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    #[test]
    fn dispatches_exactly_at_window_boundaries() {
        let mut collator = Collator::new(10);

        for seq in 5..10 {
            let evt = post_create(seq, "did:plc:a", "3jt64ar2lvs2a", "hi", seq as u8);
            assert!(collator.ingest(&evt, now_ms()).is_none());
        }

        let boundary = post_create(10, "did:plc:a", "3jt64ar2lvs2b", "boundary", 0x10);
        let batch = collator.ingest(&boundary, now_ms()).unwrap();
        // Every op since the previous boundary, the boundary event included.
        assert_eq!(batch.events, 6);
        assert_eq!(batch.post_creates.len(), 6);
        assert_eq!(batch.post_creates.last().unwrap().record.text, "boundary");

        // A fresh batch starts after the boundary.
        let evt = post_create(11, "did:plc:a", "3jt64ar2lvs2c", "next", 0x11);
        assert!(collator.ingest(&evt, now_ms()).is_none());
    }

    #[test]
    fn partitions_deletes_without_blocks() {
        let mut collator = Collator::new(1);
        let evt = commit(
            1,
            "did:plc:b",
            vec![
                TestOp {
                    action: "delete",
                    path: "app.bsky.feed.post/3jt64ar2lvs2a".to_string(),
                    cid: None,
                },
                TestOp {
                    action: "delete",
                    path: "app.bsky.graph.listitem/3jt64ar2lvs2b".to_string(),
                    cid: None,
                },
            ],
            vec![],
        );

        let batch = collator.ingest(&evt, now_ms()).unwrap();
        assert_eq!(batch.post_deletes.len(), 1);
        assert_eq!(
            batch.post_deletes[0].uri,
            "at://did:plc:b/app.bsky.feed.post/3jt64ar2lvs2a"
        );
        assert_eq!(batch.post_deletes[0].author, "did:plc:b");
        assert_eq!(batch.list_item_deletes.len(), 1);
    }

    #[test]
    fn drops_ops_with_missing_blocks() {
        let mut collator = Collator::new(1);
        let evt = commit(
            1,
            "did:plc:c",
            vec![TestOp {
                action: "create",
                path: "app.bsky.feed.post/3jt64ar2lvs2a".to_string(),
                cid: Some(test_cid(0x77)), // not present in the block store
            }],
            vec![],
        );

        let batch = collator.ingest(&evt, now_ms()).unwrap();
        assert!(batch.post_creates.is_empty());
        assert_eq!(batch.events, 1);
    }

    #[test]
    fn rejects_non_tid_record_keys() {
        let mut collator = Collator::new(1);
        let evt = post_create(1, "did:plc:d", "not-a-tid", "hello", 0x01);
        let batch = collator.ingest(&evt, now_ms()).unwrap();
        assert!(batch.post_creates.is_empty());
    }

    #[test]
    fn parses_likes_and_follows() {
        let like_cid = test_cid(0x21);
        let follow_cid = test_cid(0x22);

        let mut like_block = Vec::new();
        let mut enc = Encoder::new(&mut like_block);
        enc.map(1).unwrap();
        enc.str("subject").unwrap().map(1).unwrap();
        enc.str("uri")
            .unwrap()
            .str("at://did:plc:x/app.bsky.feed.post/3jt64ar2lvs2a")
            .unwrap();

        let mut follow_block = Vec::new();
        let mut enc = Encoder::new(&mut follow_block);
        enc.map(1).unwrap();
        enc.str("subject").unwrap().str("did:plc:followed").unwrap();

        let evt = commit(
            1,
            "did:plc:e",
            vec![
                TestOp {
                    action: "create",
                    path: "app.bsky.feed.like/3jt64ar2lvs2f".to_string(),
                    cid: Some(like_cid.clone()),
                },
                TestOp {
                    action: "create",
                    path: "app.bsky.graph.follow/3jt64ar2lvs2g".to_string(),
                    cid: Some(follow_cid.clone()),
                },
            ],
            vec![(like_cid, like_block), (follow_cid, follow_block)],
        );

        let mut collator = Collator::new(1);
        let batch = collator.ingest(&evt, now_ms()).unwrap();
        assert_eq!(
            batch.like_creates[0].record.subject_uri,
            "at://did:plc:x/app.bsky.feed.post/3jt64ar2lvs2a"
        );
        assert_eq!(batch.follow_creates[0].record.subject, "did:plc:followed");
    }
}

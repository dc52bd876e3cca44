//! Batch evaluation: one collated [`OpsBatch`] in, persistence commands out.
//!
//! The matcher owns the feed arena and the dedup cache for its shard and is
//! driven by the shard worker. Evaluation is pure bookkeeping over in-memory
//! state; every externally visible effect is returned as a
//! [`PersistenceCommand`] so the whole batch can be replayed after a failed
//! ack.
//!
//! # Gate order (live feeds)
//!
//! Block list, allow list, media kind, sensitive labels, post level, every
//! list (bypasses keywords except its own block set), language, block
//! keywords, search keywords, quote keywords. Block always wins over search.

use crate::commands::PersistenceCommand;
use crate::config::Settings;
use crate::decode::records::PostRecord;
use crate::decode::{CreateOp, OpsBatch};
use crate::dedupe::DedupeCache;
use crate::feeds::{FeedDefinition, FeedMode, FeedSet, ListKind, SUPPORTED_CW_LABELS};
use chrono::{DateTime, TimeZone, Utc};

/// Result of evaluating one batch.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub commands: Vec<PersistenceCommand>,
    /// Whether the batch's median post age exceeded the divergence threshold.
    pub divergent: bool,
    /// Posts that matched at least one feed.
    pub matched_posts: usize,
}

pub struct Matcher {
    feeds: FeedSet,
    dedupe: DedupeCache,
    post_expiry: chrono::Duration,
    divergence_threshold_ms: i64,
    dedup_retention_seqs: u64,
}

/// The disjunctive want/have gate: passes outright when everything is
/// wanted, otherwise any wanted-and-present pair passes.
fn check_list(pairs: &[(bool, bool)]) -> bool {
    if pairs.iter().all(|(want, _)| *want) {
        return true;
    }
    pairs.iter().any(|(want, have)| *want && *have)
}

/// Author DID of an `at://` record URI.
fn uri_did(uri: &str) -> Option<&str> {
    uri.strip_prefix("at://")?.split('/').next()
}

impl Matcher {
    pub fn new(feeds: FeedSet, settings: &Settings) -> Self {
        Self {
            feeds,
            dedupe: DedupeCache::new(),
            post_expiry: chrono::Duration::from_std(settings.post_expiry)
                .unwrap_or_else(|_| chrono::Duration::days(7)),
            divergence_threshold_ms: settings.divergence_threshold.as_millis() as i64,
            dedup_retention_seqs: settings.dedup_retention_seqs(),
        }
    }

    /// Swap in freshly loaded feed definitions. The dedup cache survives; it
    /// keys on post URIs, not feeds.
    pub fn replace_feeds(&mut self, feeds: FeedSet) {
        tracing::info!(feeds = feeds.len(), "feed definitions reloaded");
        self.feeds = feeds;
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Evaluate one batch ending at `cursor`.
    pub fn evaluate(&mut self, batch: &OpsBatch, cursor: u64, now_ms: i64) -> Evaluation {
        self.dedupe
            .purge(cursor.saturating_sub(self.dedup_retention_seqs));

        let mut out = Evaluation {
            divergent: self.is_divergent(batch, now_ms),
            ..Default::default()
        };
        let now = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);

        // Membership changes first so posts in the same batch see them.
        self.apply_list_events(batch, &mut out);

        for create in &batch.post_creates {
            if !self.dedupe.check_and_mark(&create.uri, cursor) {
                continue;
            }
            let before = out.commands.len();
            self.match_post(create, now, &mut out);
            if out.commands.len() > before {
                out.matched_posts += 1;
            }
        }

        if !batch.post_deletes.is_empty() {
            let uris: Vec<String> = batch.post_deletes.iter().map(|d| d.uri.clone()).collect();
            out.commands
                .push(PersistenceCommand::DeletePosts { uris: uris.clone() });
            out.commands
                .push(PersistenceCommand::DeleteAlgoEntriesByPost { uris });
        }

        self.apply_like_events(batch, now, &mut out);
        out
    }

    fn is_divergent(&self, batch: &OpsBatch, now_ms: i64) -> bool {
        if batch.post_creates.is_empty() {
            return false;
        }
        let mut created: Vec<i64> = batch
            .post_creates
            .iter()
            .map(|c| c.record.created_at_ms)
            .collect();
        created.sort_unstable();
        let median = created[created.len() / 2];
        now_ms - median > self.divergence_threshold_ms
    }

    fn apply_list_events(&mut self, batch: &OpsBatch, out: &mut Evaluation) {
        for create in &batch.list_item_creates {
            let touched =
                self.feeds
                    .add_member(&create.record.list, &create.record.subject, &create.uri);
            for (idx, kind) in touched {
                let feed_id = self.feeds.get(idx).id.clone();
                out.commands.push(PersistenceCommand::AddListMember {
                    feed_id: feed_id.clone(),
                    kind,
                    did: create.record.subject.clone(),
                    item_uri: create.uri.clone(),
                });
                // A new block-list member also scrubs their existing posts.
                if kind == ListKind::Block {
                    out.commands.push(PersistenceCommand::PullFeedFromPosts {
                        feed_id,
                        author: create.record.subject.clone(),
                    });
                }
            }
        }

        // Un-blocking does not resurrect pulled posts; removal is only a
        // membership change.
        for delete in &batch.list_item_deletes {
            for (idx, kind, did) in self.feeds.remove_member(&delete.uri) {
                out.commands.push(PersistenceCommand::RemoveListMember {
                    feed_id: self.feeds.get(idx).id.clone(),
                    kind,
                    did,
                });
            }
        }

        for delete in &batch.list_deletes {
            for (idx, kind) in self.feeds.clear_list(&delete.uri) {
                out.commands.push(PersistenceCommand::ClearListField {
                    feed_id: self.feeds.get(idx).id.clone(),
                    kind,
                });
            }
        }
    }

    fn match_post(&self, create: &CreateOp<PostRecord>, now: DateTime<Utc>, out: &mut Evaluation) {
        let post = &create.record;
        let author = create.author.as_str();

        for &idx in self.feeds.with_mode(FeedMode::Live) {
            let feed = self.feeds.get(idx);
            if let Some(reason) = live_match(feed, post, author) {
                out.commands
                    .push(self.upsert_post(feed, create, reason, now));
            }
        }

        for &idx in self.feeds.with_mode(FeedMode::Responses) {
            let feed = self.feeds.get(idx);
            if let Some(did) = response_target(feed, post) {
                out.commands
                    .push(self.upsert_post(feed, create, format!("respond-{did}"), now));
            }
        }

        for &idx in self.feeds.with_mode(FeedMode::UserPosts) {
            let feed = self.feeds.get(idx);
            if !feed.allow.contains(author) {
                continue;
            }
            if !media_gate(feed, post) || !level_gate(feed, post) {
                continue;
            }
            if feed.block_keywords.find(post, feed.surfaces).is_some() {
                continue;
            }
            let reason = feed.search.find(post, feed.surfaces);
            if reason.is_none() && !feed.search.is_empty() {
                continue;
            }
            out.commands.push(PersistenceCommand::UpsertAlgoEntry {
                feed_id: feed.id.clone(),
                post_uri: create.uri.clone(),
                reason,
                like_uri: None,
                indexed_at: now,
            });
        }
    }

    fn apply_like_events(&self, batch: &OpsBatch, now: DateTime<Utc>, out: &mut Evaluation) {
        let user_like_feeds = self.feeds.with_mode(FeedMode::UserLikes);
        if !user_like_feeds.is_empty() {
            for like in &batch.like_creates {
                if !like.record.subject_uri.contains("/app.bsky.feed.post/") {
                    continue;
                }
                for &idx in user_like_feeds {
                    let feed = self.feeds.get(idx);
                    if !feed.allow.contains(like.author.as_str()) {
                        continue;
                    }
                    out.commands.push(PersistenceCommand::UpsertAlgoEntry {
                        feed_id: feed.id.clone(),
                        post_uri: like.record.subject_uri.clone(),
                        reason: None,
                        like_uri: Some(like.uri.clone()),
                        indexed_at: now,
                    });
                }
            }
        }

        if !batch.like_deletes.is_empty() {
            out.commands.push(PersistenceCommand::DeleteAlgoEntriesByLike {
                like_uris: batch.like_deletes.iter().map(|d| d.uri.clone()).collect(),
            });
        }
    }

    fn upsert_post(
        &self,
        feed: &FeedDefinition,
        create: &CreateOp<PostRecord>,
        reason: String,
        now: DateTime<Utc>,
    ) -> PersistenceCommand {
        PersistenceCommand::UpsertPost {
            uri: create.uri.clone(),
            feed_id: feed.id.clone(),
            reason,
            author: create.author.clone(),
            indexed_at: now,
            expire_at: now + self.post_expiry,
        }
    }
}

fn media_gate(feed: &FeedDefinition, post: &PostRecord) -> bool {
    // "text" means media-free, not "has text".
    check_list(&[
        (feed.want_pics, post.has_pics),
        (feed.want_text, !(post.has_pics || post.has_video)),
        (feed.want_video, post.has_video),
    ])
}

fn level_gate(feed: &FeedDefinition, post: &PostRecord) -> bool {
    let is_reply = post.parent_uri.is_some();
    check_list(&[(feed.want_top, !is_reply), (feed.want_reply, is_reply)])
}

/// Any supported sensitive label on the post must be one the feed accepts,
/// and a feed requiring labels only matches posts carrying one of them.
fn label_gate(feed: &FeedDefinition, post: &PostRecord) -> bool {
    let accepted = post
        .labels
        .iter()
        .filter(|l| SUPPORTED_CW_LABELS.contains(&l.as_str()))
        .all(|l| feed.allowed_labels.contains(l));
    if !accepted {
        return false;
    }
    feed.required_labels.is_empty()
        || post.labels.iter().any(|l| feed.required_labels.contains(l))
}

fn language_gate(feed: &FeedDefinition, post: &PostRecord) -> bool {
    feed.languages.is_empty() || post.langs.iter().any(|l| feed.languages.contains(l))
}

/// Full live-feed gate chain; returns the inclusion reason on a match.
fn live_match(feed: &FeedDefinition, post: &PostRecord, author: &str) -> Option<String> {
    if feed.block.contains(author) {
        return None;
    }
    if !feed.allow.is_empty() && !feed.allow.contains(author) {
        return None;
    }
    if !media_gate(feed, post) || !label_gate(feed, post) || !level_gate(feed, post) {
        return None;
    }

    // Every-list members skip the keyword gates; only the dedicated block
    // set can still exclude them.
    if feed.every.contains(author) {
        if feed.every_block.find(post, feed.surfaces).is_some() {
            return None;
        }
        return Some(format!("every-{author}"));
    }

    if !language_gate(feed, post) {
        return None;
    }
    if feed.block_keywords.find(post, feed.surfaces).is_some() {
        return None;
    }
    if let Some(keyword) = feed.search.find(post, feed.surfaces) {
        return Some(keyword);
    }
    if post.quote_uri.is_some() {
        if feed.quote_block.find(post, feed.surfaces).is_some() {
            return None;
        }
        if let Some(keyword) = feed.quote_keywords.find(post, feed.surfaces) {
            return Some(keyword);
        }
    }
    None
}

/// For response feeds: the every-list member this post responds to, if any.
fn response_target(feed: &FeedDefinition, post: &PostRecord) -> Option<String> {
    let candidates = [
        post.quote_uri.as_deref(),
        post.parent_uri.as_deref(),
        post.root_uri.as_deref(),
    ];
    for uri in candidates.into_iter().flatten() {
        if let Some(did) = uri_did(uri) {
            if feed.every.contains(did) {
                return Some(did.to_string());
            }
        }
    }
    None
}

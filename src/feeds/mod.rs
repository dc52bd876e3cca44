//! Feed definitions and the reverse list index.
//!
//! Feed documents load from the store into a flat arena ([`FeedSet`]); every
//! cross-reference is an index into it. Synced member lists are additionally
//! indexed two ways so list events resolve without scanning:
//!
//! - `(kind, list-sync-id)` -> feeds syncing that list, for list-item creates
//!   and list deletes;
//! - `list-item-uri` -> (feed, kind, member did), recorded as items arrive,
//!   so a list-item delete can remove the member it created.
//!
//! List URIs are normalized to `<did>/lists/<rkey>` on both sides before any
//! comparison.

pub mod keywords;

use keywords::{KeywordSet, Surfaces};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Self-applied content labels the pipeline knows how to gate on.
pub const SUPPORTED_CW_LABELS: [&str; 4] = ["nudity", "sexual", "porn", "corpse"];

/// What a feed indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedMode {
    /// Keyword/list matching over the live post stream.
    Live,
    /// Replies to and quotes of the every-list members.
    Responses,
    /// Everything the allow-list members post.
    UserPosts,
    /// Everything the allow-list members like.
    UserLikes,
}

impl FeedMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(FeedMode::Live),
            "responses" => Some(FeedMode::Responses),
            "user-posts" => Some(FeedMode::UserPosts),
            "user-likes" => Some(FeedMode::UserLikes),
            // Manually curated feeds ("posts") never consume the stream.
            _ => None,
        }
    }
}

/// The four member-list roles a feed can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Allow,
    Block,
    Every,
    Viewers,
}

impl ListKind {
    pub const ALL: [ListKind; 4] = [
        ListKind::Allow,
        ListKind::Block,
        ListKind::Every,
        ListKind::Viewers,
    ];

    /// Single-letter code used in persisted list fields.
    pub fn code(self) -> &'static str {
        match self {
            ListKind::Allow => "a",
            ListKind::Block => "b",
            ListKind::Every => "e",
            ListKind::Viewers => "v",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListMember {
    pub did: String,
    /// List-item record URI, known for members added from the stream.
    pub item_uri: Option<String>,
}

/// One member list, optionally synced to an external graph list.
#[derive(Debug, Clone, Default)]
pub struct MemberList {
    /// Normalized `<did>/lists/<rkey>` id of the synced list.
    pub sync_id: Option<String>,
    members: Vec<ListMember>,
}

impl MemberList {
    pub fn contains(&self, did: &str) -> bool {
        self.members.iter().any(|m| m.did == did)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    fn add(&mut self, did: String, item_uri: Option<String>) {
        if !self.contains(&did) {
            self.members.push(ListMember { did, item_uri });
        }
    }

    fn remove_by_item(&mut self, item_uri: &str) -> Option<String> {
        let pos = self
            .members
            .iter()
            .position(|m| m.item_uri.as_deref() == Some(item_uri))?;
        Some(self.members.swap_remove(pos).did)
    }

    fn clear(&mut self) {
        self.members.clear();
        self.sync_id = None;
    }
}

/// Normalize a graph-list reference to `<did>/lists/<rkey>`. Accepts the
/// full `at://` record URI and the already-short form.
pub fn normalize_list_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("at://").unwrap_or(uri);
    let mut parts = rest.split('/');
    let did = parts.next().filter(|d| d.starts_with("did:"))?;
    let collection = parts.next()?;
    let rkey = parts.next().filter(|r| !r.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    match collection {
        "app.bsky.graph.list" | "lists" => Some(format!("{did}/lists/{rkey}")),
        _ => None,
    }
}

/// One loaded feed definition.
#[derive(Debug, Clone)]
pub struct FeedDefinition {
    /// Feed record key; prefixes every stored inclusion reason.
    pub id: String,
    pub mode: FeedMode,
    pub allow: MemberList,
    pub block: MemberList,
    pub every: MemberList,
    pub viewers: MemberList,
    pub search: KeywordSet,
    pub block_keywords: KeywordSet,
    pub quote_keywords: KeywordSet,
    /// Block rules from the quote keyword list; a hit rejects the post.
    pub quote_block: KeywordSet,
    /// Block set applied inside the every-list branch only.
    pub every_block: KeywordSet,
    pub surfaces: Surfaces,
    pub want_pics: bool,
    pub want_text: bool,
    pub want_video: bool,
    pub want_top: bool,
    pub want_reply: bool,
    /// Sensitive labels the feed accepts.
    pub allowed_labels: HashSet<String>,
    /// Labels a post must carry (any one) to match; empty = no requirement.
    pub required_labels: HashSet<String>,
    /// Primary language subtags; empty set = no language gate.
    pub languages: HashSet<String>,
}

impl FeedDefinition {
    pub fn list(&self, kind: ListKind) -> &MemberList {
        match kind {
            ListKind::Allow => &self.allow,
            ListKind::Block => &self.block,
            ListKind::Every => &self.every,
            ListKind::Viewers => &self.viewers,
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut MemberList {
        match kind {
            ListKind::Allow => &mut self.allow,
            ListKind::Block => &mut self.block,
            ListKind::Every => &mut self.every,
            ListKind::Viewers => &mut self.viewers,
        }
    }
}

/// A keyword rule in a feed document. `block` rules exclude, the rest search.
#[derive(Debug, Clone, Deserialize)]
pub struct KeywordRule {
    pub word: String,
    #[serde(default)]
    pub block: bool,
}

/// Feed document as persisted in the feeds collection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub block_list: Vec<String>,
    #[serde(default)]
    pub every_list: Vec<String>,
    #[serde(default)]
    pub viewers: Vec<String>,
    #[serde(default)]
    pub allow_list_sync: Option<String>,
    #[serde(default)]
    pub block_list_sync: Option<String>,
    #[serde(default)]
    pub every_list_sync: Option<String>,
    #[serde(default)]
    pub viewers_sync: Option<String>,
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
    #[serde(default)]
    pub keywords_quote: Vec<KeywordRule>,
    #[serde(default)]
    pub every_list_block_keywords: Vec<String>,
    /// Surfaces the keyword sets run over: `text`, `alt`, `link`, `tag`.
    #[serde(default)]
    pub search: Vec<String>,
    /// Wanted media kinds: `pics`, `text`, `video`. Empty = all.
    #[serde(default)]
    pub media: Vec<String>,
    /// Wanted post levels: `top`, `reply`. Empty = both.
    #[serde(default)]
    pub post_levels: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub must_labels: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

fn build_member_list(dids: &[String], sync: &Option<String>) -> MemberList {
    MemberList {
        sync_id: sync.as_deref().and_then(normalize_list_uri),
        members: dids
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| ListMember {
                did: d.clone(),
                item_uri: None,
            })
            .collect(),
    }
}

impl FeedDefinition {
    fn from_doc(doc: &FeedDoc) -> Option<Self> {
        let mode = doc.mode.as_deref().and_then(FeedMode::parse)?;

        let mut search_words = Vec::new();
        let mut block_words = Vec::new();
        for rule in &doc.keywords {
            if rule.block {
                block_words.push(rule.word.clone());
            } else {
                search_words.push(rule.word.clone());
            }
        }
        let mut quote_words = Vec::new();
        let mut quote_block_words = Vec::new();
        for rule in &doc.keywords_quote {
            if rule.block {
                quote_block_words.push(rule.word.clone());
            } else {
                quote_words.push(rule.word.clone());
            }
        }

        let surfaces = if doc.search.is_empty() {
            Surfaces::TEXT_ONLY
        } else {
            Surfaces {
                text: doc.search.iter().any(|s| s == "text"),
                alt: doc.search.iter().any(|s| s == "alt"),
                link: doc.search.iter().any(|s| s == "link"),
                tag: doc.search.iter().any(|s| s == "tag"),
            }
        };

        let want = |kind: &str| doc.media.is_empty() || doc.media.iter().any(|m| m == kind);
        let level = |kind: &str| {
            doc.post_levels.is_empty() || doc.post_levels.iter().any(|l| l == kind)
        };

        Some(FeedDefinition {
            id: doc.id.clone(),
            mode,
            allow: build_member_list(&doc.allow_list, &doc.allow_list_sync),
            block: build_member_list(&doc.block_list, &doc.block_list_sync),
            every: build_member_list(&doc.every_list, &doc.every_list_sync),
            viewers: build_member_list(&doc.viewers, &doc.viewers_sync),
            search: KeywordSet::new(&search_words),
            block_keywords: KeywordSet::new(&block_words),
            quote_keywords: KeywordSet::new(&quote_words),
            quote_block: KeywordSet::new(&quote_block_words),
            every_block: KeywordSet::new(&doc.every_list_block_keywords),
            surfaces,
            want_pics: want("pics"),
            want_text: want("text"),
            want_video: want("video"),
            want_top: level("top"),
            want_reply: level("reply"),
            allowed_labels: doc.labels.iter().cloned().collect(),
            required_labels: doc.must_labels.iter().cloned().collect(),
            languages: doc
                .languages
                .iter()
                .filter(|l| !l.is_empty())
                .cloned()
                .collect(),
        })
    }
}

/// All loaded feeds plus the reverse list index.
#[derive(Debug, Default)]
pub struct FeedSet {
    feeds: Vec<FeedDefinition>,
    by_mode: HashMap<FeedMode, Vec<usize>>,
    by_sync: HashMap<(ListKind, String), Vec<usize>>,
    by_item: HashMap<String, Vec<(usize, ListKind)>>,
}

impl FeedSet {
    /// Build the arena from loaded documents. Documents without a stream
    /// mode are skipped.
    pub fn from_docs(docs: &[FeedDoc]) -> Self {
        let mut set = FeedSet::default();
        for doc in docs {
            let Some(feed) = FeedDefinition::from_doc(doc) else {
                tracing::debug!(feed = %doc.id, mode = ?doc.mode, "feed skipped at load");
                continue;
            };
            let idx = set.feeds.len();
            set.by_mode.entry(feed.mode).or_default().push(idx);
            for kind in ListKind::ALL {
                if let Some(sync_id) = &feed.list(kind).sync_id {
                    set.by_sync
                        .entry((kind, sync_id.clone()))
                        .or_default()
                        .push(idx);
                }
            }
            set.feeds.push(feed);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub fn get(&self, idx: usize) -> &FeedDefinition {
        &self.feeds[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &FeedDefinition)> {
        self.feeds.iter().enumerate()
    }

    pub fn with_mode(&self, mode: FeedMode) -> &[usize] {
        self.by_mode.get(&mode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Feeds syncing the given list (normalized id) under the given role.
    pub fn syncing(&self, kind: ListKind, sync_id: &str) -> &[usize] {
        self.by_sync
            .get(&(kind, sync_id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Apply a list-item creation. Returns the (feed, kind) pairs that gained
    /// the member.
    pub fn add_member(
        &mut self,
        list_uri: &str,
        member_did: &str,
        item_uri: &str,
    ) -> Vec<(usize, ListKind)> {
        let Some(sync_id) = normalize_list_uri(list_uri) else {
            return Vec::new();
        };
        let mut touched = Vec::new();
        for kind in ListKind::ALL {
            let feed_idxs = self.syncing(kind, &sync_id).to_vec();
            for idx in feed_idxs {
                self.feeds[idx]
                    .list_mut(kind)
                    .add(member_did.to_string(), Some(item_uri.to_string()));
                self.by_item
                    .entry(item_uri.to_string())
                    .or_default()
                    .push((idx, kind));
                touched.push((idx, kind));
            }
        }
        touched
    }

    /// Apply a list-item deletion by item URI. Returns the (feed, kind, did)
    /// triples that lost the member.
    pub fn remove_member(&mut self, item_uri: &str) -> Vec<(usize, ListKind, String)> {
        let Some(entries) = self.by_item.remove(item_uri) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for (idx, kind) in entries {
            if let Some(did) = self.feeds[idx].list_mut(kind).remove_by_item(item_uri) {
                removed.push((idx, kind, did));
            }
        }
        removed
    }

    /// Apply a graph-list deletion: every feed syncing it drops the whole
    /// member list. Returns the (feed, kind) pairs cleared.
    pub fn clear_list(&mut self, list_uri: &str) -> Vec<(usize, ListKind)> {
        let Some(sync_id) = normalize_list_uri(list_uri) else {
            return Vec::new();
        };
        let mut cleared = Vec::new();
        for kind in ListKind::ALL {
            let Some(feed_idxs) = self.by_sync.remove(&(kind, sync_id.clone())) else {
                continue;
            };
            for idx in feed_idxs {
                self.feeds[idx].list_mut(kind).clear();
                cleared.push((idx, kind));
            }
        }
        self.by_item
            .retain(|_, entries| !entries.iter().any(|e| cleared.contains(e)));
        cleared
    }
}

/// Shared reload marker set by the store's change stream and drained by the
/// worker's reload ticker.
#[derive(Debug, Clone, Default)]
pub struct ReloadFlag(Arc<AtomicBool>);

impl ReloadFlag {
    pub fn mark(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Clears and returns the pending state.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, mode: &str) -> FeedDoc {
        FeedDoc {
            id: id.to_string(),
            mode: Some(mode.to_string()),
            allow_list: vec![],
            block_list: vec![],
            every_list: vec![],
            viewers: vec![],
            allow_list_sync: None,
            block_list_sync: None,
            every_list_sync: None,
            viewers_sync: None,
            keywords: vec![],
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

    #[test]
    fn normalizes_list_uris() {
        assert_eq!(
            normalize_list_uri("at://did:plc:o/app.bsky.graph.list/3xyz").as_deref(),
            Some("did:plc:o/lists/3xyz")
        );
        assert_eq!(
            normalize_list_uri("did:plc:o/lists/3xyz").as_deref(),
            Some("did:plc:o/lists/3xyz")
        );
        assert_eq!(normalize_list_uri("did:plc:o/feeds/3xyz"), None);
        assert_eq!(normalize_list_uri("at://not-a-did/lists/3xyz"), None);
    }

    #[test]
    fn skips_feeds_without_a_stream_mode() {
        let docs = vec![doc("a", "live"), doc("b", "posts"), doc("c", "bogus")];
        let set = FeedSet::from_docs(&docs);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0).id, "a");
        assert_eq!(set.with_mode(FeedMode::Live), &[0]);
    }

    #[test]
    fn empty_media_and_levels_want_everything() {
        let set = FeedSet::from_docs(&[doc("a", "live")]);
        let feed = set.get(0);
        assert!(feed.want_pics && feed.want_text && feed.want_video);
        assert!(feed.want_top && feed.want_reply);

        let mut restricted = doc("b", "live");
        restricted.media = vec!["pics".to_string()];
        restricted.post_levels = vec!["top".to_string()];
        let set = FeedSet::from_docs(&[restricted]);
        let feed = set.get(0);
        assert!(feed.want_pics && !feed.want_text && !feed.want_video);
        assert!(feed.want_top && !feed.want_reply);
    }

    #[test]
    fn list_item_lifecycle_updates_members() {
        let mut d = doc("cats", "live");
        d.block_list_sync = Some("at://did:plc:o/app.bsky.graph.list/3xyz".to_string());
        let mut set = FeedSet::from_docs(&[d]);

        let item_uri = "at://did:plc:o/app.bsky.graph.listitem/3item";
        let touched = set.add_member(
            "at://did:plc:o/app.bsky.graph.list/3xyz",
            "did:plc:spammer",
            item_uri,
        );
        assert_eq!(touched, vec![(0, ListKind::Block)]);
        assert!(set.get(0).block.contains("did:plc:spammer"));

        // Re-adding the same did is a no-op on the member list.
        set.add_member(
            "at://did:plc:o/app.bsky.graph.list/3xyz",
            "did:plc:spammer",
            item_uri,
        );
        assert_eq!(set.get(0).block.len(), 1);

        let removed = set.remove_member(item_uri);
        assert_eq!(
            removed,
            vec![(0, ListKind::Block, "did:plc:spammer".to_string())]
        );
        assert!(!set.get(0).block.contains("did:plc:spammer"));

        // Unknown item URIs resolve to nothing.
        assert!(set.remove_member("at://did:plc:o/app.bsky.graph.listitem/3o").is_empty());
    }

    #[test]
    fn list_delete_clears_every_syncing_feed() {
        let mut a = doc("a", "live");
        a.every_list_sync = Some("did:plc:o/lists/3xyz".to_string());
        a.every_list = vec!["did:plc:m".to_string()];
        let mut b = doc("b", "responses");
        b.every_list_sync = Some("did:plc:o/lists/3xyz".to_string());
        let mut set = FeedSet::from_docs(&[a, b]);

        let cleared = set.clear_list("at://did:plc:o/app.bsky.graph.list/3xyz");
        assert_eq!(cleared.len(), 2);
        assert!(set.get(0).every.is_empty());
        assert!(set.get(0).every.sync_id.is_none());
        assert!(set.syncing(ListKind::Every, "did:plc:o/lists/3xyz").is_empty());
    }

    #[test]
    fn reload_flag_drains_on_take() {
        let flag = ReloadFlag::default();
        assert!(!flag.take());
        flag.mark();
        flag.mark();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn per_worker_flags_drain_independently() {
        // One flag per worker; a single change marks them all and each
        // worker's drain leaves the others pending.
        let flags: Vec<ReloadFlag> = (0..3).map(|_| ReloadFlag::default()).collect();
        for flag in &flags {
            flag.mark();
        }
        assert!(flags[0].take());
        assert!(flags[1].take());
        assert!(flags[2].take());
        assert!(!flags[0].take());
    }

    #[test]
    fn quote_keyword_rules_split_into_search_and_block() {
        let mut d = doc("quotes", "live");
        d.keywords_quote = vec![
            KeywordRule {
                word: "cats".to_string(),
                block: false,
            },
            KeywordRule {
                word: "crypto".to_string(),
                block: true,
            },
        ];
        let set = FeedSet::from_docs(&[d]);
        let feed = set.get(0);
        assert!(!feed.quote_keywords.is_empty());
        assert!(!feed.quote_block.is_empty());
    }
}

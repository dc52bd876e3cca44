//! In-memory [`Store`] used by tests.
//!
//! Mirrors the document shapes of the Mongo implementation closely enough to
//! assert on post tags, algo entries, list fields, and cursor records, and to
//! verify that replaying a command batch leaves the state unchanged.

use super::{CursorRecord, Store};
use crate::commands::PersistenceCommand;
use crate::feeds::{FeedDoc, ListKind};
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostDoc {
    pub author: String,
    /// Bare feed ids the post belongs to.
    pub feeds: BTreeSet<String>,
    /// `<feed_id>-<reason>` inclusion tags.
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgoEntry {
    pub feed_id: String,
    pub post_uri: String,
    pub reason: Option<String>,
    pub like_uri: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    feeds: Vec<FeedDoc>,
    cursors: HashMap<usize, CursorRecord>,
    posts: BTreeMap<String, PostDoc>,
    /// Keyed by `<feed_id>|<like_uri or post_uri>`.
    algo: BTreeMap<String, AlgoEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feeds(feeds: Vec<FeedDoc>) -> Self {
        let store = Self::new();
        store.inner.lock().unwrap().feeds = feeds;
        store
    }

    pub fn post(&self, uri: &str) -> Option<PostDoc> {
        self.inner.lock().unwrap().posts.get(uri).cloned()
    }

    pub fn posts(&self) -> BTreeMap<String, PostDoc> {
        self.inner.lock().unwrap().posts.clone()
    }

    pub fn algo_entries(&self) -> Vec<AlgoEntry> {
        self.inner.lock().unwrap().algo.values().cloned().collect()
    }

    pub fn cursors(&self) -> HashMap<usize, CursorRecord> {
        self.inner.lock().unwrap().cursors.clone()
    }

    pub fn feed_list(&self, feed_id: &str, kind: ListKind) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let Some(doc) = inner.feeds.iter().find(|f| f.id == feed_id) else {
            return Vec::new();
        };
        match kind {
            ListKind::Allow => doc.allow_list.clone(),
            ListKind::Block => doc.block_list.clone(),
            ListKind::Every => doc.every_list.clone(),
            ListKind::Viewers => doc.viewers.clone(),
        }
    }
}

fn doc_list_mut(doc: &mut FeedDoc, kind: ListKind) -> &mut Vec<String> {
    match kind {
        ListKind::Allow => &mut doc.allow_list,
        ListKind::Block => &mut doc.block_list,
        ListKind::Every => &mut doc.every_list,
        ListKind::Viewers => &mut doc.viewers,
    }
}

fn doc_sync_mut(doc: &mut FeedDoc, kind: ListKind) -> &mut Option<String> {
    match kind {
        ListKind::Allow => &mut doc.allow_list_sync,
        ListKind::Block => &mut doc.block_list_sync,
        ListKind::Every => &mut doc.every_list_sync,
        ListKind::Viewers => &mut doc.viewers_sync,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_feeds(&self) -> Result<Vec<FeedDoc>> {
        Ok(self.inner.lock().unwrap().feeds.clone())
    }

    async fn load_cursor(&self, shard: usize) -> Result<Option<CursorRecord>> {
        Ok(self.inner.lock().unwrap().cursors.get(&shard).copied())
    }

    async fn save_cursor(&self, shard: usize, record: CursorRecord) -> Result<()> {
        self.inner.lock().unwrap().cursors.insert(shard, record);
        Ok(())
    }

    async fn set_range_end(&self, shard: usize, range_end: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .cursors
            .entry(shard)
            .or_insert_with(|| CursorRecord::unbounded(0));
        entry.range_end = range_end;
        Ok(())
    }

    async fn delete_cursor(&self, shard: usize) -> Result<()> {
        self.inner.lock().unwrap().cursors.remove(&shard);
        Ok(())
    }

    async fn apply(&self, commands: &[PersistenceCommand]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for command in commands {
            match command {
                PersistenceCommand::UpsertPost {
                    uri,
                    feed_id,
                    reason,
                    author,
                    ..
                } => {
                    let doc = inner.posts.entry(uri.clone()).or_insert_with(|| PostDoc {
                        author: author.clone(),
                        ..PostDoc::default()
                    });
                    doc.feeds.insert(feed_id.clone());
                    doc.tags.insert(format!("{feed_id}-{reason}"));
                }
                PersistenceCommand::DeletePosts { uris } => {
                    for uri in uris {
                        inner.posts.remove(uri);
                    }
                }
                PersistenceCommand::PullFeedFromPosts { feed_id, author } => {
                    let prefix = format!("{feed_id}-");
                    for doc in inner.posts.values_mut() {
                        if &doc.author == author {
                            doc.feeds.remove(feed_id);
                            doc.tags.retain(|t| !t.starts_with(&prefix));
                        }
                    }
                }
                PersistenceCommand::AddListMember {
                    feed_id, kind, did, ..
                } => {
                    if let Some(doc) = inner.feeds.iter_mut().find(|f| &f.id == feed_id) {
                        let list = doc_list_mut(doc, *kind);
                        if !list.contains(did) {
                            list.push(did.clone());
                        }
                    }
                }
                PersistenceCommand::RemoveListMember { feed_id, kind, did } => {
                    if let Some(doc) = inner.feeds.iter_mut().find(|f| &f.id == feed_id) {
                        doc_list_mut(doc, *kind).retain(|d| d != did);
                    }
                }
                PersistenceCommand::ClearListField { feed_id, kind } => {
                    if let Some(doc) = inner.feeds.iter_mut().find(|f| &f.id == feed_id) {
                        doc_list_mut(doc, *kind).clear();
                        *doc_sync_mut(doc, *kind) = None;
                    }
                }
                PersistenceCommand::UpsertAlgoEntry {
                    feed_id,
                    post_uri,
                    reason,
                    like_uri,
                    ..
                } => {
                    let key = format!(
                        "{feed_id}|{}",
                        like_uri.as_deref().unwrap_or(post_uri.as_str())
                    );
                    inner.algo.entry(key).or_insert_with(|| AlgoEntry {
                        feed_id: feed_id.clone(),
                        post_uri: post_uri.clone(),
                        reason: reason.clone(),
                        like_uri: like_uri.clone(),
                    });
                }
                PersistenceCommand::DeleteAlgoEntriesByPost { uris } => {
                    inner.algo.retain(|_, e| !uris.contains(&e.post_uri));
                }
                PersistenceCommand::DeleteAlgoEntriesByLike { like_uris } => {
                    inner.algo.retain(|_, e| {
                        e.like_uri
                            .as_ref()
                            .map(|l| !like_uris.contains(l))
                            .unwrap_or(true)
                    });
                }
            }
        }
        Ok(())
    }
}

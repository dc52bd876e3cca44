//! MongoDB [`Store`] implementation.
//!
//! Collections:
//!
//! - `feeds`: tenant feed definitions; member-list mirrors are written here;
//! - `posts`: keyed by post URI, carries `algoTags` inclusion tags plus the
//!   engagement/score seed and a TTL `expireAt`;
//! - `postsAlgoFeed`: per-user algorithmic feed entries, deterministic ids;
//! - `data`: operational records, including the per-shard cursors `c_<i>`.
//!
//! Connection establishment retries on an escalating ladder and only then
//! gives up; a pipeline without its store cannot do anything useful, so the
//! final failure is fatal to the process.

use super::{CursorRecord, Store};
use crate::commands::{initial_score, list_field, list_sync_field, PersistenceCommand};
use crate::feeds::{FeedDoc, ReloadFlag};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::event::OperationType;
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection, Database};
use std::time::Duration;

/// Escalating backoff for the initial connection, in seconds.
const CONNECT_LADDER_SECS: [u64; 6] = [30, 60, 180, 420, 1080, 1800];

/// Delay before re-establishing a broken change stream.
const WATCH_RETRY: Duration = Duration::from_secs(10);

fn cursor_doc_id(shard: usize) -> String {
    format!("c_{shard}")
}

/// Deterministic id for an algo-feed entry: one per (feed, like) for likes,
/// one per (feed, post) otherwise.
fn algo_entry_id(feed_id: &str, post_uri: &str, like_uri: Option<&str>) -> String {
    format!("{feed_id}|{}", like_uri.unwrap_or(post_uri))
}

/// Anchored pattern matching a feed's inclusion tags.
fn feed_tag_pattern(feed_id: &str) -> String {
    format!("^{}-", regex::escape(feed_id))
}

pub struct MongoStore {
    feeds: Collection<Document>,
    posts: Collection<Document>,
    algo: Collection<Document>,
    data: Collection<Document>,
}

impl MongoStore {
    /// Connect and ping, retrying on the escalating ladder. Fails only after
    /// the ladder is exhausted.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let mut attempt = 0usize;
        loop {
            match Self::try_connect(uri, db_name).await {
                Ok(store) => {
                    tracing::info!(db = db_name, "connected to store");
                    return Ok(store);
                }
                Err(err) => {
                    let Some(&delay) = CONNECT_LADDER_SECS.get(attempt) else {
                        tracing::error!("store unreachable, giving up: {err}");
                        return Err(err);
                    };
                    tracing::warn!(attempt, delay_secs = delay, "store connect failed: {err}");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_connect(uri: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 }).await?;
        Ok(Self::from_database(&db))
    }

    fn from_database(db: &Database) -> Self {
        Self {
            feeds: db.collection("feeds"),
            posts: db.collection("posts"),
            algo: db.collection("postsAlgoFeed"),
            data: db.collection("data"),
        }
    }

    /// Watch the feeds collection and mark every worker's reload flag on any
    /// change the matcher cares about. One flag per worker, so each shard's
    /// matcher picks the change up on its own reload tick. Runs until the
    /// process exits; a broken stream is re-established after a short delay.
    pub async fn watch_feeds(&self, flags: Vec<ReloadFlag>) {
        let pipeline = vec![doc! { "$match": { "$or": [
            { "operationType": { "$in": ["insert", "delete", "replace"] } },
            { "updateDescription.updatedFields.updated": { "$exists": true } },
            { "updateDescription.updatedFields.everyList": { "$exists": true } },
        ] } }];

        loop {
            let stream = self
                .feeds
                .watch()
                .pipeline(pipeline.clone())
                .full_document(FullDocumentType::UpdateLookup)
                .await;
            let mut stream = match stream {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!("feed change stream unavailable: {err}");
                    tokio::time::sleep(WATCH_RETRY).await;
                    continue;
                }
            };

            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        tracing::debug!(op = ?event.operation_type, "feed change observed");
                        if event.operation_type != OperationType::Invalidate {
                            for flag in &flags {
                                flag.mark();
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("feed change stream broke: {err}");
                        break;
                    }
                }
            }
            tokio::time::sleep(WATCH_RETRY).await;
        }
    }

    async fn apply_one(&self, command: &PersistenceCommand) -> Result<()> {
        match command {
            PersistenceCommand::UpsertPost {
                uri,
                feed_id,
                reason,
                author,
                indexed_at,
                expire_at,
            } => {
                let score = initial_score();
                self.posts
                    .update_one(
                        doc! { "_id": uri },
                        doc! {
                            "$addToSet": {
                                "feeds": feed_id,
                                "algoTags": format!("{feed_id}-{reason}"),
                            },
                            "$setOnInsert": {
                                "author": author,
                                "likes": 0i64,
                                "ups": 0i64,
                                "likeValue": score,
                                "upValue": score,
                                "indexedAt": mongodb::bson::DateTime::from_chrono(*indexed_at),
                                "expireAt": mongodb::bson::DateTime::from_chrono(*expire_at),
                            },
                        },
                    )
                    .upsert(true)
                    .await?;
            }
            PersistenceCommand::DeletePosts { uris } => {
                self.posts
                    .delete_many(doc! { "_id": { "$in": uris } })
                    .await?;
            }
            PersistenceCommand::PullFeedFromPosts { feed_id, author } => {
                let pattern = Bson::RegularExpression(mongodb::bson::Regex {
                    pattern: feed_tag_pattern(feed_id),
                    options: String::new(),
                });
                self.posts
                    .update_many(
                        doc! { "author": author },
                        doc! { "$pull": { "feeds": feed_id, "algoTags": pattern } },
                    )
                    .await?;
            }
            PersistenceCommand::AddListMember {
                feed_id, kind, did, ..
            } => {
                self.feeds
                    .update_one(
                        doc! { "_id": feed_id },
                        doc! { "$addToSet": { list_field(*kind): did } },
                    )
                    .await?;
            }
            PersistenceCommand::RemoveListMember { feed_id, kind, did } => {
                self.feeds
                    .update_one(
                        doc! { "_id": feed_id },
                        doc! { "$pull": { list_field(*kind): did } },
                    )
                    .await?;
            }
            PersistenceCommand::ClearListField { feed_id, kind } => {
                self.feeds
                    .update_one(
                        doc! { "_id": feed_id },
                        doc! {
                            "$set": { list_field(*kind): Bson::Array(vec![]) },
                            "$unset": { list_sync_field(*kind): "" },
                        },
                    )
                    .await?;
            }
            PersistenceCommand::UpsertAlgoEntry {
                feed_id,
                post_uri,
                reason,
                like_uri,
                indexed_at,
            } => {
                let mut insert = doc! {
                    "feed": feed_id,
                    "uri": post_uri,
                    "indexedAt": mongodb::bson::DateTime::from_chrono(*indexed_at),
                };
                if let Some(reason) = reason {
                    insert.insert("reason", reason);
                }
                if let Some(like_uri) = like_uri {
                    insert.insert("likeUri", like_uri);
                }
                self.algo
                    .update_one(
                        doc! { "_id": algo_entry_id(feed_id, post_uri, like_uri.as_deref()) },
                        doc! { "$setOnInsert": insert },
                    )
                    .upsert(true)
                    .await?;
            }
            PersistenceCommand::DeleteAlgoEntriesByPost { uris } => {
                self.algo.delete_many(doc! { "uri": { "$in": uris } }).await?;
            }
            PersistenceCommand::DeleteAlgoEntriesByLike { like_uris } => {
                self.algo
                    .delete_many(doc! { "likeUri": { "$in": like_uris } })
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn load_feeds(&self) -> Result<Vec<FeedDoc>> {
        let mut cursor = self.feeds.find(doc! {}).await?;
        let mut docs = Vec::new();
        while let Some(raw) = cursor.try_next().await? {
            match mongodb::bson::from_document::<FeedDoc>(raw) {
                Ok(doc) => docs.push(doc),
                Err(err) => tracing::warn!("unreadable feed document skipped: {err}"),
            }
        }
        Ok(docs)
    }

    async fn load_cursor(&self, shard: usize) -> Result<Option<CursorRecord>> {
        let Some(raw) = self
            .data
            .find_one(doc! { "_id": cursor_doc_id(shard) })
            .await?
        else {
            return Ok(None);
        };
        let cursor = raw
            .get_i64("cursor")
            .map_err(|_| Error::Config(format!("cursor record c_{shard} missing cursor")))?;
        let range_end = raw.get_i64("endAt").unwrap_or(CursorRecord::UNBOUNDED);
        Ok(Some(CursorRecord { cursor, range_end }))
    }

    async fn save_cursor(&self, shard: usize, record: CursorRecord) -> Result<()> {
        self.data
            .update_one(
                doc! { "_id": cursor_doc_id(shard) },
                doc! { "$set": { "cursor": record.cursor, "endAt": record.range_end } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn set_range_end(&self, shard: usize, range_end: i64) -> Result<()> {
        self.data
            .update_one(
                doc! { "_id": cursor_doc_id(shard) },
                doc! { "$set": { "endAt": range_end } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete_cursor(&self, shard: usize) -> Result<()> {
        self.data
            .delete_one(doc! { "_id": cursor_doc_id(shard) })
            .await?;
        Ok(())
    }

    async fn apply(&self, commands: &[PersistenceCommand]) -> Result<()> {
        for command in commands {
            self.apply_one(command).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_ids_are_per_shard() {
        assert_eq!(cursor_doc_id(0), "c_0");
        assert_eq!(cursor_doc_id(7), "c_7");
    }

    #[test]
    fn algo_entry_ids_distinguish_likes_from_posts() {
        let by_post = algo_entry_id("faves", "at://a/p/1", None);
        let by_like = algo_entry_id("faves", "at://a/p/1", Some("at://b/l/1"));
        assert_eq!(by_post, "faves|at://a/p/1");
        assert_eq!(by_like, "faves|at://b/l/1");
        assert_ne!(by_post, by_like);
    }

    #[test]
    fn tag_pattern_is_anchored_and_escaped() {
        assert_eq!(feed_tag_pattern("cat.pics"), r"^cat\.pics-");
    }
}

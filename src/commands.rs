//! Persistence commands.
//!
//! The matcher's entire output is a list of [`PersistenceCommand`]s. Every
//! command is idempotent (keyed upserts, pulls, deletes by key), so a batch
//! that was stored but never acknowledged can be replayed wholesale after a
//! reconnect without corrupting state. The store decides how each command
//! maps onto its collections.

use crate::feeds::ListKind;
use chrono::{DateTime, Utc};

/// Ranking-score shape: `(ups + 1) / (age_hours + 2) ^ 1.6`.
pub const SCORE_GRAVITY: f64 = 1.6;
pub const SCORE_AGE_OFFSET_HOURS: f64 = 2.0;

/// Score of a freshly indexed post with no engagement.
pub fn initial_score() -> f64 {
    1.0 / SCORE_AGE_OFFSET_HOURS.powf(SCORE_GRAVITY)
}

/// Persisted field name for a member-list role on a feed document.
pub fn list_field(kind: ListKind) -> &'static str {
    match kind {
        ListKind::Allow => "allowList",
        ListKind::Block => "blockList",
        ListKind::Every => "everyList",
        ListKind::Viewers => "viewers",
    }
}

/// Persisted field name for a member list's sync reference.
pub fn list_sync_field(kind: ListKind) -> &'static str {
    match kind {
        ListKind::Allow => "allowListSync",
        ListKind::Block => "blockListSync",
        ListKind::Every => "everyListSync",
        ListKind::Viewers => "viewersSync",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceCommand {
    /// Index a post into a feed. The stored inclusion tag is
    /// `<feed_id>-<reason>`; the insert seeds zero engagement and the
    /// initial score.
    UpsertPost {
        uri: String,
        feed_id: String,
        reason: String,
        author: String,
        indexed_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    },
    /// Remove deleted posts from the post index.
    DeletePosts { uris: Vec<String> },
    /// Remove a feed's inclusion tags from every indexed post by `author`
    /// (emitted when an author lands on a block list).
    PullFeedFromPosts { feed_id: String, author: String },
    /// Mirror a list-item creation onto the feed document.
    AddListMember {
        feed_id: String,
        kind: ListKind,
        did: String,
        item_uri: String,
    },
    /// Mirror a list-item deletion onto the feed document.
    RemoveListMember {
        feed_id: String,
        kind: ListKind,
        did: String,
    },
    /// Mirror a graph-list deletion: drop the whole member list and its sync
    /// reference from the feed document.
    ClearListField { feed_id: String, kind: ListKind },
    /// Index an entry into a per-user algorithmic feed.
    UpsertAlgoEntry {
        feed_id: String,
        post_uri: String,
        /// Matched keyword for user-post entries; absent for likes.
        reason: Option<String>,
        /// Like record URI for user-like entries.
        like_uri: Option<String>,
        indexed_at: DateTime<Utc>,
    },
    /// Remove algorithmic-feed entries for deleted posts.
    DeleteAlgoEntriesByPost { uris: Vec<String> },
    /// Remove algorithmic-feed entries whose source like was deleted.
    DeleteAlgoEntriesByLike { like_uris: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_score_matches_zero_engagement_formula() {
        // (0 + 1) / (0 + 2)^1.6
        let expected = 1.0f64 / 2.0f64.powf(1.6);
        assert!((initial_score() - expected).abs() < 1e-12);
        assert!(initial_score() > 0.32 && initial_score() < 0.34);
    }

    #[test]
    fn list_fields_cover_every_kind() {
        for kind in ListKind::ALL {
            assert!(list_field(kind).ends_with("List") || list_field(kind) == "viewers");
            assert!(list_sync_field(kind).ends_with("Sync"));
        }
    }
}

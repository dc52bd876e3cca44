//! Typed record extraction from raw DAG-CBOR blocks.
//!
//! Records failing their shape checks are dropped per-record; a bad block
//! never affects the rest of the batch. Posts additionally go through
//! normalization: link facets are cut out of the text, embeds are reduced to
//! the minimal projection we match against, and self labels are flattened.

use crate::firehose::cbor::Value;

/// Collection NSIDs we consume.
pub mod collections {
    pub const POST: &str = "app.bsky.feed.post";
    pub const REPOST: &str = "app.bsky.feed.repost";
    pub const LIKE: &str = "app.bsky.feed.like";
    pub const FOLLOW: &str = "app.bsky.graph.follow";
    pub const LIST_ITEM: &str = "app.bsky.graph.listitem";
    pub const LIST: &str = "app.bsky.graph.list";
    pub const FEED_GENERATOR: &str = "app.bsky.feed.generator";
}

/// Posts older than this are considered backfill and dropped.
pub const MAX_POST_AGE_MS: i64 = 12 * 60 * 60 * 1000;
/// Posts claiming a creation time further in the future than this are dropped.
pub const MAX_POST_FUTURE_MS: i64 = 10 * 60 * 1000;

const TID_ALPHABET: &str = "234567abcdefghijklmnopqrstuvwxyz";

/// Whether `s` is a 13-character base32-sortable timestamp identifier.
pub fn is_valid_tid(s: &str) -> bool {
    s.len() == 13 && s.bytes().all(|b| TID_ALPHABET.as_bytes().contains(&b))
}

/// A post record reduced to the fields the matcher evaluates.
#[derive(Debug, Clone, Default)]
pub struct PostRecord {
    /// Post text with link facet spans removed.
    pub text: String,
    /// Hashtags from tag facets plus the record's `tags` array.
    pub tags: Vec<String>,
    /// Link facet URIs plus external embed URIs.
    pub links: Vec<String>,
    /// Image and video alt texts.
    pub alt_texts: Vec<String>,
    pub has_pics: bool,
    pub has_video: bool,
    /// URI of a quoted post, if any.
    pub quote_uri: Option<String>,
    pub root_uri: Option<String>,
    pub parent_uri: Option<String>,
    /// Flattened self-applied content labels.
    pub labels: Vec<String>,
    /// Primary language subtags; `[""]` when the record declares none.
    pub langs: Vec<String>,
    /// Claimed creation time, Unix millis.
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RepostRecord {
    pub subject_uri: String,
}

#[derive(Debug, Clone)]
pub struct LikeRecord {
    pub subject_uri: String,
}

#[derive(Debug, Clone)]
pub struct FollowRecord {
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct ListItemRecord {
    /// URI of the list the item belongs to (as sent on the wire).
    pub list: String,
    /// DID of the listed account.
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct GeneratorRecord {
    pub display_name: Option<String>,
}

/// Parse and normalize a post record. `None` drops the record (bad shape,
/// stale, or too far in the future).
pub fn parse_post(v: &Value, now_ms: i64) -> Option<PostRecord> {
    let created_at = v.get("createdAt").and_then(Value::as_str)?;
    let created_at_ms = chrono::DateTime::parse_from_rfc3339(created_at)
        .ok()?
        .timestamp_millis();

    // Clock-skew / backfill guard.
    let age = now_ms - created_at_ms;
    if age > MAX_POST_AGE_MS || age < -MAX_POST_FUTURE_MS {
        return None;
    }

    let raw_text = v.get("text").and_then(Value::as_str).unwrap_or_default();

    let mut post = PostRecord {
        created_at_ms,
        ..Default::default()
    };

    extract_facets(v, raw_text, &mut post);

    if let Some(extra_tags) = v.get("tags").and_then(Value::as_array) {
        for t in extra_tags {
            if let Some(t) = t.as_str() {
                post.tags.push(t.to_string());
            }
        }
    }

    if let Some(reply) = v.get_non_null("reply") {
        post.root_uri = reply
            .get("root")
            .and_then(|r| r.get("uri"))
            .and_then(Value::as_str)
            .map(str::to_string);
        post.parent_uri = reply
            .get("parent")
            .and_then(|r| r.get("uri"))
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    if let Some(embed) = v.get_non_null("embed") {
        extract_embed(embed, &mut post);
    }

    if let Some(labels) = v.get_non_null("labels") {
        if labels.get("$type").and_then(Value::as_str) == Some("com.atproto.label.defs#selfLabels")
        {
            if let Some(values) = labels.get("values").and_then(Value::as_array) {
                for entry in values {
                    if let Some(val) = entry.get("val").and_then(Value::as_str) {
                        post.labels.push(val.to_string());
                    }
                }
            }
        }
    }

    post.langs = match v.get("langs").and_then(Value::as_array) {
        Some(langs) if !langs.is_empty() => langs
            .iter()
            .filter_map(Value::as_str)
            .map(|l| l.split('-').next().unwrap_or("").to_string())
            .collect(),
        _ => vec![String::new()],
    };

    Some(post)
}

/// Pull tags and links out of the rich-text facets and strip link spans from
/// the text so keyword matching does not fire on URLs.
fn extract_facets(v: &Value, raw_text: &str, post: &mut PostRecord) {
    let Some(facets) = v.get_non_null("facets").and_then(Value::as_array) else {
        post.text = raw_text.to_string();
        return;
    };

    let mut link_spans: Vec<(usize, usize)> = Vec::new();
    for facet in facets {
        let Some(feature) = facet
            .get("features")
            .and_then(Value::as_array)
            .and_then(|f| f.first())
        else {
            continue;
        };
        match feature.get("$type").and_then(Value::as_str) {
            Some("app.bsky.richtext.facet#tag") => {
                if let Some(tag) = feature.get("tag").and_then(Value::as_str) {
                    post.tags.push(tag.to_string());
                }
            }
            Some("app.bsky.richtext.facet#link") => {
                if let Some(uri) = feature.get("uri").and_then(Value::as_str) {
                    post.links.push(uri.to_string());
                }
                let index = facet.get("index");
                let start = index
                    .and_then(|i| i.get("byteStart"))
                    .and_then(Value::as_int);
                let end = index.and_then(|i| i.get("byteEnd")).and_then(Value::as_int);
                if let (Some(start), Some(end)) = (start, end) {
                    if start >= 0 && end >= start {
                        link_spans.push((start as usize, end as usize));
                    }
                }
            }
            _ => {}
        }
    }

    // Cut the spans back-to-front so earlier offsets stay valid.
    let mut bytes = raw_text.as_bytes().to_vec();
    link_spans.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, end) in link_spans {
        if end <= bytes.len() && start <= end {
            bytes.drain(start..end);
        }
    }
    post.text = String::from_utf8_lossy(&bytes).into_owned();
}

/// Reduce an embed to the projection we keep: alt texts, external link,
/// quoted-post URI, and the pics/video flags.
fn extract_embed(embed: &Value, post: &mut PostRecord) {
    let collect_image_alts = |images: &Value, post: &mut PostRecord| {
        if let Some(images) = images.as_array() {
            post.has_pics = true;
            for image in images {
                if let Some(alt) = image.get("alt").and_then(Value::as_str) {
                    if !alt.is_empty() {
                        post.alt_texts.push(alt.to_string());
                    }
                }
            }
        }
    };

    match embed.get("$type").and_then(Value::as_str) {
        Some("app.bsky.embed.recordWithMedia") => {
            post.quote_uri = embed
                .get("record")
                .and_then(|r| r.get("record"))
                .and_then(|r| r.get("uri"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(media) = embed.get_non_null("media") {
                if let Some(images) = media.get_non_null("images") {
                    collect_image_alts(images, post);
                }
                if let Some(video) = media.get_non_null("video") {
                    post.has_video = true;
                    if let Some(alt) = video.get("alt").and_then(Value::as_str) {
                        if !alt.is_empty() {
                            post.alt_texts.push(alt.to_string());
                        }
                    }
                }
            }
            if let Some(uri) = embed
                .get_non_null("external")
                .and_then(|e| e.get("uri"))
                .and_then(Value::as_str)
            {
                post.links.push(uri.to_string());
            }
        }
        Some("app.bsky.embed.images") => {
            if let Some(images) = embed.get_non_null("images") {
                collect_image_alts(images, post);
            }
        }
        Some("app.bsky.embed.video") => {
            post.has_video = true;
            if let Some(alt) = embed
                .get_non_null("video")
                .and_then(|vid| vid.get("alt"))
                .and_then(Value::as_str)
            {
                if !alt.is_empty() {
                    post.alt_texts.push(alt.to_string());
                }
            }
        }
        Some("app.bsky.embed.record") => {
            post.quote_uri = embed
                .get("record")
                .and_then(|r| r.get("uri"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Some("app.bsky.embed.external") => {
            if let Some(uri) = embed
                .get_non_null("external")
                .and_then(|e| e.get("uri"))
                .and_then(Value::as_str)
            {
                post.links.push(uri.to_string());
            }
        }
        _ => {}
    }
}

fn subject_uri(v: &Value) -> Option<String> {
    v.get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

pub fn parse_repost(v: &Value) -> Option<RepostRecord> {
    Some(RepostRecord {
        subject_uri: subject_uri(v)?,
    })
}

pub fn parse_like(v: &Value) -> Option<LikeRecord> {
    Some(LikeRecord {
        subject_uri: subject_uri(v)?,
    })
}

pub fn parse_follow(v: &Value) -> Option<FollowRecord> {
    let subject = v
        .get("subject")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?;
    Some(FollowRecord {
        subject: subject.to_string(),
    })
}

pub fn parse_generator(v: &Value) -> Option<GeneratorRecord> {
    Some(GeneratorRecord {
        display_name: v
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub fn parse_list_item(v: &Value) -> Option<ListItemRecord> {
    let list = v
        .get("list")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?;
    let subject = v
        .get("subject")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?;
    Some(ListItemRecord {
        list: list.to_string(),
        subject: subject.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::cbor::Value;
    use std::collections::BTreeMap;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn created_at(offset_ms: i64) -> String {
        chrono::DateTime::from_timestamp_millis(now_ms() + offset_ms)
            .unwrap()
            .to_rfc3339()
    }

    fn basic_post(text_value: &str, offset_ms: i64) -> Value {
        map(vec![
            ("text", text(text_value)),
            ("createdAt", text(&created_at(offset_ms))),
        ])
    }

    #[test]
    fn tid_validation() {
        assert!(is_valid_tid("3jt64ar2lvs2a"));
        assert!(!is_valid_tid("3jt64ar2lvs2")); // 12 chars
        assert!(!is_valid_tid("3jt64ar2lvs2A")); // uppercase
        assert!(!is_valid_tid("1jt64ar2lvs2a")); // '1' not in alphabet
    }

    #[test]
    fn accepts_recent_post() {
        let post = parse_post(&basic_post("hello", -60 * 60 * 1000), now_ms()).unwrap();
        assert_eq!(post.text, "hello");
        assert_eq!(post.langs, vec![String::new()]);
    }

    #[test]
    fn rejects_stale_and_future_posts() {
        // 13 hours old
        assert!(parse_post(&basic_post("old", -13 * 60 * 60 * 1000), now_ms()).is_none());
        // 11 minutes in the future
        assert!(parse_post(&basic_post("soon", 11 * 60 * 1000), now_ms()).is_none());
        // 5 minutes in the future is within skew tolerance
        assert!(parse_post(&basic_post("ok", 5 * 60 * 1000), now_ms()).is_some());
    }

    #[test]
    fn strips_link_facets_from_text() {
        let raw = "look at https://example.com now";
        let start = raw.find("https").unwrap() as i64;
        let end = start + "https://example.com".len() as i64;
        let facet = map(vec![
            (
                "index",
                map(vec![
                    ("byteStart", Value::Int(start)),
                    ("byteEnd", Value::Int(end)),
                ]),
            ),
            (
                "features",
                Value::Array(vec![map(vec![
                    ("$type", text("app.bsky.richtext.facet#link")),
                    ("uri", text("https://example.com")),
                ])]),
            ),
        ]);
        let mut record = basic_post(raw, -1000);
        if let Value::Map(m) = &mut record {
            m.insert("facets".to_string(), Value::Array(vec![facet]));
        }

        let post = parse_post(&record, now_ms()).unwrap();
        assert_eq!(post.text, "look at  now");
        assert_eq!(post.links, vec!["https://example.com"]);
    }

    #[test]
    fn collects_tag_facets_and_record_tags() {
        let facet = map(vec![(
            "features",
            Value::Array(vec![map(vec![
                ("$type", text("app.bsky.richtext.facet#tag")),
                ("tag", text("cats")),
            ])]),
        )]);
        let mut record = basic_post("#cats are great", -1000);
        if let Value::Map(m) = &mut record {
            m.insert("facets".to_string(), Value::Array(vec![facet]));
            m.insert("tags".to_string(), Value::Array(vec![text("felines")]));
        }

        let post = parse_post(&record, now_ms()).unwrap();
        assert_eq!(post.tags, vec!["cats", "felines"]);
    }

    #[test]
    fn image_embed_projection() {
        let embed = map(vec![
            ("$type", text("app.bsky.embed.images")),
            (
                "images",
                Value::Array(vec![
                    map(vec![("alt", text("a cat"))]),
                    map(vec![("alt", text(""))]),
                ]),
            ),
        ]);
        let mut record = basic_post("pics!", -1000);
        if let Value::Map(m) = &mut record {
            m.insert("embed".to_string(), embed);
        }

        let post = parse_post(&record, now_ms()).unwrap();
        assert!(post.has_pics);
        assert!(!post.has_video);
        assert_eq!(post.alt_texts, vec!["a cat"]);
    }

    #[test]
    fn record_with_media_embed_projection() {
        let embed = map(vec![
            ("$type", text("app.bsky.embed.recordWithMedia")),
            (
                "record",
                map(vec![(
                    "record",
                    map(vec![("uri", text("at://did:plc:q/app.bsky.feed.post/3k"))]),
                )]),
            ),
            (
                "media",
                map(vec![("video", map(vec![("alt", text("clip"))]))]),
            ),
        ]);
        let mut record = basic_post("quoting", -1000);
        if let Value::Map(m) = &mut record {
            m.insert("embed".to_string(), embed);
        }

        let post = parse_post(&record, now_ms()).unwrap();
        assert!(post.has_video);
        assert_eq!(
            post.quote_uri.as_deref(),
            Some("at://did:plc:q/app.bsky.feed.post/3k")
        );
        assert_eq!(post.alt_texts, vec!["clip"]);
    }

    #[test]
    fn flattens_self_labels_and_langs() {
        let labels = map(vec![
            ("$type", text("com.atproto.label.defs#selfLabels")),
            (
                "values",
                Value::Array(vec![map(vec![("val", text("sexual"))])]),
            ),
        ]);
        let mut record = basic_post("nsfw", -1000);
        if let Value::Map(m) = &mut record {
            m.insert("labels".to_string(), labels);
            m.insert(
                "langs".to_string(),
                Value::Array(vec![text("en-US"), text("pt")]),
            );
        }

        let post = parse_post(&record, now_ms()).unwrap();
        assert_eq!(post.labels, vec!["sexual"]);
        assert_eq!(post.langs, vec!["en", "pt"]);
    }

    #[test]
    fn like_requires_subject_uri() {
        let like = map(vec![(
            "subject",
            map(vec![("uri", text("at://did:plc:a/app.bsky.feed.post/3k"))]),
        )]);
        assert!(parse_like(&like).is_some());
        assert!(parse_like(&map(vec![("subject", map(vec![]))])).is_none());
    }

    #[test]
    fn list_item_requires_list_and_subject() {
        let item = map(vec![
            ("list", text("at://did:plc:o/app.bsky.graph.list/3x")),
            ("subject", text("did:plc:member")),
        ]);
        let parsed = parse_list_item(&item).unwrap();
        assert_eq!(parsed.subject, "did:plc:member");
        assert!(parse_list_item(&map(vec![("subject", text("did:plc:m"))])).is_none());
    }
}

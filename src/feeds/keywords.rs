//! Compiled keyword matchers.
//!
//! Each feed carries up to three keyword sets (search, block, every-list
//! block). A set compiles once into a single case-insensitive word-boundary
//! alternation and is then run over whichever post surfaces the feed opted
//! into. Hashtags are matched by exact (lowercased) equality rather than
//! through the regex.

use crate::decode::records::PostRecord;
use std::collections::HashSet;

/// Which post surfaces a keyword set is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Surfaces {
    pub text: bool,
    pub alt: bool,
    pub link: bool,
    pub tag: bool,
}

impl Surfaces {
    pub const TEXT_ONLY: Surfaces = Surfaces {
        text: true,
        alt: false,
        link: false,
        tag: false,
    };
}

/// One compiled keyword set.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    pattern: Option<regex::Regex>,
    /// Lowercased words, for exact hashtag equality.
    words: HashSet<String>,
}

impl KeywordSet {
    pub fn new(keywords: &[String]) -> Self {
        let words: HashSet<String> = keywords
            .iter()
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();
        if words.is_empty() {
            return Self::default();
        }

        let alternation = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = match regex::Regex::new(&format!(r"(?i)\b(?:{alternation})\b")) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!("unusable keyword set ({} words): {err}", words.len());
                None
            }
        };
        Self { pattern, words }
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
    }

    /// First keyword found in `text`, lowercased.
    pub fn find_in_text(&self, text: &str) -> Option<String> {
        self.pattern
            .as_ref()
            .and_then(|re| re.find(text))
            .map(|m| m.as_str().to_lowercase())
    }

    /// Exact hashtag match against the set.
    pub fn find_tag(&self, tags: &[String]) -> Option<String> {
        if self.pattern.is_none() {
            return None;
        }
        tags.iter()
            .map(|t| t.to_lowercase())
            .find(|t| self.words.contains(t))
    }

    /// Run the set over the surfaces the feed opted into; returns the matched
    /// keyword, which doubles as the inclusion reason.
    pub fn find(&self, post: &PostRecord, surfaces: Surfaces) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        if surfaces.tag {
            if let Some(hit) = self.find_tag(&post.tags) {
                return Some(hit);
            }
        }
        if surfaces.text {
            if let Some(hit) = self.find_in_text(&post.text) {
                return Some(hit);
            }
        }
        if surfaces.alt {
            for alt in &post.alt_texts {
                if let Some(hit) = self.find_in_text(alt) {
                    return Some(hit);
                }
            }
        }
        if surfaces.link {
            for link in &post.links {
                if let Some(hit) = self.find_in_text(link) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

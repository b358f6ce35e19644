//! Article identifiers and immutable, chapter-tagged snapshots.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::narrative::Chapter;

/// Identifies a wiki article, usually by its title (e.g. `"Windmere"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleId(pub String);

impl ArticleId {
    pub fn new(title: impl Into<String>) -> Self {
        Self(title.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank ids cannot address an article.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArticleId {
    fn from(title: &str) -> Self {
        Self::new(title)
    }
}

/// Unique identifier for a single snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    /// Create a new random snapshot ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One immutable version of an article.
///
/// `content` may be shown to any reader who has reached
/// `safe_through_chapter`. Snapshots are never edited; a regeneration appends
/// a new snapshot whose `parent_snapshot_id` points at the previous latest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSnapshot {
    pub id: SnapshotId,

    pub article_id: ArticleId,

    /// Full article body.
    pub content: String,

    /// Short excerpt for listings.
    pub preview: String,

    /// Last chapter whose information this content may reveal.
    pub safe_through_chapter: Chapter,

    /// 1-based position in the article's snapshot log.
    pub version_number: u32,

    /// The article's latest snapshot at the time this one was written.
    #[serde(default)]
    pub parent_snapshot_id: Option<SnapshotId>,
}

impl ArticleSnapshot {
    /// Ordering key for spoiler-safe selection: chapter first, then version.
    pub fn selection_key(&self) -> (Chapter, u32) {
        (self.safe_through_chapter, self.version_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_id_blank() {
        assert!(ArticleId::new("   ").is_blank());
        assert!(ArticleId::new("").is_blank());
        assert!(!ArticleId::from("Windmere").is_blank());
    }

    #[test]
    fn test_selection_key_orders_by_chapter_then_version() {
        let base = ArticleSnapshot {
            id: SnapshotId::new(),
            article_id: ArticleId::from("Windmere"),
            content: "a quiet village".to_string(),
            preview: "a quiet village".to_string(),
            safe_through_chapter: 3,
            version_number: 2,
            parent_snapshot_id: None,
        };
        let later_version = ArticleSnapshot {
            version_number: 3,
            ..base.clone()
        };
        let later_chapter = ArticleSnapshot {
            safe_through_chapter: 4,
            version_number: 1,
            ..base.clone()
        };

        assert!(later_version.selection_key() > base.selection_key());
        assert!(later_chapter.selection_key() > later_version.selection_key());
    }
}

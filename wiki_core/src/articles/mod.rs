//! Articles module - chapter-versioned, spoiler-safe article storage.
//!
//! Each article keeps an append-only log of immutable snapshots plus an index
//! from `safe_through_chapter` to the latest snapshot written for that
//! chapter. Regenerating an article for a chapter it already covers appends a
//! new version and repoints the index, so history is never lost.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use story_bible::{ArticleConfig, ArticleId, ArticleSnapshot, Chapter, SnapshotId};
use tracing::{debug, warn};

use crate::error::{KnowledgeError, Result};

/// A snapshot write as received from outside the core. The chapter is
/// optional here so a malformed write can be rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWrite {
    pub article_id: ArticleId,
    pub content: String,
    #[serde(default)]
    pub safe_through_chapter: Option<Chapter>,
}

impl SnapshotWrite {
    pub fn new(
        article_id: impl Into<ArticleId>,
        content: impl Into<String>,
        safe_through_chapter: Chapter,
    ) -> Self {
        Self {
            article_id: article_id.into(),
            content: content.into(),
            safe_through_chapter: Some(safe_through_chapter),
        }
    }
}

/// One article's snapshots.
#[derive(Debug, Clone, Default)]
struct ArticleHistory {
    /// Every snapshot, in version order. Versions may have gaps after a
    /// restore, so new versions continue from the last entry.
    log: Vec<ArticleSnapshot>,
    /// Active snapshot per safe-through chapter, as an index into `log`.
    active: BTreeMap<Chapter, usize>,
}

impl ArticleHistory {
    fn latest(&self) -> Option<&ArticleSnapshot> {
        self.log.last()
    }

    fn active(&self) -> impl Iterator<Item = &ArticleSnapshot> {
        self.active.values().map(|&index| &self.log[index])
    }

    fn visible_at(&self, reader_chapter: Chapter) -> Option<&ArticleSnapshot> {
        self.active()
            .filter(|snapshot| snapshot.safe_through_chapter <= reader_chapter)
            .max_by_key(|snapshot| snapshot.selection_key())
    }
}

/// Stores immutable article snapshots and answers spoiler-safe reads.
#[derive(Debug, Clone)]
pub struct ArticleStore {
    articles: HashMap<ArticleId, ArticleHistory>,
    preview_chars: usize,
}

impl Default for ArticleStore {
    fn default() -> Self {
        Self::from_config(&ArticleConfig::default())
    }
}

impl ArticleStore {
    /// Create a new empty store with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ArticleConfig) -> Self {
        Self {
            articles: HashMap::new(),
            preview_chars: config.preview_chars,
        }
    }

    /// Rebuild a store from persisted snapshots.
    ///
    /// Snapshots are ordered by version per article. If two share a
    /// safe-through chapter, the higher version becomes active.
    pub fn restore(
        config: &ArticleConfig,
        snapshots: impl IntoIterator<Item = ArticleSnapshot>,
    ) -> Self {
        let mut store = Self::from_config(config);

        let mut grouped: HashMap<ArticleId, Vec<ArticleSnapshot>> = HashMap::new();
        for snapshot in snapshots {
            grouped
                .entry(snapshot.article_id.clone())
                .or_default()
                .push(snapshot);
        }

        for (article_id, mut snapshots) in grouped {
            snapshots.sort_by_key(|s| s.version_number);
            let mut history = ArticleHistory::default();
            for snapshot in snapshots {
                let chapter = snapshot.safe_through_chapter;
                if let Some(&previous) = history.active.get(&chapter) {
                    warn!(
                        article = %article_id,
                        chapter,
                        superseded_version = history.log[previous].version_number,
                        version = snapshot.version_number,
                        "two snapshots share a safe-through chapter; keeping the higher version"
                    );
                }
                history.log.push(snapshot);
                history.active.insert(chapter, history.log.len() - 1);
            }
            store.articles.insert(article_id, history);
        }
        store
    }

    /// Append a snapshot for `article_id`, safe through `safe_through_chapter`.
    ///
    /// Writing again for the article's latest chapter replaces the active
    /// snapshot for that chapter with a new version. Writing for a chapter
    /// before the latest is rejected, keeping safe-through chapters weakly
    /// increasing with version number.
    pub fn create_snapshot(
        &mut self,
        article_id: ArticleId,
        content: impl Into<String>,
        safe_through_chapter: Chapter,
    ) -> Result<&ArticleSnapshot> {
        self.check_write(&article_id, safe_through_chapter)?;

        let content = content.into();
        let preview = preview_of(&content, self.preview_chars);
        let history = self.articles.entry(article_id.clone()).or_default();
        let parent = history.latest().map(|s| s.id);
        let replaced = history.active.contains_key(&safe_through_chapter);

        let snapshot = ArticleSnapshot {
            id: SnapshotId::new(),
            article_id,
            content,
            preview,
            safe_through_chapter,
            version_number: history.latest().map_or(1, |s| s.version_number + 1),
            parent_snapshot_id: parent,
        };
        debug!(
            article = %snapshot.article_id,
            chapter = safe_through_chapter,
            version = snapshot.version_number,
            replaced,
            "created article snapshot"
        );

        history.log.push(snapshot);
        let index = history.log.len() - 1;
        history.active.insert(safe_through_chapter, index);
        Ok(&history.log[index])
    }

    /// Validate and apply a boundary write.
    pub fn apply_write(&mut self, write: SnapshotWrite) -> Result<&ArticleSnapshot> {
        let chapter = Self::validate_write(&write)?;
        self.create_snapshot(write.article_id, write.content, chapter)
    }

    /// Structural checks on a write, independent of stored state.
    pub fn validate_write(write: &SnapshotWrite) -> Result<Chapter> {
        if write.article_id.is_blank() {
            return Err(KnowledgeError::EmptyArticleId);
        }
        write
            .safe_through_chapter
            .ok_or_else(|| KnowledgeError::MissingSafeThroughChapter(write.article_id.clone()))
    }

    /// The snapshot a reader at `reader_chapter` may see: the active snapshot
    /// with the greatest safe-through chapter not after the reader. Ties go to
    /// the higher version. `None` when nothing is safe yet.
    pub fn read_at_chapter(
        &self,
        article_id: &ArticleId,
        reader_chapter: Chapter,
    ) -> Option<&ArticleSnapshot> {
        self.articles.get(article_id)?.visible_at(reader_chapter)
    }

    /// The most recently written snapshot, regardless of reader position.
    pub fn latest(&self, article_id: &ArticleId) -> Option<&ArticleSnapshot> {
        self.articles.get(article_id)?.latest()
    }

    /// Every snapshot ever written for the article, oldest version first.
    pub fn history(&self, article_id: &ArticleId) -> &[ArticleSnapshot] {
        self.articles
            .get(article_id)
            .map(|h| h.log.as_slice())
            .unwrap_or(&[])
    }

    /// One active snapshot per safe-through chapter, in chapter order.
    pub fn active_snapshots(&self, article_id: &ArticleId) -> Vec<&ArticleSnapshot> {
        self.articles
            .get(article_id)
            .map(|h| h.active().collect())
            .unwrap_or_default()
    }

    /// Articles with something safe to show at `reader_chapter`, sorted.
    pub fn articles_visible_at(&self, reader_chapter: Chapter) -> Vec<&ArticleId> {
        let mut ids: Vec<_> = self
            .articles
            .iter()
            .filter(|(_, history)| history.visible_at(reader_chapter).is_some())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    pub fn article_ids(&self) -> impl Iterator<Item = &ArticleId> {
        self.articles.keys()
    }

    /// Number of articles.
    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    fn check_write(&self, article_id: &ArticleId, safe_through_chapter: Chapter) -> Result<()> {
        if article_id.is_blank() {
            return Err(KnowledgeError::EmptyArticleId);
        }
        if let Some(latest) = self.latest(article_id) {
            if safe_through_chapter < latest.safe_through_chapter {
                return Err(KnowledgeError::NonMonotonicSnapshot {
                    article_id: article_id.clone(),
                    requested: safe_through_chapter,
                    latest: latest.safe_through_chapter,
                });
            }
        }
        Ok(())
    }
}

/// First paragraph of `content`, whitespace-collapsed and cut to `max_chars`
/// on a character boundary.
pub fn preview_of(content: &str, max_chars: usize) -> String {
    let paragraph = content
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("");
    let collapsed = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

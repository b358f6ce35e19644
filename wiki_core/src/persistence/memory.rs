//! In-memory repository, for tests and single-process runs.

use std::collections::{BTreeMap, HashMap};
use story_bible::{ArticleId, ArticleSnapshot, Chapter, EntityId, EntityRecord, NarrativeId};

use super::KnowledgeRepository;
use crate::context_window::ChapterSummary;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
struct NarrativeData {
    entities: HashMap<EntityId, EntityRecord>,
    snapshots: BTreeMap<ArticleId, Vec<ArticleSnapshot>>,
    summaries: BTreeMap<Chapter, ChapterSummary>,
    last_committed: Option<Chapter>,
}

/// Repository that keeps everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    narratives: HashMap<NarrativeId, NarrativeData>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self, narrative: &NarrativeId) -> Option<&NarrativeData> {
        self.narratives.get(narrative)
    }

    fn data_mut(&mut self, narrative: &NarrativeId) -> &mut NarrativeData {
        self.narratives.entry(narrative.clone()).or_default()
    }
}

impl KnowledgeRepository for MemoryRepository {
    fn load_entities(&self, narrative: &NarrativeId) -> Result<Vec<EntityRecord>> {
        Ok(self
            .data(narrative)
            .map(|d| d.entities.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_entity(&mut self, narrative: &NarrativeId, record: &EntityRecord) -> Result<()> {
        self.data_mut(narrative)
            .entities
            .insert(record.id, record.clone());
        Ok(())
    }

    fn list_articles(&self, narrative: &NarrativeId) -> Result<Vec<ArticleId>> {
        Ok(self
            .data(narrative)
            .map(|d| d.snapshots.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn load_snapshots(
        &self,
        narrative: &NarrativeId,
        article_id: &ArticleId,
    ) -> Result<Vec<ArticleSnapshot>> {
        Ok(self
            .data(narrative)
            .and_then(|d| d.snapshots.get(article_id))
            .cloned()
            .unwrap_or_default())
    }

    fn save_snapshot(
        &mut self,
        narrative: &NarrativeId,
        snapshot: &ArticleSnapshot,
    ) -> Result<()> {
        let snapshots = self
            .data_mut(narrative)
            .snapshots
            .entry(snapshot.article_id.clone())
            .or_default();
        if !snapshots.iter().any(|s| s.id == snapshot.id) {
            snapshots.push(snapshot.clone());
        }
        Ok(())
    }

    fn load_summaries(&self, narrative: &NarrativeId) -> Result<Vec<ChapterSummary>> {
        Ok(self
            .data(narrative)
            .map(|d| d.summaries.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_summary(&mut self, narrative: &NarrativeId, summary: &ChapterSummary) -> Result<()> {
        self.data_mut(narrative)
            .summaries
            .insert(summary.chapter(), summary.clone());
        Ok(())
    }

    fn load_last_committed(&self, narrative: &NarrativeId) -> Result<Option<Chapter>> {
        Ok(self.data(narrative).and_then(|d| d.last_committed))
    }

    fn save_last_committed(&mut self, narrative: &NarrativeId, chapter: Chapter) -> Result<()> {
        self.data_mut(narrative).last_committed = Some(chapter);
        Ok(())
    }
}

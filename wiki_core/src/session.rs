//! Narrative Session - explicit chapter state over the three stores.
//!
//! A session owns the entity store, the article store, and the context window
//! for one narrative. Work for a chapter is staged in a [`ChapterBatch`] value
//! and applied with [`NarrativeSession::commit`], which either lands every
//! entity upsert, snapshot, and summary of the chapter or none of them.
//! Dropping a batch aborts it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use story_bible::{
    ArticleId, ArticleSnapshot, Chapter, EntityId, EntityRecord, KnowledgeConfig, NarrativeId,
};
use tracing::{debug, info, warn};

use crate::articles::{ArticleStore, SnapshotWrite};
use crate::context_window::{ChapterSummary, CharRatioEstimator, ContextWindow, TokenEstimator};
use crate::entities::{
    CandidateEntity, EntityResolver, EntityStore, ResolutionEvidence, ResolvedEntity, SearchHit,
    UpsertReport,
};
use crate::error::{KnowledgeError, Result};
use crate::persistence::KnowledgeRepository;

/// Everything one chapter wants to write, staged until commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterBatch {
    chapter: Chapter,
    summary: Option<String>,
    entities: Vec<ResolvedEntity>,
    snapshots: Vec<SnapshotWrite>,
}

impl ChapterBatch {
    pub fn new(chapter: Chapter) -> Self {
        Self {
            chapter,
            summary: None,
            entities: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn chapter(&self) -> Chapter {
        self.chapter
    }

    /// Stage the chapter's summary text.
    pub fn set_summary(&mut self, text: impl Into<String>) {
        self.summary = Some(text.into());
    }

    /// Stage the judge's merge decisions.
    pub fn add_resolved(&mut self, resolved: impl IntoIterator<Item = ResolvedEntity>) {
        self.entities.extend(resolved);
    }

    /// Stage article content safe through this batch's chapter.
    pub fn add_article(&mut self, article_id: impl Into<ArticleId>, content: impl Into<String>) {
        self.snapshots
            .push(SnapshotWrite::new(article_id, content, self.chapter));
    }

    /// Stage a boundary write as received from the pipeline.
    pub fn add_snapshot_write(&mut self, write: SnapshotWrite) {
        self.snapshots.push(write);
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.entities.is_empty() && self.snapshots.is_empty()
    }

    /// Discard the batch without touching any store.
    pub fn abort(self) {
        debug!(
            chapter = self.chapter,
            entities = self.entities.len(),
            snapshots = self.snapshots.len(),
            "aborted chapter batch"
        );
    }
}

/// What a successful commit changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReport {
    pub chapter: Chapter,
    pub entities: UpsertReport,
    pub snapshots: Vec<ArticleSnapshot>,
    /// Whether committing the summary evicted older context.
    pub evicted_context: bool,
}

/// Single-writer session for one narrative.
pub struct NarrativeSession<R: KnowledgeRepository> {
    narrative: NarrativeId,
    config: KnowledgeConfig,
    repository: R,
    estimator: Arc<dyn TokenEstimator>,
    resolver: EntityResolver,
    entities: EntityStore,
    articles: ArticleStore,
    window: ContextWindow,
    last_committed: Option<Chapter>,
}

impl<R: KnowledgeRepository> NarrativeSession<R> {
    /// Open a session, restoring stores and context from `repository`.
    ///
    /// The newest persisted summary becomes the window's current summary;
    /// older ones are loaded backwards until the token budget is reached.
    /// Live entity records left sharing a name by an interrupted commit are
    /// folded together and written back.
    pub fn open(
        mut repository: R,
        narrative: NarrativeId,
        config: KnowledgeConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (entities, folds) = EntityStore::restore(repository.load_entities(&narrative)?);
        for (survivor, absorbed) in &folds {
            for id in [survivor, absorbed] {
                if let Some(record) = entities.get(*id) {
                    repository.save_entity(&narrative, record)?;
                }
            }
        }
        if !folds.is_empty() {
            warn!(
                narrative = %narrative,
                folded = folds.len(),
                "folded duplicate entity records on open"
            );
        }

        let mut snapshots = Vec::new();
        for article_id in repository.list_articles(&narrative)? {
            snapshots.extend(repository.load_snapshots(&narrative, &article_id)?);
        }
        let newest_snapshot = snapshots.iter().map(|s| s.safe_through_chapter).max();
        let articles = ArticleStore::restore(&config.articles, snapshots);

        let summaries = repository.load_summaries(&narrative)?;
        let last_committed = [
            repository.load_last_committed(&narrative)?,
            summaries.last().map(|s| s.chapter()),
            newest_snapshot,
        ]
        .into_iter()
        .flatten()
        .max();
        let mut window = ContextWindow::from_config(&config.context);
        let mut newest_first = summaries.into_iter().rev();
        let current = newest_first.next();
        window.bootstrap(newest_first);
        if let Some(current) = current {
            window.push_latest(current);
        }

        info!(
            narrative = %narrative,
            entities = entities.len(),
            articles = articles.len(),
            context_chapters = window.len(),
            last_committed = ?last_committed,
            "opened narrative session"
        );

        Ok(Self {
            estimator: Arc::new(CharRatioEstimator::new(config.context.chars_per_token)),
            resolver: EntityResolver::lexical(config.resolver.clone()),
            narrative,
            config,
            repository,
            entities,
            articles,
            window,
            last_committed,
        })
    }

    /// Replace the similarity scorer, e.g. with an embedding-backed one.
    pub fn with_resolver(mut self, resolver: EntityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the token estimator used for new summaries.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn narrative(&self) -> &NarrativeId {
        &self.narrative
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn articles(&self) -> &ArticleStore {
        &self.articles
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    pub fn last_committed(&self) -> Option<Chapter> {
        self.last_committed
    }

    /// Prior-chapter context for the next generation prompt.
    pub fn prompt_context(&self) -> String {
        self.window.to_prompt_string()
    }

    /// Retrieval evidence for a chapter's candidates, against committed state.
    pub fn resolve(&self, candidates: &[CandidateEntity]) -> ResolutionEvidence {
        self.resolver.resolve_batch(
            &self.entities,
            candidates,
            self.config.resolver.min_significance,
        )
    }

    pub fn search(&self, query: &str) -> Vec<SearchHit<'_>> {
        self.resolver.search(&self.entities, query)
    }

    /// Spoiler-safe article read for a reader at `reader_chapter`.
    pub fn read_at_chapter(
        &self,
        article_id: &ArticleId,
        reader_chapter: Chapter,
    ) -> Option<&ArticleSnapshot> {
        self.articles.read_at_chapter(article_id, reader_chapter)
    }

    /// Start staging work for `chapter`.
    pub fn begin_chapter(&self, chapter: Chapter) -> Result<ChapterBatch> {
        self.check_order(chapter)?;
        Ok(ChapterBatch::new(chapter))
    }

    /// Apply a chapter batch all-or-nothing.
    ///
    /// Changes are applied to copies of the stores and persisted; the session
    /// only adopts them once every step has succeeded. The commit marker is
    /// written last, so a chapter whose writes were interrupted can be retried.
    pub fn commit(&mut self, batch: ChapterBatch) -> Result<CommitReport> {
        let ChapterBatch {
            chapter,
            summary,
            entities: resolved,
            snapshots: writes,
        } = batch;
        self.check_order(chapter)?;

        for write in &writes {
            let safe_through = ArticleStore::validate_write(write)?;
            if safe_through > chapter {
                return Err(KnowledgeError::SnapshotBeyondChapter {
                    article_id: write.article_id.clone(),
                    safe_through,
                    chapter,
                });
            }
        }
        for entity in &resolved {
            entity.candidate.validate()?;
        }

        let mut entities = self.entities.clone();
        let entity_report = entities.upsert(resolved)?;

        let mut articles = self.articles.clone();
        let mut snapshots = Vec::with_capacity(writes.len());
        for write in writes {
            snapshots.push(articles.apply_write(write)?.clone());
        }

        let mut window = self.window.clone();
        let summary =
            summary.map(|text| ChapterSummary::new(chapter, text, self.estimator.as_ref()));
        let evicted_context = match &summary {
            Some(summary) => window.push_latest(summary.clone()),
            None => false,
        };

        for id in entity_report.touched() {
            if let Some(record) = entities.get(id) {
                self.repository.save_entity(&self.narrative, record)?;
            }
        }
        for snapshot in &snapshots {
            self.repository.save_snapshot(&self.narrative, snapshot)?;
        }
        if let Some(summary) = &summary {
            self.repository.save_summary(&self.narrative, summary)?;
        }
        self.repository.save_last_committed(&self.narrative, chapter)?;

        self.entities = entities;
        self.articles = articles;
        self.window = window;
        self.last_committed = Some(chapter);

        info!(
            narrative = %self.narrative,
            chapter,
            created = entity_report.created.len(),
            merged = entity_report.merged.len(),
            recovered = entity_report.recovered.len(),
            snapshots = snapshots.len(),
            evicted_context,
            "committed chapter"
        );

        Ok(CommitReport {
            chapter,
            entities: entity_report,
            snapshots,
            evicted_context,
        })
    }

    /// Fold one live record into another on the caller's judgement and
    /// persist both. Returns the survivor, or `None` if the pair is invalid.
    pub fn merge_entities(
        &mut self,
        survivor: EntityId,
        absorbed: EntityId,
    ) -> Result<Option<EntityRecord>> {
        let mut entities = self.entities.clone();
        let Some(merged) = entities.merge_records(survivor, absorbed).cloned() else {
            return Ok(None);
        };

        self.repository.save_entity(&self.narrative, &merged)?;
        if let Some(tombstone) = entities.get(absorbed) {
            self.repository.save_entity(&self.narrative, tombstone)?;
        }
        self.entities = entities;
        Ok(Some(merged))
    }

    fn check_order(&self, chapter: Chapter) -> Result<()> {
        match self.last_committed {
            Some(last_committed) if chapter <= last_committed => {
                Err(KnowledgeError::OutOfOrderChapter {
                    requested: chapter,
                    last_committed,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;
    use story_bible::{EntityKind, Significance};

    fn session() -> NarrativeSession<MemoryRepository> {
        NarrativeSession::open(
            MemoryRepository::new(),
            NarrativeId::from("saga"),
            KnowledgeConfig::default(),
        )
        .unwrap()
    }

    fn mira(chapter: Chapter) -> CandidateEntity {
        CandidateEntity::new(EntityKind::Character, "Mira", chapter)
            .with_significance(Significance::Major)
    }

    #[test]
    fn test_commit_applies_everything() {
        let mut session = session();
        let mut batch = session.begin_chapter(1).unwrap();
        batch.set_summary("Mira arrives in Windmere.");
        batch.add_resolved([ResolvedEntity::new(mira(1))]);
        batch.add_article("Windmere", "a quiet village");

        let report = session.commit(batch).unwrap();

        assert_eq!(report.chapter, 1);
        assert_eq!(report.entities.created.len(), 1);
        assert_eq!(report.snapshots.len(), 1);
        assert!(!report.evicted_context);
        assert_eq!(session.last_committed(), Some(1));
        assert!(session.entities().find_by_name("Mira").is_some());
        assert!(session
            .read_at_chapter(&ArticleId::from("Windmere"), 1)
            .is_some());
        assert_eq!(session.window().current().map(|s| s.chapter()), Some(1));

        let repo = session.repository();
        assert_eq!(repo.load_entities(session.narrative()).unwrap().len(), 1);
        assert_eq!(repo.load_summaries(session.narrative()).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let mut session = session();
        let mut batch = session.begin_chapter(1).unwrap();
        batch.add_article("Windmere", "home of a dragon shrine");
        session.commit(batch).unwrap();

        let mut batch = session.begin_chapter(2).unwrap();
        batch.set_summary("The shrine is found.");
        batch.add_resolved([ResolvedEntity::new(mira(2))]);
        batch.add_snapshot_write(SnapshotWrite {
            article_id: ArticleId::from("Windmere"),
            content: "no chapter".to_string(),
            safe_through_chapter: None,
        });

        let err = session.commit(batch).unwrap_err();
        assert!(matches!(err, KnowledgeError::MissingSafeThroughChapter(_)));
        assert!(session.entities().is_empty());
        assert_eq!(session.last_committed(), Some(1));
        assert!(session.window().current().is_none());
        assert!(session
            .repository()
            .load_entities(session.narrative())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_snapshot_beyond_batch_chapter_rejected() {
        let mut session = session();
        let mut batch = session.begin_chapter(3).unwrap();
        batch.add_snapshot_write(SnapshotWrite::new("Windmere", "the ending", 9));

        let err = session.commit(batch).unwrap_err();
        assert!(matches!(
            err,
            KnowledgeError::SnapshotBeyondChapter {
                safe_through: 9,
                chapter: 3,
                ..
            }
        ));
        assert!(session.articles().is_empty());
    }

    #[test]
    fn test_chapters_must_advance() {
        let mut session = session();
        let batch = session.begin_chapter(2).unwrap();
        session.commit(batch).unwrap();

        assert!(matches!(
            session.begin_chapter(2),
            Err(KnowledgeError::OutOfOrderChapter {
                requested: 2,
                last_committed: 2
            })
        ));
        assert!(session.commit(ChapterBatch::new(1)).is_err());
        assert!(session.begin_chapter(3).is_ok());
    }

    #[test]
    fn test_aborted_batch_leaves_state_untouched() {
        let mut session = session();
        let mut batch = session.begin_chapter(1).unwrap();
        batch.add_resolved([ResolvedEntity::new(mira(1))]);
        batch.abort();

        assert!(session.entities().is_empty());
        assert_eq!(session.last_committed(), None);
        assert!(session.commit(ChapterBatch::new(1)).is_ok());
    }

    #[test]
    fn test_resolve_reads_committed_state() {
        let mut session = session();
        let mut batch = session.begin_chapter(1).unwrap();
        batch.add_resolved([ResolvedEntity::new(mira(1).with_alias("the Cartographer"))]);
        session.commit(batch).unwrap();

        let evidence = session.resolve(&[
            CandidateEntity::new(EntityKind::Character, "the Cartographer", 2)
                .with_significance(Significance::Relevant),
        ]);
        assert_eq!(evidence.matches.len(), 1);
        assert_eq!(evidence.matches[0].record.name, "Mira");
        assert_eq!(session.search("Mira").len(), 1);
    }

    #[test]
    fn test_merge_entities_persists_both_records() {
        let mut session = session();
        let mut batch = session.begin_chapter(1).unwrap();
        batch.add_resolved([
            ResolvedEntity::new(mira(1)),
            ResolvedEntity::new(
                CandidateEntity::new(EntityKind::Character, "The Cartographer", 1)
                    .with_significance(Significance::Major),
            ),
        ]);
        let report = session.commit(batch).unwrap();
        let (survivor, absorbed) = (report.entities.created[0], report.entities.created[1]);

        let merged = session.merge_entities(survivor, absorbed).unwrap().unwrap();
        assert!(merged.aliases.contains("The Cartographer"));
        assert_eq!(session.entities().len(), 1);

        let stored = session
            .repository()
            .load_entities(session.narrative())
            .unwrap();
        let tombstone = stored.iter().find(|r| r.id == absorbed).unwrap();
        assert_eq!(tombstone.merged_into, Some(survivor));

        assert!(session.merge_entities(survivor, absorbed).unwrap().is_none());
    }

    #[test]
    fn test_reopen_restores_state() {
        let mut session = session();
        for chapter in 1..=3 {
            let mut batch = session.begin_chapter(chapter).unwrap();
            batch.set_summary(format!("Summary of chapter {}", chapter));
            batch.add_article("Windmere", format!("Windmere as of chapter {}", chapter));
            batch.add_resolved([ResolvedEntity::new(mira(chapter))]);
            session.commit(batch).unwrap();
        }
        let before_window = session.window().chapters();
        let repository = session.into_repository();

        let reopened = NarrativeSession::open(
            repository,
            NarrativeId::from("saga"),
            KnowledgeConfig::default(),
        )
        .unwrap();

        assert_eq!(reopened.last_committed(), Some(3));
        assert_eq!(reopened.entities().len(), 1);
        assert_eq!(
            reopened.entities().find_by_name("Mira").map(|r| r.last_seen),
            Some(3)
        );
        assert_eq!(reopened.window().chapters(), before_window);
        assert_eq!(reopened.window().current().map(|s| s.chapter()), Some(3));
        let read = reopened
            .read_at_chapter(&ArticleId::from("Windmere"), 2)
            .unwrap();
        assert_eq!(read.content, "Windmere as of chapter 2");
        assert!(reopened.begin_chapter(3).is_err());
    }

    /// Memory repository whose first `fail_snapshots` snapshot saves fail.
    struct FailingSnapshots {
        inner: MemoryRepository,
        fail_snapshots: usize,
    }

    impl KnowledgeRepository for FailingSnapshots {
        fn load_entities(&self, narrative: &NarrativeId) -> Result<Vec<EntityRecord>> {
            self.inner.load_entities(narrative)
        }

        fn save_entity(&mut self, narrative: &NarrativeId, record: &EntityRecord) -> Result<()> {
            self.inner.save_entity(narrative, record)
        }

        fn list_articles(&self, narrative: &NarrativeId) -> Result<Vec<ArticleId>> {
            self.inner.list_articles(narrative)
        }

        fn load_snapshots(
            &self,
            narrative: &NarrativeId,
            article_id: &ArticleId,
        ) -> Result<Vec<ArticleSnapshot>> {
            self.inner.load_snapshots(narrative, article_id)
        }

        fn save_snapshot(
            &mut self,
            narrative: &NarrativeId,
            snapshot: &ArticleSnapshot,
        ) -> Result<()> {
            if self.fail_snapshots > 0 {
                self.fail_snapshots -= 1;
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.save_snapshot(narrative, snapshot)
        }

        fn load_summaries(&self, narrative: &NarrativeId) -> Result<Vec<ChapterSummary>> {
            self.inner.load_summaries(narrative)
        }

        fn save_summary(
            &mut self,
            narrative: &NarrativeId,
            summary: &ChapterSummary,
        ) -> Result<()> {
            self.inner.save_summary(narrative, summary)
        }

        fn load_last_committed(&self, narrative: &NarrativeId) -> Result<Option<Chapter>> {
            self.inner.load_last_committed(narrative)
        }

        fn save_last_committed(&mut self, narrative: &NarrativeId, chapter: Chapter) -> Result<()> {
            self.inner.save_last_committed(narrative, chapter)
        }
    }

    #[test]
    fn test_retry_after_interrupted_commit_keeps_one_record_per_name() {
        let repository = FailingSnapshots {
            inner: MemoryRepository::new(),
            fail_snapshots: 1,
        };
        let mut session = NarrativeSession::open(
            repository,
            NarrativeId::from("saga"),
            KnowledgeConfig::default(),
        )
        .unwrap();

        let mut batch = session.begin_chapter(1).unwrap();
        batch.set_summary("Mira arrives in Windmere.");
        batch.add_resolved([ResolvedEntity::new(mira(1))]);
        batch.add_article("Windmere", "a quiet village");

        assert!(matches!(
            session.commit(batch.clone()),
            Err(KnowledgeError::Io(_))
        ));
        assert_eq!(session.last_committed(), None);
        // The entity file landed before the failure.
        let stored = session
            .repository()
            .inner
            .load_entities(session.narrative())
            .unwrap();
        assert_eq!(stored.len(), 1);

        session.commit(batch).unwrap();
        let repository = session.into_repository().inner;
        assert_eq!(repository.load_entities(&NarrativeId::from("saga")).unwrap().len(), 2);

        let reopened = NarrativeSession::open(
            repository,
            NarrativeId::from("saga"),
            KnowledgeConfig::default(),
        )
        .unwrap();
        let live: Vec<_> = reopened
            .entities()
            .live_records()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(live, vec!["Mira"]);
        assert_eq!(reopened.last_committed(), Some(1));

        let stored = reopened
            .repository()
            .load_entities(reopened.narrative())
            .unwrap();
        assert_eq!(stored.iter().filter(|r| r.is_live()).count(), 1);
        assert_eq!(stored.iter().filter(|r| !r.is_live()).count(), 1);
    }

    #[test]
    fn test_reopen_remembers_chapter_committed_without_summary() {
        let mut session = session();
        let mut batch = session.begin_chapter(1).unwrap();
        batch.set_summary("Mira arrives in Windmere.");
        session.commit(batch).unwrap();

        let mut batch = session.begin_chapter(5).unwrap();
        batch.add_resolved([ResolvedEntity::new(mira(5))]);
        session.commit(batch).unwrap();
        assert_eq!(session.last_committed(), Some(5));

        let reopened = NarrativeSession::open(
            session.into_repository(),
            NarrativeId::from("saga"),
            KnowledgeConfig::default(),
        )
        .unwrap();
        assert_eq!(reopened.last_committed(), Some(5));
        assert!(matches!(
            reopened.begin_chapter(3),
            Err(KnowledgeError::OutOfOrderChapter {
                requested: 3,
                last_committed: 5
            })
        ));
        assert!(reopened.begin_chapter(6).is_ok());
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = KnowledgeConfig::default();
        config.context.token_budget = 0;
        let result =
            NarrativeSession::open(MemoryRepository::new(), NarrativeId::from("saga"), config);
        assert!(matches!(result, Err(KnowledgeError::Config(_))));
    }
}

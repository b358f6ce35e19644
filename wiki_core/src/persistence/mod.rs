//! Persistence seam for the knowledge base.
//!
//! The core never decides where records live. A repository must give
//! read-your-writes consistency within one session; anything stronger is the
//! backend's business.

mod file;
mod memory;

pub use file::*;
pub use memory::*;

use story_bible::{ArticleId, ArticleSnapshot, Chapter, EntityRecord, NarrativeId};

use crate::context_window::ChapterSummary;
use crate::error::Result;

/// Storage operations the knowledge base consumes.
pub trait KnowledgeRepository {
    /// Every entity record of the narrative, merged tombstones included.
    fn load_entities(&self, narrative: &NarrativeId) -> Result<Vec<EntityRecord>>;

    /// Insert or overwrite one entity record.
    fn save_entity(&mut self, narrative: &NarrativeId, record: &EntityRecord) -> Result<()>;

    /// Ids of every article with at least one snapshot.
    fn list_articles(&self, narrative: &NarrativeId) -> Result<Vec<ArticleId>>;

    /// Every snapshot of one article, in any order.
    fn load_snapshots(
        &self,
        narrative: &NarrativeId,
        article_id: &ArticleId,
    ) -> Result<Vec<ArticleSnapshot>>;

    /// Store a new snapshot. Snapshots are immutable, so this never overwrites.
    fn save_snapshot(&mut self, narrative: &NarrativeId, snapshot: &ArticleSnapshot)
        -> Result<()>;

    /// Persisted chapter summaries, oldest chapter first.
    fn load_summaries(&self, narrative: &NarrativeId) -> Result<Vec<ChapterSummary>>;

    /// Insert or overwrite the summary for its chapter.
    fn save_summary(&mut self, narrative: &NarrativeId, summary: &ChapterSummary) -> Result<()>;

    /// The last chapter whose commit was fully written, if any.
    fn load_last_committed(&self, narrative: &NarrativeId) -> Result<Option<Chapter>>;

    /// Mark `chapter` as committed. Written after everything else in a commit.
    fn save_last_committed(&mut self, narrative: &NarrativeId, chapter: Chapter) -> Result<()>;
}

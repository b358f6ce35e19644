//! Error types for the knowledge-base core.
//!
//! Absence is never an error here: reads return `Option`. Errors are reserved
//! for writes that would break a store invariant, and for I/O underneath the
//! persistence layer.

use story_bible::{ArticleId, Chapter, ConfigError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("snapshot write for article `{0}` has no safe-through chapter")]
    MissingSafeThroughChapter(ArticleId),

    #[error("snapshot write has an empty article id")]
    EmptyArticleId,

    #[error(
        "snapshot for `{article_id}` at chapter {requested} would precede latest chapter {latest}"
    )]
    NonMonotonicSnapshot {
        article_id: ArticleId,
        requested: Chapter,
        latest: Chapter,
    },

    #[error(
        "snapshot for `{article_id}` claims safety through chapter {safe_through} in a chapter {chapter} batch"
    )]
    SnapshotBeyondChapter {
        article_id: ArticleId,
        safe_through: Chapter,
        chapter: Chapter,
    },

    #[error("malformed entity: {0}")]
    MalformedEntity(String),

    #[error("chapter {requested} cannot be committed after chapter {last_committed}")]
    OutOfOrderChapter {
        requested: Chapter,
        last_committed: Chapter,
    },

    #[error("persistence I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

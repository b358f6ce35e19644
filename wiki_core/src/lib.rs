//! # Wiki Core
//!
//! The knowledge-base core behind a chapter-by-chapter narrative wiki. It
//! keeps prompt context bounded, gives recurring narrative elements a durable
//! identity, and stores article content so readers never see information from
//! chapters they have not reached.
//!
//! ## Core Components
//!
//! - **context_window**: Token-budgeted rolling window of chapter summaries
//! - **entities**: Entity store, pluggable similarity search, and the resolver
//! - **articles**: Append-only, chapter-versioned article snapshots
//! - **persistence**: Repository seam with in-memory and JSON-file backends
//! - **session**: Explicit per-narrative state with all-or-nothing chapter commits
//!
//! ## Design Philosophy
//!
//! - **Spoiler-Safe**: Every read is answered relative to a reader's chapter
//! - **Narrow, not Decide**: Retrieval narrows identity candidates; an external judge decides merges
//! - **Explicit State**: Stores are plain values, testable without a pipeline run

pub mod articles;
pub mod context_window;
pub mod entities;
pub mod error;
pub mod persistence;
pub mod session;

pub use articles::*;
pub use context_window::*;
pub use entities::*;
pub use error::*;
pub use persistence::*;
pub use session::*;

pub use story_bible;

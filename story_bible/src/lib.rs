//! # Story Bible
//!
//! The shared vocabulary of the chapter wiki: identifiers, entity records,
//! article snapshots, and the configuration that tunes the knowledge base.
//! This crate holds data only; the behaviour that keeps it consistent lives in
//! `wiki_core`.

pub mod articles;
pub mod config;
pub mod entities;
pub mod narrative;

pub use articles::*;
pub use config::*;
pub use entities::*;
pub use narrative::*;

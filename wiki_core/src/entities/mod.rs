//! Entities module - durable identity for recurring narrative elements.
//!
//! - **Store**: canonical records with a unique name index and merge redirects
//! - **Similarity**: pluggable scoring used for candidate retrieval
//! - **Resolver**: batch retrieval of evidence and application of merge decisions

mod resolver;
mod similarity;
mod store;

pub use resolver::*;
pub use similarity::*;
pub use store::*;

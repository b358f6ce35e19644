//! Narrative-level identifiers.

use serde::{Deserialize, Serialize};

/// A chapter index. Chapter numbering is owned by the pipeline; the knowledge
/// base only relies on ordering.
pub type Chapter = u32;

/// Identifies one serialized story. All stores are scoped to a narrative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NarrativeId(pub String);

impl NarrativeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NarrativeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NarrativeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

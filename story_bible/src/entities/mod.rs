//! Entity definitions for the narrative knowledge base.

mod record;

pub use record::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable identifier for a narrative entity. The id is the only identity that
/// survives renames and merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Create a new random entity ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an entity ID from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of narrative element an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Character,
    Location,
    Organization,
    Concept,
    Object,
}

impl EntityKind {
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Location => "location",
            EntityKind::Organization => "organization",
            EntityKind::Concept => "concept",
            EntityKind::Object => "object",
        }
    }
}

/// Coarse importance of an entity, used to decide whether it is worth
/// tracking. Ordered from least to most significant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    /// Mentioned in passing.
    Background,
    /// Matters to the chapter it appears in.
    #[default]
    Relevant,
    /// Drives the narrative.
    Major,
}

impl Significance {
    /// Check whether this level passes a minimum-significance filter.
    pub fn meets(&self, minimum: Significance) -> bool {
        *self >= minimum
    }
}

impl std::fmt::Display for Significance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Significance::Background => "background",
            Significance::Relevant => "relevant",
            Significance::Major => "major",
        };
        write!(f, "{}", label)
    }
}

//! Canonical entity records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{EntityId, EntityKind, Significance};
use crate::narrative::Chapter;

/// Normalize a name or alias into the key used for identity comparisons.
///
/// Case-folds, collapses internal whitespace, and trims surrounding
/// punctuation, so `"  The  Professor,"` and `"the professor"` share a key.
pub fn normalize_name(name: &str) -> String {
    let collapsed = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    collapsed
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

/// The canonical record for one recurring narrative element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,

    pub kind: EntityKind,

    /// Canonical display name.
    pub name: String,

    /// Alternative names seen across extraction passes.
    #[serde(default)]
    pub aliases: BTreeSet<String>,

    pub significance: Significance,

    #[serde(default)]
    pub description: String,

    /// Chapter where the entity was first sighted.
    pub first_seen: Chapter,

    /// Chapter of the most recent resolved sighting.
    pub last_seen: Chapter,

    /// Set once this record has been folded into another one. A merged record
    /// is no longer live; its id redirects to the survivor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<EntityId>,
}

impl EntityRecord {
    /// Create a new live record first seen at `chapter`.
    pub fn new(kind: EntityKind, name: impl Into<String>, chapter: Chapter) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            name: name.into(),
            aliases: BTreeSet::new(),
            significance: Significance::default(),
            description: String::new(),
            first_seen: chapter,
            last_seen: chapter,
            merged_into: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    pub fn with_aliases(mut self, aliases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_significance(mut self, significance: Significance) -> Self {
        self.significance = significance;
        self
    }

    /// Whether this record still holds its own identity.
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }

    /// The canonical name followed by every alias.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Normalized identity keys for the name and aliases, deduplicated.
    pub fn name_keys(&self) -> BTreeSet<String> {
        self.names()
            .map(normalize_name)
            .filter(|key| !key.is_empty())
            .collect()
    }

    /// Text used for similarity search: name, aliases, and description.
    pub fn canonical_text(&self) -> String {
        let mut text = self.names().collect::<Vec<_>>().join(" ");
        if !self.description.is_empty() {
            text.push(' ');
            text.push_str(&self.description);
        }
        text
    }

    /// Check if a name matches this record's name or one of its aliases.
    pub fn matches_name(&self, query: &str) -> bool {
        let key = normalize_name(query);
        !key.is_empty() && self.names().any(|name| normalize_name(name) == key)
    }

    /// Record a sighting at `chapter`, widening the seen range.
    pub fn observe(&mut self, chapter: Chapter) {
        self.first_seen = self.first_seen.min(chapter);
        self.last_seen = self.last_seen.max(chapter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  The  Professor,"), "the professor");
        assert_eq!(normalize_name("Doc"), "doc");
        assert_eq!(normalize_name("\"Marcus Webb\""), "marcus webb");
        assert_eq!(normalize_name("  ...  "), "");
    }

    #[test]
    fn test_record_builder() {
        let record = EntityRecord::new(EntityKind::Character, "Marcus Webb", 2)
            .with_alias("the Professor")
            .with_alias("Doc")
            .with_description("A retired archaeologist")
            .with_significance(Significance::Major);

        assert_eq!(record.first_seen, 2);
        assert_eq!(record.last_seen, 2);
        assert_eq!(record.aliases.len(), 2);
        assert_eq!(record.significance, Significance::Major);
        assert!(record.is_live());
    }

    #[test]
    fn test_matches_name() {
        let record = EntityRecord::new(EntityKind::Character, "Marcus Webb", 1)
            .with_aliases(["the Professor", "Doc"]);

        assert!(record.matches_name("marcus webb"));
        assert!(record.matches_name("The professor"));
        assert!(!record.matches_name("Professor Webb"));
        assert!(!record.matches_name(""));
    }

    #[test]
    fn test_name_keys_deduplicate() {
        let record = EntityRecord::new(EntityKind::Location, "Windmere", 1)
            .with_aliases(["windmere", "The Village"]);

        let keys = record.name_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("windmere"));
        assert!(keys.contains("the village"));
    }

    #[test]
    fn test_canonical_text() {
        let record = EntityRecord::new(EntityKind::Character, "Marcus Webb", 1)
            .with_alias("Doc")
            .with_description("Retired archaeologist");

        let text = record.canonical_text();
        assert!(text.starts_with("Marcus Webb"));
        assert!(text.contains("Doc"));
        assert!(text.ends_with("Retired archaeologist"));
    }

    #[test]
    fn test_observe_widens_range() {
        let mut record = EntityRecord::new(EntityKind::Object, "The Lantern", 4);
        record.observe(7);
        record.observe(2);
        record.observe(5);

        assert_eq!(record.first_seen, 2);
        assert_eq!(record.last_seen, 7);
    }

    #[test]
    fn test_merged_record_round_trips() {
        let mut record = EntityRecord::new(EntityKind::Concept, "The Pact", 3);
        record.merged_into = Some(EntityId::new());

        let json = serde_json::to_string(&record).unwrap();
        let parsed: EntityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
        assert!(!parsed.is_live());
    }
}

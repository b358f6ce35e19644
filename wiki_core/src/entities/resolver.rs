//! Entity Resolver - narrows new mentions to candidate existing records.
//!
//! Resolution runs in two phases:
//! 1. **Retrieval**: every tracked candidate is searched against the store
//! 2. **Judgement**: the union of plausible matches is handed to an external
//!    judge, which decides merge or no-merge per candidate
//!
//! The judge's decisions come back as [`ResolvedEntity`] values and are applied
//! with [`EntityResolver::upsert`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use story_bible::{
    normalize_name, Chapter, EntityId, EntityKind, EntityRecord, ResolverConfig, Significance,
};
use tracing::debug;

use super::{EntityStore, LexicalScorer, SearchHit, SimilarityScorer, UpsertReport};
use crate::error::{KnowledgeError, Result};

/// An entity mention extracted from one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub name: String,

    #[serde(default)]
    pub kind: EntityKind,

    #[serde(default)]
    pub significance: Significance,

    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub description: String,

    /// Chapter the mention was extracted from.
    pub chapter: Chapter,
}

impl CandidateEntity {
    pub fn new(kind: EntityKind, name: impl Into<String>, chapter: Chapter) -> Self {
        Self {
            name: name.into(),
            kind,
            significance: Significance::default(),
            aliases: Vec::new(),
            description: String::new(),
            chapter,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
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

    /// Name and aliases, each used as a search query.
    pub fn queries(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// A candidate needs a usable name before it can touch the store.
    pub fn validate(&self) -> Result<()> {
        if normalize_name(&self.name).is_empty() {
            return Err(KnowledgeError::MalformedEntity(format!(
                "candidate from chapter {} has no usable name: {:?}",
                self.chapter, self.name
            )));
        }
        Ok(())
    }
}

/// A candidate paired with the judge's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub candidate: CandidateEntity,

    /// The record this candidate is the same entity as, if any.
    #[serde(default)]
    pub existing_id: Option<EntityId>,
}

impl ResolvedEntity {
    /// A candidate judged to be a new entity.
    pub fn new(candidate: CandidateEntity) -> Self {
        Self {
            candidate,
            existing_id: None,
        }
    }

    /// A candidate judged to be the existing record `id`.
    pub fn matched(candidate: CandidateEntity, id: EntityId) -> Self {
        Self {
            candidate,
            existing_id: Some(id),
        }
    }
}

/// One existing record that plausibly matches part of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMatch {
    pub record: EntityRecord,

    /// Best score against any candidate in the batch.
    pub score: f32,

    /// Names of the candidates that retrieved this record.
    pub matched_candidates: Vec<String>,
}

/// Shared disambiguation evidence for one chapter's batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEvidence {
    /// Candidates that passed the significance filter.
    pub candidates: Vec<CandidateEntity>,

    /// Union of matches across the batch, best first, one entry per record.
    pub matches: Vec<EvidenceMatch>,
}

impl ResolutionEvidence {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&EvidenceMatch> {
        self.matches.iter().find(|m| m.record.id == id)
    }

    /// Format the evidence as a prompt section for the external judge.
    pub fn to_prompt_string(&self) -> String {
        if self.matches.is_empty() {
            return String::new();
        }

        let mut prompt = String::from("## Known Entities\n");
        for evidence in &self.matches {
            let record = &evidence.record;
            prompt.push_str(&format!(
                "- [{}] {} ({})",
                record.id,
                record.name,
                record.kind.name()
            ));
            if !record.aliases.is_empty() {
                let aliases: Vec<_> = record.aliases.iter().map(String::as_str).collect();
                prompt.push_str(&format!(", also known as {}", aliases.join(", ")));
            }
            if !record.description.is_empty() {
                prompt.push_str(&format!(": {}", record.description));
            }
            prompt.push_str(&format!(
                " [matched: {}; score {:.2}]\n",
                evidence.matched_candidates.join(", "),
                evidence.score
            ));
        }
        prompt
    }
}

/// Retrieves candidate matches and applies the judge's merge decisions.
#[derive(Clone)]
pub struct EntityResolver {
    scorer: Arc<dyn SimilarityScorer>,
    config: ResolverConfig,
}

impl std::fmt::Debug for EntityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EntityResolver {
    /// Create a resolver with the given scorer and configuration.
    pub fn new(scorer: Arc<dyn SimilarityScorer>, config: ResolverConfig) -> Self {
        Self { scorer, config }
    }

    /// Create a resolver backed by [`LexicalScorer`].
    pub fn lexical(config: ResolverConfig) -> Self {
        Self::new(Arc::new(LexicalScorer::new()), config)
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Top-k search with the configured relevance threshold.
    pub fn search<'a>(&self, store: &'a EntityStore, query: &str) -> Vec<SearchHit<'a>> {
        store.search_top(
            query,
            self.scorer.as_ref(),
            self.config.top_k,
            self.config.relevance_threshold,
        )
    }

    /// Search every candidate at or above `min_significance` and return the
    /// union of plausible matches as shared evidence.
    ///
    /// Searches are read-only and run concurrently, at most one thread per
    /// available core. The resolver never decides a merge itself.
    pub fn resolve_batch(
        &self,
        store: &EntityStore,
        candidates: &[CandidateEntity],
        min_significance: Significance,
    ) -> ResolutionEvidence {
        let tracked: Vec<CandidateEntity> = candidates
            .iter()
            .filter(|c| c.significance.meets(min_significance))
            .cloned()
            .collect();

        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        let chunk_size = tracked.len().div_ceil(workers).max(1);
        let per_candidate: Vec<Vec<(EntityId, f32)>> = std::thread::scope(|scope| {
            let handles: Vec<_> = tracked
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|candidate| self.candidate_hits(store, candidate))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });

        let mut union: HashMap<EntityId, (f32, Vec<String>)> = HashMap::new();
        for (candidate, hits) in tracked.iter().zip(per_candidate) {
            for (id, score) in hits {
                let entry = union.entry(id).or_insert((0.0, Vec::new()));
                entry.0 = entry.0.max(score);
                if !entry.1.contains(&candidate.name) {
                    entry.1.push(candidate.name.clone());
                }
            }
        }

        let mut matches: Vec<EvidenceMatch> = union
            .into_iter()
            .filter_map(|(id, (score, matched_candidates))| {
                store.get(id).map(|record| EvidenceMatch {
                    record: record.clone(),
                    score,
                    matched_candidates,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record.name.cmp(&b.record.name))
        });

        debug!(
            candidates = candidates.len(),
            tracked = tracked.len(),
            matches = matches.len(),
            "resolved entity batch"
        );

        ResolutionEvidence {
            candidates: tracked,
            matches,
        }
    }

    /// Apply the judge's decisions to `store`.
    pub fn upsert(
        &self,
        store: &mut EntityStore,
        resolved: impl IntoIterator<Item = ResolvedEntity>,
    ) -> Result<UpsertReport> {
        store.upsert(resolved)
    }

    /// Best score per record across the candidate's name and aliases.
    fn candidate_hits(
        &self,
        store: &EntityStore,
        candidate: &CandidateEntity,
    ) -> Vec<(EntityId, f32)> {
        let mut best: HashMap<EntityId, f32> = HashMap::new();
        for query in candidate.queries() {
            for hit in self.search(store, query) {
                let score = best.entry(hit.record.id).or_insert(0.0);
                *score = score.max(hit.score);
            }
        }
        best.into_iter().collect()
    }
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::lexical(ResolverConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_store() -> (EntityStore, EntityId, EntityId) {
        let marcus = EntityRecord::new(EntityKind::Character, "Marcus Webb", 1)
            .with_aliases(["the Professor", "Doc"])
            .with_description("Retired archaeologist");
        let windmere = EntityRecord::new(EntityKind::Location, "Windmere", 1)
            .with_description("A quiet village");
        let (marcus_id, windmere_id) = (marcus.id, windmere.id);
        (
            EntityStore::from_records([marcus, windmere]),
            marcus_id,
            windmere_id,
        )
    }

    #[test]
    fn test_empty_store_gives_empty_evidence() {
        let resolver = EntityResolver::default();
        let store = EntityStore::new();
        let candidates = vec![CandidateEntity::new(EntityKind::Character, "Mira", 1)];

        let evidence = resolver.resolve_batch(&store, &candidates, Significance::Background);
        assert!(evidence.is_empty());
        assert_eq!(evidence.candidates.len(), 1);
        assert!(evidence.to_prompt_string().is_empty());
    }

    #[test]
    fn test_significance_filter() {
        let resolver = EntityResolver::default();
        let (store, _, _) = populated_store();
        let candidates = vec![
            CandidateEntity::new(EntityKind::Character, "Doc", 2)
                .with_significance(Significance::Background),
            CandidateEntity::new(EntityKind::Location, "Windmere", 2)
                .with_significance(Significance::Major),
        ];

        let evidence = resolver.resolve_batch(&store, &candidates, Significance::Relevant);
        assert_eq!(evidence.candidates.len(), 1);
        assert_eq!(evidence.candidates[0].name, "Windmere");
        assert_eq!(evidence.matches.len(), 1);
        assert_eq!(evidence.matches[0].record.name, "Windmere");
    }

    #[test]
    fn test_evidence_is_union_across_batch() {
        let resolver = EntityResolver::default();
        let (store, marcus, windmere) = populated_store();
        let candidates = vec![
            CandidateEntity::new(EntityKind::Character, "the Professor", 3),
            CandidateEntity::new(EntityKind::Character, "Doc", 3),
            CandidateEntity::new(EntityKind::Location, "Windmere", 3),
        ];

        let evidence = resolver.resolve_batch(&store, &candidates, Significance::Background);
        assert_eq!(evidence.matches.len(), 2);

        let marcus_match = evidence.get(marcus).unwrap();
        assert_eq!(marcus_match.score, 1.0);
        assert_eq!(marcus_match.matched_candidates, vec!["the Professor", "Doc"]);
        assert!(evidence.get(windmere).is_some());
    }

    #[test]
    fn test_batch_larger_than_core_count() {
        let resolver = EntityResolver::default();
        let (store, marcus, windmere) = populated_store();
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let candidates: Vec<_> = (0..cores * 8 + 3)
            .map(|i| {
                let name = match i % 3 {
                    0 => "Doc".to_string(),
                    1 => "Windmere".to_string(),
                    _ => format!("Stranger {}", i),
                };
                CandidateEntity::new(EntityKind::Character, name, 4)
            })
            .collect();

        let evidence = resolver.resolve_batch(&store, &candidates, Significance::Background);
        assert_eq!(evidence.candidates.len(), candidates.len());
        assert_eq!(evidence.matches.len(), 2);
        assert_eq!(evidence.get(marcus).unwrap().matched_candidates, vec!["Doc"]);
        assert_eq!(
            evidence.get(windmere).unwrap().matched_candidates,
            vec!["Windmere"]
        );
    }

    #[test]
    fn test_aliases_are_searched() {
        let resolver = EntityResolver::default();
        let (store, marcus, _) = populated_store();
        let candidates = vec![
            CandidateEntity::new(EntityKind::Character, "Old Man Webb", 4).with_alias("Doc"),
        ];

        let evidence = resolver.resolve_batch(&store, &candidates, Significance::Background);
        assert_eq!(evidence.get(marcus).map(|m| m.score), Some(1.0));
    }

    #[test]
    fn test_prompt_lists_ids_and_aliases() {
        let resolver = EntityResolver::default();
        let (store, marcus, _) = populated_store();
        let candidates = vec![CandidateEntity::new(EntityKind::Character, "Doc", 2)];

        let prompt = resolver
            .resolve_batch(&store, &candidates, Significance::Background)
            .to_prompt_string();

        assert!(prompt.starts_with("## Known Entities"));
        assert!(prompt.contains(&marcus.to_string()));
        assert!(prompt.contains("Marcus Webb (character)"));
        assert!(prompt.contains("also known as Doc, the Professor"));
        assert!(prompt.contains("score 1.00"));
    }

    #[test]
    fn test_resolve_then_upsert_twice_is_idempotent() {
        let resolver = EntityResolver::default();
        let (mut store, marcus, _) = populated_store();
        let candidate = CandidateEntity::new(EntityKind::Character, "Professor Webb", 5)
            .with_alias("the Professor")
            .with_significance(Significance::Major);

        for _ in 0..2 {
            let evidence = resolver.resolve_batch(
                &store,
                std::slice::from_ref(&candidate),
                Significance::Relevant,
            );
            // The judge picks the strongest match.
            let target = evidence.matches.first().map(|m| m.record.id);
            assert_eq!(target, Some(marcus));
            resolver
                .upsert(&mut store, [ResolvedEntity::matched(candidate.clone(), marcus)])
                .unwrap();
        }

        let record = store.get(marcus).unwrap();
        assert_eq!(record.aliases.len(), 3);
        assert_eq!(record.last_seen, 5);
    }

    #[test]
    fn test_candidate_validation() {
        assert!(CandidateEntity::new(EntityKind::Object, "The Lantern", 1)
            .validate()
            .is_ok());
        assert!(matches!(
            CandidateEntity::new(EntityKind::Object, " -- ", 1).validate(),
            Err(KnowledgeError::MalformedEntity(_))
        ));
    }
}

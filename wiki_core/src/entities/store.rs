//! Entity Store - canonical records with a unique name index.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use story_bible::{normalize_name, EntityId, EntityRecord};
use tracing::{debug, warn};

use super::{CandidateEntity, ResolvedEntity, SimilarityScorer};
use crate::error::Result;

/// A merge decision whose target no longer exists and was recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredMerge {
    /// The id the caller asked to merge into.
    pub requested_target: EntityId,
    /// The record that received the entity instead.
    pub assigned: EntityId,
}

/// What an upsert did, for persistence and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    /// Fresh records created for unmatched entities.
    pub created: Vec<EntityId>,
    /// Existing records that absorbed a sighting.
    pub merged: Vec<EntityId>,
    /// Stale merge targets converted into creation (or a name-index match).
    pub recovered: Vec<RecoveredMerge>,
}

impl UpsertReport {
    /// Every record whose stored form changed.
    pub fn touched(&self) -> BTreeSet<EntityId> {
        self.created
            .iter()
            .chain(self.merged.iter())
            .copied()
            .chain(self.recovered.iter().map(|r| r.assigned))
            .collect()
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub record: &'a EntityRecord,
    pub score: f32,
}

#[derive(Debug, PartialEq)]
struct Ranked {
    score: f32,
    id: EntityId,
}

impl Eq for Ranked {}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher score first; ties broken by id so results are deterministic.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lazily ranked search results, best first. Only records with a positive
/// score are yielded.
#[derive(Debug)]
pub struct SearchHits<'a> {
    store: &'a EntityStore,
    heap: BinaryHeap<Ranked>,
}

impl<'a> Iterator for SearchHits<'a> {
    type Item = SearchHit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(ranked) = self.heap.pop() {
            if let Some(record) = self.store.records.get(&ranked.id) {
                return Some(SearchHit {
                    record,
                    score: ranked.score,
                });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.heap.len()))
    }
}

/// Holds every entity record for one narrative.
///
/// Merged records stay behind as tombstones so stale ids can be redirected to
/// the record that absorbed them. The name index maps each normalized name or
/// alias of a live record to exactly one id.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    records: HashMap<EntityId, EntityRecord>,
    name_index: HashMap<String, EntityId>,
}

impl EntityStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted records, tombstones included.
    pub fn from_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        Self::restore(records).0
    }

    /// Rebuild a store from persisted records and fold live duplicates.
    ///
    /// Earliest sightings claim contested names first. A later live record
    /// sharing a name with an earlier one is merged into it as a tombstone.
    /// Returns the store and the `(survivor, absorbed)` pairs that were
    /// folded, so the caller can write them back.
    pub fn restore(
        records: impl IntoIterator<Item = EntityRecord>,
    ) -> (Self, Vec<(EntityId, EntityId)>) {
        let mut store = Self::new();
        let mut live: Vec<_> = records
            .into_iter()
            .filter_map(|record| {
                let id = record.id;
                let is_live = record.is_live();
                store.records.insert(id, record);
                is_live.then_some(id)
            })
            .collect();

        live.sort_by_key(|id| (store.records[id].first_seen, *id));
        let mut folds = Vec::new();
        for id in live {
            let keys = store.records[&id].name_keys();
            let owner = keys
                .iter()
                .find_map(|key| store.name_index.get(key).copied());
            match owner {
                Some(owner) => {
                    warn!(
                        owner = %owner,
                        record = %id,
                        "live records share a name on restore; folding"
                    );
                    if store.merge_records(owner, id).is_some() {
                        folds.push((owner, id));
                    }
                }
                None => {
                    for key in keys {
                        store.name_index.insert(key, id);
                    }
                }
            }
        }
        (store, folds)
    }

    /// Get a record by id, including merged tombstones.
    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(&id)
    }

    /// Follow merge redirects from `id` to the live record that now holds it.
    pub fn resolve_id(&self, id: EntityId) -> Option<EntityId> {
        let mut current = id;
        for _ in 0..=self.records.len() {
            let record = self.records.get(&current)?;
            match record.merged_into {
                None => return Some(current),
                Some(next) => current = next,
            }
        }
        warn!(record = %id, "merge redirect cycle detected");
        None
    }

    /// Find the live record owning a name or alias.
    pub fn find_by_name(&self, name: &str) -> Option<&EntityRecord> {
        self.name_index
            .get(&normalize_name(name))
            .and_then(|id| self.records.get(id))
    }

    /// All live records.
    pub fn live_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values().filter(|r| r.is_live())
    }

    /// All records, tombstones included, for persistence.
    pub fn all_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live_records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rank live records by similarity to `query`.
    ///
    /// An empty store yields nothing. Recall is best-effort.
    pub fn search<'a>(&'a self, query: &str, scorer: &dyn SimilarityScorer) -> SearchHits<'a> {
        let heap = self
            .live_records()
            .filter_map(|record| {
                let score = scorer.score(query, record);
                (score > 0.0).then_some(Ranked {
                    score,
                    id: record.id,
                })
            })
            .collect();

        SearchHits { store: self, heap }
    }

    /// Search keeping at most `top_k` hits at or above `threshold`.
    pub fn search_top<'a>(
        &'a self,
        query: &str,
        scorer: &dyn SimilarityScorer,
        top_k: usize,
        threshold: f32,
    ) -> Vec<SearchHit<'a>> {
        self.search(query, scorer)
            .take_while(|hit| hit.score >= threshold)
            .take(top_k)
            .collect()
    }

    /// Apply caller-confirmed merge decisions.
    ///
    /// Entities matched to an existing id are folded into that record; the
    /// rest become new records. A merge target that no longer exists is
    /// recovered by creating a record instead. The whole batch is validated
    /// before anything changes.
    pub fn upsert(
        &mut self,
        resolved: impl IntoIterator<Item = ResolvedEntity>,
    ) -> Result<UpsertReport> {
        let resolved: Vec<_> = resolved.into_iter().collect();
        for entity in &resolved {
            entity.candidate.validate()?;
        }

        let mut report = UpsertReport::default();
        for ResolvedEntity {
            candidate,
            existing_id,
        } in resolved
        {
            match existing_id {
                Some(requested) => match self.resolve_id(requested) {
                    Some(target) => {
                        self.absorb_candidate(target, &candidate);
                        report.merged.push(target);
                    }
                    None => {
                        let assigned = self.create_or_fold(&candidate);
                        warn!(
                            requested_target = %requested,
                            assigned = %assigned,
                            name = %candidate.name,
                            "merge target missing; recovered by assigning entity to another record"
                        );
                        report.recovered.push(RecoveredMerge {
                            requested_target: requested,
                            assigned,
                        });
                    }
                },
                None => {
                    let before = self.records.len();
                    let id = self.create_or_fold(&candidate);
                    if self.records.len() > before {
                        report.created.push(id);
                    } else {
                        report.merged.push(id);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Fold `absorbed` into `survivor`. The survivor keeps its id and gains
    /// every name of the absorbed record; the absorbed record becomes a
    /// tombstone redirecting to the survivor.
    ///
    /// Returns `None` when either record is not live or both are the same.
    pub fn merge_records(
        &mut self,
        survivor: EntityId,
        absorbed: EntityId,
    ) -> Option<&EntityRecord> {
        if survivor == absorbed
            || !self.records.get(&survivor)?.is_live()
            || !self.records.get(&absorbed)?.is_live()
        {
            return None;
        }

        let taken = self.records.get(&absorbed)?.clone();
        let mut moved = Vec::new();
        for name in taken.names() {
            let key = normalize_name(name);
            if key.is_empty() {
                continue;
            }
            match self.name_index.get(&key).copied() {
                Some(owner) if owner != survivor && owner != absorbed => {
                    warn!(
                        alias = %name,
                        owner = %owner,
                        record = %survivor,
                        "alias already owned by another record; skipped"
                    );
                }
                _ => {
                    self.name_index.insert(key, survivor);
                    moved.push(name.to_string());
                }
            }
        }

        let record = self.records.get_mut(&survivor)?;
        let survivor_keys = record.name_keys();
        for name in moved {
            if !survivor_keys.contains(&normalize_name(&name)) {
                record.aliases.insert(name);
            }
        }
        // Aliases differing only in case collapse to the first spelling.
        let mut seen = BTreeSet::new();
        seen.insert(normalize_name(&record.name));
        let aliases = std::mem::take(&mut record.aliases);
        record.aliases = aliases
            .into_iter()
            .filter(|alias| seen.insert(normalize_name(alias)))
            .collect();

        if record.description.is_empty() {
            record.description = taken.description.clone();
        }
        record.significance = record.significance.max(taken.significance);
        record.observe(taken.first_seen);
        record.observe(taken.last_seen);

        if let Some(tombstone) = self.records.get_mut(&absorbed) {
            tombstone.merged_into = Some(survivor);
        }
        debug!(survivor = %survivor, absorbed = %absorbed, "merged entity records");
        self.records.get(&survivor)
    }

    /// Create a record for `candidate`, or fold it into the live record that
    /// already owns its name.
    fn create_or_fold(&mut self, candidate: &CandidateEntity) -> EntityId {
        let key = normalize_name(&candidate.name);
        if let Some(owner) = self.name_index.get(&key).copied() {
            debug!(
                name = %candidate.name,
                owner = %owner,
                "name already indexed; folding sighting"
            );
            self.absorb_candidate(owner, candidate);
            return owner;
        }

        let mut record =
            EntityRecord::new(candidate.kind, candidate.name.clone(), candidate.chapter)
                .with_description(candidate.description.clone())
                .with_significance(candidate.significance);
        let id = record.id;
        self.name_index.insert(normalize_name(&record.name), id);
        for alias in &candidate.aliases {
            let key = normalize_name(alias);
            if key.is_empty() || record.name_keys().contains(&key) {
                continue;
            }
            match self.name_index.get(&key).copied() {
                Some(owner) => {
                    warn!(
                        alias = %alias,
                        owner = %owner,
                        record = %id,
                        "alias already owned by another record; skipped"
                    );
                }
                None => {
                    self.name_index.insert(key, id);
                    record.aliases.insert(alias.clone());
                }
            }
        }
        self.records.insert(id, record);
        id
    }

    /// Merge a sighting into a live record.
    fn absorb_candidate(&mut self, id: EntityId, candidate: &CandidateEntity) {
        let names: Vec<&String> = std::iter::once(&candidate.name)
            .chain(candidate.aliases.iter())
            .collect();

        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        let mut keys = record.name_keys();
        for name in names {
            let key = normalize_name(name);
            if key.is_empty() || keys.contains(&key) {
                continue;
            }
            match self.name_index.get(&key).copied() {
                Some(owner) if owner != id => {
                    warn!(
                        alias = %name,
                        owner = %owner,
                        record = %id,
                        "alias already owned by another record; skipped"
                    );
                }
                _ => {
                    self.name_index.insert(key.clone(), id);
                    record.aliases.insert(name.clone());
                    keys.insert(key);
                }
            }
        }

        if !candidate.description.is_empty() && candidate.chapter >= record.last_seen {
            record.description = candidate.description.clone();
        }
        record.significance = record.significance.max(candidate.significance);
        record.observe(candidate.chapter);
    }
}

//! Pluggable similarity scoring between query text and entity records.

use std::collections::HashSet;
use story_bible::{normalize_name, EntityRecord};

/// Scores how well `query` refers to `record`, from 0.0 (unrelated) to 1.0.
///
/// Implementations may be lexical, embedding-based, or anything else; the
/// store only relies on higher scores meaning better matches.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, query: &str, record: &EntityRecord) -> f32;
}

/// Weight applied to description coverage relative to name overlap.
const DESCRIPTION_WEIGHT: f32 = 0.5;

const STOPWORDS: &[&str] = &["a", "an", "and", "at", "in", "of", "on", "the", "to"];

/// Token-overlap scorer over names, aliases, and description.
///
/// An exact normalized name or alias match scores 1.0. Otherwise the score is
/// the best Dice overlap against any name, or half the share of query tokens
/// found in the description, whichever is higher.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalScorer;

impl LexicalScorer {
    pub fn new() -> Self {
        Self
    }
}

impl SimilarityScorer for LexicalScorer {
    fn score(&self, query: &str, record: &EntityRecord) -> f32 {
        let key = normalize_name(query);
        if key.is_empty() {
            return 0.0;
        }
        if record.names().any(|name| normalize_name(name) == key) {
            return 1.0;
        }

        let query_tokens = content_tokens(query);
        if query_tokens.is_empty() {
            return 0.0;
        }

        let name_score = record
            .names()
            .map(|name| dice(&query_tokens, &content_tokens(name)))
            .fold(0.0_f32, f32::max);

        let description_tokens = content_tokens(&record.description);
        let covered = query_tokens
            .iter()
            .filter(|token| description_tokens.contains(*token))
            .count();
        let description_score = covered as f32 / query_tokens.len() as f32 * DESCRIPTION_WEIGHT;

        name_score.max(description_score)
    }
}

/// Lowercased alphanumeric tokens with stopwords removed. Text made only of
/// stopwords keeps them, so "The The" still has tokens.
fn content_tokens(text: &str) -> HashSet<String> {
    let all: HashSet<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect();

    let content: HashSet<String> = all
        .iter()
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .cloned()
        .collect();

    if content.is_empty() {
        all
    } else {
        content
    }
}

fn dice(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    (2 * shared) as f32 / (a.len() + b.len()) as f32
}

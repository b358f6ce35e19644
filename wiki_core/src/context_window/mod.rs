//! Context Window - keeps prior-chapter summaries within a token budget.
//!
//! The window is an ordered run of summaries, oldest to newest, plus one
//! "current" summary that has been produced but not yet counted:
//! 1. **Push**: `push_latest` commits the previous current summary to the
//!    newest end and holds the new one as current
//! 2. **Evict**: while the running total exceeds the budget, summaries are
//!    dropped from the oldest end
//! 3. **Resume**: `load_historical` walks backwards from the newest persisted
//!    chapter, inserting at the oldest end until the budget is reached
//!
//! A single summary larger than the whole budget is kept alone rather than
//! evicting the window to emptiness.

mod estimator;

pub use estimator::*;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use story_bible::{Chapter, ContextConfig};
use tracing::debug;

/// Condensed description of one chapter. Immutable once produced; the token
/// estimate is computed once and cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSummary {
    chapter: Chapter,
    text: String,
    token_estimate: usize,
}

impl ChapterSummary {
    /// Create a summary, estimating its token cost with `estimator`.
    pub fn new(chapter: Chapter, text: impl Into<String>, estimator: &dyn TokenEstimator) -> Self {
        let text = text.into();
        let token_estimate = estimator.estimate(&text);
        Self {
            chapter,
            text,
            token_estimate,
        }
    }

    /// Create a summary with a known token cost.
    pub fn with_estimate(chapter: Chapter, text: impl Into<String>, token_estimate: usize) -> Self {
        Self {
            chapter,
            text: text.into(),
            token_estimate,
        }
    }

    pub fn chapter(&self) -> Chapter {
        self.chapter
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }
}

/// Token-bounded rolling window of chapter summaries for prompt context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow {
    /// Oldest at the front, newest at the back.
    summaries: VecDeque<ChapterSummary>,

    /// Always the sum of `summaries` token estimates.
    running_total: usize,

    budget: usize,

    /// Latest summary, not yet counted against the budget.
    current: Option<ChapterSummary>,
}

impl ContextWindow {
    /// Create an empty window with the given token budget.
    pub fn new(budget: usize) -> Self {
        Self {
            summaries: VecDeque::new(),
            running_total: 0,
            budget,
            current: None,
        }
    }

    /// Create an empty window sized from configuration.
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.token_budget)
    }

    /// Hold `summary` as the new current summary, committing the previous
    /// current one to the newest end of the window.
    ///
    /// Returns whether any summary was evicted.
    pub fn push_latest(&mut self, summary: ChapterSummary) -> bool {
        let evicted = match self.current.take() {
            Some(previous) => self.append_newest(previous),
            None => false,
        };
        self.current = Some(summary);
        evicted
    }

    /// Commit the held current summary without replacing it. Used when a run
    /// ends and the last summary should count as context.
    ///
    /// Returns whether any summary was evicted.
    pub fn seal_current(&mut self) -> bool {
        match self.current.take() {
            Some(summary) => self.append_newest(summary),
            None => false,
        }
    }

    /// Insert a persisted summary at the oldest end while resuming.
    ///
    /// Never evicts. Returns `true` once the running total exceeds the budget,
    /// telling the caller to stop loading older history.
    pub fn load_historical(&mut self, summary: ChapterSummary) -> bool {
        self.running_total += summary.token_estimate;
        self.summaries.push_front(summary);
        self.running_total > self.budget
    }

    /// Rebuild the window from persisted summaries ordered newest first.
    ///
    /// Loads until the budget is exceeded, then trims the oldest end back
    /// within budget. Returns the number of summaries retained.
    pub fn bootstrap(&mut self, newest_first: impl IntoIterator<Item = ChapterSummary>) -> usize {
        for summary in newest_first {
            if self.load_historical(summary) {
                break;
            }
        }
        self.evict_to_budget();
        self.summaries.len()
    }

    pub fn running_total(&self) -> usize {
        self.running_total
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// The uncommitted current summary, if any.
    pub fn current(&self) -> Option<&ChapterSummary> {
        self.current.as_ref()
    }

    /// Window contents from oldest to newest.
    pub fn summaries(&self) -> impl Iterator<Item = &ChapterSummary> {
        self.summaries.iter()
    }

    /// Chapters currently in the window, oldest first.
    pub fn chapters(&self) -> Vec<Chapter> {
        self.summaries.iter().map(|s| s.chapter).collect()
    }

    /// Format the window as a prompt section.
    pub fn to_prompt_string(&self) -> String {
        if self.summaries.is_empty() {
            return String::new();
        }

        let mut prompt = String::from("## Previous Chapters\n");
        for summary in &self.summaries {
            prompt.push_str(&format!("### Chapter {}\n", summary.chapter));
            prompt.push_str(summary.text.trim());
            prompt.push_str("\n\n");
        }
        prompt
    }

    fn append_newest(&mut self, summary: ChapterSummary) -> bool {
        self.running_total += summary.token_estimate;
        self.summaries.push_back(summary);
        self.evict_to_budget() > 0
    }

    /// Drop summaries from the oldest end until within budget, keeping at
    /// least one.
    fn evict_to_budget(&mut self) -> usize {
        let mut evicted = 0;
        while self.running_total > self.budget && self.summaries.len() > 1 {
            let Some(oldest) = self.summaries.pop_front() else {
                break;
            };
            self.running_total -= oldest.token_estimate;
            evicted += 1;
            debug!(
                chapter = oldest.chapter,
                tokens = oldest.token_estimate,
                running_total = self.running_total,
                budget = self.budget,
                "evicted chapter summary from context window"
            );
        }
        evicted
    }
}

//! Knowledge-base configuration, loaded from TOML.
//!
//! Every section is optional; missing keys fall back to their defaults.
//!
//! ```toml
//! [context]
//! token_budget = 6000
//!
//! [resolver]
//! top_k = 8
//! min_significance = "major"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::entities::Significance;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for the token-budgeted context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum tokens of prior-chapter summaries fed into a prompt.
    pub token_budget: usize,

    /// Characters per token used by the default estimator.
    pub chars_per_token: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: 8000,
            chars_per_token: 4,
        }
    }
}

/// Settings for candidate retrieval during entity resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Hits kept per candidate search.
    pub top_k: usize,

    /// Minimum similarity score (0.0-1.0) for a hit to count as evidence.
    pub relevance_threshold: f32,

    /// Candidates below this significance are not tracked.
    pub min_significance: Significance,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            relevance_threshold: 0.35,
            min_significance: Significance::Relevant,
        }
    }
}

/// Settings for the versioned article store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArticleConfig {
    /// Maximum characters in a generated preview.
    pub preview_chars: usize,
}

impl Default for ArticleConfig {
    fn default() -> Self {
        Self { preview_chars: 160 }
    }
}

/// Top-level knowledge-base configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub context: ContextConfig,
    pub resolver: ResolverConfig,
    pub articles: ArticleConfig,
}

impl KnowledgeConfig {
    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: KnowledgeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Reject values the stores cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.token_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "context.token_budget",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.context.chars_per_token == 0 {
            return Err(ConfigError::Invalid {
                field: "context.chars_per_token",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.resolver.top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "resolver.top_k",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.resolver.relevance_threshold) {
            return Err(ConfigError::Invalid {
                field: "resolver.relevance_threshold",
                reason: format!("{} is outside 0.0..=1.0", self.resolver.relevance_threshold),
            });
        }
        Ok(())
    }
}

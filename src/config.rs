//! Workflow configuration.
//!
//! This module provides the configuration surface for the workflow
//! orchestrator: per-phase concurrency ceilings, per-item timeouts, retry
//! limits, the clarification gate timeout, the validation pass threshold,
//! and event-channel tuning.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::types::Phase;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the workflow orchestrator.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    // Concurrency settings
    /// Per-phase concurrency ceilings. Phases without an entry fall back to
    /// `default_max_concurrent`.
    pub max_concurrent_per_phase: HashMap<Phase, usize>,
    /// Concurrency ceiling for phases without an explicit entry.
    pub default_max_concurrent: usize,

    // Worker pool settings
    /// Timeout for a single handler attempt on one item.
    pub per_item_timeout: Duration,
    /// Maximum attempts per item before it is marked errored.
    pub max_attempts: u32,

    // Clarification settings
    /// How long the clarification gate waits for a human answer before
    /// resolving a question with the default manual-review answer.
    pub clarification_timeout: Duration,

    // Scoring settings
    /// Minimum score for an item to pass validation and QA review.
    pub pass_threshold: f64,
    /// Number of neighbors requested from the knowledge-graph search.
    pub search_top_k: usize,

    // Event channel settings
    /// Number of events retained for replay to late subscribers.
    pub replay_capacity: usize,
    /// Grace period after a terminal state before an idle event channel
    /// is torn down.
    pub channel_grace: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let mut max_concurrent_per_phase = HashMap::new();
        // Mining and graph indexing are I/O-light; the LLM-bound phases
        // get a smaller ceiling.
        max_concurrent_per_phase.insert(Phase::Mining, 8);
        max_concurrent_per_phase.insert(Phase::KgBuild, 8);
        max_concurrent_per_phase.insert(Phase::Validating, 4);
        max_concurrent_per_phase.insert(Phase::Rewriting, 4);
        max_concurrent_per_phase.insert(Phase::QaReview, 4);

        Self {
            max_concurrent_per_phase,
            default_max_concurrent: 4,
            per_item_timeout: Duration::from_secs(120),
            max_attempts: 3,
            clarification_timeout: Duration::from_secs(300),
            pass_threshold: 0.7,
            search_top_k: 5,
            replay_capacity: 256,
            channel_grace: Duration::from_secs(30),
        }
    }
}

impl WorkflowConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REQFORGE_MAX_CONCURRENT`: default concurrency ceiling (default: 4)
    /// - `REQFORGE_MINING_CONCURRENCY`: mining phase ceiling (default: 8)
    /// - `REQFORGE_KG_BUILD_CONCURRENCY`: graph build ceiling (default: 8)
    /// - `REQFORGE_VALIDATING_CONCURRENCY`: validation ceiling (default: 4)
    /// - `REQFORGE_REWRITING_CONCURRENCY`: rewrite ceiling (default: 4)
    /// - `REQFORGE_QA_REVIEW_CONCURRENCY`: QA review ceiling (default: 4)
    /// - `REQFORGE_ITEM_TIMEOUT_SECS`: per-item attempt timeout (default: 120)
    /// - `REQFORGE_MAX_ATTEMPTS`: attempts per item (default: 3)
    /// - `REQFORGE_CLARIFICATION_TIMEOUT_SECS`: gate timeout (default: 300)
    /// - `REQFORGE_PASS_THRESHOLD`: validation pass threshold (default: 0.7)
    /// - `REQFORGE_SEARCH_TOP_K`: graph search fan-out (default: 5)
    /// - `REQFORGE_REPLAY_CAPACITY`: event replay buffer size (default: 256)
    /// - `REQFORGE_CHANNEL_GRACE_SECS`: channel teardown grace (default: 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REQFORGE_MAX_CONCURRENT") {
            config.default_max_concurrent = parse_env_value(&val, "REQFORGE_MAX_CONCURRENT")?;
        }

        let phase_vars = [
            (Phase::Mining, "REQFORGE_MINING_CONCURRENCY"),
            (Phase::KgBuild, "REQFORGE_KG_BUILD_CONCURRENCY"),
            (Phase::Validating, "REQFORGE_VALIDATING_CONCURRENCY"),
            (Phase::Rewriting, "REQFORGE_REWRITING_CONCURRENCY"),
            (Phase::QaReview, "REQFORGE_QA_REVIEW_CONCURRENCY"),
        ];
        for (phase, key) in phase_vars {
            if let Ok(val) = std::env::var(key) {
                config
                    .max_concurrent_per_phase
                    .insert(phase, parse_env_value(&val, key)?);
            }
        }

        if let Ok(val) = std::env::var("REQFORGE_ITEM_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "REQFORGE_ITEM_TIMEOUT_SECS")?;
            config.per_item_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("REQFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "REQFORGE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("REQFORGE_CLARIFICATION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "REQFORGE_CLARIFICATION_TIMEOUT_SECS")?;
            config.clarification_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("REQFORGE_PASS_THRESHOLD") {
            config.pass_threshold = parse_env_value(&val, "REQFORGE_PASS_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("REQFORGE_SEARCH_TOP_K") {
            config.search_top_k = parse_env_value(&val, "REQFORGE_SEARCH_TOP_K")?;
        }

        if let Ok(val) = std::env::var("REQFORGE_REPLAY_CAPACITY") {
            config.replay_capacity = parse_env_value(&val, "REQFORGE_REPLAY_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("REQFORGE_CHANNEL_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "REQFORGE_CHANNEL_GRACE_SECS")?;
            config.channel_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Returns the concurrency ceiling for a phase.
    pub fn max_concurrent_for(&self, phase: Phase) -> usize {
        self.max_concurrent_per_phase
            .get(&phase)
            .copied()
            .unwrap_or(self.default_max_concurrent)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_concurrent == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_max_concurrent must be greater than 0".to_string(),
            ));
        }

        for (phase, ceiling) in &self.max_concurrent_per_phase {
            if *ceiling == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "concurrency ceiling for phase '{}' must be greater than 0",
                    phase
                )));
            }
        }

        if self.per_item_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "per_item_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.clarification_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "clarification_timeout must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(ConfigError::ValidationFailed(
                "pass_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.search_top_k == 0 {
            return Err(ConfigError::ValidationFailed(
                "search_top_k must be greater than 0".to_string(),
            ));
        }

        if self.replay_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "replay_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the ceiling for one phase.
    pub fn with_phase_concurrency(mut self, phase: Phase, ceiling: usize) -> Self {
        self.max_concurrent_per_phase.insert(phase, ceiling);
        self
    }

    /// Builder method to set the default concurrency ceiling.
    pub fn with_default_max_concurrent(mut self, ceiling: usize) -> Self {
        self.default_max_concurrent = ceiling;
        self
    }

    /// Builder method to set the per-item attempt timeout.
    pub fn with_per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = timeout;
        self
    }

    /// Builder method to set the maximum attempts per item.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder method to set the clarification timeout.
    pub fn with_clarification_timeout(mut self, timeout: Duration) -> Self {
        self.clarification_timeout = timeout;
        self
    }

    /// Builder method to set the pass threshold.
    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    /// Builder method to set the graph search fan-out.
    pub fn with_search_top_k(mut self, top_k: usize) -> Self {
        self.search_top_k = top_k;
        self
    }

    /// Builder method to set the event replay buffer size.
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Builder method to set the channel teardown grace period.
    pub fn with_channel_grace(mut self, grace: Duration) -> Self {
        self.channel_grace = grace;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

//! Explicit configuration for the analysis pipeline.
//!
//! All tunables are passed into constructors as owned structs; the pipeline
//! never reads process environment or global state.

use std::time::Duration;

use serde::Deserialize;

use crate::errors::{QuorumError, QuorumResult};

// Hard bounds the configuration is clamped against.
pub const MAX_SCAN_WORKERS: usize = 64;
pub const MAX_CONFIRM_WORKERS: usize = 64;
pub const MAX_SCAN_ITERATIONS: u32 = 64;
pub const MAX_CONFIRM_ROUNDS: u32 = 16;
pub const MAX_REQUESTS_PER_ROUND: u32 = 16;
pub const MIN_CONTEXT_BYTE_BUDGET: usize = 256;
pub const MAX_CONTEXT_BYTE_BUDGET: usize = 1_048_576;
pub const MAX_EMBEDDING_NEIGHBORS: usize = 32;
pub const MAX_FLOW_DEPTH: usize = 8;

/// Shared retry/backoff parameters for every external call site.
#[derive(Clone, Debug, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Per-call deadline enforced by service implementations.
    #[serde(with = "duration_ms", default = "default_call_timeout")]
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: default_base_delay(),
            call_timeout: default_call_timeout(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Scan-phase (hypothesis generation) settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ScanConfig {
    pub workers: usize,
    /// Deliberate repetition count per (bundle, rule key) pair.
    pub iterations: u32,
    /// Rationale-similarity threshold used when clustering hypotheses.
    pub similarity_threshold: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            iterations: 5,
            similarity_threshold: 0.6,
        }
    }
}

/// Confirm-phase (voting) settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfirmConfig {
    pub workers: usize,
    pub rounds: u32,
    pub requests_per_round: u32,
    /// Fraction of collected votes (abstentions included in the
    /// denominator) that must agree, in either direction, for early exit.
    pub decision_ratio: f64,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            rounds: 2,
            requests_per_round: 3,
            decision_ratio: 2.0 / 3.0,
        }
    }
}

/// Context-bundle assembly settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ContextConfig {
    /// Serialized-bundle budget in bytes.
    pub byte_budget: usize,
    /// Top-k embedding neighbors requested per flow member.
    pub embedding_neighbors: usize,
    /// Flow members shorter than this contribute no semantic neighbors.
    pub min_embed_len: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            byte_budget: 24_000,
            embedding_neighbors: 3,
            min_embed_len: 40,
        }
    }
}

/// Business-flow derivation settings.
#[derive(Clone, Debug, Deserialize)]
pub struct FlowConfig {
    /// Callee-expansion depth from each entry point.
    pub max_depth: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self { max_depth: 2 }
    }
}

/// Full pipeline configuration handed to the engine constructor.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub confirm: ConfirmConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub flows: FlowConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl AnalysisConfig {
    /// Validate and clamp every field against the hard bounds.
    pub fn validated(mut self) -> QuorumResult<Self> {
        if self.scan.workers == 0 || self.confirm.workers == 0 {
            return Err(QuorumError::Config("worker counts must be non-zero".into()));
        }
        if self.scan.iterations == 0 {
            return Err(QuorumError::Config("scan iterations must be non-zero".into()));
        }
        if self.confirm.rounds == 0 || self.confirm.requests_per_round == 0 {
            return Err(QuorumError::Config(
                "confirm rounds and requests must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confirm.decision_ratio)
            || !(0.0..=1.0).contains(&self.scan.similarity_threshold)
        {
            return Err(QuorumError::Config(
                "thresholds must fall within [0, 1]".into(),
            ));
        }
        self.scan.workers = self.scan.workers.min(MAX_SCAN_WORKERS);
        self.confirm.workers = self.confirm.workers.min(MAX_CONFIRM_WORKERS);
        self.scan.iterations = self.scan.iterations.min(MAX_SCAN_ITERATIONS);
        self.confirm.rounds = self.confirm.rounds.min(MAX_CONFIRM_ROUNDS);
        self.confirm.requests_per_round =
            self.confirm.requests_per_round.min(MAX_REQUESTS_PER_ROUND);
        self.context.byte_budget = self
            .context
            .byte_budget
            .clamp(MIN_CONTEXT_BYTE_BUDGET, MAX_CONTEXT_BYTE_BUDGET);
        self.context.embedding_neighbors =
            self.context.embedding_neighbors.min(MAX_EMBEDDING_NEIGHBORS);
        self.flows.max_depth = self.flows.max_depth.min(MAX_FLOW_DEPTH);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AnalysisConfig::default().validated().unwrap();
        assert_eq!(config.scan.iterations, 5);
        assert_eq!(config.confirm.rounds, 2);
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = AnalysisConfig::default();
        config.scan.workers = 0;
        assert!(config.validated().is_err());
    }

    #[test]
    fn out_of_range_ratio_rejected() {
        let mut config = AnalysisConfig::default();
        config.confirm.decision_ratio = 1.5;
        assert!(config.validated().is_err());
    }

    #[test]
    fn oversized_values_clamped() {
        let mut config = AnalysisConfig::default();
        config.scan.workers = 10_000;
        config.context.byte_budget = 10;
        let config = config.validated().unwrap();
        assert_eq!(config.scan.workers, MAX_SCAN_WORKERS);
        assert_eq!(config.context.byte_budget, MIN_CONTEXT_BYTE_BUDGET);
    }
}

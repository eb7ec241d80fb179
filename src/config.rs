//! Configuration surface for the orchestrator
//!
//! Everything here is plain serde data. Where configuration comes from (files, env, a registry)
//! is the caller's business; these types only describe and validate it. Durations travel as
//! milliseconds and are exposed as [`Duration`] accessors.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::provider::TokenUsage;

/// Per-provider retry/backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total calls allowed against one provider (first call included)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_backoff_ms: u64,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Uniform jitter applied as +/- this many milliseconds
    pub jitter_ms: u64,

    /// Upper bound for any computed backoff
    pub max_backoff_ms: u64,

    /// Upper bound for honoring a rate-limit retry-after hint
    pub rate_limit_max_wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            backoff_multiplier: 2.0,
            jitter_ms: 50,
            max_backoff_ms: 10_000,
            rate_limit_max_wait_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Retries with a fixed delay and no jitter. Mostly useful in tests.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_backoff_ms: ms,
            backoff_multiplier: 1.0,
            jitter_ms: 0,
            max_backoff_ms: ms,
            rate_limit_max_wait_ms: ms.max(1),
        }
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn rate_limit_max_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_max_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(OrchestratorError::invalid_config(
                "retry policy max_attempts must be at least 1",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(OrchestratorError::invalid_config(format!(
                "retry policy backoff_multiplier must be finite and >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// One entry of a configured fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Marks an intentional second appearance of the same provider id.
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}

/// Shadow execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Provider id of the shadow target
    pub provider: Option<String>,
    /// How long an unfinished shadow call may keep running after the primary returned
    pub grace_period_ms: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            grace_period_ms: 5_000,
        }
    }
}

impl ShadowConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// How ties between top vote groups are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusStrategy {
    Majority,
    ScoreWeighted,
    LowestLatency,
}

impl ConsensusStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            ConsensusStrategy::Majority => "majority",
            ConsensusStrategy::ScoreWeighted => "score-weighted",
            ConsensusStrategy::LowestLatency => "lowest-latency",
        }
    }
}

/// Price per 1k tokens, used to charge completed candidates against a cost ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            prompt_per_1k: 1.0,
            completion_per_1k: 1.0,
        }
    }
}

impl TokenPricing {
    /// Cost of one response; unmeasured counts are free.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let prompt = usage.prompt_tokens.unwrap_or(0) as f64;
        let completion = usage.completion_tokens.unwrap_or(0) as f64;
        (prompt * self.prompt_per_1k + completion * self.completion_per_1k) / 1000.0
    }
}

/// Voting and budget settings for parallel aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub strategy: ConsensusStrategy,

    /// Seed for the final, slot-based tie-break
    pub seed: u64,

    /// Maximum accrued cost before the controller stops waiting
    pub cost_ceiling: Option<f64>,

    pub pricing: TokenPricing,

    /// Minimum number of terminal candidates before a vote may be taken
    pub min_quorum: usize,

    /// Quality score per candidate slot, used by `score-weighted`
    pub quality_scores: Vec<f64>,

    /// Decide as soon as quorum is met instead of waiting for every candidate
    pub early_decision: bool,

    /// Bound on the wait for quorum
    pub max_wait_ms: Option<u64>,

    /// How long cancelled stragglers may run before they are aborted
    pub straggler_grace_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            strategy: ConsensusStrategy::Majority,
            seed: 0,
            cost_ceiling: None,
            pricing: TokenPricing::default(),
            min_quorum: 1,
            quality_scores: Vec::new(),
            early_decision: false,
            max_wait_ms: None,
            straggler_grace_ms: 1_000,
        }
    }
}

impl ConsensusConfig {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    pub fn straggler_grace(&self) -> Duration {
        Duration::from_millis(self.straggler_grace_ms)
    }

    /// Quality score for a slot; unconfigured slots score zero.
    pub fn quality_score(&self, slot: usize) -> f64 {
        self.quality_scores.get(slot).copied().unwrap_or(0.0)
    }

    pub fn validate(&self, candidates: usize) -> Result<()> {
        if candidates == 0 {
            return Err(OrchestratorError::invalid_config(
                "parallel aggregation needs at least one candidate",
            ));
        }
        if self.min_quorum == 0 || self.min_quorum > candidates {
            return Err(OrchestratorError::invalid_config(format!(
                "min_quorum must be within 1..={}, got {}",
                candidates, self.min_quorum
            )));
        }
        if let Some(ceiling) = self.cost_ceiling {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(OrchestratorError::invalid_config(format!(
                    "cost_ceiling must be a non-negative finite number, got {}",
                    ceiling
                )));
            }
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fallback chain, tried in order
    pub providers: Vec<ProviderEntry>,
    pub shadow: ShadowConfig,
    pub consensus: ConsensusConfig,
    /// JSON-lines metrics log
    pub metrics_path: Option<String>,
}

impl OrchestratorConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        validate_chain(self.providers.iter().map(|p| (p.id.as_str(), p.repeat)))?;
        for p in &self.providers {
            p.retry.validate()?;
        }
        if self.shadow.enabled && self.shadow.provider.is_none() {
            return Err(OrchestratorError::invalid_config(
                "shadow execution enabled without a shadow provider",
            ));
        }
        Ok(())
    }
}

/// Reject empty chains and unintended duplicate provider ids.
pub(crate) fn validate_chain<'a>(entries: impl IntoIterator<Item = (&'a str, bool)>) -> Result<()> {
    let mut seen = HashSet::new();
    let mut any = false;
    for (id, repeat) in entries {
        any = true;
        if !seen.insert(id) && !repeat {
            return Err(OrchestratorError::DuplicateProvider {
                provider: id.to_string(),
            });
        }
    }
    if !any {
        return Err(OrchestratorError::EmptyFallbackChain);
    }
    Ok(())
}

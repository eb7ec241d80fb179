//! Attempt executor: retry, backoff and fallback across an ordered provider chain
//!
//! What this module provides
//! - One logical request driven through a fallback chain, producing exactly one [`RunOutcome`]
//!   plus the append-only list of [`AttemptRecord`]s that led to it
//!
//! Per provider the executor walks `Pending -> Calling -> {Success | Retrying -> Calling | Exhausted}`:
//! - `Timeout` / `Retriable`: back off `base * multiplier^retry +/- jitter` and call the same
//!   provider again until `max_attempts` calls were made, then fall through to the next provider
//! - `RateLimit`: wait for the retry-after hint (clamped to the policy's max wait), counted as a retry
//! - `ProviderSkip`: advance immediately, no retry slot consumed, no backoff
//! - `Fatal`: advance immediately, skipping the provider's remaining retries
//! - success stops the run; later providers are never invoked
//!
//! Attempts are strictly sequential. Backoff waits are suspension points that also listen to the
//! run's cancellation token, so a cancelled run stops before its next call.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{validate_chain, RetryPolicy};
use crate::error::{classify, ErrorKind, OrchestratorError, Result};
use crate::metrics::{self, duration_ms, MetricsRecord, MetricsSvc, RecordKind, RunStatus};
use crate::provider::{ProviderRequest, ProviderResponse, ProviderSlot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed { error: ErrorKind },
}

/// One provider call. Never mutated after it is pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider_id: String,
    pub model_id: String,
    /// Position of the provider in the fallback chain
    pub stage: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: AttemptStatus,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// Retries already spent on this provider when the call was made
    pub retry_count: u32,
}

impl AttemptRecord {
    pub fn error(&self) -> Option<&ErrorKind> {
        match &self.status {
            AttemptStatus::Failed { error } => Some(error),
            AttemptStatus::Success => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, AttemptStatus::Success)
    }
}

/// Final result of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        response: ProviderResponse,
        winning: AttemptRecord,
        attempts: Vec<AttemptRecord>,
        #[serde(with = "duration_ms")]
        elapsed: Duration,
    },
    /// Every provider was exhausted; `terminal` is the last attempted provider's failure.
    Exhausted {
        attempts: Vec<AttemptRecord>,
        terminal: ErrorKind,
        #[serde(with = "duration_ms")]
        elapsed: Duration,
    },
    /// The run's cancellation token fired before a terminal state was reached.
    Cancelled {
        attempts: Vec<AttemptRecord>,
        #[serde(with = "duration_ms")]
        elapsed: Duration,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn response(&self) -> Option<&ProviderResponse> {
        match self {
            RunOutcome::Success { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn winning(&self) -> Option<&AttemptRecord> {
        match self {
            RunOutcome::Success { winning, .. } => Some(winning),
            _ => None,
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            RunOutcome::Success { attempts, .. }
            | RunOutcome::Exhausted { attempts, .. }
            | RunOutcome::Cancelled { attempts, .. } => attempts,
        }
    }

    /// Failure kind for an exhausted run, `None` otherwise.
    pub fn terminal_error(&self) -> Option<&ErrorKind> {
        match self {
            RunOutcome::Exhausted { terminal, .. } => Some(terminal),
            _ => None,
        }
    }

    /// Number of distinct fallback-chain entries that were tried.
    pub fn fallback_stages(&self) -> usize {
        let mut stages: Vec<usize> = self.attempts().iter().map(|a| a.stage).collect();
        stages.dedup();
        stages.len()
    }

    /// Retries recorded against one provider id.
    pub fn retries_for(&self, provider_id: &str) -> u32 {
        self.attempts()
            .iter()
            .filter(|a| a.provider_id == provider_id)
            .map(|a| a.retry_count)
            .max()
            .unwrap_or(0)
    }

    /// End-to-end run time on the tokio clock, including backoff waits and every fallback stage.
    pub fn elapsed(&self) -> Duration {
        match self {
            RunOutcome::Success { elapsed, .. }
            | RunOutcome::Exhausted { elapsed, .. }
            | RunOutcome::Cancelled { elapsed, .. } => *elapsed,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success { .. } => RunStatus::Success,
            RunOutcome::Exhausted { .. } => RunStatus::Failure,
            RunOutcome::Cancelled { .. } => RunStatus::Cancelled,
        }
    }

    /// Build the `run` metrics record for this outcome.
    pub fn to_metrics(&self, run_id: &str, slot: Option<usize>) -> MetricsRecord {
        let mut rec = MetricsRecord::new(run_id, RecordKind::Run, self.status());
        rec.slot = slot;
        rec.fallback_stages = self.fallback_stages();
        rec.attempts = self.attempts().len();
        rec.latency_ms = metrics::millis(self.elapsed());
        let last = self.winning().or_else(|| self.attempts().last());
        if let Some(last) = last {
            rec.provider_id = Some(last.provider_id.clone());
            rec.model_id = Some(last.model_id.clone());
        }
        if let Some(resp) = self.response() {
            rec.model_id = Some(resp.model.clone());
            rec.prompt_tokens = resp.usage.prompt_tokens;
            rec.completion_tokens = resp.usage.completion_tokens;
        }
        rec.failure_kind = self.terminal_error().cloned();
        rec
    }
}

/// Per-run identity and cancellation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub slot: Option<usize>,
    pub cancel: CancellationToken,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_run_id(Uuid::new_v4().to_string())
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            slot: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Backoff before retry number `retry + 1`, without jitter, clamped to `max_backoff`.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let factor = policy.backoff_multiplier.powi(retry as i32);
    let ms = (policy.base_backoff_ms as f64 * factor).min(policy.max_backoff_ms as f64);
    Duration::from_millis(ms.max(0.0) as u64)
}

/// Apply `+/- jitter_ms` uniformly; never negative.
fn with_jitter(policy: &RetryPolicy, delay: Duration) -> Duration {
    if policy.jitter_ms == 0 {
        return delay;
    }
    let j = i64::try_from(policy.jitter_ms).unwrap_or(i64::MAX);
    let offset = rand::thread_rng().gen_range(-j..=j);
    let base = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let ms = base.saturating_add(offset).max(0);
    Duration::from_millis(ms as u64)
}

/// Delay before the next call to the same provider after a transient failure.
fn retry_delay(policy: &RetryPolicy, kind: &ErrorKind, retry: u32) -> Duration {
    match kind {
        ErrorKind::RateLimit {
            retry_after_ms: Some(ms),
        } => Duration::from_millis(*ms).min(policy.rate_limit_max_wait()),
        ErrorKind::RateLimit {
            retry_after_ms: None,
        } => with_jitter(policy, backoff_delay(policy, retry)).min(policy.rate_limit_max_wait()),
        _ => with_jitter(policy, backoff_delay(policy, retry)),
    }
}

/// Drives one request through an ordered fallback chain.
#[derive(Clone)]
pub struct AttemptExecutor {
    chain: Vec<ProviderSlot>,
    recorder: Option<MetricsSvc>,
}

impl std::fmt::Debug for AttemptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptExecutor")
            .field("chain", &self.chain)
            .field("recording", &self.recorder.is_some())
            .finish()
    }
}

impl AttemptExecutor {
    /// Validate the chain up front: it must be non-empty, retry policies must be sane and a
    /// provider may only reappear when the later entry is marked as a repeat.
    pub fn new(chain: Vec<ProviderSlot>) -> Result<Self> {
        validate_chain(chain.iter().map(|s| (s.id.as_str(), s.repeat)))?;
        for slot in &chain {
            slot.retry.validate().map_err(|e| {
                OrchestratorError::invalid_config(format!("provider '{}': {}", slot.id, e))
            })?;
        }
        Ok(Self {
            chain,
            recorder: None,
        })
    }

    pub fn with_recorder(mut self, recorder: MetricsSvc) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn chain(&self) -> &[ProviderSlot] {
        &self.chain
    }

    /// Run with a fresh run id and no external cancellation.
    pub async fn run(&self, req: ProviderRequest) -> RunOutcome {
        self.run_in(req, RunContext::new()).await
    }

    /// Run under the given context, then emit a `run` metrics record.
    pub async fn run_in(&self, req: ProviderRequest, ctx: RunContext) -> RunOutcome {
        let span = info_span!(
            "orchestrator.run",
            run_id = %ctx.run_id,
            model = %req.model,
            slot = ?ctx.slot,
        );
        async move {
            let outcome = self.drive(&req, &ctx).await;
            match &outcome {
                RunOutcome::Success { winning, .. } => info!(
                    provider = %winning.provider_id,
                    attempts = outcome.attempts().len(),
                    "run succeeded"
                ),
                RunOutcome::Exhausted { terminal, .. } => warn!(
                    terminal = %terminal,
                    attempts = outcome.attempts().len(),
                    "fallback chain exhausted"
                ),
                RunOutcome::Cancelled { .. } => debug!(
                    attempts = outcome.attempts().len(),
                    "run cancelled"
                ),
            }
            metrics::emit(
                self.recorder.as_ref(),
                outcome.to_metrics(&ctx.run_id, ctx.slot),
            )
            .await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, req: &ProviderRequest, ctx: &RunContext) -> RunOutcome {
        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        'chain: for (stage, slot) in self.chain.iter().enumerate() {
            if !slot.enabled {
                debug!(provider = %slot.id, "provider disabled; skipping");
                let now = Utc::now();
                attempts.push(AttemptRecord {
                    provider_id: slot.id.clone(),
                    model_id: req.model.clone(),
                    stage,
                    started_at: now,
                    finished_at: now,
                    status: AttemptStatus::Failed {
                        error: ErrorKind::ProviderSkip,
                    },
                    latency: Duration::ZERO,
                    retry_count: 0,
                });
                continue 'chain;
            }

            let policy = &slot.retry;
            let mut svc = slot.service.clone();
            let mut calls: u32 = 0;
            let mut retries: u32 = 0;

            loop {
                if ctx.cancel.is_cancelled() {
                    return RunOutcome::Cancelled {
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }

                debug!(provider = %slot.id, stage, retry = retries, "calling provider");
                let started_at = Utc::now();
                let t0 = Instant::now();
                let result = match ServiceExt::ready(&mut svc).await {
                    Ok(ready) => ready.call(req.clone()).await,
                    Err(e) => Err(e),
                };
                let latency = t0.elapsed();
                let finished_at = Utc::now();

                let kind = match result {
                    Ok(response) => {
                        let winning = AttemptRecord {
                            provider_id: slot.id.clone(),
                            model_id: response.model.clone(),
                            stage,
                            started_at,
                            finished_at,
                            status: AttemptStatus::Success,
                            latency,
                            retry_count: retries,
                        };
                        attempts.push(winning.clone());
                        return RunOutcome::Success {
                            response,
                            winning,
                            attempts,
                            elapsed: started.elapsed(),
                        };
                    }
                    Err(e) => {
                        let kind = classify(&e);
                        debug!(provider = %slot.id, error = %e, kind = %kind, "provider call failed");
                        kind
                    }
                };

                attempts.push(AttemptRecord {
                    provider_id: slot.id.clone(),
                    model_id: req.model.clone(),
                    stage,
                    started_at,
                    finished_at,
                    status: AttemptStatus::Failed {
                        error: kind.clone(),
                    },
                    latency,
                    retry_count: retries,
                });

                match kind {
                    ErrorKind::ProviderSkip => {
                        debug!(provider = %slot.id, "provider declined; advancing");
                        continue 'chain;
                    }
                    ErrorKind::Fatal => {
                        warn!(provider = %slot.id, "fatal provider error; advancing fallback chain");
                        continue 'chain;
                    }
                    ErrorKind::Timeout | ErrorKind::Retriable | ErrorKind::RateLimit { .. } => {
                        calls += 1;
                        if calls >= policy.max_attempts {
                            warn!(provider = %slot.id, calls, "provider exhausted");
                            continue 'chain;
                        }
                        let delay = retry_delay(policy, &kind, retries);
                        retries += 1;
                        warn!(
                            provider = %slot.id,
                            kind = %kind,
                            retry = retries,
                            delay_ms = metrics::millis(delay),
                            "transient failure; retrying"
                        );
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => {
                                return RunOutcome::Cancelled {
                                    attempts,
                                    elapsed: started.elapsed(),
                                };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        // The chain is never empty, so at least one attempt exists here.
        let terminal = attempts
            .last()
            .and_then(|a| a.error().cloned())
            .unwrap_or(ErrorKind::Fatal);
        RunOutcome::Exhausted {
            attempts,
            terminal,
            elapsed: started.elapsed(),
        }
    }
}

impl Service<ProviderRequest> for AttemptExecutor {
    type Response = RunOutcome;
    type Error = OrchestratorError;
    type Future = Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ProviderRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.run(req).await) })
    }
}

//! Shadow execution: a side-channel comparison call that never touches the primary path
//!
//! What this module provides
//! - `ShadowRunner` wrapping a primary `AttemptExecutor` and a shadow provider
//! - `ShadowComparison` capturing how the shadow fared against the primary
//! - `SimilarityScorer`, a pluggable text similarity metric (`NormalizedLevenshtein`, `TokenJaccard`)
//!
//! Implementation strategy
//! - The shadow call is spawned as its own task with its own cancellation token, started
//!   alongside the primary run on the caller's task
//! - The primary `RunOutcome` is returned exactly as the executor produced it
//! - When the primary finishes first, the runner does not wait: a finisher task joins the shadow
//!   with a bounded grace period, aborts it past that, and records the comparison to metrics
//! - Shadow failures and timeouts only ever show up in the comparison and the metrics log
//!
//! Testing strategy
//! - Shadow ON/OFF with identical provider scripts must yield identical primary responses
//! - A slow shadow must not delay the caller; its record appears once it completes or times out

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::ShadowConfig;
use crate::consensus::normalize;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::executor::{AttemptExecutor, RunContext, RunOutcome};
use crate::metrics::{self, MetricsRecord, MetricsSvc, RecordKind, ShadowFields};
use crate::provider::{ProviderRequest, ProviderSlot};

/// Text similarity in `[0, 1]`, 1 meaning identical.
pub trait SimilarityScorer: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn score(&self, primary: &str, shadow: &str) -> f64;
}

/// `1 - levenshtein(a, b) / max(len(a), len(b))` over chars.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedLevenshtein;

impl SimilarityScorer for NormalizedLevenshtein {
    fn name(&self) -> &'static str {
        "normalized_levenshtein"
    }

    fn score(&self, primary: &str, shadow: &str) -> f64 {
        let a: Vec<char> = primary.chars().collect();
        let b: Vec<char> = shadow.chars().collect();
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 1.0;
        }
        1.0 - levenshtein(&a, &b) as f64 / longest as f64
    }
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let subst = prev[j] + usize::from(ca != cb);
            cur[j + 1] = subst.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Jaccard index of the normalized word sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenJaccard;

impl SimilarityScorer for TokenJaccard {
    fn name(&self) -> &'static str {
        "token_jaccard"
    }

    fn score(&self, primary: &str, shadow: &str) -> f64 {
        let pa = normalize(primary);
        let pb = normalize(shadow);
        let a: std::collections::BTreeSet<&str> = pa.split(' ').filter(|t| !t.is_empty()).collect();
        let b: std::collections::BTreeSet<&str> = pb.split(' ').filter(|t| !t.is_empty()).collect();
        let union = a.union(&b).count();
        if union == 0 {
            return 1.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShadowStatus {
    /// Still running when the primary returned
    Pending,
    Success,
    Failed { error: ErrorKind },
    /// Did not finish within the grace period and was aborted
    TimedOut,
}

impl ShadowStatus {
    fn label(&self) -> &'static str {
        match self {
            ShadowStatus::Pending => "pending",
            ShadowStatus::Success => "success",
            ShadowStatus::Failed { .. } => "failure",
            ShadowStatus::TimedOut => "timed_out",
        }
    }

    /// Failure kind as written to metrics; an aborted shadow counts as a timeout.
    fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            ShadowStatus::Failed { error } => Some(error.clone()),
            ShadowStatus::TimedOut => Some(ErrorKind::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowComparison {
    pub run_id: String,
    pub primary_provider: Option<String>,
    pub primary_succeeded: bool,
    pub shadow_provider: String,
    pub status: ShadowStatus,
    /// `None` unless both sides produced text
    pub diff_score: Option<f64>,
    #[serde(default, with = "opt_duration_ms")]
    pub shadow_latency: Option<Duration>,
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(crate::metrics::millis).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl ShadowComparison {
    fn pending(run_id: &str, primary: &RunOutcome, shadow_provider: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            primary_provider: primary.winning().map(|w| w.provider_id.clone()),
            primary_succeeded: primary.is_success(),
            shadow_provider: shadow_provider.to_string(),
            status: ShadowStatus::Pending,
            diff_score: None,
            shadow_latency: None,
        }
    }

    fn complete(
        mut self,
        primary: &RunOutcome,
        (shadow, latency): &(RunOutcome, Duration),
        scorer: &dyn SimilarityScorer,
    ) -> Self {
        self.status = match shadow {
            RunOutcome::Success { .. } => ShadowStatus::Success,
            RunOutcome::Exhausted { terminal, .. } => ShadowStatus::Failed {
                error: terminal.clone(),
            },
            RunOutcome::Cancelled { .. } => ShadowStatus::TimedOut,
        };
        self.diff_score = match (primary.response(), shadow.response()) {
            (Some(p), Some(s)) => Some(scorer.score(&p.text, &s.text)),
            _ => None,
        };
        self.shadow_latency = Some(*latency);
        self
    }

    fn to_metrics(&self, primary: &MetricsRecord) -> MetricsRecord {
        let mut rec = primary.clone();
        rec.record_kind = RecordKind::Shadow;
        rec.timestamp = chrono::Utc::now();
        rec.shadow = Some(ShadowFields {
            provider_id: self.shadow_provider.clone(),
            status: self.status.label().to_string(),
            failure_kind: self.status.failure_kind(),
            latency_ms: self.shadow_latency.map(metrics::millis),
            diff_score: self.diff_score,
        });
        rec
    }
}

/// Resolves to the final comparison once the shadow completed or its grace period ran out.
pub struct ShadowHandle {
    inner: Option<JoinHandle<ShadowComparison>>,
    ready: Option<ShadowComparison>,
}

impl fmt::Debug for ShadowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowHandle")
            .field("ready", &self.ready.is_some())
            .field("in_flight", &self.inner.is_some())
            .finish()
    }
}

impl ShadowHandle {
    fn none() -> Self {
        Self {
            inner: None,
            ready: None,
        }
    }

    /// `None` when shadow execution was off.
    pub async fn finished(self) -> Option<ShadowComparison> {
        if let Some(c) = self.ready {
            return Some(c);
        }
        match self.inner {
            Some(h) => h.await.ok(),
            None => None,
        }
    }
}

/// Result of one shadowed call.
#[derive(Debug)]
pub struct ShadowExecution {
    /// Exactly what the primary executor returned
    pub primary: RunOutcome,
    /// Comparison as known when the primary returned; `None` when shadowing is off
    pub comparison: Option<ShadowComparison>,
    pub handle: ShadowHandle,
}

#[derive(Clone)]
struct ShadowTarget {
    id: String,
    executor: AttemptExecutor,
}

#[derive(Clone)]
pub struct ShadowRunner {
    primary: AttemptExecutor,
    shadow: Option<ShadowTarget>,
    scorer: Arc<dyn SimilarityScorer>,
    grace: Duration,
    recorder: Option<MetricsSvc>,
}

impl ShadowRunner {
    pub fn new(primary: AttemptExecutor, shadow: ProviderSlot) -> Result<Self> {
        let id = shadow.id.clone();
        let executor = AttemptExecutor::new(vec![shadow])?;
        Ok(Self {
            primary,
            shadow: Some(ShadowTarget { id, executor }),
            scorer: Arc::new(NormalizedLevenshtein),
            grace: ShadowConfig::default().grace_period(),
            recorder: None,
        })
    }

    /// A runner that only ever calls the primary.
    pub fn disabled(primary: AttemptExecutor) -> Self {
        Self {
            primary,
            shadow: None,
            scorer: Arc::new(NormalizedLevenshtein),
            grace: ShadowConfig::default().grace_period(),
            recorder: None,
        }
    }

    /// Honor `enabled` and `grace_period_ms`; the slot must match the configured provider id.
    pub fn from_config(
        primary: AttemptExecutor,
        shadow: Option<ProviderSlot>,
        cfg: &ShadowConfig,
    ) -> Result<Self> {
        if !cfg.enabled {
            return Ok(Self::disabled(primary).grace_period(cfg.grace_period()));
        }
        let slot = shadow.ok_or_else(|| {
            OrchestratorError::invalid_config("shadow execution enabled without a shadow provider")
        })?;
        if let Some(expected) = &cfg.provider {
            if expected != &slot.id {
                return Err(OrchestratorError::invalid_config(format!(
                    "shadow provider '{}' does not match configured '{}'",
                    slot.id, expected
                )));
            }
        }
        Ok(Self::new(primary, slot)?.grace_period(cfg.grace_period()))
    }

    pub fn scorer(mut self, scorer: impl SimilarityScorer) -> Self {
        self.scorer = Arc::new(scorer);
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Recorder for `shadow` records. The primary executor keeps its own recorder.
    pub fn with_recorder(mut self, recorder: MetricsSvc) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.shadow.is_some()
    }

    pub async fn execute(&self, req: ProviderRequest) -> ShadowExecution {
        self.execute_in(req, RunContext::new()).await
    }

    pub async fn execute_in(&self, req: ProviderRequest, ctx: RunContext) -> ShadowExecution {
        let Some(target) = &self.shadow else {
            let primary = self.primary.run_in(req, ctx).await;
            return ShadowExecution {
                primary,
                comparison: None,
                handle: ShadowHandle::none(),
            };
        };

        let run_id = ctx.run_id.clone();
        let shadow_exec = target.executor.clone();
        let shadow_req = req.clone();
        // Own token: cancelling the primary never cancels the shadow and vice versa.
        let shadow_ctx = RunContext::with_run_id(run_id.clone());
        let shadow_task: JoinHandle<(RunOutcome, Duration)> = tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = shadow_exec.run_in(shadow_req, shadow_ctx).await;
                (outcome, started.elapsed())
            }
            .instrument(info_span!("orchestrator.shadow", run_id = %run_id)),
        );

        let primary = self.primary.run_in(req, ctx).await;

        let pending = ShadowComparison::pending(&run_id, &primary, &target.id);
        let primary_record = primary.to_metrics(&run_id, None);
        let primary_snapshot = primary.clone();
        let scorer = self.scorer.clone();
        let recorder = self.recorder.clone();

        if shadow_task.is_finished() {
            let comparison = match shadow_task.await {
                Ok(shadow) => pending.complete(&primary_snapshot, &shadow, scorer.as_ref()),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "shadow task failed");
                    failed(pending)
                }
            };
            metrics::emit(recorder.as_ref(), comparison.to_metrics(&primary_record)).await;
            return ShadowExecution {
                primary,
                comparison: Some(comparison.clone()),
                handle: ShadowHandle {
                    inner: None,
                    ready: Some(comparison),
                },
            };
        }

        debug!(run_id = %run_id, "primary finished before shadow; detaching comparison");
        let grace = self.grace;
        let pending_out = pending.clone();
        let finisher = tokio::spawn(async move {
            let abort = shadow_task.abort_handle();
            let comparison = match tokio::time::timeout(grace, shadow_task).await {
                Ok(Ok(shadow)) => pending.complete(&primary_snapshot, &shadow, scorer.as_ref()),
                Ok(Err(e)) => {
                    warn!(run_id = %pending.run_id, error = %e, "shadow task failed");
                    failed(pending)
                }
                Err(_) => {
                    abort.abort();
                    warn!(
                        run_id = %pending.run_id,
                        grace_ms = metrics::millis(grace),
                        "shadow call exceeded grace period; aborted"
                    );
                    ShadowComparison {
                        status: ShadowStatus::TimedOut,
                        ..pending
                    }
                }
            };
            metrics::emit(recorder.as_ref(), comparison.to_metrics(&primary_record)).await;
            comparison
        });

        ShadowExecution {
            primary,
            comparison: Some(pending_out),
            handle: ShadowHandle {
                inner: Some(finisher),
                ready: None,
            },
        }
    }
}

fn failed(pending: ShadowComparison) -> ShadowComparison {
    ShadowComparison {
        status: ShadowStatus::Failed {
            error: ErrorKind::Retriable,
        },
        ..pending
    }
}

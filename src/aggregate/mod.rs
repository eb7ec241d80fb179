//! Parallel aggregation: fan one request out to N candidate executors and commit one winner
//!
//! What this module provides
//! - `ParallelAggregator` with three modes:
//!   - `parallel_any`: first successful candidate wins, the rest are cancelled
//!   - `parallel_all`: wait for every candidate (or quorum with early decision), then vote
//!   - `consensus`: like `parallel_all`, but quorum counts agreeing candidates in the winning group
//! - `CandidateSet`, the controller's request-scoped working state
//!
//! Implementation strategy
//! - Each candidate runs its own `AttemptExecutor` in a spawned task under a child cancellation token
//! - Tasks report `(slot, RunOutcome)` through one mpsc channel; the controller task is the only
//!   writer of the `CandidateSet`
//! - Waiting stops on a decision, on the `max_wait_ms` deadline, or when the projected cost of the
//!   remaining candidates would push the accrued cost past the ceiling
//! - After a decision, stragglers are cancelled and a reaper drains the channel for
//!   `straggler_grace_ms` before aborting whatever is still running; late results never vote
//!
//! Testing strategy
//! - Scripted providers with injected delays under paused time
//! - Assert winners, discarded slots, `AggregateExhausted` / `QuorumUnmet` and the consensus record

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower::Service;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::{ConsensusConfig, TokenPricing};
use crate::consensus::{normalize, vote, Candidate, Verdict};
use crate::error::{CandidateFailure, OrchestratorError, Result};
use crate::executor::{AttemptExecutor, RunContext, RunOutcome};
use crate::metrics::{self, ConsensusFields, MetricsRecord, MetricsSvc, RecordKind, RunStatus};
use crate::provider::{ProviderRequest, ProviderResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMode {
    ParallelAny,
    ParallelAll,
    Consensus,
}

impl AggregateMode {
    pub fn label(&self) -> &'static str {
        match self {
            AggregateMode::ParallelAny => "parallel_any",
            AggregateMode::ParallelAll => "parallel_all",
            AggregateMode::Consensus => "consensus",
        }
    }
}

impl fmt::Display for AggregateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the controller stopped collecting results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    FirstSuccess,
    AllResolved,
    QuorumReached,
    Deadline,
    CostCeiling,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::FirstSuccess => "first_success",
            StopReason::AllResolved => "all_resolved",
            StopReason::QuorumReached => "quorum_reached",
            StopReason::Deadline => "deadline",
            StopReason::CostCeiling => "cost_ceiling",
        }
    }

    fn is_budget(&self) -> bool {
        matches!(self, StopReason::Deadline | StopReason::CostCeiling)
    }
}

/// Resolved candidates of one aggregated request, keyed by slot.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    size: usize,
    outcomes: BTreeMap<usize, RunOutcome>,
    /// Successful votes per normalized answer
    tally: BTreeMap<String, usize>,
    accrued_cost: f64,
}

impl CandidateSet {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            outcomes: BTreeMap::new(),
            tally: BTreeMap::new(),
            accrued_cost: 0.0,
        }
    }

    /// Store a terminal outcome. Out-of-range or repeated slots are ignored.
    pub fn record(&mut self, slot: usize, outcome: RunOutcome, pricing: &TokenPricing) -> bool {
        if slot >= self.size || self.outcomes.contains_key(&slot) {
            return false;
        }
        if let Some(resp) = outcome.response() {
            self.accrued_cost += pricing.cost(&resp.usage);
            *self.tally.entry(normalize(&resp.text)).or_default() += 1;
        }
        self.outcomes.insert(slot, outcome);
        true
    }

    pub fn get(&self, slot: usize) -> Option<&RunOutcome> {
        self.outcomes.get(&slot)
    }

    pub fn completed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn in_flight(&self) -> usize {
        self.size - self.outcomes.len()
    }

    pub fn pending_slots(&self) -> Vec<usize> {
        (0..self.size)
            .filter(|s| !self.outcomes.contains_key(s))
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn successes(&self) -> Vec<Candidate> {
        self.outcomes
            .iter()
            .filter_map(|(slot, o)| Candidate::from_outcome(*slot, o))
            .collect()
    }

    /// One entry per slot; unresolved and cancelled slots carry no kind.
    pub fn failures(&self) -> Vec<CandidateFailure> {
        (0..self.size)
            .filter(|s| !self.outcomes.get(s).is_some_and(RunOutcome::is_success))
            .map(|slot| CandidateFailure {
                slot,
                kind: self
                    .outcomes
                    .get(&slot)
                    .and_then(|o| o.terminal_error().cloned()),
            })
            .collect()
    }

    pub fn accrued_cost(&self) -> f64 {
        self.accrued_cost
    }

    /// Accrued cost plus the mean completed cost for every candidate still in flight.
    pub fn projected_cost(&self) -> f64 {
        if self.outcomes.is_empty() {
            return self.accrued_cost;
        }
        let mean = self.accrued_cost / self.outcomes.len() as f64;
        self.accrued_cost + mean * self.in_flight() as f64
    }

    /// Size of the currently leading vote group.
    pub fn leading_votes(&self) -> usize {
        self.tally.values().copied().max().unwrap_or(0)
    }

    pub fn tally(&self) -> &BTreeMap<String, usize> {
        &self.tally
    }

    fn total_attempts(&self) -> usize {
        self.outcomes.values().map(|o| o.attempts().len()).sum()
    }
}

/// Background drain of cancelled candidates.
pub struct Stragglers {
    handle: Option<JoinHandle<Vec<usize>>>,
}

impl fmt::Debug for Stragglers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stragglers")
            .field("reaping", &self.handle.is_some())
            .finish()
    }
}

impl Stragglers {
    fn none() -> Self {
        Self { handle: None }
    }

    fn reap(
        mut rx: mpsc::Receiver<(usize, RunOutcome)>,
        tasks: Vec<JoinHandle<()>>,
        grace: Duration,
    ) -> Self {
        let handle = tokio::spawn(
            async move {
                let mut late = Vec::new();
                let drain = async {
                    while let Some((slot, outcome)) = rx.recv().await {
                        debug!(slot, status = ?outcome.status(), "discarding late candidate result");
                        late.push(slot);
                    }
                };
                if tokio::time::timeout(grace, drain).await.is_err() {
                    let live = tasks.iter().filter(|t| !t.is_finished()).count();
                    for t in &tasks {
                        t.abort();
                    }
                    warn!(
                        aborted = live,
                        grace_ms = metrics::millis(grace),
                        "stragglers outlived grace period; aborted"
                    );
                }
                late
            }
            .instrument(Span::current()),
        );
        Self {
            handle: Some(handle),
        }
    }

    pub fn is_reaping(&self) -> bool {
        self.handle.is_some()
    }

    /// Wait for the reaper; returns the slots whose results arrived after the decision.
    pub async fn join(self) -> Vec<usize> {
        match self.handle {
            Some(h) => h.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

/// Committed result of one aggregated request.
#[derive(Debug)]
pub struct AggregateDecision {
    pub run_id: String,
    pub mode: AggregateMode,
    pub winner: usize,
    pub response: ProviderResponse,
    /// `None` in `parallel_any`, where no vote is taken
    pub verdict: Option<Verdict>,
    pub stop_reason: StopReason,
    /// Outcomes known at decision time
    pub outcomes: BTreeMap<usize, RunOutcome>,
    /// Slots still in flight when the decision was committed
    pub discarded: Vec<usize>,
    pub accrued_cost: f64,
    pub stragglers: Stragglers,
}

impl AggregateDecision {
    pub fn winning_outcome(&self) -> Option<&RunOutcome> {
        self.outcomes.get(&self.winner)
    }
}

/// Fans a request out to candidate executors and resolves one winner.
#[derive(Clone)]
pub struct ParallelAggregator {
    candidates: Vec<AttemptExecutor>,
    mode: AggregateMode,
    config: ConsensusConfig,
    recorder: Option<MetricsSvc>,
}

impl fmt::Debug for ParallelAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelAggregator")
            .field("candidates", &self.candidates.len())
            .field("mode", &self.mode)
            .field("config", &self.config)
            .finish()
    }
}

impl ParallelAggregator {
    pub fn new(
        candidates: Vec<AttemptExecutor>,
        mode: AggregateMode,
        config: ConsensusConfig,
    ) -> Result<Self> {
        config.validate(candidates.len())?;
        Ok(Self {
            candidates,
            mode,
            config,
            recorder: None,
        })
    }

    /// Recorder for the `consensus` record. Candidate executors keep their own recorders.
    pub fn with_recorder(mut self, recorder: MetricsSvc) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn mode(&self) -> AggregateMode {
        self.mode
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub async fn run(&self, req: ProviderRequest) -> Result<AggregateDecision> {
        self.run_in(req, RunContext::new()).await
    }

    /// Cancelling `ctx` cancels every candidate.
    pub async fn run_in(&self, req: ProviderRequest, ctx: RunContext) -> Result<AggregateDecision> {
        let span = info_span!(
            "orchestrator.aggregate",
            run_id = %ctx.run_id,
            mode = %self.mode,
            candidates = self.candidates.len(),
        );
        self.decide(req, ctx).instrument(span).await
    }

    async fn decide(&self, req: ProviderRequest, ctx: RunContext) -> Result<AggregateDecision> {
        let started = Instant::now();
        let n = self.candidates.len();
        let cfg = &self.config;
        let group = ctx.cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<(usize, RunOutcome)>(n.max(1));

        let mut tasks = Vec::with_capacity(n);
        for (slot, exec) in self.candidates.iter().enumerate() {
            let exec = exec.clone();
            let tx = tx.clone();
            let req = req.clone();
            let cctx = RunContext::with_run_id(ctx.run_id.clone())
                .slot(slot)
                .cancel_token(group.child_token());
            let span = info_span!("orchestrator.candidate", run_id = %ctx.run_id, slot);
            tasks.push(tokio::spawn(
                async move {
                    let outcome = exec.run_in(req, cctx).await;
                    // A closed channel only means the decision is already committed.
                    let _ = tx.send((slot, outcome)).await;
                }
                .instrument(span),
            ));
        }
        drop(tx);

        let deadline = cfg.max_wait().map(|d| started + d);
        let mut set = CandidateSet::new(n);
        let mut first_success = None;

        let stop = loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => break StopReason::Deadline,
                },
                None => rx.recv().await,
            };
            let Some((slot, outcome)) = next else {
                break StopReason::AllResolved;
            };
            debug!(slot, status = ?outcome.status(), "candidate resolved");
            let success = outcome.is_success();
            if !set.record(slot, outcome, &cfg.pricing) {
                continue;
            }

            match self.mode {
                AggregateMode::ParallelAny if success => {
                    first_success = Some(slot);
                    break StopReason::FirstSuccess;
                }
                AggregateMode::ParallelAll
                    if cfg.early_decision
                        && set.completed() >= cfg.min_quorum
                        && set.success_count() > 0
                        && set.in_flight() > 0 =>
                {
                    break StopReason::QuorumReached;
                }
                AggregateMode::Consensus
                    if cfg.early_decision
                        && set.in_flight() > 0
                        && set.leading_votes() >= cfg.min_quorum =>
                {
                    break StopReason::QuorumReached;
                }
                _ => {}
            }
            if set.in_flight() == 0 {
                break StopReason::AllResolved;
            }
            if let Some(ceiling) = cfg.cost_ceiling {
                let projected = set.projected_cost();
                if projected > ceiling {
                    warn!(
                        accrued = set.accrued_cost(),
                        projected,
                        ceiling,
                        "cost ceiling would be exceeded; stopping early"
                    );
                    break StopReason::CostCeiling;
                }
            }
        };

        group.cancel();
        let discarded = set.pending_slots();
        let stragglers = if discarded.is_empty() {
            Stragglers::none()
        } else {
            debug!(?discarded, "cancelling stragglers");
            Stragglers::reap(rx, tasks, cfg.straggler_grace())
        };

        let resolved = self.resolve(&set, stop, first_success);
        let elapsed = started.elapsed();
        let (winner, verdict) = match resolved {
            Ok(found) => found,
            Err(e) => {
                warn!(stop = stop.label(), error = %e, "aggregation failed");
                let rec = self.record(&ctx.run_id, &set, stop, None, None, &discarded, elapsed);
                metrics::emit(self.recorder.as_ref(), rec).await;
                return Err(e);
            }
        };

        let response = match set.get(winner).and_then(RunOutcome::response) {
            Some(r) => r.clone(),
            None => {
                return Err(OrchestratorError::AggregateExhausted {
                    failures: set.failures(),
                })
            }
        };
        info!(
            winner,
            stop = stop.label(),
            completed = set.completed(),
            tie_break = ?verdict.as_ref().and_then(|v| v.tie_break),
            "aggregate decision committed"
        );
        let rec = self.record(
            &ctx.run_id,
            &set,
            stop,
            Some(winner),
            verdict.as_ref(),
            &discarded,
            elapsed,
        );
        metrics::emit(self.recorder.as_ref(), rec).await;

        let accrued_cost = set.accrued_cost();
        Ok(AggregateDecision {
            run_id: ctx.run_id,
            mode: self.mode,
            winner,
            response,
            verdict,
            stop_reason: stop,
            outcomes: set.outcomes,
            discarded,
            accrued_cost,
            stragglers,
        })
    }

    fn resolve(
        &self,
        set: &CandidateSet,
        stop: StopReason,
        first_success: Option<usize>,
    ) -> Result<(usize, Option<Verdict>)> {
        let cfg = &self.config;
        let unresolved = || {
            if stop.is_budget() && set.completed() < cfg.min_quorum {
                OrchestratorError::QuorumUnmet {
                    completed: set.completed(),
                    required: cfg.min_quorum,
                }
            } else {
                OrchestratorError::AggregateExhausted {
                    failures: set.failures(),
                }
            }
        };

        if self.mode == AggregateMode::ParallelAny {
            return first_success.map(|slot| (slot, None)).ok_or_else(unresolved);
        }

        if stop.is_budget() && set.completed() < cfg.min_quorum {
            return Err(unresolved());
        }
        let verdict = vote(&set.successes(), cfg).ok_or_else(unresolved)?;
        if self.mode == AggregateMode::Consensus && verdict.winning_votes() < cfg.min_quorum {
            return Err(OrchestratorError::QuorumUnmet {
                completed: verdict.winning_votes(),
                required: cfg.min_quorum,
            });
        }
        Ok((verdict.winner, Some(verdict)))
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        run_id: &str,
        set: &CandidateSet,
        stop: StopReason,
        winner: Option<usize>,
        verdict: Option<&Verdict>,
        discarded: &[usize],
        elapsed: Duration,
    ) -> MetricsRecord {
        let mut rec = match winner.and_then(|w| set.get(w)) {
            Some(outcome) => {
                let mut rec = outcome.to_metrics(run_id, winner);
                rec.record_kind = RecordKind::Consensus;
                rec
            }
            None => MetricsRecord::new(run_id, RecordKind::Consensus, RunStatus::Failure),
        };
        rec.latency_ms = metrics::millis(elapsed);
        rec.attempts = set.total_attempts();
        let tally = match (verdict, winner) {
            (Some(v), _) => v.tally(),
            (None, Some(w)) => BTreeMap::from([(w, 1)]),
            (None, None) => BTreeMap::new(),
        };
        rec.consensus = Some(ConsensusFields {
            mode: self.mode.label().to_string(),
            strategy: self.config.strategy.label().to_string(),
            candidates: self.candidates.len(),
            completed: set.completed(),
            tally,
            winning_slot: winner,
            tie_break: verdict.and_then(|v| v.tie_break).map(|t| t.to_string()),
            stop_reason: stop.label().to_string(),
            discarded_slots: discarded.to_vec(),
            accrued_cost: set.accrued_cost(),
        });
        rec
    }
}

impl Service<ProviderRequest> for ParallelAggregator {
    type Response = AggregateDecision;
    type Error = OrchestratorError;
    type Future = Pin<Box<dyn Future<Output = Result<AggregateDecision>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ProviderRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.run(req).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusStrategy, RetryPolicy};
    use crate::error::ErrorKind;
    use crate::metrics::InMemoryRecorder;
    use crate::provider::{ScriptStep, ScriptedProvider, TokenUsage};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn candidate(p: &ScriptedProvider) -> AttemptExecutor {
        AttemptExecutor::new(vec![p.slot()]).unwrap()
    }

    fn delayed(id: &str, text: &str, delay: Duration) -> ScriptedProvider {
        ScriptedProvider::new(id, vec![ScriptStep::reply(text).after(delay)])
    }

    fn req() -> ProviderRequest {
        ProviderRequest::prompt("m", "q")
    }

    #[test]
    fn candidate_set_ignores_repeats_and_out_of_range() {
        let mut set = CandidateSet::new(2);
        let pricing = TokenPricing::default();
        let out = RunOutcome::Cancelled {
            attempts: vec![],
            elapsed: Duration::ZERO,
        };
        assert!(set.record(0, out.clone(), &pricing));
        assert!(!set.record(0, out.clone(), &pricing));
        assert!(!set.record(5, out, &pricing));
        assert_eq!(set.completed(), 1);
        assert_eq!(set.pending_slots(), vec![1]);
        assert_eq!(
            set.failures(),
            vec![
                CandidateFailure { slot: 0, kind: None },
                CandidateFailure { slot: 1, kind: None },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_any_takes_first_success_and_reaps_stragglers() {
        let slow = delayed("slow", "slow answer", Duration::from_secs(30));
        let fast = delayed("fast", "fast answer", ms(10));
        let broken = ScriptedProvider::failing("broken", ErrorKind::Fatal);
        let agg = ParallelAggregator::new(
            vec![candidate(&slow), candidate(&fast), candidate(&broken)],
            AggregateMode::ParallelAny,
            ConsensusConfig::default(),
        )
        .unwrap();

        let decision = agg.run(req()).await.unwrap();
        assert_eq!(decision.winner, 1);
        assert_eq!(decision.response.text, "fast answer");
        assert_eq!(decision.stop_reason, StopReason::FirstSuccess);
        assert_eq!(decision.discarded, vec![0]);
        assert!(decision.verdict.is_none());

        // The slow call is in flight and ignores cooperative cancellation; it gets aborted.
        let late = decision.stragglers.join().await;
        assert!(late.is_empty());
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_all_waits_for_every_candidate() {
        let a = delayed("a", "A", ms(30));
        let b = delayed("b", "A", ms(10));
        let c = delayed("c", "B", ms(5));
        let agg = ParallelAggregator::new(
            vec![candidate(&a), candidate(&b), candidate(&c)],
            AggregateMode::ParallelAll,
            ConsensusConfig::default(),
        )
        .unwrap();
        let d = agg.run(req()).await.unwrap();
        assert_eq!(d.stop_reason, StopReason::AllResolved);
        assert_eq!(d.outcomes.len(), 3);
        assert_eq!(d.winner, 1);
        assert_eq!(d.verdict.unwrap().winning_votes(), 2);
        assert!(!d.stragglers.is_reaping());
    }

    #[tokio::test(start_paused = true)]
    async fn consensus_early_decision_on_agreeing_quorum() {
        let a = delayed("a", "Yes", ms(10));
        let b = delayed("b", "yes", ms(20));
        let c = delayed("c", "no", Duration::from_secs(10));
        let cfg = ConsensusConfig {
            min_quorum: 2,
            early_decision: true,
            ..Default::default()
        };
        let agg = ParallelAggregator::new(
            vec![candidate(&a), candidate(&b), candidate(&c)],
            AggregateMode::Consensus,
            cfg,
        )
        .unwrap();
        let d = agg.run(req()).await.unwrap();
        assert_eq!(d.stop_reason, StopReason::QuorumReached);
        assert_eq!(d.winner, 0);
        assert_eq!(d.discarded, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn consensus_without_agreement_is_quorum_unmet() {
        let cands: Vec<_> = ["x", "y", "z"]
            .iter()
            .map(|t| candidate(&ScriptedProvider::always(*t, *t)))
            .collect();
        let cfg = ConsensusConfig {
            min_quorum: 2,
            ..Default::default()
        };
        let agg = ParallelAggregator::new(cands, AggregateMode::Consensus, cfg).unwrap();
        let err = agg.run(req()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::QuorumUnmet {
                completed: 1,
                required: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_before_quorum_is_quorum_unmet() {
        let a = delayed("a", "A", ms(1));
        let b = delayed("b", "A", Duration::from_secs(10));
        let c = delayed("c", "A", Duration::from_secs(10));
        let cfg = ConsensusConfig {
            min_quorum: 2,
            max_wait_ms: Some(100),
            ..Default::default()
        };
        let agg = ParallelAggregator::new(
            vec![candidate(&a), candidate(&b), candidate(&c)],
            AggregateMode::ParallelAll,
            cfg,
        )
        .unwrap();
        let err = agg.run(req()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::QuorumUnmet {
                completed: 1,
                required: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cost_ceiling_stops_and_votes_on_completed() {
        let pricey = ScriptedProvider::new(
            "a",
            vec![ScriptStep::reply("A").with_usage(TokenUsage::new(1000, 0))],
        );
        let b = delayed("b", "B", Duration::from_secs(10));
        let c = delayed("c", "C", Duration::from_secs(10));
        let cfg = ConsensusConfig {
            cost_ceiling: Some(2.5),
            ..Default::default()
        };
        let recorder = InMemoryRecorder::new();
        let agg = ParallelAggregator::new(
            vec![candidate(&pricey), candidate(&b), candidate(&c)],
            AggregateMode::ParallelAll,
            cfg,
        )
        .unwrap()
        .with_recorder(recorder.clone().boxed());

        let d = agg.run(req()).await.unwrap();
        assert_eq!(d.stop_reason, StopReason::CostCeiling);
        assert_eq!(d.winner, 0);
        assert_eq!(d.discarded, vec![1, 2]);
        assert!((d.accrued_cost - 1.0).abs() < 1e-9);

        let records = recorder.records().await;
        assert_eq!(records.len(), 1);
        let fields = records[0].consensus.as_ref().unwrap();
        assert_eq!(fields.stop_reason, "cost_ceiling");
        assert_eq!(fields.discarded_slots, vec![1, 2]);
        assert_eq!(records[0].run_id, d.run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_report_every_kind() {
        let a = ScriptedProvider::failing("a", ErrorKind::Fatal);
        let b = ScriptedProvider::failing("b", ErrorKind::ProviderSkip);
        let agg = ParallelAggregator::new(
            vec![candidate(&a), candidate(&b)],
            AggregateMode::ParallelAny,
            ConsensusConfig::default(),
        )
        .unwrap();
        match agg.run(req()).await.unwrap_err() {
            OrchestratorError::AggregateExhausted { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].kind, Some(ErrorKind::Fatal));
                assert_eq!(failures[1].kind, Some(ErrorKind::ProviderSkip));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_tie_resolves_by_seed_on_every_run() {
        let cfg = ConsensusConfig {
            strategy: ConsensusStrategy::Majority,
            seed: 7,
            ..Default::default()
        };
        let mut winners = Vec::new();
        for _ in 0..4 {
            let cands: Vec<_> = ["x", "y", "z"]
                .iter()
                .map(|t| candidate(&delayed(t, t, ms(20))))
                .collect();
            let agg =
                ParallelAggregator::new(cands, AggregateMode::ParallelAll, cfg.clone()).unwrap();
            let d = agg.run(req()).await.unwrap();
            assert_eq!(
                d.verdict.as_ref().unwrap().tie_break,
                Some(crate::consensus::TieBreak::Seed)
            );
            winners.push(d.winner);
        }
        assert!(winners.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn tally_counts_normalized_successes_only() {
        let pricing = TokenPricing::default();
        let mut set = CandidateSet::new(4);
        for (slot, text) in ["Yes", "  yes ", "no"].iter().enumerate() {
            let out = candidate(&ScriptedProvider::always(format!("p{slot}"), *text))
                .run(req())
                .await;
            assert!(set.record(slot, out.clone(), &pricing));
            assert!(!set.record(slot, out, &pricing));
        }
        let failed = candidate(&ScriptedProvider::failing("p3", ErrorKind::Fatal))
            .run(req())
            .await;
        assert!(set.record(3, failed, &pricing));

        assert_eq!(set.leading_votes(), 2);
        assert_eq!(set.tally().get("yes"), Some(&2));
        assert_eq!(set.tally().get("no"), Some(&1));
        assert_eq!(set.tally().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_all_decides_early_once_quorum_has_a_success() {
        let ok = delayed("ok", "A", ms(10));
        let broken = ScriptedProvider::new(
            "broken",
            vec![ScriptStep::fail(ErrorKind::Fatal).after(ms(20))],
        );
        let slow = delayed("slow", "B", Duration::from_secs(10));
        let cfg = ConsensusConfig {
            min_quorum: 2,
            early_decision: true,
            ..Default::default()
        };
        let agg = ParallelAggregator::new(
            vec![candidate(&ok), candidate(&broken), candidate(&slow)],
            AggregateMode::ParallelAll,
            cfg,
        )
        .unwrap();

        let d = agg.run(req()).await.unwrap();
        assert_eq!(d.stop_reason, StopReason::QuorumReached);
        assert_eq!(d.winner, 0);
        assert_eq!(d.discarded, vec![2]);
        assert_eq!(d.outcomes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_all_quorum_of_failures_keeps_waiting() {
        let a = ScriptedProvider::failing("a", ErrorKind::Fatal);
        let b = ScriptedProvider::new(
            "b",
            vec![ScriptStep::fail(ErrorKind::Fatal).after(ms(10))],
        );
        let late = delayed("late", "A", Duration::from_secs(1));
        let cfg = ConsensusConfig {
            min_quorum: 2,
            early_decision: true,
            ..Default::default()
        };
        let agg = ParallelAggregator::new(
            vec![candidate(&a), candidate(&b), candidate(&late)],
            AggregateMode::ParallelAll,
            cfg,
        )
        .unwrap();

        let d = agg.run(req()).await.unwrap();
        assert_eq!(d.stop_reason, StopReason::AllResolved);
        assert_eq!(d.winner, 2);
        assert!(d.discarded.is_empty());
        assert_eq!(late.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lowest_latency_counts_retries_and_backoff() {
        let retried = ScriptedProvider::new(
            "retried",
            vec![
                ScriptStep::fail(ErrorKind::Retriable),
                ScriptStep::fail(ErrorKind::Retriable),
                ScriptStep::reply("first").after(ms(10)),
            ],
        );
        let steady = delayed("steady", "second", ms(50));
        let retried_exec = AttemptExecutor::new(vec![retried
            .slot()
            .retry(RetryPolicy::fixed(3, Duration::from_secs(1)))])
        .unwrap();
        let cfg = ConsensusConfig {
            strategy: ConsensusStrategy::LowestLatency,
            ..Default::default()
        };
        let agg = ParallelAggregator::new(
            vec![retried_exec, candidate(&steady)],
            AggregateMode::ParallelAll,
            cfg,
        )
        .unwrap();

        let d = agg.run(req()).await.unwrap();
        assert_eq!(d.winner, 1);
        assert_eq!(d.response.text, "second");
        assert_eq!(
            d.verdict.as_ref().unwrap().tie_break,
            Some(crate::consensus::TieBreak::Latency)
        );
        let retried_run = d.outcomes.get(&0).unwrap();
        assert!(retried_run.is_success());
        assert!(retried_run.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn invalid_quorum_rejected_at_construction() {
        let p = ScriptedProvider::always("p", "x");
        let cfg = ConsensusConfig {
            min_quorum: 3,
            ..Default::default()
        };
        assert!(ParallelAggregator::new(vec![candidate(&p)], AggregateMode::ParallelAll, cfg).is_err());
    }
}

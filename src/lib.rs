//! # tower-llm-orchestrator
//!
//! Tower-based orchestration of calls to LLM providers. One logical request can be driven
//! through a retry/fallback chain, shadowed by a non-blocking comparison call, or fanned out to
//! several candidates whose answers are reconciled by deterministic voting.
//!
//! ## Core Concepts
//!
//! - **Provider**: any `tower::Service<ProviderRequest, Response = ProviderResponse, Error = BoxError>`
//! - **AttemptExecutor**: retry/backoff per provider, fallback across providers, one `RunOutcome`
//! - **ShadowRunner**: primary call plus a shadow call that can never change the primary result
//! - **ParallelAggregator**: `parallel_any`, `parallel_all` and `consensus` fan-out with quorum,
//!   cost ceiling and cancellation of stragglers
//! - **Metrics**: one versioned JSON line per run, shadow comparison and aggregate decision
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower_llm_orchestrator::{
//!     AttemptExecutor, ErrorKind, ProviderRequest, RetryPolicy, ScriptStep, ScriptedProvider,
//! };
//!
//! # async fn example() -> tower_llm_orchestrator::Result<()> {
//! let flaky = ScriptedProvider::new(
//!     "primary",
//!     vec![ScriptStep::fail(ErrorKind::Timeout), ScriptStep::reply("hello")],
//! );
//! let backup = ScriptedProvider::always("backup", "hi");
//!
//! let executor = AttemptExecutor::new(vec![
//!     flaky.slot().retry(RetryPolicy::default()),
//!     backup.slot(),
//! ])?;
//! let outcome = executor.run(ProviderRequest::prompt("gpt-4o", "Say hello")).await;
//! println!("{:?}", outcome.response());
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod consensus;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod provider;
pub mod shadow;
pub mod telemetry;

pub use aggregate::{AggregateDecision, AggregateMode, CandidateSet, ParallelAggregator, StopReason};
pub use config::{
    ConsensusConfig, ConsensusStrategy, OrchestratorConfig, ProviderEntry, RetryPolicy,
    ShadowConfig, TokenPricing,
};
pub use consensus::{vote, Candidate, TieBreak, Verdict};
pub use error::{classify, CandidateFailure, ErrorKind, OrchestratorError, ProviderError, Result};
pub use executor::{AttemptExecutor, AttemptRecord, AttemptStatus, RunContext, RunOutcome};
pub use metrics::{InMemoryRecorder, JsonlRecorder, MetricsRecord, MetricsSvc, SCHEMA_VERSION};
pub use provider::{
    ProviderRequest, ProviderResponse, ProviderSlot, ProviderSvc, ScriptStep, ScriptedProvider,
    TokenUsage,
};
pub use shadow::{
    NormalizedLevenshtein, ShadowComparison, ShadowExecution, ShadowRunner, ShadowStatus,
    SimilarityScorer, TokenJaccard,
};

// Re-export Tower traits that users need
pub use tower::{BoxError, Service, ServiceExt};

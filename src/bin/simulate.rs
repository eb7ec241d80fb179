//! Drive scripted providers through the executor, shadow runner and aggregator.
//!
//! Metrics go to `ORCH_METRICS_PATH` (default `orchestrator-metrics.jsonl`), log format is taken
//! from `ORCH_LOG_FORMAT` (`plain` or `json`).

use std::time::Duration;

use tower_llm_orchestrator::metrics::JsonlRecorder;
use tower_llm_orchestrator::telemetry::{init_tracing, LogFormat};
use tower_llm_orchestrator::{
    AggregateMode, AttemptExecutor, ConsensusConfig, ConsensusStrategy, ErrorKind,
    ParallelAggregator, ProviderRequest, RetryPolicy, ScriptStep, ScriptedProvider, ShadowRunner,
    TokenJaccard,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let format = std::env::var("ORCH_LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse::<LogFormat>().ok())
        .unwrap_or_default();
    init_tracing(format);

    let path = std::env::var("ORCH_METRICS_PATH")
        .unwrap_or_else(|_| "orchestrator-metrics.jsonl".to_string());
    let recorder = JsonlRecorder::open(&path).await?.boxed();
    let retry = RetryPolicy::fixed(3, Duration::from_millis(50));
    let req = ProviderRequest::prompt("demo-model", "What is the capital of France?");

    // Fallback: the first provider times out twice, then the chain moves on after a fatal error.
    let flaky = ScriptedProvider::new(
        "flaky",
        vec![
            ScriptStep::fail(ErrorKind::Timeout),
            ScriptStep::fail(ErrorKind::Timeout),
            ScriptStep::fail(ErrorKind::Fatal),
        ],
    );
    let steady = ScriptedProvider::new(
        "steady",
        vec![ScriptStep::reply("Paris").after(Duration::from_millis(40))],
    );
    let executor = AttemptExecutor::new(vec![
        flaky.slot().retry(retry.clone()),
        steady.slot().retry(retry.clone()),
    ])?
    .with_recorder(recorder.clone());
    let outcome = executor.run(req.clone()).await;
    println!(
        "fallback: {:?} after {} attempts",
        outcome.response().map(|r| r.text.as_str()),
        outcome.attempts().len()
    );

    // Shadow: compare against a slower provider without waiting for it.
    let shadow = ScriptedProvider::new(
        "shadow",
        vec![ScriptStep::reply("paris, France").after(Duration::from_millis(200))],
    );
    let runner = ShadowRunner::new(executor.clone(), shadow.slot())?
        .scorer(TokenJaccard)
        .grace_period(Duration::from_secs(2))
        .with_recorder(recorder.clone());
    let shadowed = runner.execute(req.clone()).await;
    println!(
        "shadow: primary={:?}",
        shadowed.primary.response().map(|r| r.text.as_str())
    );
    if let Some(cmp) = shadowed.handle.finished().await {
        println!("shadow: status={:?} diff_score={:?}", cmp.status, cmp.diff_score);
    }

    // Consensus over three candidates, two of which agree.
    let candidates = [
        ("cand-a", "Paris", 30),
        ("cand-b", "paris ", 60),
        ("cand-c", "Lyon", 10),
    ]
    .into_iter()
    .map(|(id, text, delay)| {
        let p = ScriptedProvider::new(
            id,
            vec![ScriptStep::reply(text).after(Duration::from_millis(delay))],
        );
        AttemptExecutor::new(vec![p.slot().retry(retry.clone())])
            .map(|e| e.with_recorder(recorder.clone()))
    })
    .collect::<Result<Vec<_>, _>>()?;
    let aggregator = ParallelAggregator::new(
        candidates,
        AggregateMode::Consensus,
        ConsensusConfig {
            strategy: ConsensusStrategy::Majority,
            seed: 42,
            ..Default::default()
        },
    )?
    .with_recorder(recorder);
    let decision = aggregator.run(req).await?;
    println!(
        "consensus: slot {} -> {:?} (tally {:?})",
        decision.winner,
        decision.response.text,
        decision.verdict.as_ref().map(|v| v.tally())
    );

    println!("metrics written to {}", path);
    Ok(())
}

//! End-to-end scenarios for the executor and the aggregation controller

use std::time::Duration;

use tower_llm_orchestrator::{
    AggregateMode, AttemptExecutor, ConsensusConfig, ConsensusStrategy, ErrorKind,
    OrchestratorError, ParallelAggregator, ProviderRequest, RetryPolicy, ScriptStep,
    ScriptedProvider, TieBreak,
};

fn req() -> ProviderRequest {
    ProviderRequest::prompt("test-model", "question")
}

fn single(p: &ScriptedProvider) -> AttemptExecutor {
    AttemptExecutor::new(vec![p.slot()]).unwrap()
}

#[tokio::test(start_paused = true)]
async fn scenario_a_timeouts_then_success_on_same_provider() {
    let p1 = ScriptedProvider::new(
        "p1",
        vec![
            ScriptStep::fail(ErrorKind::Timeout),
            ScriptStep::fail(ErrorKind::Timeout),
            ScriptStep::reply("ok"),
        ],
    );
    let exec = AttemptExecutor::new(vec![p1
        .slot()
        .retry(RetryPolicy::fixed(3, Duration::from_millis(100)))])
    .unwrap();

    let out = exec.run(req()).await;
    assert!(out.is_success());
    assert_eq!(out.attempts().len(), 3);
    assert_eq!(out.winning().unwrap().provider_id, "p1");
    assert_eq!(out.retries_for("p1"), 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_fatal_falls_back_without_retries() {
    let p1 = ScriptedProvider::failing("p1", ErrorKind::Fatal);
    let p2 = ScriptedProvider::always("p2", "ok");
    let exec = AttemptExecutor::new(vec![p1.slot(), p2.slot()]).unwrap();

    let out = exec.run(req()).await;
    assert_eq!(out.response().unwrap().provider_id, "p2");
    assert_eq!(out.attempts().len(), 2);
    assert_eq!(out.retries_for("p1"), 0);
    assert_eq!(p1.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_majority_group_wins() {
    let providers = [
        ScriptedProvider::always("c0", "A"),
        ScriptedProvider::always("c1", "A"),
        ScriptedProvider::always("c2", "B"),
    ];
    let agg = ParallelAggregator::new(
        providers.iter().map(single).collect(),
        AggregateMode::Consensus,
        ConsensusConfig {
            strategy: ConsensusStrategy::Majority,
            ..Default::default()
        },
    )
    .unwrap();

    let d = agg.run(req()).await.unwrap();
    let verdict = d.verdict.as_ref().unwrap();
    assert_eq!(verdict.key, "a");
    assert_eq!(verdict.winning_votes(), 2);
    assert_eq!(verdict.tally().values().copied().collect::<Vec<_>>(), vec![2, 1]);
    assert_eq!(d.response.text, "A");
    assert!(d.winner < 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_tie_falls_through_to_latency() {
    let slow = ScriptedProvider::new(
        "slow",
        vec![ScriptStep::reply("first").after(Duration::from_millis(80))],
    );
    let fast = ScriptedProvider::new(
        "fast",
        vec![ScriptStep::reply("second").after(Duration::from_millis(20))],
    );
    let agg = ParallelAggregator::new(
        vec![single(&slow), single(&fast)],
        AggregateMode::ParallelAll,
        ConsensusConfig {
            strategy: ConsensusStrategy::Majority,
            ..Default::default()
        },
    )
    .unwrap();

    let d = agg.run(req()).await.unwrap();
    assert_eq!(d.winner, 1);
    assert_eq!(d.response.text, "second");
    assert_eq!(d.verdict.unwrap().tie_break, Some(TieBreak::Latency));
}

#[tokio::test(start_paused = true)]
async fn scenario_e_all_candidates_fail() {
    let kinds = [ErrorKind::Fatal, ErrorKind::Timeout, ErrorKind::Retriable];
    let providers: Vec<_> = kinds
        .iter()
        .enumerate()
        .map(|(i, k)| ScriptedProvider::failing(format!("c{}", i), k.clone()))
        .collect();
    let candidates = providers
        .iter()
        .map(|p| {
            AttemptExecutor::new(vec![p
                .slot()
                .retry(RetryPolicy::fixed(2, Duration::from_millis(10)))])
            .unwrap()
        })
        .collect();
    let agg = ParallelAggregator::new(
        candidates,
        AggregateMode::ParallelAll,
        ConsensusConfig::default(),
    )
    .unwrap();

    match agg.run(req()).await {
        Err(OrchestratorError::AggregateExhausted { failures }) => {
            assert_eq!(failures.len(), 3);
            let got: Vec<_> = failures.into_iter().map(|f| f.kind.unwrap()).collect();
            assert_eq!(got, kinds.to_vec());
        }
        other => panic!("expected AggregateExhausted, got {:?}", other.map(|d| d.winner)),
    }
}

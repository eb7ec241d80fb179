//! Property tests for the attempt executor and the shadow runner.

use std::time::Duration;

use proptest::prelude::*;
use tower_llm_orchestrator::{
    AttemptExecutor, AttemptStatus, ErrorKind, ProviderRequest, RetryPolicy, RunOutcome,
    ScriptStep, ScriptedProvider, ShadowRunner,
};

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn transient() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![Just(ErrorKind::Timeout), Just(ErrorKind::Retriable)]
}

/// Distinct consecutive stages touched by the run.
fn segments(out: &RunOutcome) -> Vec<String> {
    let mut ids: Vec<String> = out.attempts().iter().map(|a| a.provider_id.clone()).collect();
    ids.dedup();
    ids
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn provider_k_success_yields_k_segments(
        failures in prop::collection::vec((transient(), 1u32..4), 0..5),
    ) {
        let mut chain = Vec::new();
        let mut failing = Vec::new();
        for (i, (kind, max_attempts)) in failures.iter().enumerate() {
            let p = ScriptedProvider::failing(format!("p{}", i), kind.clone());
            chain.push(p.slot().retry(RetryPolicy::fixed(*max_attempts, Duration::from_millis(5))));
            failing.push((p, *max_attempts));
        }
        let winner = ScriptedProvider::always("winner", "done");
        chain.push(winner.slot());
        let k = chain.len();

        let exec = AttemptExecutor::new(chain).unwrap();
        let out = paused_runtime().block_on(exec.run(ProviderRequest::prompt("m", "q")));

        prop_assert!(out.is_success());
        prop_assert_eq!(&out.response().unwrap().provider_id, "winner");
        prop_assert_eq!(segments(&out).len(), k);
        for (p, max_attempts) in &failing {
            prop_assert_eq!(p.calls(), *max_attempts as usize);
        }
    }

    #[test]
    fn shadow_on_and_off_return_the_same_primary(
        script in prop::collection::vec(
            prop_oneof![
                transient().prop_map(ScriptStep::fail),
                "[a-z ]{0,12}".prop_map(ScriptStep::reply),
            ],
            1..4,
        ),
        shadow_fails in any::<bool>(),
        shadow_delay_ms in 0u64..50,
    ) {
        let rt = paused_runtime();
        let run = |with_shadow: bool| {
            let primary = ScriptedProvider::new("primary", script.clone());
            let backup = ScriptedProvider::always("backup", "fallback text");
            let exec = AttemptExecutor::new(vec![
                primary.slot().retry(RetryPolicy::fixed(3, Duration::from_millis(5))),
                backup.slot(),
            ])
            .unwrap();
            let step = if shadow_fails {
                ScriptStep::fail(ErrorKind::Fatal)
            } else {
                ScriptStep::reply("shadow text")
            };
            let shadow = ScriptedProvider::new(
                "shadow",
                vec![step.after(Duration::from_millis(shadow_delay_ms))],
            );
            let runner = if with_shadow {
                ShadowRunner::new(exec, shadow.slot()).unwrap()
            } else {
                ShadowRunner::disabled(exec)
            };
            rt.block_on(async { runner.execute(ProviderRequest::prompt("m", "q")).await.primary })
        };

        let on = run(true);
        let off = run(false);
        prop_assert_eq!(on.response(), off.response());
        let statuses = |o: &RunOutcome| -> Vec<(String, AttemptStatus, u32)> {
            o.attempts()
                .iter()
                .map(|a| (a.provider_id.clone(), a.status.clone(), a.retry_count))
                .collect()
        };
        prop_assert_eq!(statuses(&on), statuses(&off));
    }
}

#[tokio::test(start_paused = true)]
async fn always_skipping_provider_records_zero_retries() {
    let skipper = ScriptedProvider::failing("skipper", ErrorKind::ProviderSkip);
    let ok = ScriptedProvider::always("ok", "fine");
    let exec = AttemptExecutor::new(vec![
        skipper.slot().retry(RetryPolicy::fixed(5, Duration::from_secs(1))),
        ok.slot(),
    ])
    .unwrap();

    let out = exec.run(ProviderRequest::prompt("m", "q")).await;
    assert!(out.is_success());
    assert_eq!(out.retries_for("skipper"), 0);
    assert_eq!(skipper.calls(), 1);
    assert_eq!(out.attempts()[0].error(), Some(&ErrorKind::ProviderSkip));
}

#[tokio::test(start_paused = true)]
async fn disabled_provider_records_skip_without_call() {
    let off = ScriptedProvider::always("off", "unused");
    let ok = ScriptedProvider::always("ok", "fine");
    let exec = AttemptExecutor::new(vec![off.slot().disabled(), ok.slot()]).unwrap();

    let out = exec.run(ProviderRequest::prompt("m", "q")).await;
    assert_eq!(out.response().unwrap().text, "fine");
    assert_eq!(off.calls(), 0);
    assert_eq!(out.retries_for("off"), 0);
}

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::time::Duration;
use tokio::runtime::Runtime;
use tower_llm_orchestrator::{
    vote, AggregateMode, AttemptExecutor, Candidate, ConsensusConfig, ConsensusStrategy,
    ParallelAggregator, ProviderRequest, ScriptedProvider,
};

fn candidates(n: usize, distinct: usize) -> Vec<Candidate> {
    (0..n)
        .map(|slot| {
            Candidate::new(
                slot,
                format!("  Answer {}  ", slot % distinct),
                Duration::from_millis((slot % 7) as u64),
            )
        })
        .collect()
}

fn bench_vote(c: &mut Criterion) {
    let cfg = ConsensusConfig {
        strategy: ConsensusStrategy::ScoreWeighted,
        seed: 42,
        quality_scores: (0..64).map(|i| (i % 5) as f64 / 5.0).collect(),
        ..Default::default()
    };

    let few = candidates(5, 3);
    c.bench_function("vote_5_candidates", |b| b.iter(|| vote(&few, &cfg)));

    let many = candidates(64, 8);
    c.bench_function("vote_64_candidates", |b| b.iter(|| vote(&many, &cfg)));

    // All distinct: every vote goes through the full tie-break chain
    let ties = candidates(64, 64);
    c.bench_function("vote_64_full_tie", |b| b.iter(|| vote(&ties, &cfg)));
}

fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("aggregate_parallel_all_8", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let execs = (0..8)
                    .map(|i| {
                        let p = ScriptedProvider::always(format!("p{}", i), format!("{}", i % 3));
                        AttemptExecutor::new(vec![p.slot()]).unwrap()
                    })
                    .collect();
                ParallelAggregator::new(execs, AggregateMode::ParallelAll, ConsensusConfig::default())
                    .unwrap()
            },
            |agg| async move {
                let _ = agg.run(ProviderRequest::prompt("m", "q")).await.unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_vote, bench_fanout);
criterion_main!(benches);

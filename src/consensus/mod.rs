//! Deterministic consensus voting over parallel candidates
//!
//! Successful candidates are grouped by a normalized equivalence key of their output text and
//! each group gets one vote per member. The largest group wins outright. Ties between the top
//! groups go through the configured strategy's chain, ending in a seed-driven pick over slot
//! indices:
//!
//! ```text
//! majority        -> lowest latency -> seed
//! score-weighted  -> quality score  -> lowest latency -> seed
//! lowest-latency  -> lowest latency -> seed
//! ```
//!
//! Nothing here depends on arrival order: groups are keyed by text, members are kept sorted by
//! slot, and the final tie-break hashes slot indices rather than completion times. Same inputs
//! and seed always produce the same verdict.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConsensusConfig, ConsensusStrategy};
use crate::executor::RunOutcome;

/// A successful candidate as seen by the vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub slot: usize,
    pub text: String,
    pub latency: Duration,
}

impl Candidate {
    pub fn new(slot: usize, text: impl Into<String>, latency: Duration) -> Self {
        Self {
            slot,
            text: text.into(),
            latency,
        }
    }

    /// `None` unless the outcome is a success. Latency is the whole run's, retries and
    /// fallback stages included.
    pub fn from_outcome(slot: usize, outcome: &RunOutcome) -> Option<Self> {
        outcome
            .response()
            .map(|response| Self::new(slot, response.text.clone(), outcome.elapsed()))
    }
}

/// Which rule settled a tie between top groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    QualityScore,
    Latency,
    Seed,
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TieBreak::QualityScore => "quality_score",
            TieBreak::Latency => "latency",
            TieBreak::Seed => "seed",
        })
    }
}

/// One equivalence group.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteGroup {
    pub key: String,
    /// Member slots, ascending
    pub slots: Vec<usize>,
    pub best_latency: Duration,
    pub score: f64,
}

impl VoteGroup {
    pub fn votes(&self) -> usize {
        self.slots.len()
    }

    fn representative(&self) -> usize {
        self.slots.first().copied().unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub winner: usize,
    pub key: String,
    pub strategy: ConsensusStrategy,
    /// All groups, ordered by their lowest slot
    pub groups: Vec<VoteGroup>,
    pub tie_break: Option<TieBreak>,
}

impl Verdict {
    /// Votes keyed by each group's lowest slot.
    pub fn tally(&self) -> BTreeMap<usize, usize> {
        self.groups
            .iter()
            .map(|g| (g.representative(), g.votes()))
            .collect()
    }

    pub fn winning_votes(&self) -> usize {
        self.groups
            .iter()
            .find(|g| g.key == self.key)
            .map(VoteGroup::votes)
            .unwrap_or(0)
    }
}

/// Equivalence key: trimmed, whitespace-collapsed, lowercased.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Bijective 64-bit mix; distinct slots never collide.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn seed_rank(seed: u64, slot: usize) -> u64 {
    splitmix64(seed ^ slot as u64)
}

fn group_candidates(candidates: &[Candidate], cfg: &ConsensusConfig) -> Vec<VoteGroup> {
    let mut by_key: BTreeMap<String, VoteGroup> = BTreeMap::new();
    for c in candidates {
        let key = normalize(&c.text);
        let g = by_key.entry(key.clone()).or_insert_with(|| VoteGroup {
            key,
            slots: Vec::new(),
            best_latency: c.latency,
            score: 0.0,
        });
        g.slots.push(c.slot);
        g.best_latency = g.best_latency.min(c.latency);
        g.score += cfg.quality_score(c.slot);
    }
    let mut groups: Vec<VoteGroup> = by_key
        .into_values()
        .map(|mut g| {
            g.slots.sort_unstable();
            g
        })
        .collect();
    groups.sort_by_key(VoteGroup::representative);
    groups
}

/// Keep only the groups that are best under `cmp` (Ordering::Less = better).
fn retain_best<F>(groups: &mut Vec<&VoteGroup>, cmp: F)
where
    F: Fn(&VoteGroup, &VoteGroup) -> Ordering,
{
    let Some(best) = groups.iter().copied().min_by(|a, b| cmp(*a, *b)) else {
        return;
    };
    groups.retain(|g| cmp(*g, best) == Ordering::Equal);
}

/// Run the vote. Returns `None` when there is no successful candidate.
pub fn vote(candidates: &[Candidate], cfg: &ConsensusConfig) -> Option<Verdict> {
    let groups = group_candidates(candidates, cfg);
    let max_votes = groups.iter().map(VoteGroup::votes).max()?;
    let mut top: Vec<&VoteGroup> = groups.iter().filter(|g| g.votes() == max_votes).collect();

    let mut tie_break = None;
    if top.len() > 1 && cfg.strategy == ConsensusStrategy::ScoreWeighted {
        // higher score is better
        retain_best(&mut top, |a, b| b.score.total_cmp(&a.score));
        if top.len() == 1 {
            tie_break = Some(TieBreak::QualityScore);
        }
    }
    if top.len() > 1 {
        retain_best(&mut top, |a, b| a.best_latency.cmp(&b.best_latency));
        if top.len() == 1 {
            tie_break = Some(TieBreak::Latency);
        }
    }
    if top.len() > 1 {
        retain_best(&mut top, |a, b| {
            seed_rank(cfg.seed, a.representative()).cmp(&seed_rank(cfg.seed, b.representative()))
        });
        tie_break = Some(TieBreak::Seed);
    }

    let group = top.first()?;
    let winner = candidates
        .iter()
        .filter(|c| group.slots.contains(&c.slot))
        .min_by(|a, b| a.latency.cmp(&b.latency).then(a.slot.cmp(&b.slot)))?
        .slot;

    Some(Verdict {
        winner,
        key: group.key.clone(),
        strategy: cfg.strategy,
        tie_break,
        groups: groups.clone(),
    })
}

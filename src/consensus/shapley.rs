//! Shapley attribution of the consensus score
//!
//! The characteristic function is "score of the coalition", evaluated by a
//! [`CoalitionScorer`]; the empty coalition is worth 0. Each verifier's weight
//! is its marginal contribution averaged over orderings of the verifier set.
//!
//! ## Strategies
//!
//! - `Exact`: every one of the n! orderings. Used up to `exact_threshold`
//!   verifiers (default 5, i.e. 120 orderings over 31 distinct coalitions).
//! - `MonteCarlo`: `samples` uniformly shuffled orderings. Accuracy is
//!   governed by the sample count.
//!
//! Within one run every distinct coalition is scored exactly once and the
//! result reused, so the weights always sum to the full coalition's score
//! (no mixing of different noisy replies for the same coalition). Scoring
//! calls run concurrently, at most `max_concurrent` at a time.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use super::Coalition;
use crate::chain::VerifierAddress;
use crate::config::AttributionConfig;

/// Anything that can put a number on a coalition
#[async_trait]
pub trait CoalitionScorer: Send + Sync {
    /// Score in [0, 100]; non-empty coalitions only
    async fn score_coalition(&self, coalition: &Coalition) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributionStrategy {
    Exact,
    MonteCarlo { samples: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub weights: BTreeMap<VerifierAddress, f64>,
    pub strategy: AttributionStrategy,
    /// Distinct non-empty coalitions scored
    pub evaluations: usize,
    pub full_score: u8,
}

impl Attribution {
    fn empty(strategy: AttributionStrategy) -> Self {
        Self {
            weights: BTreeMap::new(),
            strategy,
            evaluations: 0,
            full_score: 0,
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.values().sum()
    }
}

/// Set of player indices
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Members(Vec<u64>);

impl Members {
    fn empty(players: usize) -> Self {
        Self(vec![0; players.div_ceil(64).max(1)])
    }

    fn insert(&mut self, index: usize) {
        self.0[index / 64] |= 1u64 << (index % 64);
    }

    fn contains(&self, index: usize) -> bool {
        self.0[index / 64] & (1u64 << (index % 64)) != 0
    }
}

#[derive(Debug, Clone)]
pub struct ShapleyEngine {
    exact_threshold: usize,
    samples: usize,
    seed: Option<u64>,
    max_concurrent: usize,
}

impl Default for ShapleyEngine {
    fn default() -> Self {
        Self::new(5, 200, None, 4)
    }
}

impl ShapleyEngine {
    pub fn new(exact_threshold: usize, samples: usize, seed: Option<u64>, max_concurrent: usize) -> Self {
        Self {
            exact_threshold,
            samples: samples.max(1),
            seed,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn from_config(config: &AttributionConfig) -> Self {
        Self::new(
            config.exact_threshold,
            config.monte_carlo_samples,
            config.seed,
            config.max_concurrent_scoring,
        )
    }

    pub fn select_strategy(&self, players: usize) -> AttributionStrategy {
        if players <= self.exact_threshold {
            AttributionStrategy::Exact
        } else {
            AttributionStrategy::MonteCarlo {
                samples: self.samples,
            }
        }
    }

    /// Attribute the full coalition's score across its members
    pub async fn attribute(&self, scorer: &dyn CoalitionScorer, coalition: &Coalition) -> Attribution {
        let players: Vec<(&VerifierAddress, _)> = coalition.iter().collect();
        let n = players.len();
        let strategy = self.select_strategy(n);

        if n == 0 {
            return Attribution::empty(strategy);
        }

        let orderings = match strategy {
            AttributionStrategy::Exact => permutations(n),
            AttributionStrategy::MonteCarlo { samples } => self.sample_orderings(n, samples),
        };

        // Every prefix of every ordering is a coalition we need a value for
        let mut needed: HashSet<Members> = HashSet::new();
        for ordering in &orderings {
            let mut members = Members::empty(n);
            for &player in ordering {
                members.insert(player);
                needed.insert(members.clone());
            }
        }

        debug!(
            players = n,
            orderings = orderings.len(),
            coalitions = needed.len(),
            "Scoring coalitions"
        );

        let values: HashMap<Members, u8> = stream::iter(needed)
            .map(|members| {
                let subset: Coalition = players
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| members.contains(*index))
                    .map(|(_, (address, summary))| ((*address).clone(), (*summary).clone()))
                    .collect();
                async move {
                    let score = scorer.score_coalition(&subset).await;
                    (members, score)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut totals = vec![0.0f64; n];
        for ordering in &orderings {
            let mut members = Members::empty(n);
            let mut previous = 0.0f64;
            for &player in ordering {
                members.insert(player);
                let value = values.get(&members).copied().unwrap_or(0) as f64;
                totals[player] += value - previous;
                previous = value;
            }
        }

        let mut full = Members::empty(n);
        (0..n).for_each(|index| full.insert(index));
        let full_score = values.get(&full).copied().unwrap_or(0);

        let count = orderings.len() as f64;
        let weights: BTreeMap<VerifierAddress, f64> = players
            .iter()
            .zip(totals)
            .map(|((address, _), total)| ((*address).clone(), total / count))
            .collect();

        info!(
            players = n,
            strategy = ?strategy,
            evaluations = values.len(),
            full_score,
            "Shapley attribution complete"
        );

        Attribution {
            weights,
            strategy,
            evaluations: values.len(),
            full_score,
        }
    }

    fn sample_orderings(&self, n: usize, samples: usize) -> Vec<Vec<usize>> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        (0..samples)
            .map(|_| {
                let mut ordering: Vec<usize> = (0..n).collect();
                ordering.shuffle(&mut rng);
                ordering
            })
            .collect()
    }
}

/// All orderings of `0..n` (Heap's algorithm)
fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut items: Vec<usize> = (0..n).collect();
    let mut result = vec![items.clone()];
    let mut counters = vec![0usize; n];
    let mut i = 1;

    while i < n {
        if counters[i] < i {
            if i % 2 == 0 {
                items.swap(0, i);
            } else {
                items.swap(counters[i], i);
            }
            result.push(items.clone());
            counters[i] += 1;
            i = 1;
        } else {
            counters[i] = 0;
            i += 1;
        }
    }

    result
}

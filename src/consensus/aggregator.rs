//! Consensus Aggregator
//!
//! Scores a coalition of verifier summaries with one call to the scoring
//! service. The reply must be a bare integer; anything else degrades to the
//! fallback score rather than failing the round. Scores are always clamped
//! to [0, 100].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::Coalition;
use super::scoring::{ScoringRequest, ScoringService};
use super::shapley::CoalitionScorer;

/// Score used when the reply cannot be parsed
pub const FALLBACK_SCORE: u8 = 50;

pub const SYSTEM_INSTRUCTIONS: &str = "You are a consensus judge for a fact-checking network. \
Each following message summarizes one independent verifier's judgment of the same claim: \
how many sources confirm and refute it, the verifier's own correctness score (0-100) and \
its redacted explanation. Weigh the verifiers against each other and estimate how likely \
the claim is to be correct. Reply with a single integer between 0 and 100 and nothing else.";

#[derive(Debug, Default)]
pub struct AggregatorStats {
    calls: AtomicU64,
    degraded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub calls: u64,
    /// Calls answered with the fallback score
    pub degraded: u64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

pub struct ConsensusAggregator {
    scorer: Arc<dyn ScoringService>,
    fallback_score: u8,
    call_timeout: Duration,
    stats: AggregatorStats,
}

impl ConsensusAggregator {
    pub fn new(scorer: Arc<dyn ScoringService>, call_timeout: Duration) -> Self {
        Self {
            scorer,
            fallback_score: FALLBACK_SCORE,
            call_timeout,
            stats: AggregatorStats::default(),
        }
    }

    pub fn with_fallback_score(mut self, score: u8) -> Self {
        self.fallback_score = score.min(100);
        self
    }

    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Deterministic request for a coalition; members appear in address order
    pub fn build_request(coalition: &Coalition) -> ScoringRequest {
        let messages = coalition
            .values()
            .enumerate()
            .map(|(index, summary)| format!("Verifier {}:\n{}", index + 1, summary.describe()))
            .collect();

        ScoringRequest {
            system: SYSTEM_INSTRUCTIONS.to_string(),
            messages,
        }
    }

    /// Score a coalition. The empty coalition scores 0 without a call.
    pub async fn aggregate(&self, coalition: &Coalition) -> u8 {
        if coalition.is_empty() {
            return 0;
        }

        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let request = Self::build_request(coalition);

        let reply = match tokio::time::timeout(self.call_timeout, self.scorer.score(&request)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(members = coalition.len(), error = %e, "Scoring call failed, using fallback score");
                return self.degrade();
            }
            Err(_) => {
                warn!(
                    members = coalition.len(),
                    "Scoring call timed out after {:?}, using fallback score",
                    self.call_timeout
                );
                return self.degrade();
            }
        };

        match parse_score(&reply) {
            Some(score) => {
                let clamped = score.clamp(0, 100) as u8;
                debug!(members = coalition.len(), score = clamped, "Coalition scored");
                clamped
            }
            None => {
                warn!(reply = %reply, "Unparseable scoring reply, using fallback score");
                self.degrade()
            }
        }
    }

    fn degrade(&self) -> u8 {
        self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        self.fallback_score
    }
}

#[async_trait]
impl CoalitionScorer for ConsensusAggregator {
    async fn score_coalition(&self, coalition: &Coalition) -> u8 {
        self.aggregate(coalition).await
    }
}

/// Parse a bare integer reply (surrounding whitespace, quotes and a final
/// period are tolerated)
pub fn parse_score(reply: &str) -> Option<i64> {
    let trimmed = reply.trim().trim_matches('"').trim().trim_end_matches('.');
    trimmed.parse::<i64>().ok()
}

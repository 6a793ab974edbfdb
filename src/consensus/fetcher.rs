//! Verifier result retrieval
//!
//! Pulls each verifier's submission from the contract, normalizes it into a
//! [`Verdict`] and summarizes it. A verifier whose result cannot be fetched
//! within the retry budget is excluded from the coalition; the round carries
//! on with the remaining verifiers.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Coalition;
use super::summary::Summarizer;
use super::verdict::Verdict;
use crate::chain::{ChainClient, ChainError, RequestId, VerifierAddress};
use crate::retry::RetryPolicy;

/// A verifier left out of the coalition, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedVerifier {
    pub verifier: VerifierAddress,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub coalition: Coalition,
    pub excluded: Vec<ExcludedVerifier>,
}

pub struct ResultFetcher {
    chain: Arc<dyn ChainClient>,
    summarizer: Summarizer,
    retry: RetryPolicy,
    max_concurrent: usize,
}

impl ResultFetcher {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        summarizer: Summarizer,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            chain,
            summarizer,
            retry,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Fetch and summarize every listed verifier's result (duplicates ignored)
    pub async fn fetch_coalition(
        &self,
        request_id: &RequestId,
        verifiers: &[VerifierAddress],
    ) -> FetchOutcome {
        let unique: BTreeSet<VerifierAddress> = verifiers.iter().cloned().collect();
        if unique.len() != verifiers.len() {
            warn!(
                request_id = %request_id,
                listed = verifiers.len(),
                unique = unique.len(),
                "Duplicate verifiers in event, ignoring repeats"
            );
        }

        let results: Vec<(VerifierAddress, anyhow::Result<Verdict>)> = stream::iter(unique)
            .map(|verifier| async move {
                let verdict = self.fetch_verdict(request_id, &verifier).await;
                (verifier, verdict)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut outcome = FetchOutcome::default();
        for (verifier, result) in results {
            match result {
                Ok(verdict) => {
                    debug!(request_id = %request_id, verifier = %verifier, "Fetched verifier result");
                    outcome
                        .coalition
                        .insert(verifier, self.summarizer.summarize(&verdict));
                }
                Err(e) => {
                    warn!(
                        request_id = %request_id,
                        verifier = %verifier,
                        error = %e,
                        "Excluding verifier from coalition"
                    );
                    outcome.excluded.push(ExcludedVerifier {
                        verifier,
                        reason: e.to_string(),
                    });
                }
            }
        }
        outcome.excluded.sort_by(|a, b| a.verifier.cmp(&b.verifier));

        info!(
            request_id = %request_id,
            included = outcome.coalition.len(),
            excluded = outcome.excluded.len(),
            "Verifier results fetched"
        );
        outcome
    }

    async fn fetch_verdict(
        &self,
        request_id: &RequestId,
        verifier: &VerifierAddress,
    ) -> anyhow::Result<Verdict> {
        let label = format!("getVerifierResult({}, {})", request_id, verifier);
        let raw = self
            .retry
            .run(&label, || async {
                let raw = self.chain.verifier_result(request_id, verifier).await?;
                if raw.trim().is_empty() {
                    return Err(ChainError::Decode("empty submission".to_string()));
                }
                Ok(raw)
            })
            .await?;
        Ok(Verdict::parse(&raw))
    }
}

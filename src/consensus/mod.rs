//! Consensus Pipeline
//!
//! Verifier results flow leaves-first through this module:
//!
//! ```text
//! ResultFetcher -> Summarizer -> ConsensusAggregator -> ShapleyEngine
//!  (chain reads)   (redaction)    (one scoring call)    (attribution)
//! ```
//!
//! The aggregator is the only component that talks to the scoring service,
//! and the Shapley engine only sees it through [`CoalitionScorer`], so both
//! can be exercised with deterministic stubs.

pub mod aggregator;
pub mod fetcher;
pub mod scoring;
pub mod shapley;
pub mod summary;
pub mod verdict;

pub use aggregator::{AggregatorStatsSnapshot, ConsensusAggregator, FALLBACK_SCORE};
pub use fetcher::{ExcludedVerifier, FetchOutcome, ResultFetcher};
pub use scoring::{OpenRouterClient, ScoringRequest, ScoringService};
pub use shapley::{Attribution, AttributionStrategy, CoalitionScorer, ShapleyEngine};
pub use summary::{Summarizer, Summary};
pub use verdict::Verdict;

use std::collections::BTreeMap;

use crate::chain::VerifierAddress;

/// A subset of the round's verifiers with their summaries, in address order
pub type Coalition = BTreeMap<VerifierAddress, Summary>;

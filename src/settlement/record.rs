//! Settlement records
//!
//! One [`SettlementRecord`] per request id. It is created when the
//! `ThresholdReached` event is first seen, mutated only by the coordinator
//! and persisted after every change, so a restarted process resumes exactly
//! where the previous one stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::chain::{RequestId, SentTransaction, ThresholdEvent, TxHash, VerifierAddress};
use crate::consensus::{Attribution, Coalition, ExcludedVerifier};
use crate::rewards::Allocation;

/// Step of the pipeline a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStage {
    Fetching,
    Submitting,
    Withdrawing,
    Allocating,
    Disbursing,
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettlementStage::Fetching => "fetching",
            SettlementStage::Submitting => "submitting",
            SettlementStage::Withdrawing => "withdrawing",
            SettlementStage::Allocating => "allocating",
            SettlementStage::Disbursing => "disbursing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SettlementState {
    Detected,
    ResultsFetched,
    ScoreSubmitted,
    FeesWithdrawn,
    Allocated,
    Disbursed { complete: bool },
    Complete,
    Failed { stage: SettlementStage, reason: String },
}

impl SettlementState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementState::Complete | SettlementState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettlementState::Detected => "detected",
            SettlementState::ResultsFetched => "results_fetched",
            SettlementState::ScoreSubmitted => "score_submitted",
            SettlementState::FeesWithdrawn => "fees_withdrawn",
            SettlementState::Allocated => "allocated",
            SettlementState::Disbursed { complete: false } => "disbursed_partial",
            SettlementState::Disbursed { complete: true } => "disbursed_complete",
            SettlementState::Complete => "complete",
            SettlementState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementState::Failed { stage, reason } => {
                write!(f, "failed at {}: {}", stage, reason)
            }
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed { block_number: u64 },
}

/// A transaction recorded before its receipt is awaited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTx {
    pub tx_hash: TxHash,
    pub nonce: u64,
    pub status: TxStatus,
    pub sent_at: DateTime<Utc>,
}

impl TrackedTx {
    pub fn pending(sent: SentTransaction) -> Self {
        Self {
            tx_hash: sent.tx_hash,
            nonce: sent.nonce,
            status: TxStatus::Pending,
            sent_at: Utc::now(),
        }
    }

    pub fn confirm(&mut self, block_number: u64) {
        self.status = TxStatus::Confirmed { block_number };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    /// Nonce reserved and persisted; whether the node took the transfer is
    /// not known yet
    Unconfirmed {
        nonce: u64,
        last_error: Option<String>,
    },
    Sent { tx_hash: TxHash, nonce: u64 },
    PendingRetry { last_error: String },
    /// Hash and block are unknown when the transfer was settled from the
    /// account nonce after its send response was lost
    Paid {
        nonce: u64,
        tx_hash: Option<TxHash>,
        block_number: Option<u64>,
    },
    /// Zero share, nothing to send
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub amount: u128,
    pub status: PayoutStatus,
    pub attempts: u32,
    /// Digest of request id + verifier; stable across retries
    pub payout_key: String,
}

impl Payout {
    pub fn new(request_id: &RequestId, verifier: &VerifierAddress, amount: u128) -> Self {
        Self {
            amount,
            status: if amount == 0 {
                PayoutStatus::Skipped
            } else {
                PayoutStatus::Pending
            },
            attempts: 0,
            payout_key: payout_key(request_id, verifier),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, PayoutStatus::Paid { .. } | PayoutStatus::Skipped)
    }
}

pub fn payout_key(request_id: &RequestId, verifier: &VerifierAddress) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(verifier.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub request_id: RequestId,
    /// Verifier list as emitted by the event
    pub verifiers: Vec<VerifierAddress>,
    pub detected_block: u64,
    pub state: SettlementState,
    pub coalition: Coalition,
    pub excluded: Vec<ExcludedVerifier>,
    pub aggregate_score: Option<u8>,
    pub payload: Option<String>,
    pub submission_tx: Option<TrackedTx>,
    pub submission_attempts: u32,
    pub withdrawal_tx: Option<TrackedTx>,
    pub withdrawal_attempts: u32,
    pub balance_before: Option<u128>,
    pub balance_after: Option<u128>,
    pub attribution: Option<Attribution>,
    pub allocation: Option<Allocation>,
    pub payouts: BTreeMap<VerifierAddress, Payout>,
    /// Nonces of reverted transactions that were rebuilt and are no longer tracked
    #[serde(default)]
    pub spent_nonces: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn detected(event: &ThresholdEvent) -> Self {
        let now = Utc::now();
        Self {
            request_id: event.request_id.clone(),
            verifiers: event.verifiers.clone(),
            detected_block: event.block_number,
            state: SettlementState::Detected,
            coalition: Coalition::new(),
            excluded: Vec::new(),
            aggregate_score: None,
            payload: None,
            submission_tx: None,
            submission_attempts: 0,
            withdrawal_tx: None,
            withdrawal_attempts: 0,
            balance_before: None,
            balance_after: None,
            attribution: None,
            allocation: None,
            payouts: BTreeMap::new(),
            spent_nonces: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, state: SettlementState) {
        self.state = state;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Observed withdrawal: post minus pre balance
    pub fn withdrawn_amount(&self) -> Option<i128> {
        let before = i128::try_from(self.balance_before?).ok()?;
        let after = i128::try_from(self.balance_after?).ok()?;
        Some(after - before)
    }

    /// Whether this round may be holding withdrawn but undistributed funds
    pub fn holds_withdrawn_funds(&self) -> bool {
        match self.state {
            SettlementState::ScoreSubmitted => self.withdrawal_tx.is_some(),
            SettlementState::FeesWithdrawn
            | SettlementState::Allocated
            | SettlementState::Disbursed { complete: false } => true,
            _ => false,
        }
    }

    /// Whether one of this round's own transactions was sent with `nonce`
    pub fn claims_nonce(&self, nonce: u64) -> bool {
        let tracked = |tx: &Option<TrackedTx>| tx.as_ref().is_some_and(|tx| tx.nonce == nonce);

        self.spent_nonces.contains(&nonce)
            || tracked(&self.submission_tx)
            || tracked(&self.withdrawal_tx)
            || self.payouts.values().any(|payout| match &payout.status {
                PayoutStatus::Sent { nonce: sent, .. } | PayoutStatus::Paid { nonce: sent, .. } => {
                    *sent == nonce
                }
                _ => false,
            })
    }

    pub fn outstanding_payouts(&self) -> usize {
        self.payouts.values().filter(|p| !p.is_settled()).count()
    }
}

//! Settlement Coordinator
//!
//! Drives one request through
//!
//! ```text
//! Detected -> ResultsFetched -> ScoreSubmitted -> FeesWithdrawn -> Allocated
//!          -> Disbursed(partial | complete) -> Complete
//! ```
//!
//! with `Failed(stage, reason)` reachable from every non-terminal state.
//! The record is persisted after every change. Transaction hashes and
//! nonces are written before their receipts are awaited, so a resumed round
//! reconciles what is already on chain instead of sending it again.
//! Payouts go one step further: the nonce is reserved and persisted before
//! the broadcast, so a send whose response is lost is settled from the
//! account nonce rather than repeated.
//!
//! Withdrawing and disbursing share the aggregator's balance across
//! rounds, so that window is serialized: a process-wide lock plus a check
//! that no persisted record still holds withdrawn funds.

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, error, info, warn};

use super::record::{
    Payout, PayoutStatus, SettlementRecord, SettlementStage, SettlementState, TrackedTx, TxStatus,
};
use super::store::SettlementStore;
use crate::chain::{
    ChainClient, ChainError, RequestId, ThresholdEvent, TxReceipt, VerifierAddress,
    wait_for_receipt,
};
use crate::config::ConsensusConfig;
use crate::consensus::summary::MAX_LINKS_PER_SIDE;
use crate::consensus::{Coalition, ConsensusAggregator, ResultFetcher, ShapleyEngine, Summarizer};
use crate::retry::RetryPolicy;
use crate::rewards::{Allocation, RewardAllocator};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Per-verifier result reads
    pub fetch_retry: RetryPolicy,
    /// Transaction sends (RPC-level failures)
    pub send_retry: RetryPolicy,
    /// Rebuilds of a reverted or dropped submission / withdrawal
    pub max_tx_attempts: u32,
    pub max_payout_attempts: u32,
    pub call_timeout: Duration,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub max_concurrent_fetches: usize,
    pub summarizer: Summarizer,
    pub engine: ShapleyEngine,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            fetch_retry: RetryPolicy::default(),
            send_retry: RetryPolicy::default(),
            max_tx_attempts: 3,
            max_payout_attempts: 3,
            call_timeout: Duration::from_secs(15),
            receipt_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_secs(2),
            max_concurrent_fetches: 4,
            summarizer: Summarizer::default(),
            engine: ShapleyEngine::default(),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &ConsensusConfig) -> Self {
        let settlement = &config.settlement;
        let retry = |max_attempts: u32| RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(settlement.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(settlement.retry_max_backoff_ms),
            attempt_timeout: Duration::from_secs(settlement.call_timeout_secs),
        };

        Self {
            fetch_retry: retry(settlement.fetch_max_attempts),
            send_retry: retry(settlement.send_max_attempts),
            max_tx_attempts: settlement.max_tx_attempts,
            max_payout_attempts: settlement.max_payout_attempts,
            call_timeout: Duration::from_secs(settlement.call_timeout_secs),
            receipt_timeout: Duration::from_secs(settlement.receipt_timeout_secs),
            receipt_poll_interval: Duration::from_millis(settlement.receipt_poll_interval_ms),
            max_concurrent_fetches: settlement.max_concurrent_fetches,
            summarizer: Summarizer::new(config.scoring.max_response_chars),
            engine: ShapleyEngine::from_config(&config.attribution),
        }
    }
}

/// Result of feeding one `ThresholdReached` event to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// First sighting; the round was driven as far as it could go
    Started(SettlementState),
    /// Already known; ignored
    Duplicate,
}

/// What a single step did
enum Progress {
    /// The record changed; keep driving
    Advanced(SettlementRecord),
    /// Waiting on something external; resume on a later tick
    Blocked(SettlementRecord, String),
}

/// What became of a tracked transaction
enum TxProgress {
    Confirmed(TxReceipt),
    Reverted(TxReceipt),
    /// Nonce consumed, but not by this hash
    Dropped,
    Pending(String),
}

/// Result of broadcasting one payout
enum PayoutSend {
    Settled,
    AwaitingReceipt,
    /// Outcome unknown; left `Unconfirmed` on its reserved nonce
    Failed,
}

/// What the chain says about a payout's reserved nonce
enum NonceEvidence {
    /// Consumed, and no other recorded transaction holds it
    Landed,
    /// Safe to rebuild on a fresh nonce
    Free(String),
    /// Not decidable yet
    Pending(String),
}

pub struct SettlementCoordinator {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn SettlementStore>,
    fetcher: ResultFetcher,
    aggregator: Arc<ConsensusAggregator>,
    engine: ShapleyEngine,
    allocator: RewardAllocator,
    settings: CoordinatorSettings,
    funds_lock: Mutex<()>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SettlementCoordinator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn SettlementStore>,
        aggregator: Arc<ConsensusAggregator>,
        settings: CoordinatorSettings,
    ) -> Self {
        let fetcher = ResultFetcher::new(
            chain.clone(),
            settings.summarizer.clone(),
            settings.fetch_retry.clone(),
            settings.max_concurrent_fetches,
        );

        Self {
            chain,
            store,
            fetcher,
            aggregator,
            engine: settings.engine.clone(),
            allocator: RewardAllocator::new(),
            settings,
            funds_lock: Mutex::new(()),
            shutdown: None,
        }
    }

    /// Stop between state transitions once `true` is sent
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<ConsensusAggregator> {
        &self.aggregator
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// Register a detected event and drive the new round.
    ///
    /// A request id that already has a record is ignored, whatever its state.
    pub async fn handle_event(&self, event: &ThresholdEvent) -> Result<EventOutcome> {
        let record = SettlementRecord::detected(event);
        let inserted = self
            .store
            .insert_new(&record)
            .await
            .context("Failed to persist new settlement record")?;

        if !inserted {
            info!(request_id = %event.request_id, "Duplicate ThresholdReached event ignored");
            return Ok(EventOutcome::Duplicate);
        }

        info!(
            request_id = %event.request_id,
            verifiers = event.verifiers.len(),
            block = event.block_number,
            "New settlement round detected"
        );

        let state = self.drive(&event.request_id).await?;
        Ok(EventOutcome::Started(state))
    }

    /// Advance a round until it is terminal, blocked, or shutdown is requested
    pub async fn drive(&self, request_id: &RequestId) -> Result<SettlementState> {
        let mut funds_guard: Option<MutexGuard<'_, ()>> = None;

        loop {
            let record = self
                .store
                .load(request_id)
                .await?
                .ok_or_else(|| anyhow!("No settlement record for request {}", request_id))?;

            if record.state.is_terminal() {
                return Ok(record.state);
            }

            if self.shutdown_requested() {
                info!(request_id = %request_id, state = %record.state, "Shutdown requested, pausing round");
                return Ok(record.state);
            }

            if needs_funds_window(&record.state) && funds_guard.is_none() {
                let guard = self.funds_lock.lock().await;
                if let Some(holder) = self.other_funds_holder(&record).await? {
                    info!(
                        request_id = %request_id,
                        holder = %holder,
                        "Another round holds withdrawn funds, waiting"
                    );
                    return Ok(record.state);
                }
                funds_guard = Some(guard);
            }

            let from = record.state.clone();
            match self.step(record).await? {
                Progress::Advanced(record) => {
                    debug!(
                        request_id = %request_id,
                        from = %from,
                        to = %record.state,
                        "Settlement step complete"
                    );
                }
                Progress::Blocked(record, reason) => {
                    info!(
                        request_id = %request_id,
                        state = %record.state,
                        reason = %reason,
                        "Settlement round blocked, will resume later"
                    );
                    return Ok(record.state);
                }
            }
        }
    }

    async fn other_funds_holder(&self, current: &SettlementRecord) -> Result<Option<RequestId>> {
        let open = self.store.list_open().await?;
        Ok(open
            .into_iter()
            .find(|r| r.request_id != current.request_id && r.holds_withdrawn_funds())
            .map(|r| r.request_id))
    }

    async fn step(&self, record: SettlementRecord) -> Result<Progress> {
        match record.state.clone() {
            SettlementState::Detected => self.fetch_results(record).await,
            SettlementState::ResultsFetched => self.submit_score(record).await,
            SettlementState::ScoreSubmitted => self.withdraw_fees(record).await,
            SettlementState::FeesWithdrawn => self.allocate(record).await,
            SettlementState::Allocated | SettlementState::Disbursed { complete: false } => {
                self.disburse(record).await
            }
            SettlementState::Disbursed { complete: true } => {
                let mut record = record;
                record.transition(SettlementState::Complete);
                self.store.save(&record).await?;
                info!(request_id = %record.request_id, "Settlement complete");
                Ok(Progress::Advanced(record))
            }
            SettlementState::Complete | SettlementState::Failed { .. } => {
                Ok(Progress::Blocked(record, "terminal".to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Detected -> ResultsFetched
    // ------------------------------------------------------------------

    async fn fetch_results(&self, mut record: SettlementRecord) -> Result<Progress> {
        let outcome = self
            .fetcher
            .fetch_coalition(&record.request_id, &record.verifiers)
            .await;

        record.excluded = outcome.excluded;
        record.coalition = outcome.coalition;

        if record.coalition.is_empty() {
            return self
                .fail(record, SettlementStage::Fetching, "no verifier results could be fetched")
                .await;
        }

        record.transition(SettlementState::ResultsFetched);
        self.store.save(&record).await?;
        Ok(Progress::Advanced(record))
    }

    // ------------------------------------------------------------------
    // ResultsFetched -> ScoreSubmitted
    // ------------------------------------------------------------------

    async fn submit_score(&self, mut record: SettlementRecord) -> Result<Progress> {
        if let Some(tx) = record.submission_tx.clone() {
            return match self.confirm_transaction(&tx).await {
                TxProgress::Confirmed(receipt) => {
                    if let Some(tracked) = record.submission_tx.as_mut() {
                        tracked.confirm(receipt.block_number);
                    }
                    record.transition(SettlementState::ScoreSubmitted);
                    self.store.save(&record).await?;
                    info!(
                        request_id = %record.request_id,
                        tx_hash = %receipt.tx_hash,
                        score = ?record.aggregate_score,
                        "Aggregate result submitted"
                    );
                    Ok(Progress::Advanced(record))
                }
                TxProgress::Reverted(receipt) => {
                    record.spent_nonces.push(tx.nonce);
                    self.rebuild_or_fail(
                        record,
                        SettlementStage::Submitting,
                        format!("submission {} reverted", receipt.tx_hash),
                    )
                    .await
                }
                TxProgress::Dropped => {
                    self.chain.release_nonces().await;
                    self.rebuild_or_fail(
                        record,
                        SettlementStage::Submitting,
                        format!("submission {} dropped", tx.tx_hash),
                    )
                    .await
                }
                TxProgress::Pending(reason) => Ok(Progress::Blocked(record, reason)),
            };
        }

        // Score once per round; a rebuilt transaction carries the same payload
        let payload = match record.payload.clone() {
            Some(payload) => payload,
            None => {
                let score = self.aggregator.aggregate(&record.coalition).await;
                let payload = build_payload(score, &record.coalition);
                record.aggregate_score = Some(score);
                record.payload = Some(payload.clone());
                record.touch();
                self.store.save(&record).await?;
                payload
            }
        };

        let request_id = record.request_id.clone();
        let sent = self
            .settings
            .send_retry
            .run("submitAggregateResult", || {
                self.chain.submit_aggregate_result(&request_id, &payload)
            })
            .await;

        match sent {
            Ok(sent) => {
                record.submission_attempts += 1;
                record.submission_tx = Some(TrackedTx::pending(sent));
                record.touch();
                self.store.save(&record).await?;
                Ok(Progress::Advanced(record))
            }
            Err(e) => self.fail(record, SettlementStage::Submitting, &e.to_string()).await,
        }
    }

    // ------------------------------------------------------------------
    // ScoreSubmitted -> FeesWithdrawn
    // ------------------------------------------------------------------

    async fn withdraw_fees(&self, mut record: SettlementRecord) -> Result<Progress> {
        let aggregator = self.chain.aggregator_address().clone();

        if let Some(tx) = record.withdrawal_tx.clone() {
            return match self.confirm_transaction(&tx).await {
                TxProgress::Confirmed(receipt) => {
                    let after = match self
                        .with_timeout("eth_getBalance", self.chain.balance(&aggregator))
                        .await
                    {
                        Ok(balance) => balance,
                        Err(e) => return Ok(Progress::Blocked(record, e.to_string())),
                    };

                    if let Some(tracked) = record.withdrawal_tx.as_mut() {
                        tracked.confirm(receipt.block_number);
                    }
                    record.balance_after = Some(after);
                    record.transition(SettlementState::FeesWithdrawn);
                    self.store.save(&record).await?;
                    info!(
                        request_id = %record.request_id,
                        tx_hash = %receipt.tx_hash,
                        withdrawn = ?record.withdrawn_amount(),
                        "Fees withdrawn"
                    );
                    Ok(Progress::Advanced(record))
                }
                TxProgress::Reverted(receipt) => {
                    record.spent_nonces.push(tx.nonce);
                    self.rebuild_or_fail(
                        record,
                        SettlementStage::Withdrawing,
                        format!("withdrawal {} reverted", receipt.tx_hash),
                    )
                    .await
                }
                TxProgress::Dropped => {
                    self.chain.release_nonces().await;
                    self.rebuild_or_fail(
                        record,
                        SettlementStage::Withdrawing,
                        format!("withdrawal {} dropped", tx.tx_hash),
                    )
                    .await
                }
                TxProgress::Pending(reason) => Ok(Progress::Blocked(record, reason)),
            };
        }

        // Balance is re-read before every attempt: a reverted attempt still costs gas
        let before = match self
            .with_timeout("eth_getBalance", self.chain.balance(&aggregator))
            .await
        {
            Ok(balance) => balance,
            Err(e) => return Ok(Progress::Blocked(record, e.to_string())),
        };
        record.balance_before = Some(before);

        let sent = self
            .settings
            .send_retry
            .run("withdrawFees", || self.chain.withdraw_fees())
            .await;

        match sent {
            Ok(sent) => {
                record.withdrawal_attempts += 1;
                record.withdrawal_tx = Some(TrackedTx::pending(sent));
                record.touch();
                self.store.save(&record).await?;
                Ok(Progress::Advanced(record))
            }
            Err(e) => self.fail(record, SettlementStage::Withdrawing, &e.to_string()).await,
        }
    }

    // ------------------------------------------------------------------
    // FeesWithdrawn -> Allocated
    // ------------------------------------------------------------------

    async fn allocate(&self, mut record: SettlementRecord) -> Result<Progress> {
        let Some(withdrawn) = record.withdrawn_amount() else {
            return self
                .fail(record, SettlementStage::Allocating, "withdrawal balances missing")
                .await;
        };

        let attribution = match record.attribution.clone() {
            Some(attribution) => attribution,
            None => {
                let attribution = self
                    .engine
                    .attribute(self.aggregator.as_ref(), &record.coalition)
                    .await;
                record.attribution = Some(attribution.clone());
                record.touch();
                self.store.save(&record).await?;
                attribution
            }
        };

        let allocation = match self.allocator.allocate(&attribution.weights, withdrawn) {
            Ok(allocation) => allocation,
            Err(e) => {
                return self
                    .fail(record, SettlementStage::Allocating, &e.to_string())
                    .await;
            }
        };

        record.payouts = match &allocation {
            Allocation::NothingToDistribute => {
                info!(
                    request_id = %record.request_id,
                    withdrawn,
                    "Nothing to distribute, skipping transfers"
                );
                Default::default()
            }
            Allocation::Shares { shares, .. } => shares
                .iter()
                .map(|(verifier, amount)| {
                    (
                        verifier.clone(),
                        Payout::new(&record.request_id, verifier, *amount),
                    )
                })
                .collect(),
        };

        info!(
            request_id = %record.request_id,
            withdrawn,
            distributed = allocation.distributed(),
            payouts = record.payouts.len(),
            "Rewards allocated"
        );

        record.allocation = Some(allocation);
        record.transition(SettlementState::Allocated);
        self.store.save(&record).await?;
        Ok(Progress::Advanced(record))
    }

    // ------------------------------------------------------------------
    // Allocated -> Disbursed
    // ------------------------------------------------------------------

    async fn disburse(&self, mut record: SettlementRecord) -> Result<Progress> {
        let verifiers: Vec<_> = record.payouts.keys().cloned().collect();
        let mut awaiting_receipt = false;
        let mut retry_later = false;
        // After one failed broadcast the rest wait for the next pass
        let mut sends_halted = false;

        for verifier in verifiers {
            let Some(payout) = record.payouts.get(&verifier).cloned() else {
                continue;
            };

            match payout.status {
                PayoutStatus::Paid { .. } | PayoutStatus::Skipped => continue,
                PayoutStatus::Sent { tx_hash, nonce } => {
                    let tracked = TrackedTx {
                        tx_hash,
                        nonce,
                        status: TxStatus::Pending,
                        sent_at: record.updated_at,
                    };
                    let progress = self.confirm_transaction(&tracked).await;
                    if !self
                        .apply_payout_progress(&mut record, &verifier, nonce, progress)
                        .await?
                    {
                        awaiting_receipt = true;
                    }
                    self.store.save(&record).await?;
                    continue;
                }
                PayoutStatus::Unconfirmed { nonce, .. } => {
                    match self.nonce_evidence(&record, nonce).await? {
                        NonceEvidence::Landed => {
                            self.settle_from_nonce(&mut record, &verifier, nonce);
                            self.store.save(&record).await?;
                            continue;
                        }
                        NonceEvidence::Pending(reason) => {
                            debug!(
                                request_id = %record.request_id,
                                verifier = %verifier,
                                nonce,
                                reason = %reason,
                                "Unconfirmed payout still undecided"
                            );
                            awaiting_receipt = true;
                            continue;
                        }
                        NonceEvidence::Free(reason) => {
                            self.chain.release_nonces().await;
                            if let Some(entry) = record.payouts.get_mut(&verifier) {
                                entry.status = PayoutStatus::PendingRetry { last_error: reason };
                            }
                            record.touch();
                            self.store.save(&record).await?;
                        }
                    }
                }
                PayoutStatus::Pending | PayoutStatus::PendingRetry { .. } => {}
            }

            let attempts = record.payouts.get(&verifier).map_or(0, |p| p.attempts);
            if sends_halted || attempts >= self.settings.max_payout_attempts {
                continue;
            }

            match self.send_payout(&mut record, &verifier).await? {
                PayoutSend::Settled => {}
                PayoutSend::AwaitingReceipt => awaiting_receipt = true,
                PayoutSend::Failed => {
                    retry_later = true;
                    sends_halted = true;
                }
            }

            if let Some(entry) = record.payouts.get(&verifier)
                && matches!(entry.status, PayoutStatus::PendingRetry { .. })
            {
                retry_later = true;
            }
        }

        let outstanding = record.outstanding_payouts();
        if outstanding == 0 {
            record.transition(SettlementState::Disbursed { complete: true });
            self.store.save(&record).await?;
            info!(
                request_id = %record.request_id,
                payouts = record.payouts.len(),
                "All payouts settled"
            );
            return Ok(Progress::Advanced(record));
        }

        let exhausted = record.payouts.iter().find(|(_, p)| {
            matches!(p.status, PayoutStatus::PendingRetry { .. })
                && p.attempts >= self.settings.max_payout_attempts
        });
        if !awaiting_receipt && let Some((verifier, payout)) = exhausted {
            let reason = format!(
                "payout to {} failed after {} attempts",
                verifier, payout.attempts
            );
            return self.fail(record, SettlementStage::Disbursing, &reason).await;
        }

        let first_pass = record.state == SettlementState::Allocated;
        record.transition(SettlementState::Disbursed { complete: false });
        self.store.save(&record).await?;

        if awaiting_receipt {
            return Ok(Progress::Blocked(
                record,
                format!("{} payouts awaiting confirmation", outstanding),
            ));
        }

        if retry_later {
            let attempt = record
                .payouts
                .values()
                .map(|p| p.attempts)
                .max()
                .unwrap_or(1);
            tokio::time::sleep(self.settings.send_retry.backoff(attempt)).await;
        }

        if first_pass || retry_later {
            return Ok(Progress::Advanced(record));
        }

        Ok(Progress::Blocked(
            record,
            format!("{} payouts outstanding", outstanding),
        ))
    }

    /// Reserve a nonce, persist it with the payout, then broadcast.
    ///
    /// Once the nonce is on record the transfer is never rebuilt on another
    /// nonce until [`nonce_evidence`](Self::nonce_evidence) shows the first
    /// one cannot have carried it.
    async fn send_payout(
        &self,
        record: &mut SettlementRecord,
        verifier: &VerifierAddress,
    ) -> Result<PayoutSend> {
        let nonce = match self
            .with_timeout("reserve nonce", self.chain.reserve_nonce())
            .await
        {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(request_id = %record.request_id, verifier = %verifier, error = %e, "Could not reserve payout nonce");
                return Ok(PayoutSend::Failed);
            }
        };

        let Some(entry) = record.payouts.get_mut(verifier) else {
            return Ok(PayoutSend::Settled);
        };
        entry.attempts += 1;
        entry.status = PayoutStatus::Unconfirmed {
            nonce,
            last_error: None,
        };
        let amount = entry.amount;
        let attempt = entry.attempts;
        let payout_key = entry.payout_key.clone();
        record.touch();
        // Written ahead of the broadcast
        self.store.save(record).await?;

        let sent = self
            .with_timeout("transfer", self.chain.transfer(verifier, amount, nonce))
            .await;

        let sent = match sent {
            Ok(sent) => sent,
            Err(e) => {
                warn!(
                    request_id = %record.request_id,
                    verifier = %verifier,
                    payout_key = %payout_key,
                    nonce,
                    attempt,
                    error = %e,
                    "Payout send failed, outcome left to the account nonce"
                );
                if let Some(entry) = record.payouts.get_mut(verifier) {
                    entry.status = PayoutStatus::Unconfirmed {
                        nonce,
                        last_error: Some(e.to_string()),
                    };
                }
                record.touch();
                self.store.save(record).await?;
                return Ok(PayoutSend::Failed);
            }
        };

        debug!(
            request_id = %record.request_id,
            verifier = %verifier,
            payout_key = %payout_key,
            tx_hash = %sent.tx_hash,
            nonce,
            amount = %amount,
            "Payout sent"
        );
        if let Some(entry) = record.payouts.get_mut(verifier) {
            entry.status = PayoutStatus::Sent {
                tx_hash: sent.tx_hash.clone(),
                nonce,
            };
        }
        record.touch();
        self.store.save(record).await?;

        let progress = self.confirm_transaction(&TrackedTx::pending(sent)).await;
        let settled = self
            .apply_payout_progress(record, verifier, nonce, progress)
            .await?;
        self.store.save(record).await?;

        Ok(if settled {
            PayoutSend::Settled
        } else {
            PayoutSend::AwaitingReceipt
        })
    }

    /// Decide what became of a payout's reserved nonce.
    ///
    /// A consumed nonce belongs to this payout unless another recorded
    /// transaction holds it; every broadcast made on it carried this transfer.
    async fn nonce_evidence(&self, record: &SettlementRecord, nonce: u64) -> Result<NonceEvidence> {
        let confirmed = match self
            .with_timeout("eth_getTransactionCount", self.chain.confirmed_nonce())
            .await
        {
            Ok(confirmed) => confirmed,
            Err(e) => return Ok(NonceEvidence::Pending(format!("nonce lookup failed: {}", e))),
        };

        if confirmed > nonce {
            return Ok(match self.nonce_holder(record, nonce).await? {
                Some(holder) => {
                    NonceEvidence::Free(format!("nonce {} used by round {}", nonce, holder))
                }
                None => NonceEvidence::Landed,
            });
        }

        let pending = match self
            .with_timeout("eth_getTransactionCount", self.chain.pending_nonce())
            .await
        {
            Ok(pending) => pending,
            Err(e) => return Ok(NonceEvidence::Pending(format!("nonce lookup failed: {}", e))),
        };

        if pending > nonce {
            return Ok(NonceEvidence::Pending(format!(
                "nonce {} is held in the node's pool",
                nonce
            )));
        }

        Ok(NonceEvidence::Free(format!("nonce {} never reached the node", nonce)))
    }

    /// Round whose recorded transactions include `nonce`, if any
    async fn nonce_holder(&self, current: &SettlementRecord, nonce: u64) -> Result<Option<RequestId>> {
        if current.claims_nonce(nonce) {
            return Ok(Some(current.request_id.clone()));
        }

        let records = self.store.list().await?;
        Ok(records
            .into_iter()
            .find(|r| r.request_id != current.request_id && r.claims_nonce(nonce))
            .map(|r| r.request_id))
    }

    fn settle_from_nonce(&self, record: &mut SettlementRecord, verifier: &VerifierAddress, nonce: u64) {
        let request_id = record.request_id.clone();
        let Some(entry) = record.payouts.get_mut(verifier) else {
            return;
        };

        warn!(
            request_id = %request_id,
            verifier = %verifier,
            amount = %entry.amount,
            nonce,
            "Payout settled from the account nonce, transaction hash unknown"
        );
        entry.status = PayoutStatus::Paid {
            nonce,
            tx_hash: None,
            block_number: None,
        };
        record.touch();
    }

    /// Record the outcome of a payout transaction.
    ///
    /// Returns `false` while the transaction is still pending.
    async fn apply_payout_progress(
        &self,
        record: &mut SettlementRecord,
        verifier: &VerifierAddress,
        nonce: u64,
        progress: TxProgress,
    ) -> Result<bool> {
        let request_id = record.request_id.clone();

        match progress {
            TxProgress::Confirmed(receipt) => {
                if let Some(entry) = record.payouts.get_mut(verifier) {
                    info!(
                        request_id = %request_id,
                        verifier = %verifier,
                        amount = %entry.amount,
                        tx_hash = %receipt.tx_hash,
                        "Payout confirmed"
                    );
                    entry.status = PayoutStatus::Paid {
                        nonce,
                        tx_hash: Some(receipt.tx_hash),
                        block_number: Some(receipt.block_number),
                    };
                }
            }
            TxProgress::Reverted(receipt) => {
                warn!(
                    request_id = %request_id,
                    verifier = %verifier,
                    tx_hash = %receipt.tx_hash,
                    "Payout reverted, marked for retry"
                );
                record.spent_nonces.push(nonce);
                if let Some(entry) = record.payouts.get_mut(verifier) {
                    entry.status = PayoutStatus::PendingRetry {
                        last_error: format!("transfer {} reverted", receipt.tx_hash),
                    };
                }
            }
            TxProgress::Dropped => {
                // No longer evidence of its own nonce
                if let Some(entry) = record.payouts.get_mut(verifier) {
                    entry.status = PayoutStatus::Unconfirmed {
                        nonce,
                        last_error: Some("transfer dropped".to_string()),
                    };
                }
                match self.nonce_holder(record, nonce).await? {
                    Some(holder) => {
                        warn!(
                            request_id = %request_id,
                            verifier = %verifier,
                            nonce,
                            holder = %holder,
                            "Payout dropped, marked for retry"
                        );
                        self.chain.release_nonces().await;
                        if let Some(entry) = record.payouts.get_mut(verifier) {
                            entry.status = PayoutStatus::PendingRetry {
                                last_error: format!("transfer dropped, nonce {} used by {}", nonce, holder),
                            };
                        }
                    }
                    None => self.settle_from_nonce(record, verifier, nonce),
                }
            }
            TxProgress::Pending(reason) => {
                debug!(request_id = %request_id, verifier = %verifier, reason = %reason, "Payout still pending");
                return Ok(false);
            }
        }

        record.touch();
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Clear a reverted/dropped transaction so the next step rebuilds it
    async fn rebuild_or_fail(
        &self,
        mut record: SettlementRecord,
        stage: SettlementStage,
        reason: String,
    ) -> Result<Progress> {
        let attempts = match stage {
            SettlementStage::Submitting => {
                record.submission_tx = None;
                record.submission_attempts
            }
            _ => {
                record.withdrawal_tx = None;
                record.withdrawal_attempts
            }
        };

        if attempts >= self.settings.max_tx_attempts {
            return self.fail(record, stage, &reason).await;
        }

        warn!(
            request_id = %record.request_id,
            stage = %stage,
            attempts,
            reason = %reason,
            "Transaction failed, rebuilding"
        );
        record.touch();
        self.store.save(&record).await?;
        Ok(Progress::Advanced(record))
    }

    async fn fail(
        &self,
        mut record: SettlementRecord,
        stage: SettlementStage,
        reason: &str,
    ) -> Result<Progress> {
        error!(
            request_id = %record.request_id,
            stage = %stage,
            reason = %reason,
            "Settlement round failed"
        );
        record.transition(SettlementState::Failed {
            stage,
            reason: reason.to_string(),
        });
        self.store.save(&record).await?;
        Ok(Progress::Advanced(record))
    }

    /// Resolve a tracked transaction: receipt, dropped, or still pending
    async fn confirm_transaction(&self, tx: &TrackedTx) -> TxProgress {
        let waited = tokio::time::timeout(
            self.settings.receipt_timeout + self.settings.call_timeout,
            wait_for_receipt(
                self.chain.as_ref(),
                &tx.tx_hash,
                self.settings.receipt_timeout,
                self.settings.receipt_poll_interval,
            ),
        )
        .await;

        match waited {
            Ok(Ok(receipt)) => return receipt_progress(receipt),
            Ok(Err(ChainError::Timeout(_))) | Err(_) => {}
            Ok(Err(e)) => return TxProgress::Pending(format!("receipt lookup failed: {}", e)),
        }

        // No receipt within the deadline: dropped only if the nonce moved past it
        let confirmed = match self
            .with_timeout("eth_getTransactionCount", self.chain.confirmed_nonce())
            .await
        {
            Ok(confirmed) => confirmed,
            Err(e) => return TxProgress::Pending(format!("nonce lookup failed: {}", e)),
        };

        if confirmed <= tx.nonce {
            return TxProgress::Pending(format!("no receipt yet for {}", tx.tx_hash));
        }

        match self
            .with_timeout(
                "eth_getTransactionReceipt",
                self.chain.transaction_receipt(&tx.tx_hash),
            )
            .await
        {
            Ok(Some(receipt)) => receipt_progress(receipt),
            Ok(None) => {
                warn!(tx_hash = %tx.tx_hash, nonce = tx.nonce, confirmed, "Transaction dropped");
                TxProgress::Dropped
            }
            Err(e) => TxProgress::Pending(format!("receipt lookup failed: {}", e)),
        }
    }

    async fn with_timeout<T>(
        &self,
        label: &str,
        call: impl Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ChainError> {
        tokio::time::timeout(self.settings.call_timeout, call)
            .await
            .map_err(|_| {
                ChainError::Timeout(format!("{} after {:?}", label, self.settings.call_timeout))
            })?
    }
}

fn needs_funds_window(state: &SettlementState) -> bool {
    matches!(
        state,
        SettlementState::ScoreSubmitted
            | SettlementState::FeesWithdrawn
            | SettlementState::Allocated
            | SettlementState::Disbursed { complete: false }
    )
}

fn receipt_progress(receipt: TxReceipt) -> TxProgress {
    if receipt.success {
        TxProgress::Confirmed(receipt)
    } else {
        TxProgress::Reverted(receipt)
    }
}

/// On-chain payload: score plus up to five links per side, in address order
pub fn build_payload(score: u8, coalition: &Coalition) -> String {
    json!({
        "aggregated_score": score,
        "supporting_links": first_links(coalition.values().map(|s| &s.supporting_links)),
        "opposing_links": first_links(coalition.values().map(|s| &s.opposing_links)),
    })
    .to_string()
}

fn first_links<'a>(lists: impl Iterator<Item = &'a Vec<String>>) -> Vec<&'a String> {
    let mut links: Vec<&String> = Vec::new();
    for link in lists.flatten() {
        if links.len() == MAX_LINKS_PER_SIDE {
            break;
        }
        if !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Address;
    use crate::consensus::Summary;

    fn summary(supporting: &[&str], opposing: &[&str]) -> Summary {
        Summary {
            confirming_count: supporting.len(),
            refuting_count: opposing.len(),
            correctness_score: 50,
            redacted_response: String::new(),
            supporting_links: supporting.iter().map(|s| s.to_string()).collect(),
            opposing_links: opposing.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_payload_schema_and_link_cap() {
        let mut coalition = Coalition::new();
        coalition.insert(
            Address::from_bytes([1; 20]),
            summary(&["https://a", "https://b", "https://c"], &["https://x"]),
        );
        coalition.insert(
            Address::from_bytes([2; 20]),
            summary(&["https://c", "https://d", "https://e", "https://f"], &[]),
        );

        let payload: serde_json::Value = serde_json::from_str(&build_payload(72, &coalition)).unwrap();
        assert_eq!(payload["aggregated_score"], 72);
        assert_eq!(
            payload["supporting_links"],
            json!(["https://a", "https://b", "https://c", "https://d", "https://e"])
        );
        assert_eq!(payload["opposing_links"], json!(["https://x"]));
    }

    #[test]
    fn test_funds_window_states() {
        assert!(!needs_funds_window(&SettlementState::ResultsFetched));
        assert!(needs_funds_window(&SettlementState::ScoreSubmitted));
        assert!(needs_funds_window(&SettlementState::Disbursed { complete: false }));
        assert!(!needs_funds_window(&SettlementState::Disbursed { complete: true }));
    }
}

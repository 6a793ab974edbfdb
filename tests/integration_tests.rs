//! Integration tests for the consensus oracle
//!
//! These tests drive whole settlement rounds against the in-memory chain
//! with deterministic scoring stubs: detection, scoring, submission,
//! withdrawal, attribution, allocation and disbursement, plus recovery
//! paths and the operator API.

use anyhow::Result;
use async_trait::async_trait;
use silica_consensus::chain::{SentTransaction, TxReceipt};
use silica_consensus::settlement::{EventOutcome, PayoutStatus, SettlementStage, TickSummary};
use silica_consensus::{
    Address, Allocation, AttributionStrategy, ChainClient, ChainError, Coalition,
    ConsensusAggregator, CoordinatorSettings, EventMonitor, InMemoryChain,
    InMemorySettlementStore, MonitorSettings, RequestId, RetryPolicy, ScoringRequest,
    ScoringService, SettlementCoordinator, SettlementRecord, SettlementState, SettlementStore,
    ShapleyEngine, Summarizer, ThresholdEvent, TxHash, Verdict,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Test Helpers
// ============================================================================

const AGGREGATOR: u8 = 0xaa;

fn addr(byte: u8) -> Address {
    Address::from_bytes([byte; 20])
}

fn request(id: u128) -> RequestId {
    RequestId::from_u128(id)
}

/// Verifier submission in the contract's JSON shape
fn verdict_json(score: i64, confirming: &[&str], refuting: &[&str]) -> String {
    serde_json::json!({
        "confirming": confirming,
        "refuting": refuting,
        "correctness_score": score,
        "response": "The claim matches the cited reporting.",
    })
    .to_string()
}

/// Scores a coalition as the mean of its verifiers' correctness scores
struct MeanScorer;

#[async_trait]
impl ScoringService for MeanScorer {
    async fn score(&self, request: &ScoringRequest) -> Result<String> {
        let scores: Vec<i64> = request
            .messages
            .iter()
            .flat_map(|message| message.lines())
            .filter_map(|line| line.strip_prefix("Verifier correctness score: "))
            .filter_map(|score| score.trim().parse().ok())
            .collect();

        if scores.is_empty() {
            return Ok("0".to_string());
        }
        Ok((scores.iter().sum::<i64>() / scores.len() as i64).to_string())
    }
}

/// Always answers with the same reply
struct FixedReply(&'static str);

#[async_trait]
impl ScoringService for FixedReply {
    async fn score(&self, _request: &ScoringRequest) -> Result<String> {
        Ok(self.0.to_string())
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Settings with short timeouts so pending transactions block quickly
fn fast_settings() -> CoordinatorSettings {
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: ms(1),
        max_backoff: ms(5),
        attempt_timeout: ms(500),
    };

    CoordinatorSettings {
        fetch_retry: retry.clone(),
        send_retry: retry,
        max_tx_attempts: 3,
        max_payout_attempts: 3,
        call_timeout: ms(500),
        receipt_timeout: ms(50),
        receipt_poll_interval: ms(5),
        max_concurrent_fetches: 4,
        summarizer: Summarizer::default(),
        engine: ShapleyEngine::new(5, 200, Some(7), 4),
    }
}

fn aggregator_with(scorer: impl ScoringService + 'static) -> Arc<ConsensusAggregator> {
    Arc::new(ConsensusAggregator::new(Arc::new(scorer), Duration::from_secs(1)))
}

struct Harness {
    chain: Arc<InMemoryChain>,
    store: Arc<InMemorySettlementStore>,
    coordinator: Arc<SettlementCoordinator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_scorer(MeanScorer)
    }

    fn with_scorer(scorer: impl ScoringService + 'static) -> Self {
        let chain = Arc::new(InMemoryChain::new(addr(AGGREGATOR)));
        Self::on_chain(chain.clone(), chain, aggregator_with(scorer))
    }

    /// `client` is what the coordinator talks to; `chain` is for assertions
    fn on_chain(
        chain: Arc<InMemoryChain>,
        client: Arc<dyn ChainClient>,
        aggregator: Arc<ConsensusAggregator>,
    ) -> Self {
        let store = Arc::new(InMemorySettlementStore::new());
        let coordinator = Arc::new(SettlementCoordinator::new(
            client,
            store.clone(),
            aggregator,
            fast_settings(),
        ));
        Self {
            chain,
            store,
            coordinator,
        }
    }

    /// Coordinator that stops between transitions once `shutdown` flips
    fn pausable(scorer: impl ScoringService + 'static, shutdown: watch::Receiver<bool>) -> Self {
        let chain = Arc::new(InMemoryChain::new(addr(AGGREGATOR)));
        let store = Arc::new(InMemorySettlementStore::new());
        let coordinator = Arc::new(
            SettlementCoordinator::new(
                chain.clone(),
                store.clone(),
                aggregator_with(scorer),
                fast_settings(),
            )
            .with_shutdown(shutdown),
        );
        Self {
            chain,
            store,
            coordinator,
        }
    }

    /// A fresh coordinator over the same chain and store, as after a restart
    fn restarted(&self) -> SettlementCoordinator {
        SettlementCoordinator::new(
            self.chain.clone(),
            self.store.clone(),
            aggregator_with(MeanScorer),
            fast_settings(),
        )
    }

    /// Register verifier results and emit the threshold event
    async fn open_round(&self, id: u128, results: &[(u8, i64)]) -> ThresholdEvent {
        let request_id = request(id);
        let verifiers: Vec<Address> = results.iter().map(|(byte, _)| addr(*byte)).collect();

        for (byte, score) in results {
            let link = format!("https://news{}.example/story", byte);
            self.chain
                .set_verifier_result(&request_id, &addr(*byte), verdict_json(*score, &[link.as_str()], &[]))
                .await;
        }

        let block_number = self
            .chain
            .emit_threshold_reached(&request_id, verifiers.clone())
            .await;
        ThresholdEvent {
            request_id,
            verifiers,
            block_number,
        }
    }

    async fn record(&self, id: u128) -> SettlementRecord {
        self.store.load(&request(id)).await.unwrap().unwrap()
    }

    async fn paid_to(&self, byte: u8) -> u128 {
        self.chain
            .transfers()
            .await
            .iter()
            .filter(|t| t.to == addr(byte))
            .map(|t| t.amount)
            .sum()
    }
}

// ============================================================================
// End-to-End Settlement Tests
// ============================================================================

mod settlement_round {
    use super::*;

    #[tokio::test]
    async fn test_full_round_settles_and_pays_by_contribution() {
        let harness = Harness::new();
        harness.chain.accrue_fees(1_000_000).await;
        let event = harness.open_round(1, &[(1, 80), (2, 60), (3, 40)]).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Complete));

        let submissions = harness.chain.submissions().await;
        assert_eq!(submissions.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&submissions[0].payload).unwrap();
        assert_eq!(payload["aggregated_score"], 60);
        assert_eq!(payload["supporting_links"].as_array().unwrap().len(), 3);
        assert!(payload["opposing_links"].as_array().unwrap().is_empty());

        let record = harness.record(1).await;
        assert_eq!(record.aggregate_score, Some(60));
        let attribution = record.attribution.as_ref().unwrap();
        assert_eq!(attribution.strategy, AttributionStrategy::Exact);
        assert!((attribution.total_weight() - 60.0).abs() < 1e-9);

        let (a, b, c) = (
            harness.paid_to(1).await,
            harness.paid_to(2).await,
            harness.paid_to(3).await,
        );
        assert!(a > b && b > c, "payouts should follow contribution: {a} {b} {c}");

        let distributed = a + b + c;
        assert!(distributed <= 1_000_000);
        assert!(1_000_000 - distributed < 3);
        assert_eq!(record.allocation.as_ref().unwrap().distributed(), distributed);
        assert!(record.payouts.values().all(|p| matches!(p.status, PayoutStatus::Paid { .. })));
    }

    #[tokio::test]
    async fn test_unparseable_scoring_reply_uses_fallback() {
        let harness = Harness::with_scorer(FixedReply("not-a-number"));
        harness.chain.accrue_fees(300).await;
        let event = harness.open_round(2, &[(1, 90), (2, 10)]).await;

        harness.coordinator.handle_event(&event).await.unwrap();

        let record = harness.record(2).await;
        assert_eq!(record.aggregate_score, Some(50));
        assert_eq!(record.state, SettlementState::Complete);

        // Every coalition scores 50, so the two verifiers split evenly
        assert_eq!(harness.paid_to(1).await, 150);
        assert_eq!(harness.paid_to(2).await, 150);
        assert!(harness.coordinator.aggregator().stats().degraded > 0);
    }

    #[tokio::test]
    async fn test_zero_fees_skip_transfers() {
        let harness = Harness::new();
        let event = harness.open_round(3, &[(1, 70), (2, 70)]).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Complete));

        let record = harness.record(3).await;
        assert_eq!(record.allocation, Some(Allocation::NothingToDistribute));
        assert!(record.payouts.is_empty());
        assert!(harness.chain.transfers().await.is_empty());
        assert_eq!(harness.chain.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawal_gas_is_excluded_from_rewards() {
        let harness = Harness::new();
        harness.chain.fund(&addr(AGGREGATOR), 10_000).await;
        harness.chain.set_gas_cost(100).await;
        harness.chain.accrue_fees(1_000).await;
        let event = harness.open_round(4, &[(1, 50)]).await;

        harness.coordinator.handle_event(&event).await.unwrap();

        // Balance delta across the withdrawal is fees minus its own gas
        let record = harness.record(4).await;
        assert_eq!(record.withdrawn_amount(), Some(900));
        assert_eq!(harness.paid_to(1).await, 900);
    }
}

// ============================================================================
// Idempotency Tests
// ============================================================================

mod idempotency {
    use super::*;

    #[tokio::test]
    async fn test_replayed_event_is_ignored() {
        let harness = Harness::new();
        harness.chain.accrue_fees(900).await;
        let event = harness.open_round(10, &[(1, 60), (2, 60), (3, 60)]).await;

        harness.coordinator.handle_event(&event).await.unwrap();
        let transfers_before = harness.chain.transfers().await.len();

        let replay = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(replay, EventOutcome::Duplicate);
        assert_eq!(harness.chain.submissions().await.len(), 1);
        assert_eq!(harness.chain.transfers().await.len(), transfers_before);
    }

    #[tokio::test]
    async fn test_driving_a_complete_round_is_a_no_op() {
        let harness = Harness::new();
        harness.chain.accrue_fees(500).await;
        let event = harness.open_round(11, &[(1, 60)]).await;
        harness.coordinator.handle_event(&event).await.unwrap();

        let state = harness.restarted().drive(&request(11)).await.unwrap();
        assert_eq!(state, SettlementState::Complete);
        assert_eq!(harness.chain.transfers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_scans_and_persists_cursor() {
        let harness = Harness::new();
        harness.chain.accrue_fees(400).await;
        let event = harness.open_round(12, &[(1, 80), (2, 40)]).await;

        let monitor = EventMonitor::new(
            harness.chain.clone(),
            harness.store.clone(),
            harness.coordinator.clone(),
            MonitorSettings {
                poll_interval: ms(10),
                start_block: Some(event.block_number),
                max_block_range: 2,
                call_timeout: ms(500),
            },
        );

        let first = monitor.tick(None).await.unwrap();
        assert_eq!(first.events, 1);
        assert_eq!(first.new_rounds, 1);
        assert_eq!(first.cursor, Some(event.block_number));

        let second: TickSummary = monitor.tick(None).await.unwrap();
        assert_eq!(second.events, 0);
        assert_eq!(second.resumed, 0);
        assert_eq!(
            harness.store.load_cursor().await.unwrap(),
            Some(harness.chain.latest_block().await.unwrap())
        );

        assert_eq!(harness.record(12).await.state, SettlementState::Complete);
        assert_eq!(harness.chain.submissions().await.len(), 1);
    }
}

// ============================================================================
// Fetch Failure Tests
// ============================================================================

mod fetch_failures {
    use super::*;

    #[tokio::test]
    async fn test_failing_verifier_is_excluded_not_fatal() {
        let harness = Harness::new();
        harness.chain.accrue_fees(1_000).await;
        let event = harness.open_round(20, &[(1, 80), (2, 60), (3, 40)]).await;
        harness.chain.fail_verifier_fetches(&addr(2), 10).await;

        harness.coordinator.handle_event(&event).await.unwrap();

        let record = harness.record(20).await;
        assert_eq!(record.state, SettlementState::Complete);
        assert_eq!(record.excluded.len(), 1);
        assert_eq!(record.excluded[0].verifier, addr(2));
        assert!(!record.coalition.contains_key(&addr(2)));
        assert!(!record.payouts.contains_key(&addr(2)));
        assert_eq!(harness.paid_to(2).await, 0);
        assert!(harness.paid_to(1).await > 0);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let harness = Harness::new();
        let event = harness.open_round(21, &[(1, 80), (2, 60)]).await;
        harness.chain.fail_verifier_fetches(&addr(2), 1).await;

        harness.coordinator.handle_event(&event).await.unwrap();

        let record = harness.record(21).await;
        assert!(record.excluded.is_empty());
        assert_eq!(record.coalition.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_submission_is_excluded() {
        let harness = Harness::new();
        let mut event = harness.open_round(22, &[(1, 80)]).await;
        event.verifiers.push(addr(9));

        harness.coordinator.handle_event(&event).await.unwrap();

        let record = harness.record(22).await;
        assert_eq!(record.excluded.len(), 1);
        assert_eq!(record.excluded[0].verifier, addr(9));
        assert!(record.excluded[0].reason.contains("empty submission"));
    }

    #[tokio::test]
    async fn test_no_results_fails_at_fetching() {
        let harness = Harness::new();
        let event = harness.open_round(23, &[(1, 80)]).await;
        harness.chain.fail_verifier_fetches(&addr(1), 10).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();

        assert!(matches!(
            outcome,
            EventOutcome::Started(SettlementState::Failed {
                stage: SettlementStage::Fetching,
                ..
            })
        ));
        assert!(harness.chain.submissions().await.is_empty());
        assert_eq!(harness.store.list_failed().await.unwrap().len(), 1);
    }
}

// ============================================================================
// Recovery Tests
// ============================================================================

/// How the first transfer to the target goes wrong
#[derive(Clone, Copy)]
enum TransferFault {
    /// Mined, but its receipt (and every later one) is held back
    HoldReceipts,
    /// Mined, then the send reports a timeout
    LoseResponse,
    /// Never reaches the node; the send reports a timeout
    LoseRequest,
}

/// Delegates to the in-memory chain, injecting one fault into the first
/// transfer to `target`
struct FaultyTransfers {
    inner: Arc<InMemoryChain>,
    target: Address,
    fault: TransferFault,
    armed: AtomicBool,
}

impl FaultyTransfers {
    fn new(inner: Arc<InMemoryChain>, target: Address, fault: TransferFault) -> Self {
        Self {
            inner,
            target,
            fault,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ChainClient for FaultyTransfers {
    fn aggregator_address(&self) -> &Address {
        self.inner.aggregator_address()
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.inner.latest_block().await
    }

    async fn threshold_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ThresholdEvent>, ChainError> {
        self.inner.threshold_events(from_block, to_block).await
    }

    async fn verifier_result(
        &self,
        request_id: &RequestId,
        verifier: &Address,
    ) -> Result<String, ChainError> {
        self.inner.verifier_result(request_id, verifier).await
    }

    async fn submit_aggregate_result(
        &self,
        request_id: &RequestId,
        payload: &str,
    ) -> Result<SentTransaction, ChainError> {
        self.inner.submit_aggregate_result(request_id, payload).await
    }

    async fn withdraw_fees(&self) -> Result<SentTransaction, ChainError> {
        self.inner.withdraw_fees().await
    }

    async fn transfer(
        &self,
        to: &Address,
        amount: u128,
        nonce: u64,
    ) -> Result<SentTransaction, ChainError> {
        if *to != self.target || !self.armed.swap(false, Ordering::SeqCst) {
            return self.inner.transfer(to, amount, nonce).await;
        }

        match self.fault {
            TransferFault::HoldReceipts => {
                self.inner.withhold_next_receipts(1).await;
                self.inner.transfer(to, amount, nonce).await
            }
            TransferFault::LoseResponse => {
                self.inner.transfer(to, amount, nonce).await?;
                Err(ChainError::Timeout("eth_sendTransaction".to_string()))
            }
            TransferFault::LoseRequest => {
                Err(ChainError::Timeout("eth_sendTransaction".to_string()))
            }
        }
    }

    async fn reserve_nonce(&self) -> Result<u64, ChainError> {
        self.inner.reserve_nonce().await
    }

    async fn release_nonces(&self) {
        self.inner.release_nonces().await
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>, ChainError> {
        self.inner.transaction_receipt(tx_hash).await
    }

    async fn balance(&self, address: &Address) -> Result<u128, ChainError> {
        self.inner.balance(address).await
    }

    async fn confirmed_nonce(&self) -> Result<u64, ChainError> {
        self.inner.confirmed_nonce().await
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        self.inner.pending_nonce().await
    }
}

/// Scores like [`MeanScorer`] and requests shutdown the first time it is
/// asked about a single-verifier coalition (only attribution does that)
struct ShutdownDuringAttribution(watch::Sender<bool>);

#[async_trait]
impl ScoringService for ShutdownDuringAttribution {
    async fn score(&self, request: &ScoringRequest) -> Result<String> {
        let members = request
            .messages
            .iter()
            .flat_map(|message| message.lines())
            .filter(|line| line.starts_with("Verifier correctness score: "))
            .count();
        if members == 1 {
            self.0.send_replace(true);
        }
        MeanScorer.score(request).await
    }
}

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_partial_disbursement_resumes_without_repaying() {
        let chain = Arc::new(InMemoryChain::new(addr(AGGREGATOR)));
        let client = Arc::new(FaultyTransfers::new(
            chain.clone(),
            addr(2),
            TransferFault::HoldReceipts,
        ));
        let harness = Harness::on_chain(chain.clone(), client, aggregator_with(MeanScorer));
        harness.chain.accrue_fees(900).await;
        let event = harness.open_round(30, &[(1, 60), (2, 60), (3, 60)]).await;

        let first = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(
            first,
            EventOutcome::Started(SettlementState::Disbursed { complete: false })
        );

        let record = harness.record(30).await;
        assert!(matches!(record.payouts[&addr(1)].status, PayoutStatus::Paid { .. }));
        assert!(matches!(record.payouts[&addr(2)].status, PayoutStatus::Sent { .. }));
        assert!(record.holds_withdrawn_funds());
        assert_eq!(harness.chain.transfers().await.len(), 3);

        // The node eventually mines the held transfers; a restarted process resumes
        harness.chain.release_receipts().await;
        let state = harness.restarted().drive(&request(30)).await.unwrap();
        assert_eq!(state, SettlementState::Complete);

        assert_eq!(harness.chain.transfers().await.len(), 3);
        for verifier in [1, 2, 3] {
            assert_eq!(harness.paid_to(verifier).await, 300);
        }
    }

    #[tokio::test]
    async fn test_lost_send_response_does_not_pay_twice() {
        let chain = Arc::new(InMemoryChain::new(addr(AGGREGATOR)));
        let client = Arc::new(FaultyTransfers::new(
            chain.clone(),
            addr(2),
            TransferFault::LoseResponse,
        ));
        let harness = Harness::on_chain(chain.clone(), client, aggregator_with(MeanScorer));
        // A reserve balance would cover a duplicate transfer
        harness.chain.fund(&addr(AGGREGATOR), 10_000).await;
        harness.chain.accrue_fees(900).await;
        let event = harness.open_round(37, &[(1, 60), (2, 60), (3, 60)]).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Complete));

        let to_two = harness
            .chain
            .transfers()
            .await
            .iter()
            .filter(|t| t.to == addr(2))
            .count();
        assert_eq!(to_two, 1);
        for verifier in [1, 2, 3] {
            assert_eq!(harness.paid_to(verifier).await, 300);
        }

        let record = harness.record(37).await;
        let payout = &record.payouts[&addr(2)];
        assert_eq!(payout.attempts, 1);
        assert!(matches!(
            payout.status,
            PayoutStatus::Paid { tx_hash: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_lost_send_request_is_rebuilt_once() {
        let chain = Arc::new(InMemoryChain::new(addr(AGGREGATOR)));
        let client = Arc::new(FaultyTransfers::new(
            chain.clone(),
            addr(2),
            TransferFault::LoseRequest,
        ));
        let harness = Harness::on_chain(chain.clone(), client, aggregator_with(MeanScorer));
        harness.chain.fund(&addr(AGGREGATOR), 10_000).await;
        harness.chain.accrue_fees(900).await;
        let event = harness.open_round(38, &[(1, 60), (2, 60), (3, 60)]).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Complete));

        assert_eq!(harness.chain.transfers().await.len(), 3);
        assert_eq!(harness.paid_to(2).await, 300);

        let record = harness.record(38).await;
        assert_eq!(record.payouts[&addr(2)].attempts, 2);
        assert!(matches!(
            record.payouts[&addr(2)].status,
            PayoutStatus::Paid { tx_hash: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_pauses_round_between_transitions() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let harness = Harness::pausable(ShutdownDuringAttribution(shutdown_tx), shutdown_rx);
        harness.chain.accrue_fees(1_000).await;
        let event = harness.open_round(50, &[(1, 80), (2, 40)]).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Allocated));

        // Allocation finished and was persisted; nothing was paid yet
        let record = harness.record(50).await;
        assert!(record.allocation.is_some());
        assert!(record.holds_withdrawn_funds());
        assert!(harness.chain.transfers().await.is_empty());

        // Further driving stays paused while shutdown is set
        let state = harness.coordinator.drive(&request(50)).await.unwrap();
        assert_eq!(state, SettlementState::Allocated);
        assert!(harness.chain.transfers().await.is_empty());

        let state = harness.restarted().drive(&request(50)).await.unwrap();
        assert_eq!(state, SettlementState::Complete);
        assert_eq!(harness.paid_to(1).await + harness.paid_to(2).await, 1_000);
        assert_eq!(harness.chain.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_round_waits_while_another_holds_withdrawn_funds() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let harness = Harness::pausable(ShutdownDuringAttribution(shutdown_tx), shutdown_rx);
        harness.chain.accrue_fees(1_000).await;
        let first = harness.open_round(51, &[(1, 80), (2, 40)]).await;

        let outcome = harness.coordinator.handle_event(&first).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Allocated));

        // Fees for the second round accrue while the first still holds its withdrawal
        harness.chain.accrue_fees(500).await;
        let second = harness.open_round(52, &[(3, 70)]).await;
        let other = harness.restarted();

        let outcome = other.handle_event(&second).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::ScoreSubmitted));

        let waiting = harness.record(52).await;
        assert!(waiting.withdrawal_tx.is_none());
        assert!(waiting.balance_before.is_none());
        assert_eq!(harness.chain.balance_of(&addr(AGGREGATOR)).await, 1_000);
        assert_eq!(harness.chain.submissions().await.len(), 2);

        // Still blocked on a second attempt
        let state = other.drive(&request(52)).await.unwrap();
        assert_eq!(state, SettlementState::ScoreSubmitted);

        // Once the first round pays out, the second withdraws only its own fees
        let state = other.drive(&request(51)).await.unwrap();
        assert_eq!(state, SettlementState::Complete);
        assert_eq!(harness.paid_to(1).await + harness.paid_to(2).await, 1_000);

        let state = other.drive(&request(52)).await.unwrap();
        assert_eq!(state, SettlementState::Complete);
        assert_eq!(harness.record(52).await.withdrawn_amount(), Some(500));
        assert_eq!(harness.paid_to(3).await, 500);
    }

    #[tokio::test]
    async fn test_pending_submission_is_not_resent() {
        let harness = Harness::new();
        harness.chain.accrue_fees(200).await;
        let event = harness.open_round(31, &[(1, 70), (2, 30)]).await;
        harness.chain.withhold_next_receipts(1).await;

        let first = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(first, EventOutcome::Started(SettlementState::ResultsFetched));
        let record = harness.record(31).await;
        assert!(record.submission_tx.is_some());
        assert!(record.payload.is_some());

        harness.chain.release_receipts().await;
        let state = harness.restarted().drive(&request(31)).await.unwrap();

        assert_eq!(state, SettlementState::Complete);
        assert_eq!(harness.chain.submissions().await.len(), 1);
        assert_eq!(harness.record(31).await.submission_attempts, 1);
    }

    #[tokio::test]
    async fn test_reverted_withdrawal_does_not_resubmit_score() {
        let harness = Harness::new();
        harness.chain.accrue_fees(600).await;
        let event = harness.open_round(32, &[(1, 60), (2, 60)]).await;
        harness.chain.revert_next_withdrawals(1).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Complete));

        let record = harness.record(32).await;
        assert_eq!(record.withdrawal_attempts, 2);
        assert_eq!(record.submission_attempts, 1);
        assert_eq!(harness.chain.submissions().await.len(), 1);
        assert_eq!(harness.paid_to(1).await + harness.paid_to(2).await, 600);
    }

    #[tokio::test]
    async fn test_reverted_payout_is_retried() {
        let harness = Harness::new();
        harness.chain.accrue_fees(600).await;
        let event = harness.open_round(33, &[(1, 60), (2, 60)]).await;
        harness.chain.revert_transfers_to(&addr(2), 1).await;

        harness.coordinator.handle_event(&event).await.unwrap();

        let record = harness.record(33).await;
        assert_eq!(record.state, SettlementState::Complete);
        assert_eq!(record.payouts[&addr(2)].attempts, 2);
        assert_eq!(harness.paid_to(2).await, 300);
    }

    #[tokio::test]
    async fn test_exhausted_payout_fails_round() {
        let harness = Harness::new();
        harness.chain.accrue_fees(600).await;
        let event = harness.open_round(34, &[(1, 60), (2, 60)]).await;
        harness.chain.revert_transfers_to(&addr(2), 10).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();

        assert!(matches!(
            outcome,
            EventOutcome::Started(SettlementState::Failed {
                stage: SettlementStage::Disbursing,
                ..
            })
        ));
        assert_eq!(harness.paid_to(1).await, 300);
        assert_eq!(harness.paid_to(2).await, 0);

        // A failed round no longer blocks later withdrawals
        harness.chain.accrue_fees(100).await;
        let next = harness.open_round(35, &[(1, 60)]).await;
        let outcome = harness.coordinator.handle_event(&next).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started(SettlementState::Complete));
    }

    #[tokio::test]
    async fn test_send_failures_exhaust_into_failed_submission() {
        let harness = Harness::new();
        let event = harness.open_round(36, &[(1, 60)]).await;
        harness.chain.fail_next_sends(10).await;

        let outcome = harness.coordinator.handle_event(&event).await.unwrap();

        assert!(matches!(
            outcome,
            EventOutcome::Started(SettlementState::Failed {
                stage: SettlementStage::Submitting,
                ..
            })
        ));
        assert!(harness.chain.submissions().await.is_empty());
    }
}

// ============================================================================
// Attribution Tests
// ============================================================================

mod attribution {
    use super::*;
    use silica_consensus::consensus::CoalitionScorer;

    fn coalition(scores: &[(u8, i64)]) -> Coalition {
        let summarizer = Summarizer::default();
        scores
            .iter()
            .map(|(byte, score)| {
                let verdict = Verdict::parse(&verdict_json(*score, &[], &[]));
                (addr(*byte), summarizer.summarize(&verdict))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_exact_weights_sum_to_full_score() {
        let aggregator = aggregator_with(MeanScorer);
        let members = coalition(&[(1, 90), (2, 50), (3, 20), (4, 70)]);
        let engine = ShapleyEngine::new(5, 100, None, 4);

        let attribution = engine.attribute(aggregator.as_ref(), &members).await;

        assert_eq!(attribution.strategy, AttributionStrategy::Exact);
        let full = aggregator.score_coalition(&members).await as f64;
        assert!((attribution.total_weight() - full).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_identical_verifiers_get_equal_weight() {
        let aggregator = aggregator_with(MeanScorer);
        let members = coalition(&[(1, 60), (2, 60), (3, 30)]);

        let attribution = ShapleyEngine::default()
            .attribute(aggregator.as_ref(), &members)
            .await;

        let a = attribution.weights[&addr(1)];
        let b = attribution.weights[&addr(2)];
        assert!((a - b).abs() < 1e-9);
        assert!(a > attribution.weights[&addr(3)]);
    }

    #[tokio::test]
    async fn test_large_coalitions_are_sampled_reproducibly() {
        let aggregator = aggregator_with(MeanScorer);
        let scores: Vec<(u8, i64)> = (1..=7).map(|i| (i, 10 * i as i64)).collect();
        let members = coalition(&scores);
        let engine = ShapleyEngine::new(5, 64, Some(42), 4);

        let first = engine.attribute(aggregator.as_ref(), &members).await;
        let second = engine.attribute(aggregator.as_ref(), &members).await;

        assert_eq!(first.strategy, AttributionStrategy::MonteCarlo { samples: 64 });
        assert_eq!(first.weights, second.weights);
        // Every sampled ordering telescopes to the full coalition's score
        let full = aggregator.score_coalition(&members).await as f64;
        assert!((first.total_weight() - full).abs() < 1e-6);
    }
}

// ============================================================================
// Operator API Tests
// ============================================================================

mod operator_api {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use silica_consensus::{SettlementApiState, create_settlement_router};
    use tower::ServiceExt;

    async fn get(harness: &Harness, uri: &str) -> (StatusCode, serde_json::Value) {
        let app = create_settlement_router(SettlementApiState {
            store: harness.store.clone(),
            aggregator: harness.coordinator.aggregator().clone(),
        });

        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn settled_harness() -> Harness {
        let harness = Harness::new();
        harness.chain.accrue_fees(1_000).await;
        let ok = harness.open_round(40, &[(1, 80), (2, 40)]).await;
        harness.coordinator.handle_event(&ok).await.unwrap();

        let broken = harness.open_round(41, &[(3, 50)]).await;
        harness.chain.fail_verifier_fetches(&addr(3), 10).await;
        harness.coordinator.handle_event(&broken).await.unwrap();
        harness
    }

    #[tokio::test]
    async fn test_health_reports_rounds() {
        let harness = settled_harness().await;
        let (status, body) = get(&harness, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["open_rounds"], 0);
        assert_eq!(body["failed_rounds"], 1);
        assert!(body["scoring"]["calls"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_list_and_failed_endpoints() {
        let harness = settled_harness().await;

        let (status, body) = get(&harness, "/settlements").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["settlements"][0]["request_id"], "40");
        assert_eq!(body["settlements"][0]["state"], "complete");
        assert_eq!(body["settlements"][0]["distributed"], 1_000);

        let (status, body) = get(&harness, "/settlements/failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["failed"][0]["request_id"], "41");
        assert_eq!(body["failed"][0]["stage"], "fetching");
    }

    #[tokio::test]
    async fn test_get_settlement_by_id() {
        let harness = settled_harness().await;

        let (status, body) = get(&harness, "/settlements/40").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["state"], "complete");
        assert_eq!(body["aggregate_score"], 60);

        let (status, _) = get(&harness, "/settlements/0x28").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(&harness, "/settlements/99").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(&harness, "/settlements/not-a-request").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

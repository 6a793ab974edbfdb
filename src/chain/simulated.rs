//! In-memory chain
//!
//! Dev-mode fallback when no node is configured, and the backing chain for
//! tests. Models the contract's fee pool, native balances, receipts and
//! nonces, plus failure injection for the settlement paths:
//!
//! - failing verifier result reads
//! - reverted withdrawals / transfers
//! - RPC errors on send
//! - transactions held pending without a receipt
//!
//! Transactions are otherwise mined immediately. A second `submitAggregateResult`
//! for the same request reverts, as the contract rejects duplicates.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    Address, ChainClient, ChainError, NonceAllocator, RequestId, SentTransaction, ThresholdEvent,
    TxHash, TxReceipt, VerifierAddress,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub request_id: RequestId,
    pub payload: String,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub to: Address,
    pub amount: u128,
    pub tx_hash: TxHash,
}

#[derive(Debug, Default)]
struct SimulatedState {
    block: u64,
    events: Vec<ThresholdEvent>,
    verifier_results: HashMap<(RequestId, VerifierAddress), String>,
    failing_fetches: HashMap<VerifierAddress, u32>,
    balances: HashMap<Address, u128>,
    fee_pool: u128,
    gas_cost_wei: u128,
    submissions: Vec<RecordedSubmission>,
    transfers: Vec<RecordedTransfer>,
    receipts: HashMap<TxHash, TxReceipt>,
    withheld_receipts: HashMap<TxHash, TxReceipt>,
    confirmed_nonce: u64,
    revert_withdrawals: u32,
    revert_transfers: HashMap<Address, u32>,
    failing_sends: u32,
    withhold_receipts: u32,
    withheld_nonce: Option<u64>,
    tx_counter: u64,
}

pub struct InMemoryChain {
    aggregator: Address,
    state: RwLock<SimulatedState>,
    nonces: NonceAllocator,
}

impl InMemoryChain {
    pub fn new(aggregator: Address) -> Self {
        info!(aggregator = %aggregator, "Initializing in-memory chain (dev mode)");
        Self {
            aggregator,
            state: RwLock::new(SimulatedState::default()),
            nonces: NonceAllocator::new(),
        }
    }

    /// Gas charged to the aggregator for every mined transaction
    pub async fn set_gas_cost(&self, wei: u128) {
        self.state.write().await.gas_cost_wei = wei;
    }

    pub async fn fund(&self, address: &Address, amount: u128) {
        let mut state = self.state.write().await;
        *state.balances.entry(address.clone()).or_insert(0) += amount;
    }

    /// Add fees to the contract pool (what `withdrawFees` pays out)
    pub async fn accrue_fees(&self, amount: u128) {
        self.state.write().await.fee_pool += amount;
    }

    pub async fn set_verifier_result(
        &self,
        request_id: &RequestId,
        verifier: &VerifierAddress,
        raw: impl Into<String>,
    ) {
        self.state
            .write()
            .await
            .verifier_results
            .insert((request_id.clone(), verifier.clone()), raw.into());
    }

    /// Emit a `ThresholdReached` event in a new block
    pub async fn emit_threshold_reached(
        &self,
        request_id: &RequestId,
        verifiers: Vec<VerifierAddress>,
    ) -> u64 {
        let mut state = self.state.write().await;
        state.block += 1;
        let block_number = state.block;
        state.events.push(ThresholdEvent {
            request_id: request_id.clone(),
            verifiers,
            block_number,
        });
        block_number
    }

    /// Make the next `count` result reads for a verifier fail
    pub async fn fail_verifier_fetches(&self, verifier: &VerifierAddress, count: u32) {
        self.state
            .write()
            .await
            .failing_fetches
            .insert(verifier.clone(), count);
    }

    pub async fn revert_next_withdrawals(&self, count: u32) {
        self.state.write().await.revert_withdrawals = count;
    }

    pub async fn revert_transfers_to(&self, to: &Address, count: u32) {
        self.state
            .write()
            .await
            .revert_transfers
            .insert(to.clone(), count);
    }

    /// Make the next `count` transaction sends fail before reaching the mempool
    pub async fn fail_next_sends(&self, count: u32) {
        self.state.write().await.failing_sends = count;
    }

    /// Keep the next `count` transactions pending (no receipt, nonce unconfirmed)
    pub async fn withhold_next_receipts(&self, count: u32) {
        self.state.write().await.withhold_receipts = count;
    }

    /// Confirm every pending transaction and publish its receipt
    pub async fn release_receipts(&self) {
        let mut state = self.state.write().await;
        let withheld: Vec<(TxHash, TxReceipt)> = state.withheld_receipts.drain().collect();
        state.receipts.extend(withheld);
        if let Some(nonce) = state.withheld_nonce.take() {
            state.confirmed_nonce = state.confirmed_nonce.max(nonce + 1);
        }
    }

    pub async fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.read().await.submissions.clone()
    }

    pub async fn transfers(&self) -> Vec<RecordedTransfer> {
        self.state.read().await.transfers.clone()
    }

    pub async fn balance_of(&self, address: &Address) -> u128 {
        self.state
            .read()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn next_tx_hash(state: &mut SimulatedState, nonce: u64) -> TxHash {
        state.tx_counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(nonce.to_le_bytes());
        hasher.update(state.tx_counter.to_le_bytes());
        TxHash(format!("0x{:x}", hasher.finalize()))
    }

    /// Next nonce the node would accept: after the confirmed ones and any
    /// still held in the pool
    fn next_nonce(state: &SimulatedState) -> u64 {
        state
            .withheld_nonce
            .map_or(state.confirmed_nonce, |nonce| nonce + 1)
    }

    /// Mine a transaction on the allocator's next nonce
    async fn mine<F>(&self, effect: F) -> Result<SentTransaction, ChainError>
    where
        F: FnOnce(&mut SimulatedState, &TxHash) -> Result<bool, ChainError>,
    {
        self.nonces
            .submit(
                || async { Ok(Self::next_nonce(&*self.state.read().await)) },
                |nonce| self.mine_at(nonce, effect),
            )
            .await
    }

    /// Mine a transaction: charge gas, apply `effect` unless it reverts.
    ///
    /// Nonces must arrive in order; anything else is rejected as a node would
    /// reject a stale or gapped nonce.
    async fn mine_at<F>(&self, nonce: u64, effect: F) -> Result<SentTransaction, ChainError>
    where
        F: FnOnce(&mut SimulatedState, &TxHash) -> Result<bool, ChainError>,
    {
        let mut state = self.state.write().await;

        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(ChainError::Rpc("simulated send failure".to_string()));
        }

        let expected = Self::next_nonce(&*state);
        if nonce != expected {
            return Err(ChainError::Rpc(format!(
                "nonce {} rejected, node expects {}",
                nonce, expected
            )));
        }

        let gas = state.gas_cost_wei;
        let aggregator_balance = state
            .balances
            .entry(self.aggregator.clone())
            .or_insert(0);
        *aggregator_balance = aggregator_balance.saturating_sub(gas);

        let tx_hash = Self::next_tx_hash(&mut *state, nonce);
        let success = effect(&mut *state, &tx_hash)?;

        state.block += 1;
        let receipt = TxReceipt {
            tx_hash: tx_hash.clone(),
            block_number: state.block,
            success,
        };

        // Withheld transactions stay pending: no receipt, nonce not
        // confirmed. Later nonces queue behind them.
        if state.withhold_receipts > 0 || state.withheld_nonce.is_some() {
            state.withhold_receipts = state.withhold_receipts.saturating_sub(1);
            state.withheld_receipts.insert(tx_hash.clone(), receipt);
            state.withheld_nonce = Some(nonce);
        } else {
            state.receipts.insert(tx_hash.clone(), receipt);
            state.confirmed_nonce = nonce + 1;
        }

        debug!(tx_hash = %tx_hash, nonce, success, "Mined simulated transaction");
        Ok(SentTransaction { tx_hash, nonce })
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    fn aggregator_address(&self) -> &Address {
        &self.aggregator
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().await.block)
    }

    async fn threshold_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ThresholdEvent>, ChainError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn verifier_result(
        &self,
        request_id: &RequestId,
        verifier: &VerifierAddress,
    ) -> Result<String, ChainError> {
        let mut state = self.state.write().await;

        if let Some(remaining) = state.failing_fetches.get_mut(verifier)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ChainError::Rpc(format!(
                "simulated result read failure for {}",
                verifier
            )));
        }

        Ok(state
            .verifier_results
            .get(&(request_id.clone(), verifier.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_aggregate_result(
        &self,
        request_id: &RequestId,
        payload: &str,
    ) -> Result<SentTransaction, ChainError> {
        let request_id = request_id.clone();
        let payload = payload.to_string();

        self.mine(move |state, tx_hash| {
            if state.submissions.iter().any(|s| s.request_id == request_id) {
                return Ok(false);
            }
            state.submissions.push(RecordedSubmission {
                request_id,
                payload,
                tx_hash: tx_hash.clone(),
            });
            Ok(true)
        })
        .await
    }

    async fn withdraw_fees(&self) -> Result<SentTransaction, ChainError> {
        let aggregator = self.aggregator.clone();
        self.mine(move |state, _| {
            if state.revert_withdrawals > 0 {
                state.revert_withdrawals -= 1;
                return Ok(false);
            }
            let amount = std::mem::take(&mut state.fee_pool);
            *state.balances.entry(aggregator).or_insert(0) += amount;
            Ok(true)
        })
        .await
    }

    async fn transfer(
        &self,
        to: &Address,
        amount: u128,
        nonce: u64,
    ) -> Result<SentTransaction, ChainError> {
        let aggregator = self.aggregator.clone();
        let recipient = to.clone();

        self.mine_at(nonce, move |state, tx_hash| {
            if let Some(remaining) = state.revert_transfers.get_mut(&recipient)
                && *remaining > 0
            {
                *remaining -= 1;
                return Ok(false);
            }

            let balance = state.balances.get(&aggregator).copied().unwrap_or(0);
            if balance < amount {
                return Ok(false);
            }

            state.balances.insert(aggregator, balance - amount);
            *state.balances.entry(recipient.clone()).or_insert(0) += amount;
            state.transfers.push(RecordedTransfer {
                to: recipient,
                amount,
                tx_hash: tx_hash.clone(),
            });
            Ok(true)
        })
        .await
    }

    async fn reserve_nonce(&self) -> Result<u64, ChainError> {
        self.nonces
            .reserve(|| async { Ok(Self::next_nonce(&*self.state.read().await)) })
            .await
    }

    async fn release_nonces(&self) {
        self.nonces.reset().await;
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state.read().await.receipts.get(tx_hash).cloned())
    }

    async fn balance(&self, address: &Address) -> Result<u128, ChainError> {
        Ok(self.balance_of(address).await)
    }

    async fn confirmed_nonce(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().await.confirmed_nonce)
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        Ok(Self::next_nonce(&*self.state.read().await))
    }
}

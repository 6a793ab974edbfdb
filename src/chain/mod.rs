//! Chain Integration Module
//!
//! Narrow interface to the fact-checker contract and the aggregator's
//! signing account. The coordinator only ever talks to [`ChainClient`];
//! concrete transports live in the submodules.
//!
//! ## Implementations
//!
//! - `rpc`: Ethereum JSON-RPC node with a node-managed signing account
//! - `simulated`: in-memory chain (dev mode and tests)
//!
//! ## Contract Surface
//!
//! - `ThresholdReached(requestId, verifiers[])` event (polled)
//! - `getVerifierResult(requestId, verifier) -> string`
//! - `submitAggregateResult(requestId, jsonPayload)`
//! - `withdrawFees()`
//! - native transfer to verifiers (explicit, pre-reserved nonce)

pub mod abi;
pub mod nonce;
pub mod rpc;
pub mod simulated;

pub use nonce::NonceAllocator;
pub use rpc::JsonRpcChain;
pub use simulated::InMemoryChain;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors surfaced by chain clients
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transaction {0} reverted")]
    Reverted(TxHash),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Opaque identifier of one verification round (decimal form of the on-chain uint256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_string())
    }

    /// Parse a decimal or `0x`-prefixed hex request id
    pub fn parse(raw: &str) -> Result<Self, ChainError> {
        let raw = raw.trim();
        let value = if let Some(hex_part) = raw.strip_prefix("0x") {
            u128::from_str_radix(hex_part, 16)
        } else {
            raw.parse::<u128>()
        }
        .map_err(|e| ChainError::Decode(format!("request id '{}': {}", raw, e)))?;
        Ok(Self::from_u128(value))
    }

    pub fn as_u128(&self) -> Result<u128, ChainError> {
        self.0
            .parse::<u128>()
            .map_err(|e| ChainError::Decode(format!("request id '{}': {}", self.0, e)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 20-byte account address in canonical lowercase `0x` hex form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

/// Verifiers are identified by their account address
pub type VerifierAddress = Address;

impl Address {
    pub fn parse(raw: &str) -> Result<Self, ChainError> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ChainError::InvalidAddress(format!("missing 0x prefix: {}", raw)))?;

        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChainError::InvalidAddress(format!(
                "expected 40 hex characters: {}",
                raw
            )));
        }

        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        // Canonical form is validated on construction
        if let Ok(decoded) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&decoded);
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transaction accepted by the node, with the nonce it was built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentTransaction {
    pub tx_hash: TxHash,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

/// Decoded `ThresholdReached` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdEvent {
    pub request_id: RequestId,
    pub verifiers: Vec<VerifierAddress>,
    pub block_number: u64,
}

/// Operations the settlement pipeline needs from the chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Account that signs submissions and pays verifiers
    fn aggregator_address(&self) -> &Address;

    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// `ThresholdReached` events in the inclusive block range
    async fn threshold_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ThresholdEvent>, ChainError>;

    async fn verifier_result(
        &self,
        request_id: &RequestId,
        verifier: &VerifierAddress,
    ) -> Result<String, ChainError>;

    async fn submit_aggregate_result(
        &self,
        request_id: &RequestId,
        payload: &str,
    ) -> Result<SentTransaction, ChainError>;

    async fn withdraw_fees(&self) -> Result<SentTransaction, ChainError>;

    /// Native transfer from the aggregator account, built with a nonce
    /// previously handed out by [`reserve_nonce`](Self::reserve_nonce)
    async fn transfer(
        &self,
        to: &Address,
        amount: u128,
        nonce: u64,
    ) -> Result<SentTransaction, ChainError>;

    /// Claim the next aggregator nonce ahead of a broadcast
    async fn reserve_nonce(&self) -> Result<u64, ChainError>;

    /// Drop cached nonce state after a reserved nonce turned out unused
    async fn release_nonces(&self);

    /// `None` while the transaction is unknown or not yet mined
    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>, ChainError>;

    async fn balance(&self, address: &Address) -> Result<u128, ChainError>;

    /// Number of transactions from the aggregator account included on chain
    async fn confirmed_nonce(&self) -> Result<u64, ChainError>;

    /// Confirmed count plus the contiguous run of transactions the node holds
    /// in its pool
    async fn pending_nonce(&self) -> Result<u64, ChainError>;
}

/// Poll for a receipt until it appears or the deadline passes
pub async fn wait_for_receipt(
    chain: &dyn ChainClient,
    tx_hash: &TxHash,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<TxReceipt, ChainError> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(receipt) = chain.transaction_receipt(tx_hash).await? {
            return Ok(receipt);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ChainError::Timeout(format!(
                "no receipt for {} after {:?}",
                tx_hash, timeout
            )));
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

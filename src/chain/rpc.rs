//! JSON-RPC Chain Client
//!
//! Talks to an Ethereum-compatible node over HTTP. Transactions go through
//! `eth_sendTransaction`, so the aggregator account's key stays with the
//! node (or the signer proxy in front of it); this client never handles
//! private keys. Gas price and limits are fixed configuration values.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use super::abi::{self, Token};
use super::{
    Address, ChainClient, ChainError, NonceAllocator, RequestId, SentTransaction, ThresholdEvent,
    TxHash, TxReceipt, VerifierAddress,
};
use crate::config::ChainConfig;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

pub struct JsonRpcChain {
    client: Client,
    rpc_url: String,
    contract: Address,
    aggregator: Address,
    chain_id: u64,
    gas_price_wei: u128,
    submit_gas_limit: u64,
    withdraw_gas_limit: u64,
    transfer_gas_limit: u64,
    threshold_topic: String,
    nonces: NonceAllocator,
    request_counter: AtomicU64,
}

impl JsonRpcChain {
    pub fn new(config: &ChainConfig) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_secs))
            .user_agent("SilicaConsensus/0.1")
            .build()
            .map_err(|e| ChainError::Rpc(format!("failed to build HTTP client: {}", e)))?;

        let contract = Address::parse(&config.contract_address)?;
        let aggregator = Address::parse(&config.aggregator_address)?;

        info!(
            rpc_url = %config.rpc_url,
            contract = %contract,
            aggregator = %aggregator,
            chain_id = config.chain_id,
            "JSON-RPC chain client created"
        );

        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            contract,
            aggregator,
            chain_id: config.chain_id,
            gas_price_wei: config.gas_price_wei,
            submit_gas_limit: config.submit_gas_limit,
            withdraw_gas_limit: config.withdraw_gas_limit,
            transfer_gas_limit: config.transfer_gas_limit,
            threshold_topic: abi::event_topic(abi::THRESHOLD_REACHED_EVENT),
            nonces: NonceAllocator::new(),
            request_counter: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.request_counter.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout(format!("{}: {}", method, e))
                } else {
                    ChainError::Rpc(format!("{}: {}", method, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(ChainError::Rpc(format!(
                "{}: HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(format!("{}: {}", method, e)))?;

        if let Some(error) = body.error {
            return Err(ChainError::Rpc(format!(
                "{} failed ({}): {}",
                method, error.code, error.message
            )));
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128, ChainError> {
        let value = self.call(method, params).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| ChainError::Decode(format!("{} returned {}", method, value)))?;
        abi::parse_quantity(raw)
    }

    /// Send a transaction from the aggregator account with the next nonce
    async fn send_transaction(
        &self,
        to: &Address,
        value: u128,
        data: Option<Vec<u8>>,
        gas_limit: u64,
    ) -> Result<SentTransaction, ChainError> {
        self.nonces
            .submit(
                || self.pending_nonce(),
                |nonce| self.send_with_nonce(to, value, data, gas_limit, nonce),
            )
            .await
    }

    async fn send_with_nonce(
        &self,
        to: &Address,
        value: u128,
        data: Option<Vec<u8>>,
        gas_limit: u64,
        nonce: u64,
    ) -> Result<SentTransaction, ChainError> {
        let mut tx = json!({
            "from": self.aggregator.as_str(),
            "to": to.as_str(),
            "value": abi::to_quantity(value),
            "gas": abi::to_quantity(gas_limit as u128),
            "gasPrice": abi::to_quantity(self.gas_price_wei),
            "nonce": abi::to_quantity(nonce as u128),
            "chainId": abi::to_quantity(self.chain_id as u128),
        });
        if let Some(data) = data {
            tx["data"] = Value::String(format!("0x{}", hex::encode(data)));
        }

        let hash = self.call("eth_sendTransaction", json!([tx])).await?;
        let hash = hash.as_str().ok_or_else(|| {
            ChainError::Decode(format!("eth_sendTransaction returned {}", hash))
        })?;

        debug!(tx_hash = %hash, nonce, to = %to, "Transaction sent");
        Ok(SentTransaction {
            tx_hash: TxHash(hash.to_string()),
            nonce,
        })
    }

    async fn transaction_count(&self, block: &str) -> Result<u64, ChainError> {
        let nonce = self
            .quantity(
                "eth_getTransactionCount",
                json!([self.aggregator.as_str(), block]),
            )
            .await?;
        u64::try_from(nonce).map_err(|_| ChainError::Decode("nonce out of range".to_string()))
    }
}

/// Decode one `eth_getLogs` entry into a threshold event
pub(crate) fn parse_threshold_log(log: &Value) -> Result<ThresholdEvent, ChainError> {
    let topics: Vec<String> = log
        .get("topics")
        .and_then(|t| t.as_array())
        .map(|topics| {
            topics
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let data = abi::decode_hex(log.get("data").and_then(|d| d.as_str()).unwrap_or("0x"))?;
    let block_number = log
        .get("blockNumber")
        .and_then(|b| b.as_str())
        .map(abi::parse_quantity)
        .transpose()?
        .unwrap_or(0);

    let (request_id, verifiers) = abi::decode_threshold_reached(&topics, &data)?;

    Ok(ThresholdEvent {
        request_id,
        verifiers,
        block_number: block_number as u64,
    })
}

/// Decode a batch of logs, skipping entries that do not decode.
///
/// One malformed event must not pin the monitor's cursor to its block.
pub(crate) fn decode_threshold_logs(entries: &[Value]) -> Vec<ThresholdEvent> {
    entries
        .iter()
        .filter_map(|log| match parse_threshold_log(log) {
            Ok(event) => Some(event),
            Err(e) => {
                error!(
                    error = %e,
                    block = ?log.get("blockNumber"),
                    tx_hash = ?log.get("transactionHash"),
                    "Skipping undecodable ThresholdReached log"
                );
                None
            }
        })
        .collect()
}

#[async_trait]
impl ChainClient for JsonRpcChain {
    fn aggregator_address(&self) -> &Address {
        &self.aggregator
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        let block = self.quantity("eth_blockNumber", json!([])).await?;
        Ok(block as u64)
    }

    async fn threshold_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ThresholdEvent>, ChainError> {
        let logs = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": self.contract.as_str(),
                    "fromBlock": abi::to_quantity(from_block as u128),
                    "toBlock": abi::to_quantity(to_block as u128),
                    "topics": [self.threshold_topic],
                }]),
            )
            .await?;

        let entries = logs
            .as_array()
            .ok_or_else(|| ChainError::Decode(format!("eth_getLogs returned {}", logs)))?;

        Ok(decode_threshold_logs(entries))
    }

    async fn verifier_result(
        &self,
        request_id: &RequestId,
        verifier: &VerifierAddress,
    ) -> Result<String, ChainError> {
        let data = abi::encode_call(
            abi::GET_VERIFIER_RESULT,
            &[
                Token::Uint(request_id.as_u128()?),
                Token::Address(verifier.clone()),
            ],
        );

        let result = self
            .call(
                "eth_call",
                json!([{
                    "to": self.contract.as_str(),
                    "data": format!("0x{}", hex::encode(data)),
                }, "latest"]),
            )
            .await?;

        let raw = result
            .as_str()
            .ok_or_else(|| ChainError::Decode(format!("eth_call returned {}", result)))?;
        abi::decode_string(&abi::decode_hex(raw)?)
    }

    async fn submit_aggregate_result(
        &self,
        request_id: &RequestId,
        payload: &str,
    ) -> Result<SentTransaction, ChainError> {
        let data = abi::encode_call(
            abi::SUBMIT_AGGREGATE_RESULT,
            &[
                Token::Uint(request_id.as_u128()?),
                Token::String(payload.to_string()),
            ],
        );
        self.send_transaction(&self.contract, 0, Some(data), self.submit_gas_limit)
            .await
    }

    async fn withdraw_fees(&self) -> Result<SentTransaction, ChainError> {
        let data = abi::encode_call(abi::WITHDRAW_FEES, &[]);
        self.send_transaction(&self.contract, 0, Some(data), self.withdraw_gas_limit)
            .await
    }

    async fn transfer(
        &self,
        to: &Address,
        amount: u128,
        nonce: u64,
    ) -> Result<SentTransaction, ChainError> {
        self.send_with_nonce(to, amount, None, self.transfer_gas_limit, nonce)
            .await
    }

    async fn reserve_nonce(&self) -> Result<u64, ChainError> {
        self.nonces.reserve(|| self.pending_nonce()).await
    }

    async fn release_nonces(&self) {
        self.nonces.reset().await;
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = self
            .call("eth_getTransactionReceipt", json!([tx_hash.0]))
            .await?;

        if receipt.is_null() {
            return Ok(None);
        }

        let status = receipt
            .get("status")
            .and_then(|s| s.as_str())
            .map(abi::parse_quantity)
            .transpose()?
            .unwrap_or(0);
        let block_number = receipt
            .get("blockNumber")
            .and_then(|b| b.as_str())
            .map(abi::parse_quantity)
            .transpose()?
            .unwrap_or(0);

        Ok(Some(TxReceipt {
            tx_hash: tx_hash.clone(),
            block_number: block_number as u64,
            success: status == 1,
        }))
    }

    async fn balance(&self, address: &Address) -> Result<u128, ChainError> {
        self.quantity("eth_getBalance", json!([address.as_str(), "latest"]))
            .await
    }

    async fn confirmed_nonce(&self) -> Result<u64, ChainError> {
        self.transaction_count("latest").await
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        self.transaction_count("pending").await
    }
}

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};
use url::Url;

use crate::chain::Address;

/// Configuration for the consensus settlement oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Operator API server
    pub server: ServerConfig,
    /// Chain connection and contract addresses
    pub chain: ChainConfig,
    /// Scoring service (LLM) configuration
    pub scoring: ScoringConfig,
    /// Shapley attribution configuration
    pub attribution: AttributionConfig,
    /// Retry, timeout and payout limits
    pub settlement: SettlementConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// Ethereum JSON-RPC node
    Rpc,
    /// In-memory chain (development only)
    Simulated,
}

impl FromStr for ChainMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rpc" => Ok(ChainMode::Rpc),
            "simulated" | "memory" => Ok(ChainMode::Simulated),
            other => Err(anyhow!("Unknown chain mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub mode: ChainMode,
    /// JSON-RPC endpoint of a node that manages the aggregator account
    pub rpc_url: String,
    pub chain_id: u64,
    /// Fact-checker contract - MUST be configured
    pub contract_address: String,
    /// Account that submits results and pays verifiers - MUST be configured
    pub aggregator_address: String,
    pub gas_price_wei: u128,
    pub submit_gas_limit: u64,
    pub withdraw_gas_limit: u64,
    pub transfer_gas_limit: u64,
    pub rpc_timeout_secs: u64,
    /// First block to scan when no cursor is stored
    pub start_block: Option<u64>,
    pub max_block_range: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// OpenRouter-compatible API base URL
    pub api_url: String,
    /// API key - MUST be from environment
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Score used when a reply cannot be parsed
    pub fallback_score: u8,
    /// Cap on the redacted response shown to the scorer
    pub max_response_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Largest verifier count attributed exactly (n! orderings)
    pub exact_threshold: usize,
    /// Orderings sampled above the threshold
    pub monte_carlo_samples: usize,
    /// Fixed seed for reproducible sampling
    pub seed: Option<u64>,
    /// Concurrent scoring calls per attribution run
    pub max_concurrent_scoring: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    pub fetch_max_attempts: u32,
    pub send_max_attempts: u32,
    /// Rebuilds of a reverted or dropped submission/withdrawal
    pub max_tx_attempts: u32,
    pub max_payout_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub call_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub max_concurrent_fetches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub postgres_url: String,
    /// Enable PostgreSQL (if false, uses in-memory fallback)
    pub postgres_enabled: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug)
    pub level: String,
    /// Mask secrets before they reach the log
    pub sanitize_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            mode: ChainMode::Rpc,
            rpc_url: "https://coston2-api.flare.network/ext/C/rpc".to_string(),
            chain_id: 114,
            contract_address: String::new(), // MUST be configured
            aggregator_address: String::new(), // MUST be configured
            gas_price_wei: 30_000_000_000,
            submit_gas_limit: 300_000,
            withdraw_gas_limit: 100_000,
            transfer_gas_limit: 21_000,
            rpc_timeout_secs: 15,
            start_block: None,
            max_block_range: 1_000,
            poll_interval_secs: 5,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: String::new(), // MUST be configured
            model: "qwen/qwen-vl-plus:free".to_string(),
            timeout_secs: 30,
            temperature: 0.0,
            max_tokens: 16,
            fallback_score: 50,
            max_response_chars: 600,
        }
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            exact_threshold: 5,
            monte_carlo_samples: 200,
            seed: None,
            max_concurrent_scoring: 4,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            fetch_max_attempts: 3,
            send_max_attempts: 3,
            max_tx_attempts: 3,
            max_payout_attempts: 3,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 10_000,
            call_timeout_secs: 15,
            receipt_timeout_secs: 120,
            receipt_poll_interval_ms: 2_000,
            max_concurrent_fetches: 4,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: "postgresql://localhost:5432/silica_consensus".to_string(),
            postgres_enabled: false,
            max_connections: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            sanitize_logs: true,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            chain: ChainConfig::default(),
            scoring: ScoringConfig::default(),
            attribution: AttributionConfig::default(),
            settlement: SettlementConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse an optional environment variable
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {} value: {}", name, e)),
        Err(_) => Ok(None),
    }
}

impl ConsensusConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Server configuration
        if let Ok(host) = env::var("SILICA_HOST") {
            config.server.host = host;
        }
        if let Some(port) = parse_var("SILICA_PORT")? {
            config.server.port = port;
        }

        // Chain configuration
        if let Some(mode) = parse_var("SILICA_CHAIN_MODE")? {
            config.chain.mode = mode;
        }
        if let Ok(rpc_url) = env::var("SILICA_RPC_URL") {
            config.chain.rpc_url = rpc_url;
        }
        if let Some(chain_id) = parse_var("SILICA_CHAIN_ID")? {
            config.chain.chain_id = chain_id;
        }
        config.chain.aggregator_address = env::var("SILICA_AGGREGATOR_ADDRESS")
            .context("SILICA_AGGREGATOR_ADDRESS environment variable is required")?;
        match env::var("SILICA_CONTRACT_ADDRESS") {
            Ok(contract) => config.chain.contract_address = contract,
            Err(_) if config.chain.mode == ChainMode::Simulated => {
                warn!("SILICA_CONTRACT_ADDRESS not set, using zero address (simulated chain)");
                config.chain.contract_address = format!("0x{}", "0".repeat(40));
            }
            Err(_) => {
                return Err(anyhow!(
                    "SILICA_CONTRACT_ADDRESS environment variable is required"
                ));
            }
        }
        if let Some(gas_price) = parse_var("SILICA_GAS_PRICE_WEI")? {
            config.chain.gas_price_wei = gas_price;
        }
        if let Some(limit) = parse_var("SILICA_SUBMIT_GAS_LIMIT")? {
            config.chain.submit_gas_limit = limit;
        }
        if let Some(limit) = parse_var("SILICA_WITHDRAW_GAS_LIMIT")? {
            config.chain.withdraw_gas_limit = limit;
        }
        if let Some(limit) = parse_var("SILICA_TRANSFER_GAS_LIMIT")? {
            config.chain.transfer_gas_limit = limit;
        }
        if let Some(timeout) = parse_var("SILICA_RPC_TIMEOUT_SECS")? {
            config.chain.rpc_timeout_secs = timeout;
        }
        if let Some(block) = parse_var("SILICA_START_BLOCK")? {
            config.chain.start_block = Some(block);
        }
        if let Some(range) = parse_var("SILICA_MAX_BLOCK_RANGE")? {
            config.chain.max_block_range = range;
        }
        if let Some(interval) = parse_var("SILICA_POLL_INTERVAL_SECS")? {
            config.chain.poll_interval_secs = interval;
        }

        // Scoring configuration
        if let Ok(api_url) = env::var("SILICA_OPENROUTER_URL") {
            config.scoring.api_url = api_url;
        }
        config.scoring.api_key = env::var("SILICA_OPENROUTER_API_KEY")
            .context("SILICA_OPENROUTER_API_KEY environment variable is required")?;
        if let Ok(model) = env::var("SILICA_SCORING_MODEL") {
            config.scoring.model = model;
        }
        if let Some(timeout) = parse_var("SILICA_SCORING_TIMEOUT_SECS")? {
            config.scoring.timeout_secs = timeout;
        }
        if let Some(temperature) = parse_var("SILICA_SCORING_TEMPERATURE")? {
            config.scoring.temperature = temperature;
        }
        if let Some(score) = parse_var("SILICA_FALLBACK_SCORE")? {
            config.scoring.fallback_score = score;
        }
        if let Some(chars) = parse_var("SILICA_MAX_RESPONSE_CHARS")? {
            config.scoring.max_response_chars = chars;
        }

        // Attribution configuration
        if let Some(threshold) = parse_var("SILICA_SHAPLEY_EXACT_THRESHOLD")? {
            config.attribution.exact_threshold = threshold;
        }
        if let Some(samples) = parse_var("SILICA_SHAPLEY_SAMPLES")? {
            config.attribution.monte_carlo_samples = samples;
        }
        if let Some(seed) = parse_var("SILICA_SHAPLEY_SEED")? {
            config.attribution.seed = Some(seed);
        }
        if let Some(concurrency) = parse_var("SILICA_MAX_CONCURRENT_SCORING")? {
            config.attribution.max_concurrent_scoring = concurrency;
        }

        // Settlement configuration
        if let Some(attempts) = parse_var("SILICA_FETCH_MAX_ATTEMPTS")? {
            config.settlement.fetch_max_attempts = attempts;
        }
        if let Some(attempts) = parse_var("SILICA_SEND_MAX_ATTEMPTS")? {
            config.settlement.send_max_attempts = attempts;
        }
        if let Some(attempts) = parse_var("SILICA_MAX_TX_ATTEMPTS")? {
            config.settlement.max_tx_attempts = attempts;
        }
        if let Some(attempts) = parse_var("SILICA_MAX_PAYOUT_ATTEMPTS")? {
            config.settlement.max_payout_attempts = attempts;
        }
        if let Some(timeout) = parse_var("SILICA_RECEIPT_TIMEOUT_SECS")? {
            config.settlement.receipt_timeout_secs = timeout;
        }
        if let Some(timeout) = parse_var("SILICA_CALL_TIMEOUT_SECS")? {
            config.settlement.call_timeout_secs = timeout;
        }

        // Database configuration
        if let Ok(url) = env::var("SILICA_POSTGRES_URL") {
            config.database.postgres_url = url;
        }
        if let Some(enabled) = parse_var("SILICA_POSTGRES_ENABLED")? {
            config.database.postgres_enabled = enabled;
        }
        if let Some(connections) = parse_var("SILICA_POSTGRES_MAX_CONNECTIONS")? {
            config.database.max_connections = connections;
        }

        // Logging configuration
        if let Ok(level) = env::var("SILICA_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(sanitize) = parse_var("SILICA_SANITIZE_LOGS")? {
            config.logging.sanitize_logs = sanitize;
        }

        config.validate()?;

        info!(
            chain_mode = ?config.chain.mode,
            chain_id = config.chain.chain_id,
            contract = %config.chain.contract_address,
            aggregator = %config.chain.aggregator_address,
            model = %config.scoring.model,
            postgres = config.database.postgres_enabled,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate configuration for security and consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow!("Server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(anyhow!("Server port must be non-zero"));
        }

        // Addresses
        Address::parse(&self.chain.aggregator_address)
            .map_err(|e| anyhow!("Invalid aggregator address: {}", e))?;
        Address::parse(&self.chain.contract_address)
            .map_err(|e| anyhow!("Invalid contract address: {}", e))?;

        if self.chain.mode == ChainMode::Rpc {
            let rpc = Url::parse(&self.chain.rpc_url)
                .with_context(|| format!("Invalid RPC URL: {}", self.chain.rpc_url))?;
            if !matches!(rpc.scheme(), "http" | "https") {
                return Err(anyhow!("RPC URL must be http(s): {}", self.chain.rpc_url));
            }
        }

        if self.chain.max_block_range == 0 {
            return Err(anyhow!("Max block range must be non-zero"));
        }

        // The API key travels in a bearer header
        if !self.scoring.api_url.starts_with("https://") {
            return Err(anyhow!(
                "HTTPS is required but scoring URL is not HTTPS: {}",
                self.scoring.api_url
            ));
        }

        if self.scoring.api_key.trim().is_empty() {
            return Err(anyhow!("Scoring API key is required"));
        }

        if self.scoring.fallback_score > 100 {
            return Err(anyhow!("Fallback score must be within 0..=100"));
        }

        // 8! = 40320 orderings is the practical ceiling for exact attribution
        if self.attribution.exact_threshold > 8 {
            return Err(anyhow!(
                "Exact attribution threshold {} is too large (maximum 8)",
                self.attribution.exact_threshold
            ));
        }

        if self.attribution.monte_carlo_samples == 0 {
            return Err(anyhow!("Monte-Carlo sample count must be non-zero"));
        }

        if self.attribution.max_concurrent_scoring == 0 {
            return Err(anyhow!("Scoring concurrency must be non-zero"));
        }

        let settlement = &self.settlement;
        if settlement.fetch_max_attempts == 0
            || settlement.send_max_attempts == 0
            || settlement.max_tx_attempts == 0
            || settlement.max_payout_attempts == 0
        {
            return Err(anyhow!("Retry attempt limits must be at least 1"));
        }

        if settlement.call_timeout_secs == 0 || settlement.receipt_timeout_secs == 0 {
            return Err(anyhow!("Timeouts must be non-zero"));
        }

        Ok(())
    }
}

/// Sanitize sensitive data for logging
pub fn sanitize_for_logging(data: &str) -> String {
    // Connection strings: keep everything but the password
    if data.contains("://")
        && let Ok(mut parsed) = Url::parse(data)
        && parsed.password().is_some()
    {
        let _ = parsed.set_password(Some("***"));
        return parsed.to_string();
    }

    let sensitive_patterns = ["key", "token", "password", "secret", "bearer", "sk-or-"];

    let data_lower = data.to_lowercase();
    if sensitive_patterns.iter().any(|p| data_lower.contains(p)) {
        let chars: Vec<char> = data.chars().collect();
        let keep = if chars.len() > 20 { 6 } else { 2 };
        let keep = keep.min(chars.len() / 2);
        let head: String = chars[..keep].iter().collect();
        let tail: String = chars[chars.len() - keep..].iter().collect();
        return format!("{}***{}", head, tail);
    }

    data.to_string()
}

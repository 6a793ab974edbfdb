//! Silica Consensus Oracle
//!
//! Settles fact-check requests: once enough verifiers have answered a
//! request on chain, the oracle scores the verifier coalition with an LLM,
//! submits the aggregate result, withdraws the accrued fees and splits them
//! among verifiers by Shapley attribution.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── main.rs        - Server entrypoint
//! ├── config.rs      - Configuration management
//! ├── retry.rs       - Bounded retry with exponential backoff
//! ├── chain/         - Contract and account access
//! │   ├── abi.rs        - Call encoding and log decoding
//! │   ├── nonce.rs      - Aggregator nonce allocation
//! │   ├── rpc.rs        - JSON-RPC client
//! │   └── simulated.rs  - In-memory chain
//! ├── consensus/     - Coalition scoring
//! │   ├── verdict.rs    - Verifier submission parsing
//! │   ├── summary.rs    - Redacted verifier summaries
//! │   ├── fetcher.rs    - Concurrent result fetching
//! │   ├── scoring.rs    - LLM scoring service (OpenRouter)
//! │   ├── aggregator.rs - Coalition score with fallback
//! │   └── shapley.rs    - Exact / Monte-Carlo attribution
//! ├── rewards/       - Fee allocation
//! │   └── allocator.rs  - Integer proportional split
//! ├── settlement/    - Per-request lifecycle
//! │   ├── record.rs     - Persisted settlement state
//! │   ├── store.rs      - Store trait + in-memory store
//! │   ├── coordinator.rs - State machine
//! │   └── monitor.rs    - Event polling loop
//! ├── api/           - Operator HTTP API
//! └── database/      - PostgreSQL persistence
//! ```

pub mod api;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod database;
pub mod retry;
pub mod rewards;
pub mod settlement;

// Re-export main types for convenience
pub use config::ConsensusConfig;
pub use database::{DatabasePool, SettlementRepository};
pub use retry::RetryPolicy;

// Re-export chain types
pub use chain::{
    Address, ChainClient, ChainError, InMemoryChain, JsonRpcChain, RequestId, ThresholdEvent,
    TxHash, VerifierAddress,
};

// Re-export consensus types
pub use consensus::{
    Attribution, AttributionStrategy, Coalition, ConsensusAggregator, OpenRouterClient,
    ResultFetcher, ScoringRequest, ScoringService, ShapleyEngine, Summarizer, Summary, Verdict,
};

// Re-export reward types
pub use rewards::{Allocation, AllocationError, RewardAllocator};

// Re-export settlement types
pub use settlement::{
    CoordinatorSettings, EventMonitor, InMemorySettlementStore, MonitorSettings,
    SettlementCoordinator, SettlementRecord, SettlementState, SettlementStore,
};

// Re-export API types
pub use api::{SettlementApiState, create_settlement_router};

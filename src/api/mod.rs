//! HTTP API endpoints for the consensus oracle
//!
//! Provides an operator API for:
//! - Health and scoring statistics
//! - Settlement records (all, failed, by request id)

pub mod settlements;

pub use settlements::{SettlementApiState, create_settlement_router};

//! Settlement Module
//!
//! Per-request lifecycle from event detection to the last payout:
//!
//! - `record`: persisted state of one round
//! - `store`: persistence seam (PostgreSQL or in-memory)
//! - `coordinator`: the state machine
//! - `monitor`: event polling loop feeding the coordinator

pub mod coordinator;
pub mod monitor;
pub mod record;
pub mod store;

pub use coordinator::{CoordinatorSettings, EventOutcome, SettlementCoordinator, build_payload};
pub use monitor::{EventMonitor, MonitorSettings, TickSummary};
pub use record::{
    Payout, PayoutStatus, SettlementRecord, SettlementStage, SettlementState, TrackedTx, TxStatus,
    payout_key,
};
pub use store::{InMemorySettlementStore, SettlementStore};

//! PostgreSQL Database Module
//!
//! Durable storage for settlement records and the event scan cursor.

pub mod pool;
pub mod settlements;

pub use pool::DatabasePool;
pub use settlements::SettlementRepository;

//! Reward distribution
//!
//! Splits the observed withdrawal across verifiers according to their
//! Shapley weights. Amounts are in the chain's base unit (wei).

pub mod allocator;

pub use allocator::{Allocation, AllocationError, RewardAllocator, SplitPolicy, WEIGHT_SCALE};

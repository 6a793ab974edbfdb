//! Reward Allocator
//!
//! Turns attribution weights and a withdrawn amount into integer shares.
//!
//! - `total <= 0`: nothing to distribute
//! - weight sum `<= 0`: equal split, residual to the lowest addresses
//! - otherwise proportional over positive weights, residual one unit at a
//!   time to the largest remainders (ties: ascending address)
//!
//! Weights are fixed-point (6 decimals) so the split is exact integer math.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::chain::VerifierAddress;

/// Fixed-point scale applied to weights
pub const WEIGHT_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("no verifiers to allocate to")]
    NoVerifiers,

    #[error("weight for {verifier} is not finite: {weight}")]
    InvalidWeight {
        verifier: VerifierAddress,
        weight: String,
    },

    #[error("arithmetic overflow while allocating {total}")]
    Overflow { total: u128 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    Proportional,
    /// Non-positive weight sum
    EqualSplit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    NothingToDistribute,
    Shares {
        shares: BTreeMap<VerifierAddress, u128>,
        policy: SplitPolicy,
    },
}

impl Allocation {
    pub fn shares(&self) -> Option<&BTreeMap<VerifierAddress, u128>> {
        match self {
            Allocation::NothingToDistribute => None,
            Allocation::Shares { shares, .. } => Some(shares),
        }
    }

    pub fn distributed(&self) -> u128 {
        self.shares()
            .map(|shares| shares.values().sum())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RewardAllocator;

impl RewardAllocator {
    pub fn new() -> Self {
        Self
    }

    pub fn allocate(
        &self,
        weights: &BTreeMap<VerifierAddress, f64>,
        total: i128,
    ) -> Result<Allocation, AllocationError> {
        if total <= 0 {
            info!(total, "Nothing to distribute");
            return Ok(Allocation::NothingToDistribute);
        }
        let total = total as u128;

        if weights.is_empty() {
            return Err(AllocationError::NoVerifiers);
        }

        let quantized = quantize(weights)?;
        let sum = quantized
            .iter()
            .try_fold(0i128, |acc, (_, q)| acc.checked_add(*q))
            .ok_or(AllocationError::Overflow { total })?;

        let (shares, policy) = if sum <= 0 {
            (equal_split(weights.keys(), total), SplitPolicy::EqualSplit)
        } else {
            (proportional(&quantized, total)?, SplitPolicy::Proportional)
        };

        debug!(
            total,
            verifiers = shares.len(),
            policy = ?policy,
            "Allocation computed"
        );

        Ok(Allocation::Shares { shares, policy })
    }
}

fn quantize(
    weights: &BTreeMap<VerifierAddress, f64>,
) -> Result<Vec<(&VerifierAddress, i128)>, AllocationError> {
    weights
        .iter()
        .map(|(verifier, weight)| {
            if !weight.is_finite() {
                return Err(AllocationError::InvalidWeight {
                    verifier: verifier.clone(),
                    weight: weight.to_string(),
                });
            }
            Ok((verifier, (weight * WEIGHT_SCALE).round() as i128))
        })
        .collect()
}

fn equal_split<'a>(
    verifiers: impl ExactSizeIterator<Item = &'a VerifierAddress>,
    total: u128,
) -> BTreeMap<VerifierAddress, u128> {
    let count = verifiers.len() as u128;
    let base = total / count;
    let residual = (total % count) as usize;

    // Iteration is in ascending address order
    verifiers
        .enumerate()
        .map(|(index, verifier)| {
            let bonus = if index < residual { 1 } else { 0 };
            (verifier.clone(), base + bonus)
        })
        .collect()
}

fn proportional(
    quantized: &[(&VerifierAddress, i128)],
    total: u128,
) -> Result<BTreeMap<VerifierAddress, u128>, AllocationError> {
    let overflow = AllocationError::Overflow { total };

    // Negative weights take no share; the denominator is the positive mass
    let positive: Vec<(&VerifierAddress, u128)> = quantized
        .iter()
        .map(|(verifier, q)| (*verifier, (*q).max(0) as u128))
        .collect();
    let denominator = positive
        .iter()
        .try_fold(0u128, |acc, (_, q)| acc.checked_add(*q))
        .ok_or_else(|| overflow.clone())?;

    let mut shares = BTreeMap::new();
    let mut remainders: Vec<(u128, &VerifierAddress)> = Vec::with_capacity(positive.len());
    let mut assigned: u128 = 0;

    for (verifier, weight) in &positive {
        let numerator = total.checked_mul(*weight).ok_or_else(|| overflow.clone())?;
        let share = numerator / denominator;
        assigned += share;
        shares.insert((*verifier).clone(), share);
        remainders.push((numerator % denominator, *verifier));
    }

    // Largest remainder first, ascending address on ties
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let residual = (total - assigned) as usize;
    for (_, verifier) in remainders.iter().take(residual) {
        if let Some(share) = shares.get_mut(*verifier) {
            *share += 1;
        }
    }

    Ok(shares)
}

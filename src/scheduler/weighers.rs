//! Backend Weighers
//!
//! Each weigher scores the pools that passed filtering. Scores are min-max
//! normalised per weigher, scaled by its multiplier and summed.

use super::backend_state::PoolState;
use super::filters::RequestSpec;

/// Raw score of a pool; higher wins before the multiplier is applied
pub trait BackendWeigher: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_multiplier(&self) -> f64 {
        1.0
    }

    fn weigh(&self, pool: &PoolState, spec: &RequestSpec) -> f64;
}

/// Prefer pools with the most free (virtual, for thin requests) capacity
pub struct CapacityWeigher;

impl BackendWeigher for CapacityWeigher {
    fn name(&self) -> &'static str {
        "CapacityWeigher"
    }

    fn weigh(&self, pool: &PoolState, spec: &RequestSpec) -> f64 {
        pool.virtual_free_capacity(spec.wants_thin())
    }
}

/// Spread by allocated capacity; the negative default multiplier favours
/// the least allocated pool
pub struct AllocatedCapacityWeigher;

impl BackendWeigher for AllocatedCapacityWeigher {
    fn name(&self) -> &'static str {
        "AllocatedCapacityWeigher"
    }

    fn default_multiplier(&self) -> f64 {
        -1.0
    }

    fn weigh(&self, pool: &PoolState, _spec: &RequestSpec) -> f64 {
        pool.allocated_capacity_gb
    }
}

/// Min-max normalise; all-equal inputs normalise to zero
pub fn normalize(weights: &[f64]) -> Vec<f64> {
    let Some(min) = weights.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = weights.iter().copied().fold(min, f64::max);
    if max == min {
        return vec![0.0; weights.len()];
    }
    let range = max - min;
    weights.iter().map(|w| (w - min) / range).collect()
}

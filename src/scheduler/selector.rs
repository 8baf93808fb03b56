//! Backend Selector
//!
//! Filter scheduler: filter pools, weigh the survivors and pick the best.
//! Ties keep the registration order of the pools.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend_state::{BackendStateManager, PoolState};
use super::filters::{default_filters, BackendFilter, RequestSpec};
use super::weighers::{normalize, AllocatedCapacityWeigher, BackendWeigher, CapacityWeigher};
use crate::domain::host::{extract_host, HostLevel};
use crate::error::{Error, Result};

/// Multipliers applied to the built-in weighers
#[derive(Debug, Clone, Copy)]
pub struct WeigherMultipliers {
    pub capacity: f64,
    pub allocated_capacity: f64,
}

impl Default for WeigherMultipliers {
    fn default() -> Self {
        Self {
            capacity: CapacityWeigher.default_multiplier(),
            allocated_capacity: AllocatedCapacityWeigher.default_multiplier(),
        }
    }
}

/// A pool together with its total weight
#[derive(Debug, Clone)]
pub struct WeighedBackend {
    pub pool: PoolState,
    pub weight: f64,
}

/// Filter scheduler over the shared backend state
pub struct FilterScheduler {
    state: Arc<BackendStateManager>,
    filters: Vec<Box<dyn BackendFilter>>,
    weighers: Vec<(Box<dyn BackendWeigher>, f64)>,
}

impl FilterScheduler {
    pub fn new(state: Arc<BackendStateManager>, multipliers: WeigherMultipliers) -> Self {
        Self {
            state,
            filters: default_filters(),
            weighers: vec![
                (Box::new(CapacityWeigher), multipliers.capacity),
                (Box::new(AllocatedCapacityWeigher), multipliers.allocated_capacity),
            ],
        }
    }

    pub fn state(&self) -> &Arc<BackendStateManager> {
        &self.state
    }

    /// Pools that pass every filter, in registration order
    pub fn filter(&self, spec: &RequestSpec) -> Vec<PoolState> {
        self.state
            .pools()
            .into_iter()
            .filter(|pool| self.pool_passes(pool, spec))
            .collect()
    }

    fn pool_passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool {
        for filter in &self.filters {
            if !filter.passes(pool, spec) {
                debug!("Pool {} rejected by {}", pool.host, filter.name());
                return false;
            }
        }
        true
    }

    /// Weigh pools, best first; equal weights keep input order
    pub fn weigh(&self, pools: Vec<PoolState>, spec: &RequestSpec) -> Vec<WeighedBackend> {
        let mut totals = vec![0.0; pools.len()];
        for (weigher, multiplier) in &self.weighers {
            let raw: Vec<f64> = pools.iter().map(|p| weigher.weigh(p, spec)).collect();
            for (total, w) in totals.iter_mut().zip(normalize(&raw)) {
                *total += multiplier * w;
            }
        }

        let mut weighed: Vec<WeighedBackend> = pools
            .into_iter()
            .zip(totals)
            .map(|(pool, weight)| WeighedBackend { pool, weight })
            .collect();
        // sort_by is stable
        weighed.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        weighed
    }

    /// Choose a pool for a new volume and account for its size
    pub fn select_backend(&self, spec: &RequestSpec) -> Result<WeighedBackend> {
        let candidates = self.filter(spec);
        if candidates.is_empty() {
            warn!("No valid backend for request of {} GB", spec.size);
            return Err(Error::NoValidBackend {
                reason: format!("no weighed backends available for {} GB", spec.size),
            });
        }

        let best = self
            .weigh(candidates, spec)
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoValidBackend {
                reason: "no weighed backends available".to_string(),
            })?;

        self.state.consume(&best.pool.host, spec.size)?;
        info!(
            "Selected backend {} (weight {:.3}) for {} GB",
            best.pool.host, best.weight, spec.size
        );
        Ok(best)
    }

    /// Choose a pool on another backend for a volume currently on `current_host`
    pub fn find_migration_target(&self, current_host: &str, spec: &RequestSpec) -> Result<WeighedBackend> {
        let mut spec = spec.clone();
        if let Some(backend) = extract_host(current_host, HostLevel::Backend, false) {
            spec.ignore_backends.push(backend);
        }
        self.select_backend(&spec)
    }

    /// Check that a specific pool can take the request
    pub fn backend_passes_filters(&self, host: &str, spec: &RequestSpec) -> Result<PoolState> {
        let pool = self.state.get(host).ok_or_else(|| Error::NoValidBackend {
            reason: format!("cannot place volume on {}", host),
        })?;
        if !self.pool_passes(&pool, spec) {
            return Err(Error::NoValidBackend {
                reason: format!("cannot place volume on {}", host),
            });
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{BackendStats, PoolStats};
    use assert_matches::assert_matches;

    fn stats(pools: Vec<PoolStats>) -> BackendStats {
        BackendStats {
            volume_backend_name: "lvm".into(),
            vendor_name: "Open Source".into(),
            driver_version: "1.0".into(),
            storage_protocol: "iSCSI".into(),
            pools,
        }
    }

    fn scheduler() -> FilterScheduler {
        let state = Arc::new(BackendStateManager::new());
        state.update_from_stats("n1@lvm", "nova", &stats(vec![PoolStats::new("a", 100.0, 40.0)]));
        state.update_from_stats("n2@lvm", "nova", &stats(vec![PoolStats::new("a", 100.0, 90.0)]));
        FilterScheduler::new(state, WeigherMultipliers::default())
    }

    #[test]
    fn test_select_most_free() {
        let scheduler = scheduler();
        let best = scheduler.select_backend(&RequestSpec::new(10)).unwrap();
        assert_eq!(best.pool.host, "n2@lvm#a");
        assert_eq!(scheduler.state().get("n2@lvm#a").unwrap().free_capacity_gb, 80.0);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let state = Arc::new(BackendStateManager::new());
        state.update_from_stats("n1@lvm", "nova", &stats(vec![PoolStats::new("a", 100.0, 50.0)]));
        state.update_from_stats("n2@lvm", "nova", &stats(vec![PoolStats::new("a", 100.0, 50.0)]));
        let scheduler = FilterScheduler::new(state, WeigherMultipliers::default());

        let weighed = scheduler.weigh(scheduler.filter(&RequestSpec::new(1)), &RequestSpec::new(1));
        assert_eq!(weighed[0].pool.host, "n1@lvm#a");
        assert_eq!(weighed[0].weight, weighed[1].weight);
    }

    #[test]
    fn test_default_multipliers_follow_weighers() {
        let multipliers = WeigherMultipliers::default();
        assert_eq!(multipliers.capacity, 1.0);
        assert_eq!(multipliers.allocated_capacity, -1.0);
    }

    #[test]
    fn test_no_valid_backend() {
        let scheduler = scheduler();
        assert_matches!(
            scheduler.select_backend(&RequestSpec::new(500)),
            Err(Error::NoValidBackend { .. })
        );
    }

    #[test]
    fn test_migration_skips_current_backend() {
        let scheduler = scheduler();
        let target = scheduler
            .find_migration_target("n2@lvm#a", &RequestSpec::new(1))
            .unwrap();
        assert_eq!(target.pool.backend, "n1@lvm");
    }

    #[test]
    fn test_backend_passes_filters() {
        let scheduler = scheduler();
        assert!(scheduler.backend_passes_filters("n1@lvm#a", &RequestSpec::new(10)).is_ok());
        assert!(scheduler.backend_passes_filters("n1@lvm#a", &RequestSpec::new(50)).is_err());
        assert!(scheduler.backend_passes_filters("n9@lvm#a", &RequestSpec::new(1)).is_err());
    }
}

//! Backend State
//!
//! Per-pool capacity and capability view built from driver stats reports.
//! Pools are kept in registration order so weighing ties resolve stably.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::host::append_pool;
use crate::domain::ports::{BackendStats, PoolStats};
use crate::error::{Error, Result};

// =============================================================================
// Pool State
// =============================================================================

/// Scheduler view of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolState {
    /// Full placement, `host@backend#pool`
    pub host: String,
    /// `host@backend`
    pub backend: String,
    pub pool_name: String,
    pub availability_zone: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    pub allocated_capacity_gb: f64,
    pub provisioned_capacity_gb: f64,
    pub reserved_percentage: u32,
    pub max_over_subscription_ratio: f64,
    pub thin_provisioning_support: bool,
    pub thick_provisioning_support: bool,
    pub multiattach: bool,
    /// Flattened capabilities matched by the capabilities filter
    pub capabilities: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl PoolState {
    pub fn from_stats(
        backend: &str,
        availability_zone: &str,
        stats: &BackendStats,
        pool: &PoolStats,
    ) -> Self {
        let mut capabilities = pool.capabilities.clone();
        capabilities.insert("volume_backend_name".into(), stats.volume_backend_name.clone());
        capabilities.insert("vendor_name".into(), stats.vendor_name.clone());
        capabilities.insert("driver_version".into(), stats.driver_version.clone());
        capabilities.insert("storage_protocol".into(), stats.storage_protocol.clone());
        capabilities.insert("pool_name".into(), pool.pool_name.clone());
        capabilities.insert(
            "thin_provisioning_support".into(),
            pool.thin_provisioning_support.to_string(),
        );
        capabilities.insert(
            "thick_provisioning_support".into(),
            pool.thick_provisioning_support.to_string(),
        );
        capabilities.insert("multiattach".into(), pool.multiattach.to_string());

        Self {
            host: append_pool(backend, Some(&pool.pool_name)),
            backend: backend.to_string(),
            pool_name: pool.pool_name.clone(),
            availability_zone: availability_zone.to_string(),
            total_capacity_gb: pool.total_capacity_gb,
            free_capacity_gb: pool.free_capacity_gb,
            allocated_capacity_gb: pool.allocated_capacity_gb,
            provisioned_capacity_gb: pool.provisioned_capacity_gb,
            reserved_percentage: pool.reserved_percentage,
            max_over_subscription_ratio: pool.max_over_subscription_ratio,
            thin_provisioning_support: pool.thin_provisioning_support,
            thick_provisioning_support: pool.thick_provisioning_support,
            multiattach: pool.multiattach,
            capabilities,
            updated_at: Utc::now(),
        }
    }

    /// Space held back from allocation, in GB
    pub fn reserved_gb(&self) -> f64 {
        (self.total_capacity_gb * self.reserved_percentage as f64 / 100.0).floor()
    }

    /// Free capacity as seen by a request of the given provisioning type
    pub fn virtual_free_capacity(&self, thin: bool) -> f64 {
        if thin && self.thin_provisioning_support {
            self.total_capacity_gb * self.max_over_subscription_ratio
                - self.provisioned_capacity_gb
                - self.reserved_gb()
        } else {
            self.free_capacity_gb - self.reserved_gb()
        }
    }

    /// Account for a volume placed on this pool until the next stats report
    pub fn consume_from_volume(&mut self, size_gb: u64) {
        let size = size_gb as f64;
        self.allocated_capacity_gb += size;
        self.provisioned_capacity_gb += size;
        self.free_capacity_gb -= size;
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Backend State Manager
// =============================================================================

/// All known pools, keyed by full placement
#[derive(Default)]
pub struct BackendStateManager {
    pools: RwLock<IndexMap<String, PoolState>>,
}

impl BackendStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every pool of `backend` with the pools in `stats`
    pub fn update_from_stats(&self, backend: &str, availability_zone: &str, stats: &BackendStats) {
        let mut pools = self.pools.write();
        let fresh: Vec<PoolState> = stats
            .pools
            .iter()
            .map(|p| PoolState::from_stats(backend, availability_zone, stats, p))
            .collect();

        pools.retain(|_, p| p.backend != backend || fresh.iter().any(|f| f.host == p.host));
        for pool in fresh {
            debug!(
                "Pool {} reports {:.1}/{:.1} GB free",
                pool.host, pool.free_capacity_gb, pool.total_capacity_gb
            );
            pools.insert(pool.host.clone(), pool);
        }
    }

    pub fn remove_backend(&self, backend: &str) {
        self.pools.write().retain(|_, p| p.backend != backend);
    }

    /// Snapshot of all pools in registration order
    pub fn pools(&self) -> Vec<PoolState> {
        self.pools.read().values().cloned().collect()
    }

    pub fn get(&self, host: &str) -> Option<PoolState> {
        self.pools.read().get(host).cloned()
    }

    pub fn consume(&self, host: &str, size_gb: u64) -> Result<()> {
        let mut pools = self.pools.write();
        let pool = pools.get_mut(host).ok_or_else(|| Error::BackendNotFound {
            host: host.to_string(),
        })?;
        pool.consume_from_volume(size_gb);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

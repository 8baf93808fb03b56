//! Backend Filters
//!
//! Pure accept/reject predicates over pool state for one placement request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::backend_state::PoolState;
use super::extra_specs_ops;
use crate::domain::host::{extract_host, same_backend, HostLevel};

/// Prefix of extra spec keys matched against capabilities
const CAPABILITIES_SCOPE: &str = "capabilities";

// =============================================================================
// Request Spec
// =============================================================================

/// What a placement request asks for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Size in GB
    pub size: u64,
    /// Extra specs of the requested volume type
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub multiattach: bool,
    /// Backends (`host@backend` or full placement) to skip
    #[serde(default)]
    pub ignore_backends: Vec<String>,
    /// Restrict placement to the backend of this placement
    pub same_backend_as: Option<String>,
}

impl RequestSpec {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Thin provisioning unless the type asks for `provisioning:type=thick`
    pub fn wants_thin(&self) -> bool {
        self.extra_specs
            .get("provisioning:type")
            .map(|t| t != "thick")
            .unwrap_or(true)
    }
}

// =============================================================================
// Filter Trait
// =============================================================================

/// Accept or reject one pool for a request
pub trait BackendFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool;
}

/// Filters applied by default, in order
pub fn default_filters() -> Vec<Box<dyn BackendFilter>> {
    vec![
        Box::new(IgnoredBackendsFilter),
        Box::new(SameBackendFilter),
        Box::new(AvailabilityZoneFilter),
        Box::new(CapacityFilter),
        Box::new(CapabilitiesFilter),
    ]
}

// =============================================================================
// Filters
// =============================================================================

/// Pool must be in the requested availability zone
pub struct AvailabilityZoneFilter;

impl BackendFilter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "AvailabilityZoneFilter"
    }

    fn passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool {
        match spec.availability_zone {
            Some(ref az) => pool.availability_zone == *az,
            None => true,
        }
    }
}

/// Pool must have room for the request, honouring reserved space and
/// thin provisioning over-subscription
pub struct CapacityFilter;

impl BackendFilter for CapacityFilter {
    fn name(&self) -> &'static str {
        "CapacityFilter"
    }

    fn passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool {
        let requested = spec.size as f64;
        if pool.total_capacity_gb <= 0.0 {
            return false;
        }

        let free = pool.free_capacity_gb - pool.reserved_gb();
        let thin = spec.wants_thin();

        if thin && pool.thin_provisioning_support {
            if pool.max_over_subscription_ratio < 1.0 {
                return false;
            }
            let provisioned_ratio =
                (pool.provisioned_capacity_gb + requested) / pool.total_capacity_gb;
            if provisioned_ratio > pool.max_over_subscription_ratio {
                return false;
            }
            return free * pool.max_over_subscription_ratio >= requested;
        }

        if !thin && !pool.thick_provisioning_support {
            return false;
        }

        free >= requested
    }
}

/// Type extra specs must match pool capabilities
pub struct CapabilitiesFilter;

impl BackendFilter for CapabilitiesFilter {
    fn name(&self) -> &'static str {
        "CapabilitiesFilter"
    }

    fn passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool {
        if spec.multiattach && !pool.multiattach {
            return false;
        }

        for (key, requirement) in &spec.extra_specs {
            let capability = match key.split_once(':') {
                Some((CAPABILITIES_SCOPE, rest)) => rest,
                // Scoped keys belong to someone else (qos:, provisioning:, ...)
                Some(_) => continue,
                None => key.as_str(),
            };
            let value = pool.capabilities.get(capability).map(String::as_str);
            if value.is_none() {
                return false;
            }
            if !extra_specs_ops::matches(value, Some(requirement)) {
                return false;
            }
        }
        true
    }
}

/// Skip backends the request excludes, such as a migration source
pub struct IgnoredBackendsFilter;

impl BackendFilter for IgnoredBackendsFilter {
    fn name(&self) -> &'static str {
        "IgnoredBackendsFilter"
    }

    fn passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool {
        !spec.ignore_backends.iter().any(|ignored| {
            if ignored.contains('#') {
                *ignored == pool.host
            } else {
                extract_host(ignored, HostLevel::Backend, false).as_deref()
                    == Some(pool.backend.as_str())
            }
        })
    }
}

/// Keep a new volume on the backend of its snapshot or source volume
pub struct SameBackendFilter;

impl BackendFilter for SameBackendFilter {
    fn name(&self) -> &'static str {
        "SameBackendFilter"
    }

    fn passes(&self, pool: &PoolState, spec: &RequestSpec) -> bool {
        match spec.same_backend_as {
            Some(ref host) => same_backend(host, &pool.host),
            None => true,
        }
    }
}

//! Service Configuration
//!
//! YAML configuration of the lifecycle service. Every field has a default,
//! so an empty document yields a working single-backend setup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::controlplane::quota::QuotaLimits;
use crate::domain::ports::PoolStats;
use crate::error::{Error, Result};
use crate::message::DEFAULT_MESSAGE_TTL_SECS;
use crate::scheduler::WeigherMultipliers;
use crate::volume_types::DEFAULT_VOLUME_TYPE_NAME;

/// Top level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Host name used to build `host@backend#pool` placements
    pub host: String,
    pub availability_zone: String,
    /// Name of the type used when a request names none
    pub default_volume_type: String,
    /// How long to wait for a resource lock; 0 waits forever
    pub lock_timeout_secs: u64,
    /// Interval of the backend stats refresh
    pub stats_interval_secs: u64,
    /// Lifetime of user messages
    pub message_ttl_secs: i64,
    pub quota: QuotaLimits,
    pub scheduler: SchedulerSettings,
    pub backends: Vec<BackendSettings>,
    pub backup_services: Vec<BackupServiceSettings>,
    /// Types created at startup besides the default type
    pub volume_types: Vec<VolumeTypeSettings>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            availability_zone: "nova".to_string(),
            default_volume_type: DEFAULT_VOLUME_TYPE_NAME.to_string(),
            lock_timeout_secs: 0,
            stats_interval_secs: 60,
            message_ttl_secs: DEFAULT_MESSAGE_TTL_SECS,
            quota: QuotaLimits::default(),
            scheduler: SchedulerSettings::default(),
            backends: vec![BackendSettings::default()],
            backup_services: vec![BackupServiceSettings::default()],
            volume_types: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration("host must not be empty".to_string()));
        }
        if self.message_ttl_secs <= 0 {
            return Err(Error::Configuration(
                "message_ttl_secs must be positive".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() || backend.name.contains(['@', '#']) {
                return Err(Error::Configuration(format!(
                    "invalid backend name '{}'",
                    backend.name
                )));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "backend {} configured twice",
                    backend.name
                )));
            }
            if backend.pools.is_empty() {
                return Err(Error::Configuration(format!(
                    "backend {} declares no pools",
                    backend.name
                )));
            }
        }
        Ok(())
    }

    /// `host@backend` of a configured backend
    pub fn backend_host(&self, backend: &BackendSettings) -> String {
        format!("{}@{}", self.host, backend.name)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_secs > 0).then(|| Duration::from_secs(self.lock_timeout_secs))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/// Weigher multipliers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub capacity_weight_multiplier: f64,
    pub allocated_capacity_weight_multiplier: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = WeigherMultipliers::default();
        Self {
            capacity_weight_multiplier: defaults.capacity,
            allocated_capacity_weight_multiplier: defaults.allocated_capacity,
        }
    }
}

impl SchedulerSettings {
    pub fn multipliers(&self) -> WeigherMultipliers {
        WeigherMultipliers {
            capacity: self.capacity_weight_multiplier,
            allocated_capacity: self.allocated_capacity_weight_multiplier,
        }
    }
}

/// One volume backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Backend section name, the middle part of a placement
    pub name: String,
    /// Driver name in the driver registry
    pub driver: String,
    /// Zone of the backend; the service zone when absent
    pub availability_zone: Option<String>,
    /// Reported backend name; the section name when absent
    pub volume_backend_name: Option<String>,
    pub storage_protocol: String,
    pub pools: Vec<PoolStats>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            driver: "memory".to_string(),
            availability_zone: None,
            volume_backend_name: None,
            storage_protocol: "local".to_string(),
            pools: vec![PoolStats::new("pool0", 1000.0, 1000.0)],
        }
    }
}

impl BackendSettings {
    pub fn volume_backend_name(&self) -> String {
        self.volume_backend_name
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

/// One backup service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupServiceSettings {
    pub host: String,
    pub driver: String,
    pub availability_zone: Option<String>,
}

impl Default for BackupServiceSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            driver: "memory".to_string(),
            availability_zone: None,
        }
    }
}

/// Volume type created at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeTypeSettings {
    pub name: String,
    pub description: Option<String>,
    pub extra_specs: BTreeMap<String, String>,
}

//! Domain Ports - Driver capability interfaces
//!
//! These traits are the boundary between the lifecycle core and the vendor
//! backends. Drivers implement them; the core only ever consumes them.

use crate::domain::model::{Backup, Snapshot, Volume};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Connector / Connection Info
// =============================================================================

/// Properties of the host that wants to connect to a volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorProperties {
    /// Host name of the initiator
    pub host: String,
    /// iSCSI initiator name, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub multipath: bool,
    /// Anything else, forwarded to the driver untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ConnectorProperties {
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }
}

/// Connection information returned by `initialize_connection`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Transport, e.g. `iscsi`, `rbd`, `local`
    pub driver_volume_type: String,
    /// Transport specific data; the core adds `qos_specs` and `access_mode`
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Driver Results
// =============================================================================

/// Fields a driver asks the core to persist after an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub provider_location: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ModelUpdate {
    pub fn with_location(location: impl Into<String>) -> Self {
        Self {
            provider_location: Some(location.into()),
            metadata: BTreeMap::new(),
        }
    }
}

/// Reference to a pre-existing backend object (`source-name` / `source-id`)
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExistingRef(pub BTreeMap<String, String>);

impl ExistingRef {
    pub fn source_name(name: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("source-name".to_string(), name.into());
        Self(map)
    }

    pub fn source_id(id: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("source-id".to_string(), id.into());
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("source-name").map(String::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("source-id").map(String::as_str)
    }

    /// The backend identifier this reference points at
    pub fn identifier(&self) -> Option<&str> {
        self.name().or_else(|| self.id())
    }

    /// Smallest value of the reference map, used for sorting
    pub fn sort_value(&self) -> Option<&str> {
        self.0.values().map(String::as_str).min()
    }
}

impl std::fmt::Display for ExistingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// One entry of a list-manageable response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManageableDescriptor {
    pub reference: ExistingRef,
    /// Size in GB
    pub size: u64,
    pub safe_to_manage: bool,
    pub reason_not_safe: Option<String>,
    pub cinder_id: Option<String>,
    pub extra_info: Option<String>,
}

/// Sort key accepted by the list-manageable helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Size,
    Reference,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

/// Pagination and sorting parameters for list-manageable calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManageableQuery {
    pub marker: Option<ExistingRef>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_keys: Vec<SortKey>,
    #[serde(default)]
    pub sort_dirs: Vec<SortDir>,
}

// =============================================================================
// Backend Stats
// =============================================================================

/// Capacity and capability report for one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    #[serde(default)]
    pub allocated_capacity_gb: f64,
    #[serde(default)]
    pub provisioned_capacity_gb: f64,
    #[serde(default)]
    pub reserved_percentage: u32,
    #[serde(default = "default_over_subscription")]
    pub max_over_subscription_ratio: f64,
    #[serde(default)]
    pub thin_provisioning_support: bool,
    #[serde(default = "default_true")]
    pub thick_provisioning_support: bool,
    #[serde(default)]
    pub multiattach: bool,
    /// Vendor capabilities matched against type extra specs
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

fn default_over_subscription() -> f64 {
    20.0
}

fn default_true() -> bool {
    true
}

impl PoolStats {
    pub fn new(pool_name: impl Into<String>, total_capacity_gb: f64, free_capacity_gb: f64) -> Self {
        Self {
            pool_name: pool_name.into(),
            total_capacity_gb,
            free_capacity_gb,
            allocated_capacity_gb: 0.0,
            provisioned_capacity_gb: 0.0,
            reserved_percentage: 0,
            max_over_subscription_ratio: default_over_subscription(),
            thin_provisioning_support: false,
            thick_provisioning_support: true,
            multiattach: false,
            capabilities: BTreeMap::new(),
        }
    }
}

/// Stats report of a whole backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub volume_backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub pools: Vec<PoolStats>,
}

// =============================================================================
// Volume Driver Port
// =============================================================================

/// Capability interface every volume backend implements
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Backend name this driver serves
    fn backend_name(&self) -> &str;

    /// Whether setup completed and the driver accepts calls
    fn is_initialized(&self) -> bool;

    /// Validate configuration and connect to the backend
    async fn do_setup(&self) -> Result<()>;

    /// Create a raw volume
    async fn create_volume(&self, volume: &Volume) -> Result<ModelUpdate>;

    /// Delete a volume; a missing backend object is reported as not found
    async fn delete_volume(&self, volume: &Volume) -> Result<()>;

    /// Grow a volume to `new_size` GB
    async fn extend_volume(&self, volume: &Volume, new_size: u64) -> Result<()>;

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<ModelUpdate>;

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<ModelUpdate>;

    async fn create_cloned_volume(&self, volume: &Volume, src_vref: &Volume) -> Result<ModelUpdate>;

    /// Export a volume to a connector
    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo>;

    /// Remove an export; `None` removes every export of the volume
    async fn terminate_connection(
        &self,
        volume: &Volume,
        connector: Option<&ConnectorProperties>,
    ) -> Result<()>;

    /// Take over a backend object
    async fn manage_existing(&self, volume: &Volume, existing_ref: &ExistingRef) -> Result<ModelUpdate>;

    /// Size in GB of the backend object a reference points at
    async fn manage_existing_get_size(&self, volume: &Volume, existing_ref: &ExistingRef) -> Result<u64>;

    /// Stop managing a volume, leaving the backend object in place
    async fn unmanage(&self, volume: &Volume) -> Result<()>;

    /// List backend volumes that could be managed
    async fn get_manageable_volumes(
        &self,
        cinder_volumes: &[Volume],
        query: &ManageableQuery,
    ) -> Result<Vec<ManageableDescriptor>>;

    /// List backend snapshots that could be managed
    async fn get_manageable_snapshots(
        &self,
        _cinder_snapshots: &[Snapshot],
        _query: &ManageableQuery,
    ) -> Result<Vec<ManageableDescriptor>> {
        Ok(Vec::new())
    }

    /// Capacity and capability report
    async fn get_volume_stats(&self, refresh: bool) -> Result<BackendStats>;
}

// =============================================================================
// Backup Driver Port
// =============================================================================

/// Device a backup reads from or a restore writes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDevice {
    /// Volume record behind the device (the source or a temporary clone)
    pub volume_id: String,
    /// Whether the device is a temporary clone owned by the backup
    pub is_temporary: bool,
    /// Connection established for the duration of the operation
    pub connection: Option<ConnectionInfo>,
}

/// Interface of a backup service driver
#[async_trait]
pub trait BackupDriver: Send + Sync {
    /// Name recorded on backups produced by this driver
    fn service_name(&self) -> &str;

    /// Whether the backup service is up
    fn is_working(&self) -> bool;

    async fn backup(&self, backup: &Backup, device: &BackupDevice) -> Result<()>;

    async fn restore(&self, backup: &Backup, device: &BackupDevice) -> Result<()>;

    /// Remove backup data; missing data is reported as not found
    async fn delete_backup(&self, backup: &Backup) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeDriverRef = Arc<dyn VolumeDriver>;
pub type BackupDriverRef = Arc<dyn BackupDriver>;

impl std::fmt::Debug for dyn VolumeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDriver")
            .field("backend_name", &self.backend_name())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for dyn BackupDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupDriver")
            .field("service_name", &self.service_name())
            .finish_non_exhaustive()
    }
}

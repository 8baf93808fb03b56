//! In-Memory Volume Driver
//!
//! Keeps backend objects in memory. Serves standalone deployments and the
//! test suite; failures can be injected per operation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::instrumentation::{Failure, Instrumentation};
use crate::domain::host::{extract_host, HostLevel};
use crate::domain::model::{Snapshot, Volume};
use crate::domain::ports::{
    BackendStats, ConnectionInfo, ConnectorProperties, ExistingRef, ManageableDescriptor,
    ManageableQuery, ModelUpdate, PoolStats, VolumeDriver,
};
use crate::error::{Error, Result};
use crate::manageable::{list_manageable, BackendObject};

const VOLUME_PREFIX: &str = "volume-";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const UNMANAGED_PREFIX: &str = "unmanaged-";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the in-memory driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDriverConfig {
    /// Backend name reported in stats
    pub backend_name: String,
    pub storage_protocol: String,
    /// Pools with their total capacity; free capacity is computed
    pub pools: Vec<PoolStats>,
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            backend_name: "memory".to_string(),
            storage_protocol: "local".to_string(),
            pools: vec![PoolStats::new("pool0", 1000.0, 1000.0)],
        }
    }
}

// =============================================================================
// Backend Objects
// =============================================================================

#[derive(Debug, Clone)]
struct BackendVolume {
    size: u64,
    pool: String,
    /// Hosts the volume is exported to
    exports: Vec<String>,
}

#[derive(Debug, Clone)]
struct BackendSnapshot {
    volume_name: String,
    size: u64,
}

// =============================================================================
// Driver
// =============================================================================

/// Volume driver backed by in-process maps
pub struct InMemoryDriver {
    config: MemoryDriverConfig,
    initialized: AtomicBool,
    volumes: RwLock<BTreeMap<String, BackendVolume>>,
    snapshots: RwLock<BTreeMap<String, BackendSnapshot>>,
    instrumentation: Instrumentation,
}

impl InMemoryDriver {
    pub fn new(config: MemoryDriverConfig) -> Self {
        Self {
            config,
            initialized: AtomicBool::new(false),
            volumes: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
            instrumentation: Instrumentation::default(),
        }
    }

    /// Call accounting and failure injection
    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Place an object on the backend that no volume record owns
    pub async fn add_unmanaged_volume(&self, name: &str, size: u64, in_use: bool) {
        let pool = self.default_pool();
        let exports = if in_use { vec!["unknown".to_string()] } else { Vec::new() };
        self.volumes
            .write()
            .await
            .insert(name.to_string(), BackendVolume { size, pool, exports });
    }

    pub async fn has_volume(&self, volume_id: &str) -> bool {
        self.volumes
            .read()
            .await
            .contains_key(&Self::volume_name(volume_id))
    }

    pub async fn has_snapshot(&self, snapshot_id: &str) -> bool {
        self.snapshots
            .read()
            .await
            .contains_key(&Self::snapshot_name(snapshot_id))
    }

    pub async fn exports_of(&self, volume_id: &str) -> Vec<String> {
        self.volumes
            .read()
            .await
            .get(&Self::volume_name(volume_id))
            .map(|v| v.exports.clone())
            .unwrap_or_default()
    }

    fn volume_name(volume_id: &str) -> String {
        format!("{}{}", VOLUME_PREFIX, volume_id)
    }

    fn snapshot_name(snapshot_id: &str) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, snapshot_id)
    }

    fn default_pool(&self) -> String {
        self.config
            .pools
            .first()
            .map(|p| p.pool_name.clone())
            .unwrap_or_else(|| "pool0".to_string())
    }

    fn pool_of(&self, volume: &Volume) -> String {
        volume
            .host
            .as_deref()
            .and_then(|h| extract_host(h, HostLevel::Pool, false))
            .unwrap_or_else(|| self.default_pool())
    }

    fn location(&self, name: &str) -> String {
        format!("memory://{}/{}", self.config.backend_name, name)
    }

    fn failed(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::backend_failed(&self.config.backend_name, operation, reason)
    }

    fn missing(&self, reference: impl Into<String>) -> Error {
        Error::BackendObjectNotFound {
            backend: self.config.backend_name.clone(),
            reference: reference.into(),
        }
    }

    fn injected(&self, operation: &'static str, failure: Option<Failure>, target: &str) -> Result<()> {
        match failure {
            None => Ok(()),
            Some(Failure::Error) => Err(self.failed(operation, "injected failure")),
            Some(Failure::NotFound) => Err(self.missing(target)),
            Some(Failure::Busy) => Err(Error::SnapshotIsBusy {
                snapshot_id: target.to_string(),
            }),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::DriverNotInitialized {
                backend: self.config.backend_name.clone(),
            })
        }
    }

    async fn find_reference(&self, existing_ref: &ExistingRef) -> Result<(String, BackendVolume)> {
        let name = existing_ref.identifier().ok_or_else(|| Error::ManageExistingInvalidReference {
            reference: existing_ref.to_string(),
            reason: "reference must contain source-name or source-id".to_string(),
        })?;
        self.volumes
            .read()
            .await
            .get(name)
            .cloned()
            .map(|v| (name.to_string(), v))
            .ok_or_else(|| Error::ManageExistingInvalidReference {
                reference: existing_ref.to_string(),
                reason: format!("no backend volume named {}", name),
            })
    }
}

#[async_trait]
impl VolumeDriver for InMemoryDriver {
    fn backend_name(&self) -> &str {
        &self.config.backend_name
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn do_setup(&self) -> Result<()> {
        if self.config.pools.is_empty() {
            return Err(Error::Configuration(format!(
                "backend {} declares no pools",
                self.config.backend_name
            )));
        }
        self.set_initialized(true);
        info!(
            "In-memory backend {} ready with {} pools",
            self.config.backend_name,
            self.config.pools.len()
        );
        Ok(())
    }

    async fn create_volume(&self, volume: &Volume) -> Result<ModelUpdate> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("create_volume").await;
        self.injected("create_volume", failure, &volume.id)?;

        let name = Self::volume_name(&volume.id);
        let object = BackendVolume {
            size: volume.size,
            pool: self.pool_of(volume),
            exports: Vec::new(),
        };
        self.volumes.write().await.insert(name.clone(), object);
        debug!("Created backend volume {} ({} GB)", name, volume.size);
        Ok(ModelUpdate::with_location(self.location(&name)))
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<()> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("delete_volume").await;
        self.injected("delete_volume", failure, &volume.id)?;

        let name = Self::volume_name(&volume.id);
        let mut volumes = self.volumes.write().await;
        match volumes.get(&name) {
            None => Err(self.missing(name)),
            Some(v) if !v.exports.is_empty() => {
                Err(self.failed("delete_volume", format!("{} is still exported", name)))
            }
            Some(_) => {
                volumes.remove(&name);
                debug!("Deleted backend volume {}", name);
                Ok(())
            }
        }
    }

    async fn extend_volume(&self, volume: &Volume, new_size: u64) -> Result<()> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("extend_volume").await;
        self.injected("extend_volume", failure, &volume.id)?;

        let name = Self::volume_name(&volume.id);
        let mut volumes = self.volumes.write().await;
        let object = volumes.get_mut(&name).ok_or_else(|| self.missing(&name))?;
        object.size = new_size;
        Ok(())
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<ModelUpdate> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("create_snapshot").await;
        self.injected("create_snapshot", failure, &snapshot.id)?;

        let volume_name = Self::volume_name(&snapshot.volume_id);
        if !self.volumes.read().await.contains_key(&volume_name) {
            return Err(self.missing(volume_name));
        }
        let name = Self::snapshot_name(&snapshot.id);
        self.snapshots.write().await.insert(
            name.clone(),
            BackendSnapshot {
                volume_name,
                size: snapshot.volume_size,
            },
        );
        Ok(ModelUpdate::with_location(self.location(&name)))
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("delete_snapshot").await;
        self.injected("delete_snapshot", failure, &snapshot.id)?;

        let name = Self::snapshot_name(&snapshot.id);
        self.snapshots
            .write()
            .await
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| self.missing(name))
    }

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<ModelUpdate> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("create_volume_from_snapshot").await;
        self.injected("create_volume_from_snapshot", failure, &volume.id)?;

        let snap_name = Self::snapshot_name(&snapshot.id);
        let source = self
            .snapshots
            .read()
            .await
            .get(&snap_name)
            .cloned()
            .ok_or_else(|| self.missing(&snap_name))?;
        if volume.size < source.size {
            return Err(self.failed(
                "create_volume_from_snapshot",
                format!("volume of {} GB is smaller than snapshot of {} GB", volume.size, source.size),
            ));
        }

        let name = Self::volume_name(&volume.id);
        debug!("Creating {} from {} of {}", name, snap_name, source.volume_name);
        self.volumes.write().await.insert(
            name.clone(),
            BackendVolume {
                size: volume.size,
                pool: self.pool_of(volume),
                exports: Vec::new(),
            },
        );
        Ok(ModelUpdate::with_location(self.location(&name)))
    }

    async fn create_cloned_volume(&self, volume: &Volume, src_vref: &Volume) -> Result<ModelUpdate> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("create_cloned_volume").await;
        self.injected("create_cloned_volume", failure, &volume.id)?;

        let src_name = Self::volume_name(&src_vref.id);
        let mut volumes = self.volumes.write().await;
        let source = volumes.get(&src_name).cloned().ok_or_else(|| self.missing(&src_name))?;
        let name = Self::volume_name(&volume.id);
        volumes.insert(
            name.clone(),
            BackendVolume {
                size: volume.size.max(source.size),
                pool: source.pool,
                exports: Vec::new(),
            },
        );
        Ok(ModelUpdate::with_location(self.location(&name)))
    }

    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("initialize_connection").await;
        self.injected("initialize_connection", failure, &volume.id)?;

        let name = Self::volume_name(&volume.id);
        let mut volumes = self.volumes.write().await;
        let object = volumes.get_mut(&name).ok_or_else(|| self.missing(&name))?;
        if !object.exports.contains(&connector.host) {
            object.exports.push(connector.host.clone());
        }

        let mut data = serde_json::Map::new();
        data.insert("volume_id".into(), volume.id.clone().into());
        data.insert("device_path".into(), format!("/dev/memory/{}", name).into());
        data.insert("target_host".into(), connector.host.clone().into());
        Ok(ConnectionInfo {
            driver_volume_type: self.config.storage_protocol.clone(),
            data,
        })
    }

    async fn terminate_connection(
        &self,
        volume: &Volume,
        connector: Option<&ConnectorProperties>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("terminate_connection").await;
        self.injected("terminate_connection", failure, &volume.id)?;

        let name = Self::volume_name(&volume.id);
        let mut volumes = self.volumes.write().await;
        let object = volumes.get_mut(&name).ok_or_else(|| self.missing(&name))?;
        match connector {
            Some(connector) => object.exports.retain(|h| *h != connector.host),
            None => object.exports.clear(),
        }
        Ok(())
    }

    async fn manage_existing(&self, volume: &Volume, existing_ref: &ExistingRef) -> Result<ModelUpdate> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("manage_existing").await;
        self.injected("manage_existing", failure, &existing_ref.to_string())?;

        let (current, mut object) = self.find_reference(existing_ref).await?;
        let name = Self::volume_name(&volume.id);
        object.pool = self.pool_of(volume);

        let mut volumes = self.volumes.write().await;
        volumes.remove(&current);
        volumes.insert(name.clone(), object);
        info!("Managed backend volume {} as {}", current, name);
        Ok(ModelUpdate::with_location(self.location(&name)))
    }

    async fn manage_existing_get_size(&self, _volume: &Volume, existing_ref: &ExistingRef) -> Result<u64> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("manage_existing_get_size").await;
        self.injected("manage_existing_get_size", failure, &existing_ref.to_string())?;

        let (_, object) = self.find_reference(existing_ref).await?;
        Ok(object.size)
    }

    async fn unmanage(&self, volume: &Volume) -> Result<()> {
        self.ensure_initialized()?;
        let (_call, failure) = self.instrumentation.enter("unmanage").await;
        self.injected("unmanage", failure, &volume.id)?;

        let name = Self::volume_name(&volume.id);
        let mut volumes = self.volumes.write().await;
        let object = volumes.remove(&name).ok_or_else(|| self.missing(&name))?;
        volumes.insert(format!("{}{}", UNMANAGED_PREFIX, name), object);
        Ok(())
    }

    async fn get_manageable_volumes(
        &self,
        cinder_volumes: &[Volume],
        query: &ManageableQuery,
    ) -> Result<Vec<ManageableDescriptor>> {
        self.ensure_initialized()?;
        let managed: HashSet<String> = cinder_volumes.iter().map(|v| v.id.clone()).collect();
        let objects = self
            .volumes
            .read()
            .await
            .iter()
            .map(|(name, v)| BackendObject {
                reference: ExistingRef::source_name(name.clone()),
                size: v.size,
                in_use: !v.exports.is_empty(),
                cinder_id: name.strip_prefix(VOLUME_PREFIX).map(str::to_string),
                extra_info: Some(format!("pool={}", v.pool)),
            })
            .collect();
        list_manageable(objects, &managed, query)
    }

    async fn get_manageable_snapshots(
        &self,
        cinder_snapshots: &[Snapshot],
        query: &ManageableQuery,
    ) -> Result<Vec<ManageableDescriptor>> {
        self.ensure_initialized()?;
        let managed: HashSet<String> = cinder_snapshots.iter().map(|s| s.id.clone()).collect();
        let objects = self
            .snapshots
            .read()
            .await
            .iter()
            .map(|(name, s)| BackendObject {
                reference: ExistingRef::source_name(name.clone()),
                size: s.size,
                in_use: false,
                cinder_id: name.strip_prefix(SNAPSHOT_PREFIX).map(str::to_string),
                extra_info: Some(format!("source={}", s.volume_name)),
            })
            .collect();
        list_manageable(objects, &managed, query)
    }

    async fn get_volume_stats(&self, _refresh: bool) -> Result<BackendStats> {
        let (_call, failure) = self.instrumentation.enter("get_volume_stats").await;
        self.injected("get_volume_stats", failure, &self.config.backend_name)?;

        let volumes = self.volumes.read().await;
        let pools = self
            .config
            .pools
            .iter()
            .map(|pool| {
                let used: u64 = volumes
                    .values()
                    .filter(|v| v.pool == pool.pool_name)
                    .map(|v| v.size)
                    .sum();
                let mut stats = pool.clone();
                stats.allocated_capacity_gb = used as f64;
                stats.provisioned_capacity_gb = used as f64;
                stats.free_capacity_gb = (pool.total_capacity_gb - used as f64).max(0.0);
                stats
            })
            .collect();

        Ok(BackendStats {
            volume_backend_name: self.config.backend_name.clone(),
            vendor_name: "Open Source".to_string(),
            driver_version: crate::VERSION.to_string(),
            storage_protocol: self.config.storage_protocol.clone(),
            pools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    async fn driver() -> InMemoryDriver {
        let driver = InMemoryDriver::new(MemoryDriverConfig::default());
        driver.do_setup().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_requires_setup() {
        let driver = InMemoryDriver::new(MemoryDriverConfig::default());
        let volume = Volume::new("v", 1);
        assert_matches!(
            driver.create_volume(&volume).await,
            Err(Error::DriverNotInitialized { .. })
        );
    }

    #[tokio::test]
    async fn test_volume_roundtrip_and_stats() {
        let driver = driver().await;
        let volume = Volume::new("v", 10);
        let update = driver.create_volume(&volume).await.unwrap();
        assert!(update.provider_location.unwrap().ends_with(&volume.id));

        let stats = driver.get_volume_stats(true).await.unwrap();
        assert_eq!(stats.pools[0].free_capacity_gb, 990.0);

        driver.delete_volume(&volume).await.unwrap();
        assert!(driver.delete_volume(&volume).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_connections_track_exports() {
        let driver = driver().await;
        let volume = Volume::new("v", 1);
        driver.create_volume(&volume).await.unwrap();

        let connector = ConnectorProperties::for_host("compute-1");
        let info = driver.initialize_connection(&volume, &connector).await.unwrap();
        assert_eq!(info.driver_volume_type, "local");
        assert_eq!(driver.exports_of(&volume.id).await, vec!["compute-1".to_string()]);
        assert!(driver.delete_volume(&volume).await.is_err());

        driver.terminate_connection(&volume, None).await.unwrap();
        assert!(driver.exports_of(&volume.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let driver = driver().await;
        let volume = Volume::new("v", 1);
        driver.instrumentation().fail_on("create_volume", Failure::Error);
        assert_matches!(
            driver.create_volume(&volume).await,
            Err(Error::BackendOperationFailed { .. })
        );
        assert_eq!(driver.instrumentation().calls("create_volume"), 1);
    }

    #[tokio::test]
    async fn test_manage_and_list() {
        let driver = driver().await;
        driver.add_unmanaged_volume("lv-data", 4, false).await;
        driver.add_unmanaged_volume("lv-busy", 2, true).await;

        let listed = driver
            .get_manageable_volumes(&[], &ManageableQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|d| !d.safe_to_manage));

        let volume = Volume::new("imported", 0);
        let reference = ExistingRef::source_name("lv-data");
        assert_eq!(driver.manage_existing_get_size(&volume, &reference).await.unwrap(), 4);
        driver.manage_existing(&volume, &reference).await.unwrap();
        assert!(driver.has_volume(&volume.id).await);

        assert_matches!(
            driver.manage_existing(&volume, &reference).await,
            Err(Error::ManageExistingInvalidReference { .. })
        );
    }
}

//! Lifecycle Manager - The single mutator of resource status
//!
//! Coordinates every lifecycle operation:
//! - Validates the current status of the resources involved
//! - Delegates to the volume or backup driver of the resource
//! - Applies the resulting state transition
//! - Records a user message for every failure and re-raises the error
//!
//! Operations take the resource locks of [`ResourceLocks`] in canonical
//! order (volume, snapshot, attachment, backup) and hold them across the
//! driver call.

mod attachment;
mod backup;
mod manage;
mod snapshot;
mod volume;

pub use attachment::*;
pub use manage::*;
pub use volume::*;

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::controlplane::backends::DriverRegistry;
use crate::controlplane::locks::ResourceLocks;
use crate::controlplane::quota::{QuotaEngine, QuotaLimits};
use crate::controlplane::store::ResourceStore;
use crate::domain::context::OperationContext;
use crate::domain::host::{extract_host, HostLevel};
use crate::domain::ports::VolumeDriverRef;
use crate::error::{Error, Result};
use crate::message::{Action, Detail, Message, MessageApi, ResourceType, DEFAULT_MESSAGE_TTL_SECS};
use crate::metrics::LifecycleMetrics;
use crate::scheduler::{BackendStateManager, BackupServiceRegistry, FilterScheduler, WeigherMultipliers};
use crate::volume_types::{VolumeType, VolumeTypeRegistry, DEFAULT_VOLUME_TYPE_NAME};

// =============================================================================
// Settings
// =============================================================================

/// Settings of a lifecycle manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Zone given to volumes that request none
    pub availability_zone: String,
    pub default_volume_type: String,
    /// `None` waits for locks indefinitely
    pub lock_timeout: Option<Duration>,
    pub message_ttl_secs: i64,
    pub quota: QuotaLimits,
    pub multipliers: WeigherMultipliers,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            availability_zone: "nova".to_string(),
            default_volume_type: DEFAULT_VOLUME_TYPE_NAME.to_string(),
            lock_timeout: None,
            message_ttl_secs: DEFAULT_MESSAGE_TTL_SECS,
            quota: QuotaLimits::default(),
            multipliers: WeigherMultipliers::default(),
        }
    }
}

impl From<&ServiceConfig> for ManagerSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            availability_zone: config.availability_zone.clone(),
            default_volume_type: config.default_volume_type.clone(),
            lock_timeout: config.lock_timeout(),
            message_ttl_secs: config.message_ttl_secs,
            quota: config.quota.clone(),
            multipliers: config.scheduler.multipliers(),
        }
    }
}

// =============================================================================
// Backend Entry
// =============================================================================

/// A registered volume backend
#[derive(Clone)]
pub struct BackendEntry {
    /// `host@backend`
    pub host: String,
    pub availability_zone: String,
    pub driver: VolumeDriverRef,
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

/// Lifecycle manager over the resource store
pub struct LifecycleManager {
    settings: ManagerSettings,
    store: Arc<ResourceStore>,
    locks: ResourceLocks,
    scheduler: FilterScheduler,
    /// Volume backends by `host@backend`
    backends: RwLock<BTreeMap<String, BackendEntry>>,
    backup_services: BackupServiceRegistry,
    volume_types: VolumeTypeRegistry,
    messages: MessageApi,
    quota: QuotaEngine,
    metrics: LifecycleMetrics,
}

impl LifecycleManager {
    /// Create a manager without backends
    pub fn new(settings: ManagerSettings) -> Result<Self> {
        let metrics = LifecycleMetrics::new()?;
        let mut locks = ResourceLocks::new().with_gauge(metrics.locks_held());
        if let Some(timeout) = settings.lock_timeout {
            locks = locks.with_timeout(timeout);
        }

        Ok(Self {
            scheduler: FilterScheduler::new(Arc::new(BackendStateManager::new()), settings.multipliers),
            store: Arc::new(ResourceStore::new()),
            locks,
            backends: RwLock::new(BTreeMap::new()),
            backup_services: BackupServiceRegistry::new(),
            volume_types: VolumeTypeRegistry::new(&settings.default_volume_type),
            messages: MessageApi::new(settings.message_ttl_secs),
            quota: QuotaEngine::new(settings.quota.clone()),
            metrics,
            settings,
        })
    }

    /// Build a manager from configuration and set up every configured backend
    pub async fn from_config(config: &ServiceConfig, drivers: &DriverRegistry) -> Result<Arc<Self>> {
        config.validate()?;
        let manager = Self::new(ManagerSettings::from(config))?;

        for backend in &config.backends {
            let driver = drivers.create_volume_driver(backend)?;
            let az = backend
                .availability_zone
                .clone()
                .unwrap_or_else(|| config.availability_zone.clone());
            manager
                .register_backend(&config.backend_host(backend), &az, driver)
                .await?;
        }

        for service in &config.backup_services {
            let driver = drivers.create_backup_driver(service)?;
            let az = service
                .availability_zone
                .as_deref()
                .unwrap_or(&config.availability_zone);
            manager.backup_services.register(&service.host, az, driver);
        }

        for vtype in &config.volume_types {
            manager.volume_types.create(
                &vtype.name,
                vtype.extra_specs.clone(),
                vtype.description.clone(),
            )?;
        }

        info!(
            "Lifecycle manager ready: {} backends, {} backup services",
            config.backends.len(),
            config.backup_services.len()
        );
        Ok(Arc::new(manager))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    pub fn scheduler(&self) -> &FilterScheduler {
        &self.scheduler
    }

    pub fn backup_services(&self) -> &BackupServiceRegistry {
        &self.backup_services
    }

    pub fn volume_types(&self) -> &VolumeTypeRegistry {
        &self.volume_types
    }

    pub fn messages(&self) -> &MessageApi {
        &self.messages
    }

    pub fn metrics(&self) -> &LifecycleMetrics {
        &self.metrics
    }

    // =========================================================================
    // Backends
    // =========================================================================

    /// Set up a driver and publish its pools to the scheduler
    pub async fn register_backend(
        &self,
        host: &str,
        availability_zone: &str,
        driver: VolumeDriverRef,
    ) -> Result<()> {
        info!("Registering backend {} ({})", host, driver.backend_name());
        if let Err(e) = driver.do_setup().await {
            // The backend stays registered so requests report DriverNotInitialized
            error!("Setup of backend {} failed: {}", host, e);
        }

        self.backends.write().await.insert(
            host.to_string(),
            BackendEntry {
                host: host.to_string(),
                availability_zone: availability_zone.to_string(),
                driver: driver.clone(),
            },
        );

        if driver.is_initialized() {
            let stats = driver.get_volume_stats(true).await?;
            self.scheduler
                .state()
                .update_from_stats(host, availability_zone, &stats);
        }
        Ok(())
    }

    /// Pull fresh stats from every initialized backend
    pub async fn refresh_backend_stats(&self) -> usize {
        let entries: Vec<BackendEntry> = self.backends.read().await.values().cloned().collect();
        let (ready, down): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.driver.is_initialized());
        for entry in &down {
            self.scheduler.state().remove_backend(&entry.host);
        }

        let reports = join_all(ready.iter().map(|e| e.driver.get_volume_stats(true))).await;
        let mut refreshed = 0;
        for (entry, report) in ready.iter().zip(reports) {
            match report {
                Ok(stats) => {
                    self.scheduler
                        .state()
                        .update_from_stats(&entry.host, &entry.availability_zone, &stats);
                    refreshed += 1;
                }
                Err(e) => warn!("Stats refresh of {} failed: {}", entry.host, e),
            }
        }
        refreshed
    }

    pub async fn backends(&self) -> Vec<BackendEntry> {
        self.backends.read().await.values().cloned().collect()
    }

    /// Driver serving a placement, whether or not it is initialized
    pub async fn driver_for(&self, placement: &str) -> Result<VolumeDriverRef> {
        let backend = extract_host(placement, HostLevel::Backend, false).ok_or_else(|| {
            Error::BackendNotFound {
                host: placement.to_string(),
            }
        })?;
        self.backends
            .read()
            .await
            .get(&backend)
            .map(|e| e.driver.clone())
            .ok_or(Error::BackendNotFound { host: backend })
    }

    /// Driver serving a placement; fails unless set up
    pub(crate) async fn initialized_driver(&self, placement: Option<&str>) -> Result<VolumeDriverRef> {
        let placement = placement.ok_or_else(|| Error::InvalidVolume {
            reason: "volume has no placement".to_string(),
        })?;
        let driver = self.driver_for(placement).await?;
        if !driver.is_initialized() {
            return Err(Error::DriverNotInitialized {
                backend: driver.backend_name().to_string(),
            });
        }
        Ok(driver)
    }

    // =========================================================================
    // Volume Types
    // =========================================================================

    /// Type named by `name_or_id`, or the default type
    pub fn resolve_volume_type(&self, name_or_id: Option<&str>) -> Result<VolumeType> {
        match name_or_id {
            Some(name) => self.volume_types.find(name),
            None => self.volume_types.default_type(),
        }
    }

    /// Delete a volume type no live volume references
    pub fn delete_volume_type(&self, type_id: &str) -> Result<()> {
        let referenced = self
            .store
            .volumes
            .count(|v| v.volume_type_id.as_deref() == Some(type_id))
            > 0;
        self.volume_types.delete(type_id, referenced)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Record a user message for a failure
    pub(crate) fn record(
        &self,
        ctx: &mut OperationContext,
        action: Action,
        resource_type: ResourceType,
        resource_id: &str,
        error: &Error,
        detail: Option<Detail>,
    ) -> Message {
        let message = self
            .messages
            .create(ctx, action, resource_type, Some(resource_id), Some(error), detail);
        self.metrics.record_message(&message.event_id);
        message
    }

    /// Record a user message attributed to the context's message target
    pub(crate) fn record_from_context(
        &self,
        ctx: &mut OperationContext,
        error: &Error,
        detail: Detail,
    ) -> Option<Message> {
        let message = self.messages.create_from_context(ctx, Some(error), Some(detail));
        if let Some(ref m) = message {
            self.metrics.record_message(&m.event_id);
        }
        message
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the manager tests

    use super::*;
    use crate::controlplane::backends::{InMemoryBackupDriver, InMemoryDriver, MemoryDriverConfig};
    use crate::domain::ports::PoolStats;

    pub const BACKEND: &str = "node1@mem";

    pub struct Fixture {
        pub manager: Arc<LifecycleManager>,
        pub driver: Arc<InMemoryDriver>,
        pub backup_driver: Arc<InMemoryBackupDriver>,
    }

    pub async fn fixture_with(settings: ManagerSettings) -> Fixture {
        let manager = Arc::new(LifecycleManager::new(settings).unwrap());
        let mut pool = PoolStats::new("pool0", 1000.0, 1000.0);
        pool.multiattach = true;
        let driver = Arc::new(InMemoryDriver::new(MemoryDriverConfig {
            backend_name: "mem".to_string(),
            storage_protocol: "local".to_string(),
            pools: vec![pool],
        }));
        manager
            .register_backend(BACKEND, "nova", driver.clone())
            .await
            .unwrap();

        let backup_driver = Arc::new(InMemoryBackupDriver::new("memory"));
        manager
            .backup_services()
            .register("backup1", "nova", backup_driver.clone());

        Fixture {
            manager,
            driver,
            backup_driver,
        }
    }

    pub async fn fixture() -> Fixture {
        fixture_with(ManagerSettings::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::BackendSettings;
    use crate::controlplane::backends::{InMemoryDriver, MemoryDriverConfig};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_register_backend_publishes_pools() {
        let f = fixture().await;
        assert_eq!(f.manager.scheduler().state().len(), 1);
        assert!(f.manager.scheduler().state().get("node1@mem#pool0").is_some());
        assert_eq!(f.manager.refresh_backend_stats().await, 1);
    }

    #[tokio::test]
    async fn test_uninitialized_backend_is_kept_out_of_scheduling() {
        let manager = LifecycleManager::new(ManagerSettings::default()).unwrap();
        let driver = Arc::new(InMemoryDriver::new(MemoryDriverConfig {
            pools: Vec::new(),
            ..Default::default()
        }));
        manager.register_backend("n@broken", "nova", driver).await.unwrap();
        assert!(manager.scheduler().state().is_empty());
        assert_matches!(
            manager.initialized_driver(Some("n@broken#p")).await,
            Err(Error::DriverNotInitialized { .. })
        );
        assert_matches!(
            manager.driver_for("other@x").await,
            Err(Error::BackendNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = ServiceConfig::default();
        config.host = "node9".to_string();
        config.backends = vec![BackendSettings {
            name: "lvm".to_string(),
            ..Default::default()
        }];
        config.volume_types.push(crate::config::VolumeTypeSettings {
            name: "gold".to_string(),
            ..Default::default()
        });

        let manager = LifecycleManager::from_config(&config, &DriverRegistry::with_builtin())
            .await
            .unwrap();
        assert!(manager.scheduler().state().get("node9@lvm#pool0").is_some());
        assert_eq!(manager.backup_services().list().len(), 1);
        assert!(manager.resolve_volume_type(Some("gold")).is_ok());
        assert_eq!(
            manager.resolve_volume_type(None).unwrap().name,
            DEFAULT_VOLUME_TYPE_NAME
        );
    }
}

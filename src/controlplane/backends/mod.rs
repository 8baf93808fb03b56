//! Volume and Backup Drivers
//!
//! Built-in drivers and the registry that maps a configured driver name to
//! a constructor:
//! - memory: in-process volume driver
//! - memory: in-process backup driver

pub mod backup;
pub mod instrumentation;
pub mod memory;

pub use backup::*;
pub use instrumentation::*;
pub use memory::*;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BackendSettings, BackupServiceSettings};
use crate::domain::ports::{BackupDriverRef, VolumeDriverRef};
use crate::error::{Error, Result};

type VolumeDriverCtor = fn(&BackendSettings) -> Result<VolumeDriverRef>;
type BackupDriverCtor = fn(&BackupServiceSettings) -> Result<BackupDriverRef>;

/// Registry of driver constructors keyed by driver name
pub struct DriverRegistry {
    volume_drivers: HashMap<String, VolumeDriverCtor>,
    backup_drivers: HashMap<String, BackupDriverCtor>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            volume_drivers: HashMap::new(),
            backup_drivers: HashMap::new(),
        }
    }

    /// Registry with the built-in drivers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_volume_driver("memory", |settings| {
            Ok(Arc::new(InMemoryDriver::new(MemoryDriverConfig {
                backend_name: settings.volume_backend_name(),
                storage_protocol: settings.storage_protocol.clone(),
                pools: settings.pools.clone(),
            })))
        });
        registry.register_backup_driver("memory", |settings| {
            Ok(Arc::new(InMemoryBackupDriver::new(format!(
                "memory@{}",
                settings.host
            ))))
        });
        registry
    }

    pub fn register_volume_driver(&mut self, name: &str, ctor: VolumeDriverCtor) {
        self.volume_drivers.insert(name.to_lowercase(), ctor);
    }

    pub fn register_backup_driver(&mut self, name: &str, ctor: BackupDriverCtor) {
        self.backup_drivers.insert(name.to_lowercase(), ctor);
    }

    /// Create the volume driver of a configured backend
    pub fn create_volume_driver(&self, settings: &BackendSettings) -> Result<VolumeDriverRef> {
        let ctor = self
            .volume_drivers
            .get(&settings.driver.to_lowercase())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown volume driver {} for backend {}",
                    settings.driver, settings.name
                ))
            })?;
        ctor(settings)
    }

    /// Create the driver of a configured backup service
    pub fn create_backup_driver(&self, settings: &BackupServiceSettings) -> Result<BackupDriverRef> {
        let ctor = self
            .backup_drivers
            .get(&settings.driver.to_lowercase())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown backup driver {} for {}",
                    settings.driver, settings.host
                ))
            })?;
        ctor(settings)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

//! Backup Host Selection
//!
//! Registry of backup services. Hosts are picked round-robin among the
//! services that are up in the requested availability zone.

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::domain::ports::BackupDriverRef;
use crate::error::{Error, Result};

/// A registered backup service
#[derive(Clone, Debug)]
pub struct BackupService {
    pub host: String,
    pub availability_zone: String,
    pub up: bool,
    pub driver: BackupDriverRef,
}

impl BackupService {
    pub fn is_available(&self) -> bool {
        self.up && self.driver.is_working()
    }
}

/// Registry of backup services
#[derive(Default)]
pub struct BackupServiceRegistry {
    services: RwLock<IndexMap<String, BackupService>>,
    cursor: AtomicUsize,
}

impl BackupServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: &str, availability_zone: &str, driver: BackupDriverRef) {
        info!(
            "Registered backup service {} ({}) in zone {}",
            host,
            driver.service_name(),
            availability_zone
        );
        self.services.write().insert(
            host.to_string(),
            BackupService {
                host: host.to_string(),
                availability_zone: availability_zone.to_string(),
                up: true,
                driver,
            },
        );
    }

    pub fn set_up(&self, host: &str, up: bool) -> Result<()> {
        let mut services = self.services.write();
        let service = services.get_mut(host).ok_or_else(|| Error::ServiceNotFound {
            service: format!("cinder-backup on {}", host),
        })?;
        if !up {
            warn!("Backup service {} marked down", host);
        }
        service.up = up;
        Ok(())
    }

    pub fn get(&self, host: &str) -> Result<BackupService> {
        self.services
            .read()
            .get(host)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound {
                service: format!("cinder-backup on {}", host),
            })
    }

    pub fn list(&self) -> Vec<BackupService> {
        self.services.read().values().cloned().collect()
    }

    /// Pick an available backup host, round-robin
    pub fn select(&self, availability_zone: Option<&str>) -> Result<BackupService> {
        let candidates: Vec<BackupService> = self
            .services
            .read()
            .values()
            .filter(|s| s.is_available())
            .filter(|s| availability_zone.map_or(true, |az| s.availability_zone == az))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(Error::ServiceNotFound {
                service: format!(
                    "cinder-backup in zone {}",
                    availability_zone.unwrap_or("any")
                ),
            });
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::InMemoryBackupDriver;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn test_round_robin_in_zone() {
        let registry = BackupServiceRegistry::new();
        registry.register("b1", "az1", Arc::new(InMemoryBackupDriver::new("mem")));
        registry.register("b2", "az1", Arc::new(InMemoryBackupDriver::new("mem")));
        registry.register("b3", "az2", Arc::new(InMemoryBackupDriver::new("mem")));

        let first = registry.select(Some("az1")).unwrap().host;
        let second = registry.select(Some("az1")).unwrap().host;
        assert_ne!(first, second);
        assert_eq!(registry.select(Some("az2")).unwrap().host, "b3");
    }

    #[test]
    fn test_no_service() {
        let registry = BackupServiceRegistry::new();
        assert_matches!(registry.select(None), Err(Error::ServiceNotFound { .. }));

        registry.register("b1", "az1", Arc::new(InMemoryBackupDriver::new("mem")));
        registry.set_up("b1", false).unwrap();
        assert_matches!(registry.select(Some("az1")), Err(Error::ServiceNotFound { .. }));

        let driver = Arc::new(InMemoryBackupDriver::new("mem"));
        driver.set_working(false);
        registry.register("b2", "az1", driver);
        assert!(registry.select(Some("az1")).is_err());
    }
}

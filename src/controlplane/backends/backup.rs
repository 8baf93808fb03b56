//! In-Memory Backup Driver
//!
//! Stores backup payloads in memory, keyed by backup id.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::instrumentation::{Failure, Instrumentation};
use crate::domain::model::Backup;
use crate::domain::ports::{BackupDevice, BackupDriver};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredBackup {
    source_volume_id: String,
    size: u64,
}

/// Backup driver backed by an in-process map
pub struct InMemoryBackupDriver {
    name: String,
    working: AtomicBool,
    data: RwLock<HashMap<String, StoredBackup>>,
    instrumentation: Instrumentation,
}

impl InMemoryBackupDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            working: AtomicBool::new(true),
            data: RwLock::new(HashMap::new()),
            instrumentation: Instrumentation::default(),
        }
    }

    pub fn set_working(&self, working: bool) {
        self.working.store(working, Ordering::SeqCst);
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn has_backup(&self, backup_id: &str) -> bool {
        self.data.read().contains_key(backup_id)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check(&self, operation: &'static str, failure: Option<Failure>, backup: &Backup) -> Result<()> {
        match failure {
            None => Ok(()),
            Some(Failure::NotFound) => Err(Error::BackupNotFound {
                backup_id: backup.id.clone(),
            }),
            Some(_) => Err(Error::BackupOperationFailed {
                service: self.name.clone(),
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BackupDriver for InMemoryBackupDriver {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    async fn backup(&self, backup: &Backup, device: &BackupDevice) -> Result<()> {
        let (_call, failure) = self.instrumentation.enter("backup").await;
        self.check("backup", failure, backup)?;

        if device.connection.is_none() {
            return Err(Error::BackupOperationFailed {
                service: self.name.clone(),
                operation: "backup".to_string(),
                reason: format!("device for volume {} is not connected", device.volume_id),
            });
        }

        self.data.write().insert(
            backup.id.clone(),
            StoredBackup {
                source_volume_id: device.volume_id.clone(),
                size: backup.size,
            },
        );
        info!(
            "Backed up volume {} into {} ({} GB, temporary device: {})",
            device.volume_id, backup.id, backup.size, device.is_temporary
        );
        Ok(())
    }

    async fn restore(&self, backup: &Backup, device: &BackupDevice) -> Result<()> {
        let (_call, failure) = self.instrumentation.enter("restore").await;
        self.check("restore", failure, backup)?;

        let stored = self
            .data
            .read()
            .get(&backup.id)
            .cloned()
            .ok_or_else(|| Error::BackupNotFound {
                backup_id: backup.id.clone(),
            })?;
        debug!(
            "Restoring {} GB from {} (source {}) onto {}",
            stored.size, backup.id, stored.source_volume_id, device.volume_id
        );
        Ok(())
    }

    async fn delete_backup(&self, backup: &Backup) -> Result<()> {
        let (_call, failure) = self.instrumentation.enter("delete_backup").await;
        self.check("delete_backup", failure, backup)?;

        self.data
            .write()
            .remove(&backup.id)
            .map(|_| ())
            .ok_or_else(|| Error::BackupNotFound {
                backup_id: backup.id.clone(),
            })
    }
}

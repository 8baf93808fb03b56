//! Backup create / delete / restore
//!
//! `request_*` functions validate and reserve the resources under the lock,
//! release it, then run the worker (`create_backup`, `delete_backup`,
//! `restore_backup`). Workers check their preconditions in a fixed order; every
//! failure point updates the resource status, records a user message against
//! the backup and returns the error.

use tracing::{error, info, warn};

use super::{CreateVolumeRequest, LifecycleManager};
use crate::controlplane::locks::ResourceKey;
use crate::controlplane::transitions::VolumeOperation;
use crate::domain::context::OperationContext;
use crate::domain::model::{AttachMode, Backup, BackupStatus, Volume, VolumeStatus};
use crate::domain::ports::{BackupDevice, ConnectorProperties, VolumeDriverRef};
use crate::error::{Error, Result};
use crate::message::{Action, Detail, ResourceType};
use crate::scheduler::BackupService;

impl LifecycleManager {
    pub fn get_backup(&self, backup_id: &str) -> Result<Backup> {
        self.store.backups.get(backup_id)
    }

    pub fn list_backups(&self, volume_id: Option<&str>) -> Vec<Backup> {
        self.store
            .backups
            .list(|b| volume_id.map_or(true, |v| b.volume_id == v))
    }

    /// Backup service that owns a backup; fails unless it is up
    fn working_backup_service(&self, backup: &Backup) -> Result<BackupService> {
        let host = backup.host.as_deref().ok_or_else(|| Error::InvalidBackup {
            reason: format!("backup {} has no backup host", backup.id),
        })?;
        let service = self.backup_services.get(host)?;
        if !service.is_available() {
            return Err(Error::InvalidBackup {
                reason: format!("backup service {} is down", host),
            });
        }
        Ok(service)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Validate a volume, pick a backup host and run the backup.
    ///
    /// `force` allows backing up an in-use volume through a temporary clone.
    pub async fn request_backup(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        name: &str,
        force: bool,
    ) -> Result<Backup> {
        let backup = {
            let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
            let volume = self.store.volumes.get(volume_id)?;

            if let Err(e) = VolumeOperation::CreateBackup.check(&volume, force) {
                self.record(
                    ctx,
                    Action::BackupCreate,
                    ResourceType::Volume,
                    volume_id,
                    &e,
                    Some(Detail::BackupInvalidState),
                );
                return Err(e);
            }
            self.quota
                .check_backup(&self.store, volume.project_id.as_deref())?;

            let service = match self.backup_services.select(volume.availability_zone.as_deref()) {
                Ok(service) => service,
                Err(e) => {
                    warn!("No backup service for volume {}: {}", volume_id, e);
                    self.record(
                        ctx,
                        Action::BackupCreate,
                        ResourceType::Volume,
                        volume_id,
                        &e,
                        Some(Detail::BackupScheduleError),
                    );
                    return Err(e);
                }
            };

            let mut backup = Backup::new(&volume, name);
            backup.host = Some(service.host.clone());
            backup.service = Some(service.driver.service_name().to_string());
            let backup = self.store.backups.insert(backup);
            self.store.volumes.update(volume_id, |v| {
                v.set_status_saving_previous(VolumeStatus::BackingUp)
            })?;
            info!(
                "Backup {} of volume {} scheduled on {}",
                backup.id, volume_id, service.host
            );
            backup
        };

        self.create_backup(ctx, &backup.id).await
    }

    /// Back up the volume of a `creating` backup whose volume is `backing-up`
    pub async fn create_backup(&self, ctx: &mut OperationContext, backup_id: &str) -> Result<Backup> {
        let timer = self.metrics.start("create_backup");
        let result = self.create_backup_locked(ctx, backup_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn create_backup_locked(&self, ctx: &mut OperationContext, backup_id: &str) -> Result<Backup> {
        let volume_id = self.store.backups.get(backup_id)?.volume_id;
        let _guards = self
            .locks
            .lock_all(vec![
                ResourceKey::volume(&volume_id),
                ResourceKey::backup(backup_id),
            ])
            .await?;
        let backup = self.store.backups.get(backup_id)?;
        ctx.set_message_target(Action::BackupCreate, ResourceType::VolumeBackup, backup_id);
        info!("Creating backup {} of volume {}", backup_id, volume_id);

        let service = match self.working_backup_service(&backup) {
            Ok(service) => service,
            Err(e) => return Err(self.fail_backup(ctx, &backup, e, Detail::BackupServiceDown)),
        };

        let volume = match self.store.volumes.get(&volume_id) {
            Ok(volume) => volume,
            Err(e) => return Err(self.fail_backup(ctx, &backup, e, Detail::BackupInvalidState)),
        };
        if volume.status != VolumeStatus::BackingUp {
            let e = Error::InvalidVolume {
                reason: format!(
                    "volume {} is {}, expected backing-up",
                    volume_id, volume.status
                ),
            };
            return Err(self.fail_backup(ctx, &backup, e, Detail::BackupInvalidState));
        }
        if backup.status != BackupStatus::Creating {
            let e = Error::InvalidBackup {
                reason: format!("backup {} is {}, expected creating", backup_id, backup.status),
            };
            return Err(self.fail_backup(ctx, &backup, e, Detail::BackupInvalidState));
        }

        // Device: the volume itself, or a temporary clone of an in-use volume
        let driver = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver,
            Err(e) => return Err(self.fail_backup(ctx, &backup, e, Detail::BackupCreateDeviceError)),
        };
        let is_temporary = volume.previous_status == Some(VolumeStatus::InUse);
        let device_volume = if is_temporary {
            match self.clone_for_backup(&driver, &backup, &volume).await {
                Ok(temp) => temp,
                Err(e) => {
                    return Err(self.fail_backup(ctx, &backup, e, Detail::BackupCreateDeviceError))
                }
            }
        } else {
            volume.clone()
        };

        let connector = ConnectorProperties::for_host(service.host.clone());
        let connection = match driver
            .initialize_connection(&device_volume, &connector)
            .await
            .and_then(|info| self.connection_properties(&device_volume, info, AttachMode::Ro))
        {
            Ok(connection) => connection,
            Err(e) => {
                if is_temporary {
                    self.discard_temp_volume(&driver, &device_volume).await;
                }
                return Err(self.fail_backup(ctx, &backup, e, Detail::AttachError));
            }
        };

        let device = BackupDevice {
            volume_id: device_volume.id.clone(),
            is_temporary,
            connection: Some(connection),
        };
        if let Err(e) = service.driver.backup(&backup, &device).await {
            if let Err(detach) = driver
                .terminate_connection(&device_volume, Some(&connector))
                .await
            {
                warn!("Detach after failed backup {}: {}", backup_id, detach);
            }
            if is_temporary {
                self.discard_temp_volume(&driver, &device_volume).await;
            }
            return Err(self.fail_backup(ctx, &backup, e, Detail::BackupCreateDriverError));
        }

        if let Err(e) = driver
            .terminate_connection(&device_volume, Some(&connector))
            .await
        {
            return Err(self.fail_backup(ctx, &backup, e, Detail::DetachError));
        }

        if is_temporary {
            let cleanup = match driver.delete_volume(&device_volume).await {
                Ok(()) => self.store.volumes.soft_delete(&device_volume.id).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = cleanup {
                return Err(self.fail_backup(ctx, &backup, e, Detail::BackupCreateCleanupError));
            }
        }

        let backup = self.store.backups.update(backup_id, |b| {
            b.status = BackupStatus::Available;
            b.temp_volume_id = None;
            b.fail_reason = None;
        })?;
        self.release_backup_source(&volume_id);
        info!("Backup {} available", backup_id);
        Ok(backup)
    }

    /// Clone an in-use volume so the backup reads a stable copy
    async fn clone_for_backup(
        &self,
        driver: &VolumeDriverRef,
        backup: &Backup,
        volume: &Volume,
    ) -> Result<Volume> {
        let mut temp = Volume::new(format!("backup-vol-{}", backup.id), volume.size);
        temp.project_id = volume.project_id.clone();
        temp.host = volume.host.clone();
        temp.availability_zone = volume.availability_zone.clone();
        temp.volume_type_id = volume.volume_type_id.clone();
        temp.admin_metadata
            .insert("temporary".to_string(), "True".to_string());
        let temp = self.store.volumes.insert(temp);
        self.store
            .backups
            .update(&backup.id, |b| b.temp_volume_id = Some(temp.id.clone()))?;

        match driver.create_cloned_volume(&temp, volume).await {
            Ok(update) => self.store.volumes.update(&temp.id, |v| {
                v.status = VolumeStatus::Available;
                v.provider_location = update.provider_location;
            }),
            Err(e) => {
                if let Err(cleanup) = self.store.volumes.soft_delete(&temp.id) {
                    warn!("Could not drop temporary volume {}: {}", temp.id, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn discard_temp_volume(&self, driver: &VolumeDriverRef, temp: &Volume) {
        if let Err(e) = driver.delete_volume(temp).await {
            warn!("Could not delete temporary volume {}: {}", temp.id, e);
            self.set_volume_status(&temp.id, VolumeStatus::ErrorDeleting);
            return;
        }
        if let Err(e) = self.store.volumes.soft_delete(&temp.id) {
            warn!("Could not drop temporary volume {}: {}", temp.id, e);
        }
    }

    /// Return a `backing-up` volume to the status it had before the backup
    fn release_backup_source(&self, volume_id: &str) {
        let released = self.store.volumes.update_if(
            volume_id,
            |v| v.status == VolumeStatus::BackingUp,
            |v| {
                v.status = v.previous_status.take().unwrap_or(VolumeStatus::Available);
            },
        );
        if let Err(e) = released {
            warn!("Could not release volume {} after backup: {}", volume_id, e);
        }
    }

    /// Mark a backup failed and record the failure. The volume is released
    /// only when this backup is the `creating` one that put it in `backing-up`.
    fn fail_backup(
        &self,
        ctx: &mut OperationContext,
        backup: &Backup,
        error: Error,
        detail: Detail,
    ) -> Error {
        error!("Backup {} failed: {}", backup.id, error);
        let reason = error.to_string();
        if let Err(e) = self.store.backups.update(&backup.id, |b| {
            b.status = BackupStatus::Error;
            b.fail_reason = Some(reason);
        }) {
            warn!("Could not mark backup {} failed: {}", backup.id, e);
        }
        if backup.status == BackupStatus::Creating {
            self.release_backup_source(&backup.volume_id);
        }
        self.record_from_context(ctx, &error, detail);
        error
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Validate and run the deletion of an `available` or `error` backup
    pub async fn request_backup_delete(&self, ctx: &mut OperationContext, backup_id: &str) -> Result<()> {
        {
            let _guard = self.locks.lock(ResourceKey::backup(backup_id)).await?;
            let backup = self.store.backups.get(backup_id)?;
            if !matches!(backup.status, BackupStatus::Available | BackupStatus::Error) {
                let e = Error::InvalidBackup {
                    reason: format!(
                        "backup {} is {}, must be available or error",
                        backup_id, backup.status
                    ),
                };
                self.record(
                    ctx,
                    Action::BackupDelete,
                    ResourceType::VolumeBackup,
                    backup_id,
                    &e,
                    Some(Detail::BackupInvalidState),
                );
                return Err(e);
            }
            self.store
                .backups
                .update(backup_id, |b| b.status = BackupStatus::Deleting)?;
        }

        self.delete_backup(ctx, backup_id).await
    }

    /// Remove the data of a `deleting` backup; data already gone counts as deleted
    pub async fn delete_backup(&self, ctx: &mut OperationContext, backup_id: &str) -> Result<()> {
        let timer = self.metrics.start("delete_backup");
        let result = self.delete_backup_locked(ctx, backup_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn delete_backup_locked(&self, ctx: &mut OperationContext, backup_id: &str) -> Result<()> {
        let _guard = self.locks.lock(ResourceKey::backup(backup_id)).await?;
        let backup = self.store.backups.get(backup_id)?;
        ctx.set_message_target(Action::BackupDelete, ResourceType::VolumeBackup, backup_id);

        if backup.status != BackupStatus::Deleting {
            let e = Error::InvalidBackup {
                reason: format!("backup {} is {}, expected deleting", backup_id, backup.status),
            };
            self.record_from_context(ctx, &e, Detail::BackupInvalidState);
            return Err(e);
        }

        let service = match self.working_backup_service(&backup) {
            Ok(service) => service,
            Err(e) => {
                return Err(self.fail_backup_delete(
                    ctx,
                    backup_id,
                    e,
                    BackupStatus::Error,
                    Detail::BackupServiceDown,
                ))
            }
        };
        if backup.service.as_deref() != Some(service.driver.service_name()) {
            let e = Error::InvalidBackup {
                reason: format!(
                    "backup {} was made by {}, not by {}",
                    backup_id,
                    backup.service.as_deref().unwrap_or("unknown service"),
                    service.driver.service_name()
                ),
            };
            return Err(self.fail_backup_delete(
                ctx,
                backup_id,
                e,
                BackupStatus::Error,
                Detail::UnknownError,
            ));
        }

        info!("Deleting backup {}", backup_id);
        match service.driver.delete_backup(&backup).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Data of backup {} already gone: {}", backup_id, e);
            }
            Err(e) => {
                return Err(self.fail_backup_delete(
                    ctx,
                    backup_id,
                    e,
                    BackupStatus::ErrorDeleting,
                    Detail::BackupDeleteDriverError,
                ))
            }
        }

        self.store.backups.soft_delete(backup_id)?;
        info!("Backup {} deleted", backup_id);
        Ok(())
    }

    fn fail_backup_delete(
        &self,
        ctx: &mut OperationContext,
        backup_id: &str,
        error: Error,
        status: BackupStatus,
        detail: Detail,
    ) -> Error {
        error!("Deleting backup {} failed: {}", backup_id, error);
        let reason = error.to_string();
        if let Err(e) = self.store.backups.update(backup_id, |b| {
            b.status = status;
            b.fail_reason = Some(reason);
        }) {
            warn!("Could not mark backup {} failed: {}", backup_id, e);
        }
        self.record_from_context(ctx, &error, detail);
        error
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Restore a backup onto `volume_id`, or onto a new volume of the backup size
    pub async fn request_restore(
        &self,
        ctx: &mut OperationContext,
        backup_id: &str,
        volume_id: Option<&str>,
    ) -> Result<Volume> {
        let backup = self.store.backups.get(backup_id)?;
        let volume_id = match volume_id {
            Some(id) => id.to_string(),
            None => {
                let mut request =
                    CreateVolumeRequest::new(format!("restore_backup_{}", backup_id), backup.size);
                request.availability_zone = backup.availability_zone.clone();
                self.create_volume(ctx, request).await?.id
            }
        };

        {
            let _guards = self
                .locks
                .lock_all(vec![
                    ResourceKey::volume(&volume_id),
                    ResourceKey::backup(backup_id),
                ])
                .await?;
            let backup = self.store.backups.get(backup_id)?;
            let volume = self.store.volumes.get(&volume_id)?;

            if backup.status != BackupStatus::Available {
                let e = Error::InvalidBackup {
                    reason: format!("backup {} is {}, must be available", backup_id, backup.status),
                };
                self.record(
                    ctx,
                    Action::BackupRestore,
                    ResourceType::VolumeBackup,
                    backup_id,
                    &e,
                    Some(Detail::BackupInvalidState),
                );
                return Err(e);
            }
            if let Err(e) = VolumeOperation::RestoreTarget.check(&volume, false) {
                self.record(
                    ctx,
                    Action::BackupRestore,
                    ResourceType::Volume,
                    &volume_id,
                    &e,
                    Some(Detail::VolumeInvalidState),
                );
                return Err(e);
            }
            if volume.size < backup.size {
                return Err(Error::InvalidVolume {
                    reason: format!(
                        "volume {} ({} GB) is smaller than backup {} ({} GB)",
                        volume_id, volume.size, backup_id, backup.size
                    ),
                });
            }

            self.store.backups.update(backup_id, |b| {
                b.status = BackupStatus::Restoring;
                b.restore_volume_id = Some(volume_id.clone());
            })?;
            self.set_volume_status(&volume_id, VolumeStatus::RestoringBackup);
        }

        self.restore_backup(ctx, backup_id, &volume_id).await
    }

    /// Write a `restoring` backup onto a `restoring-backup` volume
    pub async fn restore_backup(
        &self,
        ctx: &mut OperationContext,
        backup_id: &str,
        volume_id: &str,
    ) -> Result<Volume> {
        let timer = self.metrics.start("restore_backup");
        let result = self.restore_backup_locked(ctx, backup_id, volume_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn restore_backup_locked(
        &self,
        ctx: &mut OperationContext,
        backup_id: &str,
        volume_id: &str,
    ) -> Result<Volume> {
        let _guards = self
            .locks
            .lock_all(vec![
                ResourceKey::volume(volume_id),
                ResourceKey::backup(backup_id),
            ])
            .await?;
        let backup = self.store.backups.get(backup_id)?;
        let volume = self.store.volumes.get(volume_id)?;
        ctx.set_message_target(Action::BackupRestore, ResourceType::VolumeBackup, backup_id);
        info!("Restoring backup {} onto volume {}", backup_id, volume_id);

        let service = match self.working_backup_service(&backup) {
            Ok(service) => service,
            Err(e) => {
                return Err(self.fail_restore(ctx, backup_id, volume_id, e, Detail::BackupServiceDown))
            }
        };
        if volume.status != VolumeStatus::RestoringBackup {
            let e = Error::InvalidVolume {
                reason: format!(
                    "volume {} is {}, expected restoring-backup",
                    volume_id, volume.status
                ),
            };
            return Err(self.fail_restore(ctx, backup_id, volume_id, e, Detail::VolumeInvalidState));
        }
        if backup.status != BackupStatus::Restoring {
            let e = Error::InvalidBackup {
                reason: format!("backup {} is {}, expected restoring", backup_id, backup.status),
            };
            return Err(self.fail_restore(ctx, backup_id, volume_id, e, Detail::BackupInvalidState));
        }

        let connector = ConnectorProperties::for_host(service.host.clone());
        let attached = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver
                .initialize_connection(&volume, &connector)
                .await
                .and_then(|info| self.connection_properties(&volume, info, AttachMode::Rw))
                .map(|info| (driver, info)),
            Err(e) => Err(e),
        };
        let (driver, connection) = match attached {
            Ok(attached) => attached,
            Err(e) => return Err(self.fail_restore(ctx, backup_id, volume_id, e, Detail::AttachError)),
        };

        let device = BackupDevice {
            volume_id: volume_id.to_string(),
            is_temporary: false,
            connection: Some(connection),
        };
        if let Err(e) = service.driver.restore(&backup, &device).await {
            if let Err(detach) = driver.terminate_connection(&volume, Some(&connector)).await {
                warn!("Detach after failed restore of {}: {}", backup_id, detach);
            }
            return Err(self.fail_restore(ctx, backup_id, volume_id, e, Detail::BackupRestoreError));
        }

        if let Err(e) = driver.terminate_connection(&volume, Some(&connector)).await {
            return Err(self.fail_restore(ctx, backup_id, volume_id, e, Detail::DetachError));
        }

        self.store
            .backups
            .update(backup_id, |b| b.status = BackupStatus::Available)?;
        let volume = self
            .store
            .volumes
            .update(volume_id, |v| v.status = VolumeStatus::Available)?;
        info!("Backup {} restored onto volume {}", backup_id, volume_id);
        Ok(volume)
    }

    /// Put a restore's volume in `error_restoring` and its backup back to `available`
    fn fail_restore(
        &self,
        ctx: &mut OperationContext,
        backup_id: &str,
        volume_id: &str,
        error: Error,
        detail: Detail,
    ) -> Error {
        error!("Restore of backup {} onto {} failed: {}", backup_id, volume_id, error);
        if let Err(e) = self.store.volumes.update_if(
            volume_id,
            |v| v.status == VolumeStatus::RestoringBackup,
            |v| v.status = VolumeStatus::ErrorRestoring,
        ) {
            warn!("Could not mark volume {} failed: {}", volume_id, e);
        }
        if let Err(e) = self.store.backups.update_if(
            backup_id,
            |b| b.status == BackupStatus::Restoring,
            |b| b.status = BackupStatus::Available,
        ) {
            warn!("Could not release backup {}: {}", backup_id, e);
        }
        self.record_from_context(ctx, &error, detail);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::controlplane::backends::Failure;
    use crate::controlplane::manager::AttachRequest;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn available_volume(f: &Fixture, size: u64) -> Volume {
        let mut ctx = OperationContext::new();
        f.manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("source", size))
            .await
            .unwrap()
    }

    /// A `creating` backup of a `backing-up` volume, ready for `create_backup`
    fn pending_backup(f: &Fixture, volume: &Volume) -> Backup {
        let mut backup = Backup::new(volume, "pending");
        backup.host = Some("backup1".to_string());
        backup.service = Some("memory".to_string());
        let backup = f.manager.store().backups.insert(backup);
        f.manager
            .store()
            .volumes
            .update(&volume.id, |v| v.set_status_saving_previous(VolumeStatus::BackingUp))
            .unwrap();
        backup
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 2).await;

        let backup = f
            .manager
            .request_backup(&mut ctx, &volume.id, "nightly", false)
            .await
            .unwrap();
        assert_eq!(backup.status, BackupStatus::Available);
        assert_eq!(backup.size, 2);
        assert!(f.backup_driver.has_backup(&backup.id));
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::Available
        );
        assert!(f.driver.exports_of(&volume.id).await.is_empty());

        let restored = f
            .manager
            .request_restore(&mut ctx, &backup.id, None)
            .await
            .unwrap();
        assert_eq!(restored.status, VolumeStatus::Available);
        assert_eq!(restored.size, 2);
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().restore_volume_id,
            Some(restored.id.clone())
        );
        assert!(ctx.messages().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_backup_state_is_recorded() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        let backup = pending_backup(&f, &volume);
        f.manager
            .store()
            .backups
            .update(&backup.id, |b| b.status = BackupStatus::Available)
            .unwrap();

        assert_matches!(
            f.manager.create_backup(&mut ctx, &backup.id).await,
            Err(Error::InvalidBackup { .. })
        );
        assert_eq!(ctx.message_action, Some(Action::BackupCreate));
        assert_eq!(ctx.message_resource_type, Some(ResourceType::VolumeBackup));
        assert_eq!(ctx.message_resource_id.as_deref(), Some(backup.id.as_str()));
        let message = ctx.last_message().unwrap();
        assert_eq!(message.detail, Detail::BackupInvalidState);
        assert_eq!(message.resource_uuid.as_deref(), Some(backup.id.as_str()));
        assert_eq!(f.backup_driver.instrumentation().calls("backup"), 0);
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::Error
        );
        // The volume stays with the backup that holds it
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::BackingUp
        );
    }

    #[tokio::test]
    async fn test_stale_create_leaves_in_flight_backup_alone() {
        let f = fixture().await;
        let volume = available_volume(&f, 1).await;
        let mut ctx = OperationContext::new();
        let done = f
            .manager
            .request_backup(&mut ctx, &volume.id, "first", false)
            .await
            .unwrap();
        let pending = pending_backup(&f, &volume);

        let mut stale = OperationContext::new();
        assert_matches!(
            f.manager.create_backup(&mut stale, &done.id).await,
            Err(Error::InvalidBackup { .. })
        );
        assert_eq!(stale.last_message().unwrap().detail, Detail::BackupInvalidState);
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::BackingUp
        );

        let backup = f.manager.create_backup(&mut ctx, &pending.id).await.unwrap();
        assert_eq!(backup.status, BackupStatus::Available);
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::Available
        );
    }

    #[tokio::test]
    async fn test_service_down() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        let backup = pending_backup(&f, &volume);
        f.backup_driver.set_working(false);

        assert_matches!(
            f.manager.create_backup(&mut ctx, &backup.id).await,
            Err(Error::InvalidBackup { .. })
        );
        assert_eq!(ctx.last_message().unwrap().detail, Detail::BackupServiceDown);
        let backup = f.manager.get_backup(&backup.id).unwrap();
        assert_eq!(backup.status, BackupStatus::Error);
        assert!(backup.fail_reason.is_some());
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::Available
        );
    }

    #[tokio::test]
    async fn test_concurrent_create_reaches_driver_once() {
        let f = fixture().await;
        let volume = available_volume(&f, 1).await;
        let backup = pending_backup(&f, &volume);
        f.backup_driver
            .instrumentation()
            .set_delay(Some(Duration::from_millis(20)));

        let mut ctx1 = OperationContext::new();
        let mut ctx2 = OperationContext::new();
        let (first, second) = tokio::join!(
            f.manager.create_backup(&mut ctx1, &backup.id),
            f.manager.create_backup(&mut ctx2, &backup.id)
        );

        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_matches!(
            first.and(second),
            Err(Error::InvalidBackup { .. })
        );
        assert_eq!(f.backup_driver.instrumentation().calls("backup"), 1);
        assert_eq!(f.backup_driver.instrumentation().max_in_flight(), 1);
        assert!(f.backup_driver.has_backup(&backup.id));
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::Available
        );
    }

    #[tokio::test]
    async fn test_in_use_volume_backed_up_through_temporary_clone() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        f.manager
            .attach_volume(&mut ctx, &volume.id, AttachRequest::instance("vm", AttachMode::Rw))
            .await
            .unwrap();

        assert_matches!(
            f.manager.request_backup(&mut ctx, &volume.id, "b", false).await,
            Err(Error::InvalidVolume { .. })
        );
        assert_eq!(ctx.last_message().unwrap().detail, Detail::BackupInvalidState);

        let backup = f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", true)
            .await
            .unwrap();
        assert_eq!(backup.status, BackupStatus::Available);
        assert_eq!(f.driver.instrumentation().calls("create_cloned_volume"), 1);
        assert_eq!(f.driver.instrumentation().calls("delete_volume"), 1);
        assert_eq!(f.manager.list_volumes(None).len(), 1);
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::InUse
        );
    }

    #[tokio::test]
    async fn test_failure_points_map_to_details() {
        let cases = [
            ("initialize_connection", Detail::AttachError),
            ("terminate_connection", Detail::DetachError),
        ];
        for (operation, detail) in cases {
            let f = fixture().await;
            let mut ctx = OperationContext::new();
            let volume = available_volume(&f, 1).await;
            f.driver.instrumentation().fail_on(operation, Failure::Error);

            assert!(f
                .manager
                .request_backup(&mut ctx, &volume.id, "b", false)
                .await
                .is_err());
            let message = ctx.last_message().unwrap();
            assert_eq!(message.detail, detail);
            assert_eq!(message.resource_type, ResourceType::VolumeBackup);
            let backup = &f.manager.list_backups(Some(&volume.id))[0];
            assert_eq!(backup.status, BackupStatus::Error);
            assert_eq!(
                f.manager.get_volume(&volume.id).unwrap().status,
                VolumeStatus::Available
            );
        }
    }

    #[tokio::test]
    async fn test_clone_failure_is_device_error() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        f.manager
            .attach_volume(&mut ctx, &volume.id, AttachRequest::instance("vm", AttachMode::Rw))
            .await
            .unwrap();
        f.driver
            .instrumentation()
            .fail_on("create_cloned_volume", Failure::Error);

        assert!(f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", true)
            .await
            .is_err());
        let message = ctx.last_message().unwrap();
        assert_eq!(message.detail, Detail::BackupCreateDeviceError);
        assert_eq!(message.resource_type, ResourceType::VolumeBackup);
        let backup = &f.manager.list_backups(Some(&volume.id))[0];
        assert_eq!(backup.status, BackupStatus::Error);
        assert_eq!(f.backup_driver.instrumentation().calls("backup"), 0);
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::InUse
        );
        // No temporary volume is left behind
        assert_eq!(f.manager.list_volumes(None).len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_volume_driver_fails_device_step() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;

        // No placement: the generic device error is recorded
        let backup = pending_backup(&f, &volume);
        f.manager
            .store()
            .volumes
            .update(&volume.id, |v| v.host = None)
            .unwrap();
        assert_matches!(
            f.manager.create_backup(&mut ctx, &backup.id).await,
            Err(Error::InvalidVolume { .. })
        );
        assert_eq!(
            ctx.last_message().unwrap().detail,
            Detail::BackupCreateDeviceError
        );
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::Error
        );
        let restored = f
            .manager
            .store()
            .volumes
            .update(&volume.id, |v| v.host = volume.host.clone())
            .unwrap();
        assert_eq!(restored.status, VolumeStatus::Available);

        // Uninitialized driver: its own mapped detail wins over the device error
        let mut ctx = OperationContext::new();
        let backup = pending_backup(&f, &volume);
        f.driver.set_initialized(false);
        assert_matches!(
            f.manager.create_backup(&mut ctx, &backup.id).await,
            Err(Error::DriverNotInitialized { .. })
        );
        assert_eq!(
            ctx.last_message().unwrap().detail,
            Detail::DriverNotInitialized
        );
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::Error
        );
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::Available
        );
        assert_eq!(f.backup_driver.instrumentation().calls("backup"), 0);
    }

    #[tokio::test]
    async fn test_driver_and_cleanup_failures() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        f.backup_driver
            .instrumentation()
            .fail_on("backup", Failure::Error);
        assert!(f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", false)
            .await
            .is_err());
        assert_eq!(
            ctx.last_message().unwrap().detail,
            Detail::BackupCreateDriverError
        );
        assert!(f.driver.exports_of(&volume.id).await.is_empty());

        f.backup_driver.instrumentation().clear_failure("backup");
        f.manager
            .attach_volume(&mut ctx, &volume.id, AttachRequest::instance("vm", AttachMode::Rw))
            .await
            .unwrap();
        f.driver
            .instrumentation()
            .fail_on("delete_volume", Failure::Error);
        assert!(f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", true)
            .await
            .is_err());
        assert_eq!(
            ctx.last_message().unwrap().detail,
            Detail::BackupCreateCleanupError
        );
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::InUse
        );
    }

    #[tokio::test]
    async fn test_no_backup_service_in_zone() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        f.manager.backup_services().set_up("backup1", false).unwrap();

        assert_matches!(
            f.manager.request_backup(&mut ctx, &volume.id, "b", false).await,
            Err(Error::ServiceNotFound { .. })
        );
        let message = ctx.last_message().unwrap();
        assert_eq!(message.detail, Detail::BackupScheduleError);
        assert_eq!(message.resource_type, ResourceType::Volume);
        assert!(f.manager.list_backups(None).is_empty());
    }

    #[tokio::test]
    async fn test_delete_backup() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        let backup = f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", false)
            .await
            .unwrap();

        f.backup_driver
            .instrumentation()
            .fail_on("delete_backup", Failure::Error);
        assert!(f
            .manager
            .request_backup_delete(&mut ctx, &backup.id)
            .await
            .is_err());
        assert_eq!(
            ctx.last_message().unwrap().detail,
            Detail::BackupDeleteDriverError
        );
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::ErrorDeleting
        );

        // error_deleting is not deletable again
        assert_matches!(
            f.manager.request_backup_delete(&mut ctx, &backup.id).await,
            Err(Error::InvalidBackup { .. })
        );
        assert_eq!(ctx.last_message().unwrap().detail, Detail::BackupInvalidState);

        f.manager
            .store()
            .backups
            .update(&backup.id, |b| b.status = BackupStatus::Error)
            .unwrap();
        f.backup_driver
            .instrumentation()
            .fail_on("delete_backup", Failure::NotFound);
        f.manager
            .request_backup_delete(&mut ctx, &backup.id)
            .await
            .unwrap();
        assert!(f.manager.get_backup(&backup.id).is_err());
    }

    #[tokio::test]
    async fn test_delete_backup_of_other_service() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        let backup = f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", false)
            .await
            .unwrap();
        f.manager
            .store()
            .backups
            .update(&backup.id, |b| b.service = Some("swift".to_string()))
            .unwrap();

        assert_matches!(
            f.manager.request_backup_delete(&mut ctx, &backup.id).await,
            Err(Error::InvalidBackup { .. })
        );
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::Error
        );
        assert!(f.backup_driver.has_backup(&backup.id));
    }

    #[tokio::test]
    async fn test_restore_preconditions() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 2).await;
        let backup = f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", false)
            .await
            .unwrap();

        let small = available_volume(&f, 1).await;
        assert_matches!(
            f.manager.request_restore(&mut ctx, &backup.id, Some(&small.id)).await,
            Err(Error::InvalidVolume { .. })
        );

        f.manager
            .attach_volume(&mut ctx, &volume.id, AttachRequest::instance("vm", AttachMode::Rw))
            .await
            .unwrap();
        assert_matches!(
            f.manager.request_restore(&mut ctx, &backup.id, Some(&volume.id)).await,
            Err(Error::InvalidVolume { .. })
        );
        assert_eq!(ctx.last_message().unwrap().detail, Detail::VolumeInvalidState);
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::Available
        );
    }

    #[tokio::test]
    async fn test_restore_driver_failure() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = available_volume(&f, 1).await;
        let backup = f
            .manager
            .request_backup(&mut ctx, &volume.id, "b", false)
            .await
            .unwrap();
        f.backup_driver
            .instrumentation()
            .fail_on("restore", Failure::Error);

        assert!(f
            .manager
            .request_restore(&mut ctx, &backup.id, Some(&volume.id))
            .await
            .is_err());
        let message = ctx.last_message().unwrap();
        assert_eq!(message.action, Action::BackupRestore);
        assert_eq!(message.detail, Detail::BackupRestoreError);
        assert_eq!(
            f.manager.get_volume(&volume.id).unwrap().status,
            VolumeStatus::ErrorRestoring
        );
        assert_eq!(
            f.manager.get_backup(&backup.id).unwrap().status,
            BackupStatus::Available
        );
        assert!(f.driver.exports_of(&volume.id).await.is_empty());
    }
}

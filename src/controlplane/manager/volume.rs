//! Volume create / delete / extend

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::LifecycleManager;
use crate::controlplane::locks::ResourceKey;
use crate::controlplane::transitions::VolumeOperation;
use crate::domain::context::OperationContext;
use crate::domain::model::{AttachStatus, Snapshot, SnapshotStatus, Volume, VolumeStatus};
use crate::error::{Error, Result};
use crate::message::{Action, Detail, ResourceType};
use crate::scheduler::RequestSpec;

/// Parameters of a new volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Size in GB
    pub size: u64,
    /// Type name or id; the default type when absent
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
    pub snapshot_id: Option<String>,
    pub source_volid: Option<String>,
    #[serde(default)]
    pub multiattach: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateVolumeRequest {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ..Default::default()
        }
    }
}

/// Where the content of a new volume comes from
enum VolumeSource {
    Raw,
    Snapshot(Snapshot),
    Volume(Volume),
}

impl LifecycleManager {
    pub fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.store.volumes.get(volume_id)
    }

    /// Live volumes, optionally restricted to one project
    pub fn list_volumes(&self, project_id: Option<&str>) -> Vec<Volume> {
        self.store
            .volumes
            .list(|v| project_id.map_or(true, |p| v.project_id.as_deref() == Some(p)))
    }

    /// Set the status of a volume, logging instead of failing when it is gone
    pub(crate) fn set_volume_status(&self, volume_id: &str, status: VolumeStatus) {
        if let Err(e) = self.store.volumes.update(volume_id, |v| v.status = status) {
            warn!("Could not set volume {} to {}: {}", volume_id, status, e);
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a volume: raw, from a snapshot or cloned from another volume
    pub async fn create_volume(
        &self,
        ctx: &mut OperationContext,
        request: CreateVolumeRequest,
    ) -> Result<Volume> {
        let timer = self.metrics.start("create_volume");
        let result = self.create_volume_locked(ctx, request).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn create_volume_locked(
        &self,
        ctx: &mut OperationContext,
        request: CreateVolumeRequest,
    ) -> Result<Volume> {
        if request.size == 0 {
            return Err(Error::InvalidInput {
                reason: "volume size must be a positive number of GB".to_string(),
            });
        }
        let vtype = self.resolve_volume_type(request.volume_type.as_deref())?;

        let mut volume = Volume::new(request.name, request.size);
        let mut keys = vec![ResourceKey::volume(&volume.id)];
        if let Some(ref id) = request.snapshot_id {
            keys.push(ResourceKey::snapshot(id));
        }
        if let Some(ref id) = request.source_volid {
            keys.push(ResourceKey::volume(id));
        }
        let _guards = self.locks.lock_all(keys).await?;

        let source = self.volume_source(&request.snapshot_id, &request.source_volid, request.size)?;
        self.quota
            .check_volume(&self.store, ctx.project_id.as_deref(), request.size)?;

        let multiattach = request.multiattach
            || vtype
                .extra_specs
                .get("multiattach")
                .map(|v| v == "<is> True")
                .unwrap_or(false);
        volume.project_id = ctx.project_id.clone();
        volume.volume_type_id = Some(vtype.id.clone());
        volume.availability_zone = Some(
            request
                .availability_zone
                .unwrap_or_else(|| self.settings.availability_zone.clone()),
        );
        volume.multiattach = multiattach;
        volume.snapshot_id = request.snapshot_id;
        volume.source_volid = request.source_volid;
        volume.metadata = request.metadata;
        volume.policy = self.volume_types.resolve_policy(&vtype.id)?;
        let volume = self.store.volumes.insert(volume);
        info!("Creating volume {} ({} GB)", volume.id, volume.size);

        let mut spec = RequestSpec::new(volume.size);
        spec.extra_specs = vtype.extra_specs.clone();
        spec.availability_zone = volume.availability_zone.clone();
        spec.multiattach = multiattach;
        spec.same_backend_as = match &source {
            VolumeSource::Raw => None,
            VolumeSource::Snapshot(snapshot) => self.store.volumes.get(&snapshot.volume_id)?.host,
            VolumeSource::Volume(src) => src.host.clone(),
        };

        let placement = match self.scheduler.select_backend(&spec) {
            Ok(best) => best.pool.host,
            Err(e) => {
                warn!("Scheduling volume {} failed: {}", volume.id, e);
                self.set_volume_status(&volume.id, VolumeStatus::Error);
                self.record(ctx, Action::ScheduleAllocateVolume, ResourceType::Volume, &volume.id, &e, None);
                return Err(e);
            }
        };
        let volume = self
            .store
            .volumes
            .update(&volume.id, |v| v.host = Some(placement.clone()))?;

        let driver = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver,
            Err(e) => {
                self.set_volume_status(&volume.id, VolumeStatus::Error);
                self.record(ctx, Action::CreateVolumeFromBackend, ResourceType::Volume, &volume.id, &e, None);
                return Err(e);
            }
        };

        let created = match &source {
            VolumeSource::Raw => driver.create_volume(&volume).await,
            VolumeSource::Snapshot(snapshot) => {
                driver.create_volume_from_snapshot(&volume, snapshot).await
            }
            VolumeSource::Volume(src) => driver.create_cloned_volume(&volume, src).await,
        };

        match created {
            Ok(update) => {
                let volume = self.store.volumes.update(&volume.id, |v| {
                    v.status = VolumeStatus::Available;
                    v.provider_location = update.provider_location;
                    v.metadata.extend(update.metadata);
                })?;
                info!("Volume {} created on {}", volume.id, placement);
                Ok(volume)
            }
            Err(e) => {
                error!("Driver failed to create volume {}: {}", volume.id, e);
                self.set_volume_status(&volume.id, VolumeStatus::Error);
                self.record(
                    ctx,
                    Action::CreateVolumeFromBackend,
                    ResourceType::Volume,
                    &volume.id,
                    &e,
                    Some(Detail::DriverFailedCreate),
                );
                Err(e)
            }
        }
    }

    fn volume_source(
        &self,
        snapshot_id: &Option<String>,
        source_volid: &Option<String>,
        size: u64,
    ) -> Result<VolumeSource> {
        match (snapshot_id, source_volid) {
            (Some(_), Some(_)) => Err(Error::InvalidInput {
                reason: "snapshot_id and source_volid are mutually exclusive".to_string(),
            }),
            (Some(id), None) => {
                let snapshot = self.store.snapshots.get(id)?;
                if snapshot.status != SnapshotStatus::Available {
                    return Err(Error::InvalidSnapshot {
                        reason: format!("snapshot {} is {}, must be available", id, snapshot.status),
                    });
                }
                if size < snapshot.volume_size {
                    return Err(Error::InvalidInput {
                        reason: format!(
                            "volume size {} GB is smaller than snapshot size {} GB",
                            size, snapshot.volume_size
                        ),
                    });
                }
                Ok(VolumeSource::Snapshot(snapshot))
            }
            (None, Some(id)) => {
                let src = self.store.volumes.get(id)?;
                VolumeOperation::CloneSource.check(&src, false)?;
                if size < src.size {
                    return Err(Error::InvalidInput {
                        reason: format!(
                            "volume size {} GB is smaller than source size {} GB",
                            size, src.size
                        ),
                    });
                }
                Ok(VolumeSource::Volume(src))
            }
            (None, None) => Ok(VolumeSource::Raw),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a volume; a backend object that is already gone counts as deleted
    pub async fn delete_volume(&self, ctx: &mut OperationContext, volume_id: &str) -> Result<()> {
        let timer = self.metrics.start("delete_volume");
        let result = self.delete_volume_locked(ctx, volume_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn delete_volume_locked(&self, ctx: &mut OperationContext, volume_id: &str) -> Result<()> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;

        VolumeOperation::Delete.check(&volume, false)?;
        let attachments = self.store.attachments_for(volume_id);
        if attachments.iter().any(|a| a.attach_status.is_live()) {
            return Err(Error::InvalidVolume {
                reason: format!("volume {} is still attached", volume_id),
            });
        }
        if !self.store.snapshots_for(volume_id).is_empty() {
            return Err(Error::InvalidVolume {
                reason: format!("volume {} still has snapshots", volume_id),
            });
        }

        info!("Deleting volume {}", volume_id);
        let volume = self
            .store
            .volumes
            .update(volume_id, |v| v.status = VolumeStatus::Deleting)?;

        // Never placed, nothing on a backend
        if volume.host.is_some() {
            let outcome = match self.initialized_driver(volume.host.as_deref()).await {
                Ok(driver) => driver.delete_volume(&volume).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!("Backend object of volume {} already gone: {}", volume_id, e);
                }
                Err(e) => {
                    error!("Failed to delete volume {}: {}", volume_id, e);
                    self.set_volume_status(volume_id, VolumeStatus::ErrorDeleting);
                    self.record(
                        ctx,
                        Action::DeleteVolume,
                        ResourceType::Volume,
                        volume_id,
                        &e,
                        Some(Detail::DriverFailedDelete),
                    );
                    return Err(e);
                }
            }
        }

        for attachment in attachments {
            self.store.attachments.soft_delete(&attachment.id)?;
        }
        self.store.volumes.soft_delete(volume_id)?;
        info!("Volume {} deleted", volume_id);
        Ok(())
    }

    // =========================================================================
    // Extend
    // =========================================================================

    /// Grow a volume to `new_size` GB
    pub async fn extend_volume(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        new_size: u64,
    ) -> Result<Volume> {
        let timer = self.metrics.start("extend_volume");
        let result = self.extend_volume_locked(ctx, volume_id, new_size).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn extend_volume_locked(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        new_size: u64,
    ) -> Result<Volume> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;

        VolumeOperation::Extend.check(&volume, false)?;
        if new_size <= volume.size {
            return Err(Error::InvalidInput {
                reason: format!(
                    "new size {} GB must be greater than current size {} GB",
                    new_size, volume.size
                ),
            });
        }
        let delta = new_size - volume.size;
        self.quota
            .check_extend(&self.store, volume.project_id.as_deref(), delta)?;

        ctx.set_message_target(Action::ExtendVolume, ResourceType::Volume, volume_id);
        let host = volume.host.clone().unwrap_or_default();
        let mut spec = RequestSpec::new(delta);
        spec.extra_specs = match volume.volume_type_id {
            Some(ref type_id) => self.volume_types.get(type_id)?.extra_specs,
            None => BTreeMap::new(),
        };
        if let Err(e) = self.scheduler.backend_passes_filters(&host, &spec) {
            warn!("Backend {} cannot extend volume {}: {}", host, volume_id, e);
            self.record_from_context(ctx, &e, Detail::NoBackendAvailable);
            return Err(e);
        }

        let driver = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver,
            Err(e) => {
                self.record_from_context(ctx, &e, Detail::DriverFailedExtend);
                return Err(e);
            }
        };

        let volume = self
            .store
            .volumes
            .update(volume_id, |v| v.set_status_saving_previous(VolumeStatus::Extending))?;
        debug!("Extending volume {} from {} to {} GB", volume_id, volume.size, new_size);

        match driver.extend_volume(&volume, new_size).await {
            Ok(()) => {
                let volume = self.store.volumes.update(volume_id, |v| {
                    v.size = new_size;
                    v.status = v.previous_status.take().unwrap_or(VolumeStatus::Available);
                })?;
                if let Err(e) = self.scheduler.state().consume(&host, delta) {
                    debug!("Pool {} not tracked: {}", host, e);
                }
                info!("Volume {} extended to {} GB", volume_id, new_size);
                Ok(volume)
            }
            Err(e) => {
                error!("Failed to extend volume {}: {}", volume_id, e);
                self.set_volume_status(volume_id, VolumeStatus::ErrorExtending);
                self.record_from_context(ctx, &e, Detail::DriverFailedExtend);
                Err(e)
            }
        }
    }

    /// Attach status a volume should show given its live attachments
    pub(crate) fn settle_attach_status(&self, volume_id: &str) -> Result<Volume> {
        let live = self
            .store
            .attachments_for(volume_id)
            .iter()
            .filter(|a| a.attach_status == AttachStatus::Attached)
            .count();
        self.store.volumes.update(volume_id, |v| {
            v.previous_status = None;
            if live == 0 {
                v.status = VolumeStatus::Available;
                v.attach_status = AttachStatus::Detached;
            } else {
                v.status = VolumeStatus::InUse;
                v.attach_status = AttachStatus::Attached;
            }
        })
    }
}

//! Attach / detach and connection management

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::LifecycleManager;
use crate::controlplane::locks::ResourceKey;
use crate::controlplane::transitions::{check_attach_transition, VolumeOperation};
use crate::domain::context::OperationContext;
use crate::domain::model::{AttachMode, AttachStatus, AttachTarget, Attachment, Volume, VolumeStatus};
use crate::domain::ports::{ConnectionInfo, ConnectorProperties};
use crate::error::{Error, Result};
use crate::message::{Action, Detail, ResourceType};
use crate::volume_types::front_end_qos;

/// Parameters of an attach request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    pub target: AttachTarget,
    pub mountpoint: Option<String>,
    pub mode: AttachMode,
    /// Connector of the attaching host; derived from the target when absent
    pub connector: Option<ConnectorProperties>,
}

impl AttachRequest {
    pub fn instance(instance_uuid: impl Into<String>, mode: AttachMode) -> Self {
        Self {
            target: AttachTarget::Instance(instance_uuid.into()),
            mountpoint: None,
            mode,
            connector: None,
        }
    }

    pub fn host(host: impl Into<String>, mode: AttachMode) -> Self {
        Self {
            target: AttachTarget::Host(host.into()),
            mountpoint: None,
            mode,
            connector: None,
        }
    }

    fn connector(&self) -> ConnectorProperties {
        match (&self.connector, &self.target) {
            (Some(connector), _) => connector.clone(),
            (None, AttachTarget::Host(host)) => ConnectorProperties::for_host(host.clone()),
            (None, AttachTarget::Instance(uuid)) => {
                ConnectorProperties::for_host(format!("instance-{}", uuid))
            }
        }
    }
}

impl LifecycleManager {
    pub fn get_attachment(&self, attachment_id: &str) -> Result<Attachment> {
        self.store.attachments.get(attachment_id)
    }

    pub fn list_attachments(&self, volume_id: &str) -> Vec<Attachment> {
        self.store.attachments_for(volume_id)
    }

    /// Connection info with the front-end QoS of the volume type and the access mode
    pub(crate) fn connection_properties(
        &self,
        volume: &Volume,
        mut info: ConnectionInfo,
        mode: AttachMode,
    ) -> Result<ConnectionInfo> {
        let qos = match volume.volume_type_id {
            Some(ref type_id) => self.volume_types.qos_for_type(type_id)?,
            None => None,
        };
        let qos_specs = front_end_qos(qos.as_ref(), volume.size)?
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);
        info.data.insert("qos_specs".to_string(), qos_specs);
        info.data
            .insert("access_mode".to_string(), mode.to_string().into());
        Ok(info)
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Attach a volume to an instance or host.
    ///
    /// A repeated request from the same target returns the existing
    /// attachment.
    pub async fn attach_volume(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        request: AttachRequest,
    ) -> Result<Attachment> {
        let timer = self.metrics.start("attach_volume");
        let result = self.attach_volume_locked(ctx, volume_id, request).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn attach_volume_locked(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        request: AttachRequest,
    ) -> Result<Attachment> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;
        ctx.set_message_target(Action::AttachVolume, ResourceType::Volume, volume_id);

        let live: Vec<Attachment> = self
            .store
            .attachments_for(volume_id)
            .into_iter()
            .filter(|a| a.attach_status.is_live())
            .collect();
        if let Some(existing) = live.iter().find(|a| a.target == request.target) {
            debug!("Volume {} already attached to {}", volume_id, request.target);
            return Ok(existing.clone());
        }
        if !live.is_empty() && !volume.multiattach {
            return Err(Error::InvalidVolume {
                reason: format!(
                    "volume {} is already attached and does not support multiattach",
                    volume_id
                ),
            });
        }
        VolumeOperation::Attach.check(&volume, false)?;

        if volume.is_readonly() && request.mode == AttachMode::Rw {
            let e = Error::InvalidVolumeAttachMode {
                mode: request.mode.to_string(),
                volume_id: volume_id.to_string(),
            };
            self.record_from_context(ctx, &e, Detail::VolumeAttachModeInvalid);
            return Err(e);
        }

        let driver = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver,
            Err(e) => {
                self.record_from_context(ctx, &e, Detail::AttachError);
                return Err(e);
            }
        };

        let connector = request.connector();
        let mut attachment = Attachment::new(volume_id, request.target.clone(), request.mode);
        attachment.mountpoint = request.mountpoint.clone();
        attachment.connector = Some(connector.clone());
        let attachment = self.store.attachments.insert(attachment);
        let volume = self.store.volumes.update(volume_id, |v| {
            v.set_status_saving_previous(VolumeStatus::Attaching);
            v.attach_status = AttachStatus::Attaching;
        })?;
        info!("Attaching volume {} to {}", volume_id, request.target);

        let info = match driver.initialize_connection(&volume, &connector).await {
            Ok(info) => self.connection_properties(&volume, info, request.mode),
            Err(e) => Err(e),
        };

        match info {
            Ok(info) => {
                check_attach_transition(&attachment.id, attachment.attach_status, AttachStatus::Attached)?;
                let attachment = self.store.attachments.update(&attachment.id, |a| {
                    a.attach_status = AttachStatus::Attached;
                    a.attach_time = Some(Utc::now());
                    a.connection_info = Some(info);
                })?;
                self.store.volumes.update(volume_id, |v| {
                    v.status = VolumeStatus::InUse;
                    v.previous_status = None;
                    v.attach_status = AttachStatus::Attached;
                })?;
                info!("Volume {} attached ({})", volume_id, attachment.id);
                Ok(attachment)
            }
            Err(e) => {
                error!("Failed to attach volume {}: {}", volume_id, e);
                self.store.attachments.update(&attachment.id, |a| {
                    a.attach_status = AttachStatus::ErrorAttaching;
                })?;
                self.store.volumes.update(volume_id, |v| {
                    v.status = v.previous_status.take().unwrap_or(VolumeStatus::Available);
                    v.attach_status = if live.is_empty() {
                        AttachStatus::Detached
                    } else {
                        AttachStatus::Attached
                    };
                })?;
                self.record_from_context(ctx, &e, Detail::AttachError);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Detach one attachment; an unknown attachment is not an error
    pub async fn detach_volume(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        attachment_id: &str,
    ) -> Result<()> {
        let timer = self.metrics.start("detach_volume");
        let result = self.detach_volume_locked(ctx, volume_id, attachment_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn detach_volume_locked(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        attachment_id: &str,
    ) -> Result<()> {
        let _guards = self
            .locks
            .lock_all(vec![
                ResourceKey::volume(volume_id),
                ResourceKey::attachment(attachment_id),
            ])
            .await?;
        let volume = self.store.volumes.get(volume_id)?;

        let attachment = match self.store.attachments.get(attachment_id) {
            Ok(a) if a.volume_id == volume_id => a,
            _ => {
                info!(
                    "Attachment {} of volume {} not found, nothing to detach",
                    attachment_id, volume_id
                );
                return Ok(());
            }
        };

        if attachment.attach_status == AttachStatus::ErrorAttaching {
            self.store.attachments.update(attachment_id, |a| {
                a.attach_status = AttachStatus::Detached;
                a.detach_time = Some(Utc::now());
            })?;
            self.store.attachments.soft_delete(attachment_id)?;
            return Ok(());
        }

        ctx.set_message_target(Action::DetachVolume, ResourceType::Volume, volume_id);
        check_attach_transition(attachment_id, attachment.attach_status, AttachStatus::Detaching)?;

        let driver = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver,
            Err(e) => {
                self.record_from_context(ctx, &e, Detail::DetachError);
                return Err(e);
            }
        };

        self.store
            .attachments
            .update(attachment_id, |a| a.attach_status = AttachStatus::Detaching)?;
        let volume = self.store.volumes.update(volume_id, |v| {
            v.set_status_saving_previous(VolumeStatus::Detaching);
            v.attach_status = AttachStatus::Detaching;
        })?;
        info!("Detaching volume {} ({})", volume_id, attachment_id);

        match driver
            .terminate_connection(&volume, attachment.connector.as_ref())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Export of volume {} already gone: {}", volume_id, e);
            }
            Err(e) => {
                error!("Failed to detach volume {}: {}", volume_id, e);
                self.store
                    .attachments
                    .update(attachment_id, |a| a.attach_status = AttachStatus::ErrorDetaching)?;
                self.store.volumes.update(volume_id, |v| {
                    v.status = VolumeStatus::InUse;
                    v.previous_status = None;
                    v.attach_status = AttachStatus::Attached;
                })?;
                self.record_from_context(ctx, &e, Detail::DetachError);
                return Err(e);
            }
        }

        self.store.attachments.update(attachment_id, |a| {
            a.attach_status = AttachStatus::Detached;
            a.detach_time = Some(Utc::now());
        })?;
        self.store.attachments.soft_delete(attachment_id)?;
        let volume = self.settle_attach_status(volume_id)?;
        info!("Volume {} detached, now {}", volume_id, volume.status);
        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Export a volume to a connector without creating an attachment
    pub async fn initialize_connection(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        connector: &ConnectorProperties,
        mode: AttachMode,
    ) -> Result<ConnectionInfo> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;
        VolumeOperation::Attach.check(&volume, false)?;
        ctx.set_message_target(Action::UpdateAttachment, ResourceType::Volume, volume_id);

        if volume.is_readonly() && mode == AttachMode::Rw {
            let e = Error::InvalidVolumeAttachMode {
                mode: mode.to_string(),
                volume_id: volume_id.to_string(),
            };
            self.record_from_context(ctx, &e, Detail::VolumeAttachModeInvalid);
            return Err(e);
        }

        let result = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver.initialize_connection(&volume, connector).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(info) => self.connection_properties(&volume, info, mode),
            Err(e) => {
                error!("Failed to initialize connection of {}: {}", volume_id, e);
                self.record_from_context(ctx, &e, Detail::AttachError);
                Err(e)
            }
        }
    }

    /// Remove an export; `None` removes every export of the volume
    pub async fn terminate_connection(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        connector: Option<&ConnectorProperties>,
    ) -> Result<()> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;
        ctx.set_message_target(Action::UpdateAttachment, ResourceType::Volume, volume_id);

        let result = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver.terminate_connection(&volume, connector).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                error!("Failed to terminate connection of {}: {}", volume_id, e);
                self.record_from_context(ctx, &e, Detail::DetachError);
                Err(e)
            }
        }
    }
}

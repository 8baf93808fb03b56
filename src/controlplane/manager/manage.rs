//! Manage existing backend objects, unmanage, and manageable listings

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::LifecycleManager;
use crate::controlplane::locks::ResourceKey;
use crate::controlplane::transitions::VolumeOperation;
use crate::domain::context::OperationContext;
use crate::domain::host::{append_pool, extract_host, same_backend, HostLevel, DEFAULT_POOL_NAME};
use crate::domain::model::{Volume, VolumeStatus};
use crate::domain::ports::{ExistingRef, ManageableDescriptor, ManageableQuery};
use crate::error::{Error, Result};
use crate::manageable::validate_reference;
use crate::message::{Action, Detail, ResourceType};

/// Parameters of a manage-existing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageExistingRequest {
    /// `host@backend` or `host@backend#pool`
    pub host: String,
    pub reference: ExistingRef,
    #[serde(default)]
    pub name: String,
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
}

impl LifecycleManager {
    /// Pool to place a managed object on; the first known pool when none is given
    fn manage_placement(&self, host: &str) -> String {
        if host.contains('#') {
            return host.to_string();
        }
        self.scheduler
            .state()
            .pools()
            .into_iter()
            .find(|p| p.backend == host)
            .map(|p| p.host)
            .unwrap_or_else(|| append_pool(host, Some(DEFAULT_POOL_NAME)))
    }

    fn fail_manage(&self, ctx: &mut OperationContext, volume_id: &str, error: Error) -> Error {
        error!("Managing volume {} failed: {}", volume_id, error);
        self.set_volume_status(volume_id, VolumeStatus::ErrorManaging);
        self.record(
            ctx,
            Action::CreateVolumeFromBackend,
            ResourceType::Volume,
            volume_id,
            &error,
            None,
        );
        error
    }

    /// Bring a backend object under management as a new volume
    pub async fn manage_existing(
        &self,
        ctx: &mut OperationContext,
        request: ManageExistingRequest,
    ) -> Result<Volume> {
        let timer = self.metrics.start("manage_existing");
        let result = self.manage_existing_locked(ctx, request).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn manage_existing_locked(
        &self,
        ctx: &mut OperationContext,
        request: ManageExistingRequest,
    ) -> Result<Volume> {
        validate_reference(&request.reference)?;
        let vtype = self.resolve_volume_type(request.volume_type.as_deref())?;
        let placement = self.manage_placement(&request.host);

        let identifier = request.reference.identifier().unwrap_or_default();
        let backend = extract_host(&placement, HostLevel::Backend, false).unwrap_or_default();
        // Held until the driver has taken over the object
        let _reference = self
            .locks
            .lock(ResourceKey::manage_reference(&backend, identifier))
            .await?;
        let managed = self.store.volumes.count(|v| {
            v.host.as_deref().map_or(false, |h| same_backend(h, &placement))
                && (v.id == identifier || format!("volume-{}", v.id) == identifier)
        });
        if managed > 0 {
            return Err(Error::ManageExistingAlreadyManaged {
                reference: request.reference.to_string(),
            });
        }
        self.quota
            .check_volume(&self.store, ctx.project_id.as_deref(), 0)?;

        let mut volume = Volume::new(request.name, 0);
        let _guard = self.locks.lock(ResourceKey::volume(&volume.id)).await?;
        volume.project_id = ctx.project_id.clone();
        volume.host = Some(placement.clone());
        volume.volume_type_id = Some(vtype.id.clone());
        volume.policy = self.volume_types.resolve_policy(&vtype.id)?;
        volume.availability_zone = Some(
            request
                .availability_zone
                .unwrap_or_else(|| self.settings.availability_zone.clone()),
        );
        let volume = self.store.volumes.insert(volume);
        ctx.set_message_target(Action::CreateVolumeFromBackend, ResourceType::Volume, &volume.id);
        info!(
            "Managing {} on {} as volume {}",
            request.reference, placement, volume.id
        );

        let driver = match self.initialized_driver(Some(&placement)).await {
            Ok(driver) => driver,
            Err(e) => return Err(self.fail_manage(ctx, &volume.id, e)),
        };
        let size = match driver
            .manage_existing_get_size(&volume, &request.reference)
            .await
        {
            Ok(size) => size,
            Err(e) => return Err(self.fail_manage(ctx, &volume.id, e)),
        };
        if let Err(e) = self
            .quota
            .check_extend(&self.store, ctx.project_id.as_deref(), size)
        {
            return Err(self.fail_manage(ctx, &volume.id, e));
        }
        let volume = self.store.volumes.update(&volume.id, |v| v.size = size)?;

        match driver.manage_existing(&volume, &request.reference).await {
            Ok(update) => {
                let volume = self.store.volumes.update(&volume.id, |v| {
                    v.status = VolumeStatus::Available;
                    v.provider_location = update.provider_location;
                    v.metadata.extend(update.metadata);
                })?;
                if let Err(e) = self.scheduler.state().consume(&placement, size) {
                    warn!("Could not account {} GB on {}: {}", size, placement, e);
                }
                info!("Volume {} managed ({} GB)", volume.id, size);
                Ok(volume)
            }
            Err(e) => Err(self.fail_manage(ctx, &volume.id, e)),
        }
    }

    /// Stop managing a volume, leaving its backend object in place
    pub async fn unmanage_volume(&self, ctx: &mut OperationContext, volume_id: &str) -> Result<()> {
        let timer = self.metrics.start("unmanage_volume");
        let result = self.unmanage_volume_locked(ctx, volume_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn unmanage_volume_locked(&self, ctx: &mut OperationContext, volume_id: &str) -> Result<()> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;
        VolumeOperation::Unmanage.check(&volume, false)?;
        if self
            .store
            .attachments_for(volume_id)
            .iter()
            .any(|a| a.attach_status.is_live())
        {
            return Err(Error::InvalidVolume {
                reason: format!("volume {} is attached", volume_id),
            });
        }
        if !self.store.snapshots_for(volume_id).is_empty() {
            return Err(Error::InvalidVolume {
                reason: format!("volume {} has snapshots", volume_id),
            });
        }

        ctx.set_message_target(Action::UnmanageVolume, ResourceType::Volume, volume_id);
        let result = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver.unmanage(&volume).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Unmanaging volume {} failed: {}", volume_id, e);
            self.set_volume_status(volume_id, VolumeStatus::Error);
            self.record_from_context(ctx, &e, Detail::UnknownError);
            return Err(e);
        }

        for attachment in self.store.attachments_for(volume_id) {
            self.store.attachments.soft_delete(&attachment.id)?;
        }
        self.store.volumes.soft_delete(volume_id)?;
        info!("Volume {} unmanaged", volume_id);
        Ok(())
    }

    /// Backend volumes on `host` that could be managed
    pub async fn get_manageable_volumes(
        &self,
        host: &str,
        query: &ManageableQuery,
    ) -> Result<Vec<ManageableDescriptor>> {
        let driver = self.initialized_driver(Some(host)).await?;
        let volumes = self.store.volumes.list(|v| {
            v.host.as_deref().map_or(false, |h| same_backend(h, host))
        });
        driver.get_manageable_volumes(&volumes, query).await
    }

    /// Backend snapshots on `host` that could be managed
    pub async fn get_manageable_snapshots(
        &self,
        host: &str,
        query: &ManageableQuery,
    ) -> Result<Vec<ManageableDescriptor>> {
        let driver = self.initialized_driver(Some(host)).await?;
        let snapshots = self.store.snapshots.list(|s| {
            self.store
                .volumes
                .get(&s.volume_id)
                .ok()
                .and_then(|v| v.host)
                .map_or(false, |h| same_backend(&h, host))
        });
        driver.get_manageable_snapshots(&snapshots, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::controlplane::manager::{AttachRequest, CreateVolumeRequest};
    use crate::domain::model::AttachMode;
    use crate::manageable::REASON_ALREADY_MANAGED;
    use assert_matches::assert_matches;

    fn request(reference: ExistingRef) -> ManageExistingRequest {
        ManageExistingRequest {
            host: BACKEND.to_string(),
            reference,
            name: "imported".to_string(),
            volume_type: None,
            availability_zone: None,
        }
    }

    #[tokio::test]
    async fn test_manage_and_unmanage() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        f.driver.add_unmanaged_volume("lv-data", 5, false).await;

        let volume = f
            .manager
            .manage_existing(&mut ctx, request(ExistingRef::source_name("lv-data")))
            .await
            .unwrap();
        assert_eq!(volume.status, VolumeStatus::Available);
        assert_eq!(volume.size, 5);
        assert_eq!(volume.host.as_deref(), Some("node1@mem#pool0"));
        assert!(volume.provider_location.is_some());
        assert!(f.driver.has_volume(&volume.id).await);

        assert_matches!(
            f.manager
                .manage_existing(
                    &mut ctx,
                    request(ExistingRef::source_name(format!("volume-{}", volume.id)))
                )
                .await,
            Err(Error::ManageExistingAlreadyManaged { .. })
        );

        f.manager.unmanage_volume(&mut ctx, &volume.id).await.unwrap();
        assert!(f.manager.get_volume(&volume.id).is_err());
        assert!(!f.driver.has_volume(&volume.id).await);
        assert!(ctx.messages().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_manage_of_same_reference() {
        let f = fixture().await;
        f.driver.add_unmanaged_volume("lv-shared", 3, false).await;
        f.driver
            .instrumentation()
            .set_delay(Some(std::time::Duration::from_millis(20)));

        let mut ctx1 = OperationContext::new();
        let mut ctx2 = OperationContext::new();
        let (first, second) = tokio::join!(
            f.manager
                .manage_existing(&mut ctx1, request(ExistingRef::source_name("lv-shared"))),
            f.manager
                .manage_existing(&mut ctx2, request(ExistingRef::source_name("lv-shared")))
        );

        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_eq!(f.driver.instrumentation().calls("manage_existing"), 1);
        assert_eq!(f.driver.instrumentation().max_in_flight(), 1);
        let available = f
            .manager
            .list_volumes(None)
            .into_iter()
            .filter(|v| v.status == VolumeStatus::Available)
            .count();
        assert_eq!(available, 1);
    }

    #[tokio::test]
    async fn test_empty_reference_rejected_before_backend_call() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let calls = f.driver.instrumentation().total_calls();

        assert_matches!(
            f.manager
                .manage_existing(&mut ctx, request(ExistingRef::default()))
                .await,
            Err(Error::ManageExistingInvalidReference { .. })
        );
        assert_eq!(f.driver.instrumentation().total_calls(), calls);
        assert!(f.manager.list_volumes(None).is_empty());
        assert!(ctx.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reference_marks_error_managing() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();

        assert_matches!(
            f.manager
                .manage_existing(&mut ctx, request(ExistingRef::source_name("missing")))
                .await,
            Err(Error::ManageExistingInvalidReference { .. })
        );
        let message = ctx.last_message().unwrap();
        assert_eq!(message.action, Action::CreateVolumeFromBackend);
        assert_eq!(message.detail, Detail::UnknownError);
        let volume = f
            .manager
            .get_volume(message.resource_uuid.as_deref().unwrap())
            .unwrap();
        assert_eq!(volume.status, VolumeStatus::ErrorManaging);

        // Terminal error state can still be cleaned up
        f.manager.delete_volume(&mut ctx, &volume.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unmanage_refuses_attached_volume() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = f
            .manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("v", 1))
            .await
            .unwrap();
        f.manager
            .attach_volume(&mut ctx, &volume.id, AttachRequest::host("h1", AttachMode::Rw))
            .await
            .unwrap();

        assert_matches!(
            f.manager.unmanage_volume(&mut ctx, &volume.id).await,
            Err(Error::InvalidVolume { .. })
        );
        assert_eq!(f.driver.instrumentation().calls("unmanage"), 0);
    }

    #[tokio::test]
    async fn test_manageable_listing_marks_managed_objects() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = f
            .manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("v", 2))
            .await
            .unwrap();
        f.driver.add_unmanaged_volume("free-lv", 7, false).await;
        f.driver.add_unmanaged_volume("busy-lv", 3, true).await;

        let entries = f
            .manager
            .get_manageable_volumes(BACKEND, &ManageableQuery::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);

        let managed = entries
            .iter()
            .find(|e| e.cinder_id.as_deref() == Some(volume.id.as_str()))
            .unwrap();
        assert!(!managed.safe_to_manage);
        assert_eq!(managed.reason_not_safe.as_deref(), Some(REASON_ALREADY_MANAGED));

        let free = entries
            .iter()
            .find(|e| e.reference.name() == Some("free-lv"))
            .unwrap();
        assert!(free.safe_to_manage);

        assert!(f
            .manager
            .get_manageable_snapshots(BACKEND, &ManageableQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}

//! Snapshot create / delete

use tracing::{error, info, warn};

use super::LifecycleManager;
use crate::controlplane::locks::ResourceKey;
use crate::controlplane::transitions::VolumeOperation;
use crate::domain::context::OperationContext;
use crate::domain::model::{Snapshot, SnapshotStatus};
use crate::error::{Error, Result};
use crate::message::{Action, Detail, ResourceType};

impl LifecycleManager {
    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.store.snapshots.get(snapshot_id)
    }

    pub fn list_snapshots(&self, volume_id: Option<&str>) -> Vec<Snapshot> {
        self.store
            .snapshots
            .list(|s| volume_id.map_or(true, |v| s.volume_id == v))
    }

    fn set_snapshot_status(&self, snapshot_id: &str, status: SnapshotStatus) {
        if let Err(e) = self.store.snapshots.update(snapshot_id, |s| s.status = status) {
            warn!("Could not set snapshot {} to {}: {}", snapshot_id, status, e);
        }
    }

    /// Snapshot a volume; `force` allows an in-use volume
    pub async fn create_snapshot(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        name: &str,
        force: bool,
    ) -> Result<Snapshot> {
        let timer = self.metrics.start("create_snapshot");
        let result = self.create_snapshot_locked(ctx, volume_id, name, force).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn create_snapshot_locked(
        &self,
        ctx: &mut OperationContext,
        volume_id: &str,
        name: &str,
        force: bool,
    ) -> Result<Snapshot> {
        let _guard = self.locks.lock(ResourceKey::volume(volume_id)).await?;
        let volume = self.store.volumes.get(volume_id)?;
        VolumeOperation::CreateSnapshot.check(&volume, force)?;
        self.quota
            .check_snapshot(&self.store, volume.project_id.as_deref(), volume.size)?;

        let snapshot = self.store.snapshots.insert(Snapshot::new(&volume, name));
        let _snapshot_guard = self.locks.lock(ResourceKey::snapshot(&snapshot.id)).await?;
        ctx.set_message_target(Action::SnapshotCreate, ResourceType::VolumeSnapshot, &snapshot.id);
        info!("Creating snapshot {} of volume {}", snapshot.id, volume_id);

        let result = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver.create_snapshot(&snapshot).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(update) => {
                let snapshot = self.store.snapshots.update(&snapshot.id, |s| {
                    s.status = SnapshotStatus::Available;
                    s.provider_location = update.provider_location;
                })?;
                info!("Snapshot {} available", snapshot.id);
                Ok(snapshot)
            }
            Err(e) => {
                error!("Failed to create snapshot {}: {}", snapshot.id, e);
                self.set_snapshot_status(&snapshot.id, SnapshotStatus::Error);
                self.record_from_context(ctx, &e, Detail::SnapshotCreateError);
                Err(e)
            }
        }
    }

    /// Delete a snapshot; a busy snapshot goes back to available
    pub async fn delete_snapshot(&self, ctx: &mut OperationContext, snapshot_id: &str) -> Result<()> {
        let timer = self.metrics.start("delete_snapshot");
        let result = self.delete_snapshot_locked(ctx, snapshot_id).await;
        self.metrics.finish(timer, &result);
        result
    }

    async fn delete_snapshot_locked(&self, ctx: &mut OperationContext, snapshot_id: &str) -> Result<()> {
        let volume_id = self.store.snapshots.get(snapshot_id)?.volume_id;
        let _guards = self
            .locks
            .lock_all(vec![
                ResourceKey::volume(&volume_id),
                ResourceKey::snapshot(snapshot_id),
            ])
            .await?;
        let snapshot = self.store.snapshots.get(snapshot_id)?;
        if !matches!(snapshot.status, SnapshotStatus::Available | SnapshotStatus::Error) {
            return Err(Error::InvalidSnapshot {
                reason: format!(
                    "snapshot {} is {}, must be available or error",
                    snapshot_id, snapshot.status
                ),
            });
        }

        let volume = self.store.volumes.get(&volume_id)?;
        ctx.set_message_target(Action::SnapshotDelete, ResourceType::VolumeSnapshot, snapshot_id);
        self.set_snapshot_status(snapshot_id, SnapshotStatus::Deleting);
        info!("Deleting snapshot {}", snapshot_id);

        let result = match self.initialized_driver(volume.host.as_deref()).await {
            Ok(driver) => driver.delete_snapshot(&snapshot).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Backend snapshot {} already gone: {}", snapshot_id, e);
            }
            Err(e @ Error::SnapshotIsBusy { .. }) => {
                warn!("Snapshot {} is busy: {}", snapshot_id, e);
                self.set_snapshot_status(snapshot_id, SnapshotStatus::Available);
                self.record_from_context(ctx, &e, Detail::SnapshotIsBusy);
                return Err(e);
            }
            Err(e) => {
                error!("Failed to delete snapshot {}: {}", snapshot_id, e);
                self.set_snapshot_status(snapshot_id, SnapshotStatus::ErrorDeleting);
                self.record_from_context(ctx, &e, Detail::SnapshotDeleteError);
                return Err(e);
            }
        }

        self.store.snapshots.soft_delete(snapshot_id)?;
        info!("Snapshot {} deleted", snapshot_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::controlplane::backends::Failure;
    use crate::controlplane::manager::{AttachRequest, CreateVolumeRequest};
    use crate::domain::model::AttachMode;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = f
            .manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("v", 3))
            .await
            .unwrap();

        let snapshot = f
            .manager
            .create_snapshot(&mut ctx, &volume.id, "s1", false)
            .await
            .unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Available);
        assert_eq!(snapshot.volume_size, 3);
        assert!(f.driver.has_snapshot(&snapshot.id).await);

        // Volume with snapshots cannot be deleted
        assert_matches!(
            f.manager.delete_volume(&mut ctx, &volume.id).await,
            Err(Error::InvalidVolume { .. })
        );

        f.manager.delete_snapshot(&mut ctx, &snapshot.id).await.unwrap();
        assert!(f.manager.get_snapshot(&snapshot.id).is_err());
        assert!(f.manager.list_snapshots(Some(&volume.id)).is_empty());
    }

    #[tokio::test]
    async fn test_in_use_volume_requires_force() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = f
            .manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("v", 1))
            .await
            .unwrap();
        f.manager
            .attach_volume(&mut ctx, &volume.id, AttachRequest::instance("vm", AttachMode::Rw))
            .await
            .unwrap();

        assert_matches!(
            f.manager.create_snapshot(&mut ctx, &volume.id, "s", false).await,
            Err(Error::InvalidVolume { .. })
        );
        assert!(f
            .manager
            .create_snapshot(&mut ctx, &volume.id, "s", true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_create_failure_records_message() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = f
            .manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("v", 1))
            .await
            .unwrap();
        f.driver.instrumentation().fail_on("create_snapshot", Failure::Error);

        assert!(f
            .manager
            .create_snapshot(&mut ctx, &volume.id, "s", false)
            .await
            .is_err());
        let message = ctx.last_message().unwrap();
        assert_eq!(message.action, Action::SnapshotCreate);
        assert_eq!(message.detail, Detail::SnapshotCreateError);
        let snapshot = f
            .manager
            .get_snapshot(message.resource_uuid.as_deref().unwrap())
            .unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Error);
    }

    #[tokio::test]
    async fn test_busy_snapshot_returns_to_available() {
        let f = fixture().await;
        let mut ctx = OperationContext::new();
        let volume = f
            .manager
            .create_volume(&mut ctx, CreateVolumeRequest::new("v", 1))
            .await
            .unwrap();
        let snapshot = f
            .manager
            .create_snapshot(&mut ctx, &volume.id, "s", false)
            .await
            .unwrap();
        f.driver.instrumentation().fail_on("delete_snapshot", Failure::Busy);

        assert_matches!(
            f.manager.delete_snapshot(&mut ctx, &snapshot.id).await,
            Err(Error::SnapshotIsBusy { .. })
        );
        assert_eq!(
            f.manager.get_snapshot(&snapshot.id).unwrap().status,
            SnapshotStatus::Available
        );
        assert_eq!(ctx.last_message().unwrap().detail, Detail::SnapshotIsBusy);

        f.driver.instrumentation().fail_on("delete_snapshot", Failure::Error);
        assert!(f.manager.delete_snapshot(&mut ctx, &snapshot.id).await.is_err());
        assert_eq!(
            f.manager.get_snapshot(&snapshot.id).unwrap().status,
            SnapshotStatus::ErrorDeleting
        );
        assert_eq!(ctx.last_message().unwrap().detail, Detail::SnapshotDeleteError);
    }
}

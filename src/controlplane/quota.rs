//! Quota
//!
//! Per-project limits checked before a resource record is created. Usage is
//! counted from the live rows of the store.

use serde::{Deserialize, Serialize};

use super::store::ResourceStore;
use crate::error::{Error, Result};

/// Per-project limits; `None` means unlimited
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub volumes: Option<u64>,
    pub snapshots: Option<u64>,
    pub backups: Option<u64>,
    pub gigabytes: Option<u64>,
}

/// Quota checks over the resource store
pub struct QuotaEngine {
    limits: QuotaLimits,
}

impl QuotaEngine {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    fn gigabytes_used(store: &ResourceStore, project: Option<&str>) -> u64 {
        let volumes: u64 = store
            .volumes
            .list(|v| v.project_id.as_deref() == project)
            .iter()
            .map(|v| v.size)
            .sum();
        let snapshots: u64 = store
            .snapshots
            .list(|s| s.project_id.as_deref() == project)
            .iter()
            .map(|s| s.volume_size)
            .sum();
        volumes + snapshots
    }

    fn check_gigabytes(&self, store: &ResourceStore, project: Option<&str>, size: u64) -> Result<()> {
        if let Some(allowed) = self.limits.gigabytes {
            let requested = Self::gigabytes_used(store, project) + size;
            if requested > allowed {
                return Err(Error::GigabytesLimitExceeded { requested, allowed });
            }
        }
        Ok(())
    }

    /// Reserve room for a new volume of `size` GB
    pub fn check_volume(&self, store: &ResourceStore, project: Option<&str>, size: u64) -> Result<()> {
        if let Some(allowed) = self.limits.volumes {
            let used = store.volumes.count(|v| v.project_id.as_deref() == project) as u64;
            if used + 1 > allowed {
                return Err(Error::VolumeLimitExceeded { allowed });
            }
        }
        self.check_gigabytes(store, project, size)
    }

    /// Growing a volume only consumes gigabytes
    pub fn check_extend(&self, store: &ResourceStore, project: Option<&str>, delta: u64) -> Result<()> {
        self.check_gigabytes(store, project, delta)
    }

    pub fn check_snapshot(&self, store: &ResourceStore, project: Option<&str>, size: u64) -> Result<()> {
        if let Some(allowed) = self.limits.snapshots {
            let used = store.snapshots.count(|s| s.project_id.as_deref() == project) as u64;
            if used + 1 > allowed {
                return Err(Error::SnapshotLimitExceeded { allowed });
            }
        }
        self.check_gigabytes(store, project, size)
    }

    pub fn check_backup(&self, store: &ResourceStore, project: Option<&str>) -> Result<()> {
        if let Some(allowed) = self.limits.backups {
            let used = store.backups.count(|b| b.project_id.as_deref() == project) as u64;
            if used + 1 > allowed {
                return Err(Error::BackupLimitExceeded { allowed });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Snapshot, Volume};
    use assert_matches::assert_matches;
    use tokio_test::assert_ok;

    fn volume(project: &str, size: u64) -> Volume {
        let mut v = Volume::new("v", size);
        v.project_id = Some(project.to_string());
        v
    }

    #[test]
    fn test_unlimited_by_default() {
        let store = ResourceStore::new();
        let quota = QuotaEngine::new(QuotaLimits::default());
        assert_ok!(quota.check_volume(&store, Some("p"), 10_000));
        assert_ok!(quota.check_backup(&store, Some("p")));
    }

    #[test]
    fn test_volume_and_gigabyte_limits() {
        let store = ResourceStore::new();
        store.volumes.insert(volume("p", 8));
        let quota = QuotaEngine::new(QuotaLimits {
            volumes: Some(2),
            gigabytes: Some(10),
            ..Default::default()
        });

        assert_ok!(quota.check_volume(&store, Some("p"), 2));
        assert_matches!(
            quota.check_volume(&store, Some("p"), 3),
            Err(Error::GigabytesLimitExceeded { requested: 11, allowed: 10 })
        );
        assert_ok!(quota.check_volume(&store, Some("other"), 10));

        store.volumes.insert(volume("p", 1));
        assert_matches!(
            quota.check_volume(&store, Some("p"), 1),
            Err(Error::VolumeLimitExceeded { allowed: 2 })
        );
    }

    #[test]
    fn test_snapshot_limit() {
        let store = ResourceStore::new();
        let v = store.volumes.insert(volume("p", 1));
        store.snapshots.insert(Snapshot::new(&v, "s"));
        let quota = QuotaEngine::new(QuotaLimits {
            snapshots: Some(1),
            ..Default::default()
        });
        assert_matches!(
            quota.check_snapshot(&store, Some("p"), 1),
            Err(Error::SnapshotLimitExceeded { allowed: 1 })
        );
    }
}

//! Resource Records
//!
//! One canonical record type per storage entity. Status enums carry the
//! wire names used by the API (`in-use`, `error_deleting`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ports::{ConnectionInfo, ConnectorProperties};

/// Generate a new resource identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Volume
// =============================================================================

/// Volume status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeStatus {
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "in-use")]
    InUse,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "error_deleting")]
    ErrorDeleting,
    #[serde(rename = "error_extending")]
    ErrorExtending,
    #[serde(rename = "error_restoring")]
    ErrorRestoring,
    #[serde(rename = "error_managing")]
    ErrorManaging,
    #[serde(rename = "backing-up")]
    BackingUp,
    #[serde(rename = "restoring-backup")]
    RestoringBackup,
    #[serde(rename = "maintenance")]
    Maintenance,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "extending")]
    Extending,
    #[serde(rename = "retyping")]
    Retyping,
    #[serde(rename = "attaching")]
    Attaching,
    #[serde(rename = "detaching")]
    Detaching,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Error => "error",
            VolumeStatus::ErrorDeleting => "error_deleting",
            VolumeStatus::ErrorExtending => "error_extending",
            VolumeStatus::ErrorRestoring => "error_restoring",
            VolumeStatus::ErrorManaging => "error_managing",
            VolumeStatus::BackingUp => "backing-up",
            VolumeStatus::RestoringBackup => "restoring-backup",
            VolumeStatus::Maintenance => "maintenance",
            VolumeStatus::Uploading => "uploading",
            VolumeStatus::Extending => "extending",
            VolumeStatus::Retyping => "retyping",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::Detaching => "detaching",
        }
    }

    /// Error states need operator intervention; nothing moves out of them automatically
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VolumeStatus::Error
                | VolumeStatus::ErrorDeleting
                | VolumeStatus::ErrorExtending
                | VolumeStatus::ErrorRestoring
                | VolumeStatus::ErrorManaging
        )
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attach status shared by volumes and attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachStatus {
    Attaching,
    Attached,
    Detaching,
    Detached,
    ErrorAttaching,
    ErrorDetaching,
}

impl AttachStatus {
    /// Attachment still holds a connection to the volume
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            AttachStatus::Attaching | AttachStatus::Attached | AttachStatus::Detaching
        )
    }
}

impl std::fmt::Display for AttachStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachStatus::Attaching => write!(f, "attaching"),
            AttachStatus::Attached => write!(f, "attached"),
            AttachStatus::Detaching => write!(f, "detaching"),
            AttachStatus::Detached => write!(f, "detached"),
            AttachStatus::ErrorAttaching => write!(f, "error_attaching"),
            AttachStatus::ErrorDetaching => write!(f, "error_detaching"),
        }
    }
}

/// A block storage volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub project_id: Option<String>,
    /// Size in GB
    pub size: u64,
    pub status: VolumeStatus,
    /// Status to return to once a transient operation (backup) finishes
    pub previous_status: Option<VolumeStatus>,
    pub attach_status: AttachStatus,
    pub volume_type_id: Option<String>,
    /// Placement, `host@backend#pool`
    pub host: Option<String>,
    pub availability_zone: Option<String>,
    pub multiattach: bool,
    pub provider_location: Option<String>,
    pub replication_status: Option<String>,
    pub snapshot_id: Option<String>,
    pub source_volid: Option<String>,
    /// Type extra specs merged with the type's QoS specs
    #[serde(default)]
    pub policy: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub admin_metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Volume {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            project_id: None,
            size,
            status: VolumeStatus::Creating,
            previous_status: None,
            attach_status: AttachStatus::Detached,
            volume_type_id: None,
            host: None,
            availability_zone: None,
            multiattach: false,
            provider_location: None,
            replication_status: None,
            snapshot_id: None,
            source_volid: None,
            policy: BTreeMap::new(),
            metadata: BTreeMap::new(),
            admin_metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Admin metadata `readonly=True` forbids read-write attachments
    pub fn is_readonly(&self) -> bool {
        self.admin_metadata
            .get("readonly")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Set the status, remembering the current one as `previous_status`
    pub fn set_status_saving_previous(&mut self, status: VolumeStatus) {
        self.previous_status = Some(self.status);
        self.status = status;
    }
}

// =============================================================================
// Attachment
// =============================================================================

/// Access mode of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    Ro,
    Rw,
}

impl std::fmt::Display for AttachMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachMode::Ro => write!(f, "ro"),
            AttachMode::Rw => write!(f, "rw"),
        }
    }
}

/// What a volume is attached to; an instance and a host are mutually exclusive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachTarget {
    Instance(String),
    Host(String),
}

impl std::fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachTarget::Instance(uuid) => write!(f, "instance {}", uuid),
            AttachTarget::Host(host) => write!(f, "host {}", host),
        }
    }
}

/// A connection of a volume to an instance or host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub volume_id: String,
    pub target: AttachTarget,
    pub attach_mode: AttachMode,
    pub attach_status: AttachStatus,
    pub mountpoint: Option<String>,
    pub connector: Option<ConnectorProperties>,
    pub connection_info: Option<ConnectionInfo>,
    pub attach_time: Option<DateTime<Utc>>,
    pub detach_time: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Attachment {
    pub fn new(volume_id: impl Into<String>, target: AttachTarget, attach_mode: AttachMode) -> Self {
        Self {
            id: new_id(),
            volume_id: volume_id.into(),
            target,
            attach_mode,
            attach_status: AttachStatus::Attaching,
            mountpoint: None,
            connector: None,
            connection_info: None,
            attach_time: None,
            detach_time: None,
            deleted_at: None,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Snapshot status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Deleting,
    Error,
    ErrorDeleting,
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotStatus::Creating => write!(f, "creating"),
            SnapshotStatus::Available => write!(f, "available"),
            SnapshotStatus::Deleting => write!(f, "deleting"),
            SnapshotStatus::Error => write!(f, "error"),
            SnapshotStatus::ErrorDeleting => write!(f, "error_deleting"),
        }
    }
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub name: String,
    pub project_id: Option<String>,
    pub status: SnapshotStatus,
    /// Size of the parent volume at creation, never changed afterwards
    pub volume_size: u64,
    pub provider_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(volume: &Volume, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            volume_id: volume.id.clone(),
            name: name.into(),
            project_id: volume.project_id.clone(),
            status: SnapshotStatus::Creating,
            volume_size: volume.size,
            provider_location: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

// =============================================================================
// Backup
// =============================================================================

/// Backup status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Available,
    Deleting,
    Restoring,
    Error,
    ErrorDeleting,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStatus::Creating => write!(f, "creating"),
            BackupStatus::Available => write!(f, "available"),
            BackupStatus::Deleting => write!(f, "deleting"),
            BackupStatus::Restoring => write!(f, "restoring"),
            BackupStatus::Error => write!(f, "error"),
            BackupStatus::ErrorDeleting => write!(f, "error_deleting"),
        }
    }
}

/// Backup of a volume; keeps only a weak reference to its source volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub volume_id: String,
    pub snapshot_id: Option<String>,
    pub name: String,
    pub project_id: Option<String>,
    pub status: BackupStatus,
    /// Size in GB
    pub size: u64,
    /// Backup driver that produced the data
    pub service: Option<String>,
    /// Backup service host handling the backup
    pub host: Option<String>,
    pub availability_zone: Option<String>,
    pub fail_reason: Option<String>,
    pub temp_volume_id: Option<String>,
    pub restore_volume_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Backup {
    pub fn new(volume: &Volume, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            volume_id: volume.id.clone(),
            snapshot_id: None,
            name: name.into(),
            project_id: volume.project_id.clone(),
            status: BackupStatus::Creating,
            size: volume.size,
            service: None,
            host: None,
            availability_zone: volume.availability_zone.clone(),
            fail_reason: None,
            temp_volume_id: None,
            restore_volume_id: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&VolumeStatus::InUse).unwrap(),
            "\"in-use\""
        );
        assert_eq!(
            serde_json::to_string(&VolumeStatus::ErrorDeleting).unwrap(),
            "\"error_deleting\""
        );
        let status: VolumeStatus = serde_json::from_str("\"restoring-backup\"").unwrap();
        assert_eq!(status, VolumeStatus::RestoringBackup);
        assert_eq!(format!("{}", VolumeStatus::BackingUp), "backing-up");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(VolumeStatus::Error.is_terminal());
        assert!(VolumeStatus::ErrorDeleting.is_terminal());
        assert!(!VolumeStatus::Available.is_terminal());
        assert!(!VolumeStatus::Extending.is_terminal());
    }

    #[test]
    fn test_readonly_metadata() {
        let mut volume = Volume::new("vol", 1);
        assert!(!volume.is_readonly());
        volume.admin_metadata.insert("readonly".into(), "True".into());
        assert!(volume.is_readonly());
    }

    #[test]
    fn test_snapshot_copies_volume_size() {
        let volume = Volume::new("vol", 7);
        let snapshot = Snapshot::new(&volume, "snap");
        assert_eq!(snapshot.volume_size, 7);
        assert_eq!(snapshot.volume_id, volume.id);
        assert_eq!(snapshot.status, SnapshotStatus::Creating);
    }
}

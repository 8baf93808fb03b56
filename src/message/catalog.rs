//! Message Catalog
//!
//! Stable codes and user-facing text for the (resource type, action, detail)
//! triples of user messages, plus the mapping from errors to detail codes.
//! Codes are part of the public API and are never renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Text returned for an action code that is not in the catalog
pub const UNKNOWN_ACTION_TEXT: &str = "unknown action";

/// Wire form of a catalog entry: `{id, text}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeText {
    pub id: String,
    #[serde(default)]
    pub text: String,
}

// =============================================================================
// Resource Type
// =============================================================================

/// Kind of resource a message is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "VOLUME")]
    Volume,
    #[serde(rename = "VOLUME_SNAPSHOT")]
    VolumeSnapshot,
    #[serde(rename = "VOLUME_BACKUP")]
    VolumeBackup,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Volume => "VOLUME",
            ResourceType::VolumeSnapshot => "VOLUME_SNAPSHOT",
            ResourceType::VolumeBackup => "VOLUME_BACKUP",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Action
// =============================================================================

/// Operation a message is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "CodeText", try_from = "CodeText")]
pub enum Action {
    ScheduleAllocateVolume,
    AttachVolume,
    CopyVolumeToImage,
    UpdateAttachment,
    CopyImageToVolume,
    UnmanageVolume,
    ExtendVolume,
    CreateVolumeFromBackend,
    SnapshotCreate,
    SnapshotDelete,
    SnapshotUpdate,
    SnapshotMetadataUpdate,
    BackupCreate,
    BackupDelete,
    BackupRestore,
    ReimageVolume,
    DeleteVolume,
    DetachVolume,
}

impl Action {
    pub const ALL: [Action; 18] = [
        Action::ScheduleAllocateVolume,
        Action::AttachVolume,
        Action::CopyVolumeToImage,
        Action::UpdateAttachment,
        Action::CopyImageToVolume,
        Action::UnmanageVolume,
        Action::ExtendVolume,
        Action::CreateVolumeFromBackend,
        Action::SnapshotCreate,
        Action::SnapshotDelete,
        Action::SnapshotUpdate,
        Action::SnapshotMetadataUpdate,
        Action::BackupCreate,
        Action::BackupDelete,
        Action::BackupRestore,
        Action::ReimageVolume,
        Action::DeleteVolume,
        Action::DetachVolume,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Action::ScheduleAllocateVolume => "001",
            Action::AttachVolume => "002",
            Action::CopyVolumeToImage => "003",
            Action::UpdateAttachment => "004",
            Action::CopyImageToVolume => "005",
            Action::UnmanageVolume => "006",
            Action::ExtendVolume => "007",
            Action::CreateVolumeFromBackend => "008",
            Action::SnapshotCreate => "009",
            Action::SnapshotDelete => "010",
            Action::SnapshotUpdate => "011",
            Action::SnapshotMetadataUpdate => "012",
            Action::BackupCreate => "013",
            Action::BackupDelete => "014",
            Action::BackupRestore => "015",
            Action::ReimageVolume => "016",
            Action::DeleteVolume => "017",
            Action::DetachVolume => "018",
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            Action::ScheduleAllocateVolume => "schedule allocate volume",
            Action::AttachVolume => "attach volume",
            Action::CopyVolumeToImage => "copy volume to image",
            Action::UpdateAttachment => "update attachment",
            Action::CopyImageToVolume => "copy image to volume",
            Action::UnmanageVolume => "unmanage volume",
            Action::ExtendVolume => "extend volume",
            Action::CreateVolumeFromBackend => "create volume from backend storage",
            Action::SnapshotCreate => "create snapshot",
            Action::SnapshotDelete => "delete snapshot",
            Action::SnapshotUpdate => "update snapshot",
            Action::SnapshotMetadataUpdate => "update snapshot metadata",
            Action::BackupCreate => "create backup",
            Action::BackupDelete => "delete backup",
            Action::BackupRestore => "restore backup",
            Action::ReimageVolume => "reimage volume",
            Action::DeleteVolume => "delete volume",
            Action::DetachVolume => "detach volume",
        }
    }

    pub fn from_id(id: &str) -> Option<Action> {
        Action::ALL.iter().copied().find(|a| a.id() == id)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

impl From<Action> for CodeText {
    fn from(action: Action) -> Self {
        CodeText {
            id: action.id().to_string(),
            text: action.text().to_string(),
        }
    }
}

impl TryFrom<CodeText> for Action {
    type Error = String;

    fn try_from(code: CodeText) -> std::result::Result<Self, Self::Error> {
        Action::from_id(&code.id).ok_or_else(|| format!("unknown action id {}", code.id))
    }
}

// =============================================================================
// Detail
// =============================================================================

/// Reason a message was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "CodeText", try_from = "CodeText")]
pub enum Detail {
    UnknownError,
    DriverNotInitialized,
    NoBackendAvailable,
    FailedToUploadVolume,
    VolumeAttachModeInvalid,
    QuotaExceed,
    NotEnoughSpaceForImage,
    UnmanageEncNotSupported,
    NotifyComputeServiceFailed,
    DriverFailedExtend,
    SignatureVerificationFailed,
    DriverFailedCreate,
    SnapshotCreateError,
    SnapshotUpdateMetadataFailed,
    SnapshotIsBusy,
    SnapshotDeleteError,
    BackupInvalidState,
    BackupServiceDown,
    BackupCreateDeviceError,
    BackupCreateDriverError,
    AttachError,
    DetachError,
    BackupCreateCleanupError,
    BackupScheduleError,
    BackupDeleteDriverError,
    BackupRestoreError,
    VolumeInvalidState,
    ReimageVolumeFailed,
    DriverFailedDelete,
}

impl Detail {
    pub const ALL: [Detail; 29] = [
        Detail::UnknownError,
        Detail::DriverNotInitialized,
        Detail::NoBackendAvailable,
        Detail::FailedToUploadVolume,
        Detail::VolumeAttachModeInvalid,
        Detail::QuotaExceed,
        Detail::NotEnoughSpaceForImage,
        Detail::UnmanageEncNotSupported,
        Detail::NotifyComputeServiceFailed,
        Detail::DriverFailedExtend,
        Detail::SignatureVerificationFailed,
        Detail::DriverFailedCreate,
        Detail::SnapshotCreateError,
        Detail::SnapshotUpdateMetadataFailed,
        Detail::SnapshotIsBusy,
        Detail::SnapshotDeleteError,
        Detail::BackupInvalidState,
        Detail::BackupServiceDown,
        Detail::BackupCreateDeviceError,
        Detail::BackupCreateDriverError,
        Detail::AttachError,
        Detail::DetachError,
        Detail::BackupCreateCleanupError,
        Detail::BackupScheduleError,
        Detail::BackupDeleteDriverError,
        Detail::BackupRestoreError,
        Detail::VolumeInvalidState,
        Detail::ReimageVolumeFailed,
        Detail::DriverFailedDelete,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Detail::UnknownError => "001",
            Detail::DriverNotInitialized => "002",
            Detail::NoBackendAvailable => "003",
            Detail::FailedToUploadVolume => "004",
            Detail::VolumeAttachModeInvalid => "005",
            Detail::QuotaExceed => "006",
            Detail::NotEnoughSpaceForImage => "007",
            Detail::UnmanageEncNotSupported => "008",
            Detail::NotifyComputeServiceFailed => "009",
            Detail::DriverFailedExtend => "010",
            Detail::SignatureVerificationFailed => "011",
            Detail::DriverFailedCreate => "012",
            Detail::SnapshotCreateError => "013",
            Detail::SnapshotUpdateMetadataFailed => "014",
            Detail::SnapshotIsBusy => "015",
            Detail::SnapshotDeleteError => "016",
            Detail::BackupInvalidState => "017",
            Detail::BackupServiceDown => "018",
            Detail::BackupCreateDeviceError => "019",
            Detail::BackupCreateDriverError => "020",
            Detail::AttachError => "021",
            Detail::DetachError => "022",
            Detail::BackupCreateCleanupError => "023",
            Detail::BackupScheduleError => "024",
            Detail::BackupDeleteDriverError => "025",
            Detail::BackupRestoreError => "026",
            Detail::VolumeInvalidState => "027",
            Detail::ReimageVolumeFailed => "028",
            Detail::DriverFailedDelete => "029",
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            Detail::UnknownError => "An unknown error occurred.",
            Detail::DriverNotInitialized => "Driver is not initialized at present.",
            Detail::NoBackendAvailable => "Could not find any available weighted backend.",
            Detail::FailedToUploadVolume => "Failed to upload volume to image at image service.",
            Detail::VolumeAttachModeInvalid => "Volume's attach mode is invalid.",
            Detail::QuotaExceed => "Not enough quota resource for operation.",
            Detail::NotEnoughSpaceForImage => {
                "Image used for creating volume exceeds available space."
            }
            Detail::UnmanageEncNotSupported => "Unmanaging encrypted volumes is not supported.",
            Detail::NotifyComputeServiceFailed => "Compute service failed to extend volume.",
            Detail::DriverFailedExtend => "Volume Driver failed to extend volume.",
            Detail::SignatureVerificationFailed => "Image signature verification failed.",
            Detail::DriverFailedCreate => "Driver failed to create the volume.",
            Detail::SnapshotCreateError => "Snapshot failed to create.",
            Detail::SnapshotUpdateMetadataFailed => "Volume snapshot update metadata failed.",
            Detail::SnapshotIsBusy => "Snapshot is busy.",
            Detail::SnapshotDeleteError => "Snapshot failed to delete.",
            Detail::BackupInvalidState => "Backup status is invalid.",
            Detail::BackupServiceDown => "Backup service is down.",
            Detail::BackupCreateDeviceError => {
                "Failed to get backup device from the volume service."
            }
            Detail::BackupCreateDriverError => "Backup driver failed to create backup.",
            Detail::AttachError => "Failed to attach volume.",
            Detail::DetachError => "Failed to detach volume.",
            Detail::BackupCreateCleanupError => "Cleanup of temporary volume/snapshot failed.",
            Detail::BackupScheduleError => {
                "Backup failed to schedule. Service not found for creating backup."
            }
            Detail::BackupDeleteDriverError => "Backup driver failed to delete backup.",
            Detail::BackupRestoreError => "Backup driver failed to restore backup.",
            Detail::VolumeInvalidState => "Volume status is invalid.",
            Detail::ReimageVolumeFailed => "Compute service failed to reimage volume.",
            Detail::DriverFailedDelete => "Driver failed to delete the volume.",
        }
    }

    pub fn from_id(id: &str) -> Option<Detail> {
        Detail::ALL.iter().copied().find(|d| d.id() == id)
    }

    /// Detail an error maps to, if the error class is in the mapping table
    pub fn for_error(error: &Error) -> Option<Detail> {
        match error {
            Error::DriverNotInitialized { .. } => Some(Detail::DriverNotInitialized),
            Error::NoValidBackend { .. } => Some(Detail::NoBackendAvailable),
            Error::InvalidVolumeAttachMode { .. } => Some(Detail::VolumeAttachModeInvalid),
            Error::ImageLimitExceeded { .. }
            | Error::BackupLimitExceeded { .. }
            | Error::SnapshotLimitExceeded { .. }
            | Error::VolumeLimitExceeded { .. }
            | Error::GigabytesLimitExceeded { .. } => Some(Detail::QuotaExceed),
            Error::ImageTooBig { .. } => Some(Detail::NotEnoughSpaceForImage),
            Error::SnapshotIsBusy { .. } => Some(Detail::SnapshotIsBusy),
            _ => None,
        }
    }
}

impl fmt::Display for Detail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

impl From<Detail> for CodeText {
    fn from(detail: Detail) -> Self {
        CodeText {
            id: detail.id().to_string(),
            text: detail.text().to_string(),
        }
    }
}

impl TryFrom<CodeText> for Detail {
    type Error = String;

    fn try_from(code: CodeText) -> std::result::Result<Self, Self::Error> {
        Detail::from_id(&code.id).ok_or_else(|| format!("unknown detail id {}", code.id))
    }
}

// =============================================================================
// Translation
// =============================================================================

/// Text of an action code, or `"unknown action"`
pub fn translate_action(action_id: &str) -> &'static str {
    Action::from_id(action_id)
        .map(|a| a.text())
        .unwrap_or(UNKNOWN_ACTION_TEXT)
}

/// Text of a detail code, or the unknown-error text
pub fn translate_detail(detail_id: &str) -> &'static str {
    Detail::from_id(detail_id)
        .unwrap_or(Detail::UnknownError)
        .text()
}

/// Resolve the detail to record for a failure.
///
/// A mapped error always wins over the caller's hint; the hint wins over the
/// unknown-error fallback.
pub fn translate_detail_id(error: Option<&Error>, detail: Option<Detail>) -> Detail {
    if let Some(mapped) = error.and_then(Detail::for_error) {
        return mapped;
    }
    detail.unwrap_or(Detail::UnknownError)
}

/// Event id of a message, `VOLUME_<resource type>_<action>_<detail>`
pub fn event_id(resource_type: ResourceType, action: Action, detail: Detail) -> String {
    format!(
        "VOLUME_{}_{}_{}",
        resource_type.as_str(),
        action.id(),
        detail.id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_action_has_text() {
        for action in Action::ALL {
            assert!(!translate_action(action.id()).is_empty());
            assert_eq!(translate_action(action.id()), action.text());
        }
    }

    #[test]
    fn test_unknown_action() {
        assert_eq!(translate_action("999"), "unknown action");
        assert_eq!(translate_action(""), "unknown action");
    }

    #[test]
    fn test_unknown_detail_falls_back() {
        assert_eq!(translate_detail("999"), "An unknown error occurred.");
        assert_eq!(translate_detail("017"), "Backup status is invalid.");
    }

    #[test]
    fn test_codes_are_unique() {
        let mut ids: Vec<&str> = Detail::ALL.iter().map(|d| d.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), Detail::ALL.len());

        let mut ids: Vec<&str> = Action::ALL.iter().map(|a| a.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), Action::ALL.len());
    }

    #[test]
    fn test_mapped_error_dominates_hint() {
        let mapped = [
            (
                Error::DriverNotInitialized { backend: "b".into() },
                Detail::DriverNotInitialized,
            ),
            (
                Error::NoValidBackend { reason: "none".into() },
                Detail::NoBackendAvailable,
            ),
            (
                Error::InvalidVolumeAttachMode {
                    mode: "rw".into(),
                    volume_id: "v".into(),
                },
                Detail::VolumeAttachModeInvalid,
            ),
            (Error::ImageLimitExceeded { allowed: 1 }, Detail::QuotaExceed),
            (Error::BackupLimitExceeded { allowed: 1 }, Detail::QuotaExceed),
            (Error::SnapshotLimitExceeded { allowed: 1 }, Detail::QuotaExceed),
            (Error::VolumeLimitExceeded { allowed: 1 }, Detail::QuotaExceed),
            (
                Error::GigabytesLimitExceeded {
                    requested: 10,
                    allowed: 1,
                },
                Detail::QuotaExceed,
            ),
            (
                Error::ImageTooBig {
                    image_size: 10,
                    volume_size: 1,
                },
                Detail::NotEnoughSpaceForImage,
            ),
            (
                Error::SnapshotIsBusy { snapshot_id: "s".into() },
                Detail::SnapshotIsBusy,
            ),
        ];

        for (error, expected) in mapped.iter() {
            for hint in [None, Some(Detail::AttachError), Some(Detail::BackupServiceDown)] {
                assert_eq!(translate_detail_id(Some(error), hint), *expected);
            }
        }
    }

    #[test]
    fn test_hint_and_fallback() {
        assert_eq!(
            translate_detail_id(None, Some(Detail::BackupInvalidState)),
            Detail::BackupInvalidState
        );
        assert_eq!(translate_detail_id(None, None), Detail::UnknownError);

        let unmapped = Error::backend_failed("memory", "create_volume", "boom");
        assert_eq!(
            translate_detail_id(Some(&unmapped), Some(Detail::DriverFailedCreate)),
            Detail::DriverFailedCreate
        );
        assert_eq!(translate_detail_id(Some(&unmapped), None), Detail::UnknownError);
    }

    #[test]
    fn test_event_id_and_wire_form() {
        assert_eq!(
            event_id(ResourceType::VolumeBackup, Action::BackupCreate, Detail::BackupInvalidState),
            "VOLUME_VOLUME_BACKUP_013_017"
        );

        let json = serde_json::to_value(Action::AttachVolume).unwrap();
        assert_eq!(json, serde_json::json!({"id": "002", "text": "attach volume"}));
        let back: Detail = serde_json::from_value(serde_json::json!({"id": "015"})).unwrap();
        assert_eq!(back, Detail::SnapshotIsBusy);
    }
}

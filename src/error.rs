//! Error types for the block storage core
//!
//! Provides structured error types for lifecycle operations, drivers,
//! scheduling, quota and configuration. Every variant belongs to exactly one
//! [`ErrorKind`], and user-facing Detail codes are resolved from the variant
//! itself (see [`crate::message::Detail::for_error`]).

use thiserror::Error;

/// Unified error type for the block storage core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    // =========================================================================
    // Invalid State Errors
    // =========================================================================
    #[error("Invalid volume: {reason}")]
    InvalidVolume { reason: String },

    #[error("Invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("Invalid backup: {reason}")]
    InvalidBackup { reason: String },

    #[error("Invalid attach mode '{mode}' for volume {volume_id}")]
    InvalidVolumeAttachMode { mode: String, volume_id: String },

    #[error("Volume type {name} is in use or protected: {reason}")]
    VolumeTypeInUse { name: String, reason: String },

    #[error("Volume type already exists: {name}")]
    VolumeTypeExists { name: String },

    // =========================================================================
    // Not Found Errors
    // =========================================================================
    #[error("Volume not found: {volume_id}")]
    VolumeNotFound { volume_id: String },

    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Backup not found: {backup_id}")]
    BackupNotFound { backup_id: String },

    #[error("Attachment not found: {attachment_id}")]
    AttachmentNotFound { attachment_id: String },

    #[error("Volume type not found: {type_id}")]
    VolumeTypeNotFound { type_id: String },

    #[error("QoS specs not found: {qos_id}")]
    QosSpecsNotFound { qos_id: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Backend object not found: {backend} - {reference}")]
    BackendObjectNotFound { backend: String, reference: String },

    #[error("Backend not found: {host}")]
    BackendNotFound { host: String },

    // =========================================================================
    // Backend Availability Errors
    // =========================================================================
    #[error("Volume driver not initialized: {backend}")]
    DriverNotInitialized { backend: String },

    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    // =========================================================================
    // Driver Operation Errors
    // =========================================================================
    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Backup driver operation failed: {service} - {operation}: {reason}")]
    BackupOperationFailed {
        service: String,
        operation: String,
        reason: String,
    },

    #[error("Snapshot is busy: {snapshot_id}")]
    SnapshotIsBusy { snapshot_id: String },

    #[error("Image of {image_size} GB is too big for volume of {volume_size} GB")]
    ImageTooBig { image_size: u64, volume_size: u64 },

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    #[error("No valid backend was found: {reason}")]
    NoValidBackend { reason: String },

    // =========================================================================
    // Quota Errors
    // =========================================================================
    #[error("Maximum number of volumes allowed ({allowed}) exceeded")]
    VolumeLimitExceeded { allowed: u64 },

    #[error("Maximum number of snapshots allowed ({allowed}) exceeded")]
    SnapshotLimitExceeded { allowed: u64 },

    #[error("Maximum number of backups allowed ({allowed}) exceeded")]
    BackupLimitExceeded { allowed: u64 },

    #[error("Requested {requested} GB exceeds the allowed gigabytes quota ({allowed} GB)")]
    GigabytesLimitExceeded { requested: u64, allowed: u64 },

    #[error("Maximum number of images allowed ({allowed}) exceeded")]
    ImageLimitExceeded { allowed: u64 },

    // =========================================================================
    // Manage Existing Errors
    // =========================================================================
    #[error("Manage existing volume failed due to invalid backend reference {reference}: {reason}")]
    ManageExistingInvalidReference { reference: String, reason: String },

    #[error("Failed to manage existing volume {reference}: already managed")]
    ManageExistingAlreadyManaged { reference: String },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    #[error("Resource busy: {resource}")]
    ResourceBusy { resource: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed failure taxonomy every error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Precondition on resource status violated
    InvalidState,
    /// Referenced resource or backend object missing
    NotFound,
    /// Driver not initialized or service down
    BackendUnavailable,
    /// Backend call raised during a mutating operation
    DriverOperationFailed,
    /// No eligible backend
    SchedulingFailed,
    /// Quota limit hit
    QuotaExceeded,
    /// Manage-existing reference malformed or already managed
    InvalidReference,
    /// Malformed configuration or request input
    ConfigurationError,
    /// Resource lock could not be taken
    Busy,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidState => write!(f, "invalid_state"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::BackendUnavailable => write!(f, "backend_unavailable"),
            ErrorKind::DriverOperationFailed => write!(f, "driver_operation_failed"),
            ErrorKind::SchedulingFailed => write!(f, "scheduling_failed"),
            ErrorKind::QuotaExceeded => write!(f, "quota_exceeded"),
            ErrorKind::InvalidReference => write!(f, "invalid_reference"),
            ErrorKind::ConfigurationError => write!(f, "configuration_error"),
            ErrorKind::Busy => write!(f, "busy"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Taxonomy bucket of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidVolume { .. }
            | Error::InvalidSnapshot { .. }
            | Error::InvalidBackup { .. }
            | Error::InvalidVolumeAttachMode { .. }
            | Error::VolumeTypeInUse { .. }
            | Error::VolumeTypeExists { .. } => ErrorKind::InvalidState,

            Error::VolumeNotFound { .. }
            | Error::SnapshotNotFound { .. }
            | Error::BackupNotFound { .. }
            | Error::AttachmentNotFound { .. }
            | Error::VolumeTypeNotFound { .. }
            | Error::QosSpecsNotFound { .. }
            | Error::MessageNotFound { .. }
            | Error::BackendObjectNotFound { .. }
            | Error::BackendNotFound { .. } => ErrorKind::NotFound,

            Error::DriverNotInitialized { .. }
            | Error::ServiceNotFound { .. }
            | Error::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,

            Error::BackendOperationFailed { .. }
            | Error::BackupOperationFailed { .. }
            | Error::SnapshotIsBusy { .. }
            | Error::ImageTooBig { .. } => ErrorKind::DriverOperationFailed,

            Error::NoValidBackend { .. } => ErrorKind::SchedulingFailed,

            Error::VolumeLimitExceeded { .. }
            | Error::SnapshotLimitExceeded { .. }
            | Error::BackupLimitExceeded { .. }
            | Error::GigabytesLimitExceeded { .. }
            | Error::ImageLimitExceeded { .. } => ErrorKind::QuotaExceeded,

            Error::ManageExistingInvalidReference { .. }
            | Error::ManageExistingAlreadyManaged { .. } => ErrorKind::InvalidReference,

            Error::Configuration(_)
            | Error::InvalidInput { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorKind::ConfigurationError,

            Error::ResourceBusy { .. } => ErrorKind::Busy,

            Error::Internal(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Stable class name of the error, used in logs and API bodies
    pub fn name(&self) -> &'static str {
        match self {
            Error::Internal(_) => "Internal",
            Error::Configuration(_) => "Configuration",
            Error::InvalidInput { .. } => "InvalidInput",
            Error::InvalidVolume { .. } => "InvalidVolume",
            Error::InvalidSnapshot { .. } => "InvalidSnapshot",
            Error::InvalidBackup { .. } => "InvalidBackup",
            Error::InvalidVolumeAttachMode { .. } => "InvalidVolumeAttachMode",
            Error::VolumeTypeInUse { .. } => "VolumeTypeInUse",
            Error::VolumeTypeExists { .. } => "VolumeTypeExists",
            Error::VolumeNotFound { .. } => "VolumeNotFound",
            Error::SnapshotNotFound { .. } => "SnapshotNotFound",
            Error::BackupNotFound { .. } => "BackupNotFound",
            Error::AttachmentNotFound { .. } => "AttachmentNotFound",
            Error::VolumeTypeNotFound { .. } => "VolumeTypeNotFound",
            Error::QosSpecsNotFound { .. } => "QosSpecsNotFound",
            Error::MessageNotFound { .. } => "MessageNotFound",
            Error::BackendObjectNotFound { .. } => "BackendObjectNotFound",
            Error::BackendNotFound { .. } => "BackendNotFound",
            Error::DriverNotInitialized { .. } => "DriverNotInitialized",
            Error::ServiceNotFound { .. } => "ServiceNotFound",
            Error::BackendUnavailable { .. } => "BackendUnavailable",
            Error::BackendOperationFailed { .. } => "BackendOperationFailed",
            Error::BackupOperationFailed { .. } => "BackupOperationFailed",
            Error::SnapshotIsBusy { .. } => "SnapshotIsBusy",
            Error::ImageTooBig { .. } => "ImageTooBig",
            Error::NoValidBackend { .. } => "NoValidBackend",
            Error::VolumeLimitExceeded { .. } => "VolumeLimitExceeded",
            Error::SnapshotLimitExceeded { .. } => "SnapshotLimitExceeded",
            Error::BackupLimitExceeded { .. } => "BackupLimitExceeded",
            Error::GigabytesLimitExceeded { .. } => "GigabytesLimitExceeded",
            Error::ImageLimitExceeded { .. } => "ImageLimitExceeded",
            Error::ManageExistingInvalidReference { .. } => "ManageExistingInvalidReference",
            Error::ManageExistingAlreadyManaged { .. } => "ManageExistingAlreadyManaged",
            Error::ResourceBusy { .. } => "ResourceBusy",
            Error::JsonParse(_) => "JsonParse",
            Error::YamlParse(_) => "YamlParse",
            Error::Io(_) => "Io",
        }
    }

    /// Check if this error reports a missing resource or backend object
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Shorthand for a failed driver call
    pub fn backend_failed(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::BackendOperationFailed {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the block storage core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::NoValidBackend {
            reason: "no pools".into(),
        };
        assert_eq!(err.kind(), ErrorKind::SchedulingFailed);

        let err = Error::SnapshotLimitExceeded { allowed: 10 };
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let err = Error::ManageExistingInvalidReference {
            reference: "{}".into(),
            reason: "empty".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidReference);

        let err = Error::DriverNotInitialized {
            backend: "lvm".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.name(), "DriverNotInitialized");
    }

    #[test]
    fn test_not_found() {
        let missing = Error::BackendObjectNotFound {
            backend: "memory".into(),
            reference: "vol-1".into(),
        };
        assert!(missing.is_not_found());

        let failed = Error::backend_failed("memory", "delete_volume", "io timeout");
        assert!(!failed.is_not_found());
        assert_eq!(failed.kind(), ErrorKind::DriverOperationFailed);
    }
}

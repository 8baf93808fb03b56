//! State Machines
//!
//! Legal volume statuses per operation and the attachment status graph.
//! Any status not listed for an operation is rejected.

use crate::domain::model::{AttachStatus, Volume, VolumeStatus};
use crate::error::{Error, Result};

/// Operations gated on the volume status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOperation {
    Attach,
    Extend,
    Delete,
    CreateSnapshot,
    CreateBackup,
    RestoreTarget,
    Unmanage,
    CloneSource,
}

impl VolumeOperation {
    /// Statuses that allow the operation; `force` widens snapshot and backup to `in-use`
    pub fn allowed_statuses(&self, force: bool) -> &'static [VolumeStatus] {
        use VolumeStatus::*;
        match self {
            VolumeOperation::Attach => &[Available, InUse],
            VolumeOperation::Extend => &[Available, InUse],
            VolumeOperation::Delete | VolumeOperation::Unmanage => {
                &[Available, Error, ErrorRestoring, ErrorExtending, ErrorManaging]
            }
            VolumeOperation::CreateSnapshot | VolumeOperation::CreateBackup => {
                if force {
                    &[Available, InUse]
                } else {
                    &[Available]
                }
            }
            VolumeOperation::RestoreTarget => &[Available],
            VolumeOperation::CloneSource => &[Available, InUse],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VolumeOperation::Attach => "attach",
            VolumeOperation::Extend => "extend",
            VolumeOperation::Delete => "delete",
            VolumeOperation::CreateSnapshot => "create snapshot",
            VolumeOperation::CreateBackup => "create backup",
            VolumeOperation::RestoreTarget => "restore backup to",
            VolumeOperation::Unmanage => "unmanage",
            VolumeOperation::CloneSource => "clone",
        }
    }

    /// Reject the operation with `InvalidVolume` if the status does not allow it
    pub fn check(&self, volume: &Volume, force: bool) -> Result<()> {
        let allowed = self.allowed_statuses(force);
        if allowed.contains(&volume.status) {
            return Ok(());
        }
        let expected: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
        Err(Error::InvalidVolume {
            reason: format!(
                "cannot {} volume {} in status {}, must be one of: {}",
                self.name(),
                volume.id,
                volume.status,
                expected.join(", ")
            ),
        })
    }
}

/// Whether an attachment may move from `from` to `to`
pub fn attach_transition_allowed(from: AttachStatus, to: AttachStatus) -> bool {
    use AttachStatus::*;
    matches!(
        (from, to),
        (Attaching, Attached)
            | (Attaching, ErrorAttaching)
            | (Attached, Detaching)
            | (Detaching, Detached)
            | (Detaching, ErrorDetaching)
            | (ErrorDetaching, Detaching)
            | (ErrorAttaching, Detached)
    )
}

/// Reject an illegal attachment transition
pub fn check_attach_transition(attachment_id: &str, from: AttachStatus, to: AttachStatus) -> Result<()> {
    if attach_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(Error::InvalidVolume {
            reason: format!(
                "attachment {} cannot move from {} to {}",
                attachment_id, from, to
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn volume(status: VolumeStatus) -> Volume {
        let mut v = Volume::new("v", 1);
        v.status = status;
        v
    }

    #[test]
    fn test_backup_requires_available_unless_forced() {
        let in_use = volume(VolumeStatus::InUse);
        assert_matches!(
            VolumeOperation::CreateBackup.check(&in_use, false),
            Err(Error::InvalidVolume { .. })
        );
        assert!(VolumeOperation::CreateBackup.check(&in_use, true).is_ok());
        assert!(VolumeOperation::CreateBackup
            .check(&volume(VolumeStatus::BackingUp), true)
            .is_err());
    }

    #[test]
    fn test_delete_accepts_error_states() {
        for status in [
            VolumeStatus::Available,
            VolumeStatus::Error,
            VolumeStatus::ErrorExtending,
            VolumeStatus::ErrorRestoring,
            VolumeStatus::ErrorManaging,
        ] {
            assert!(VolumeOperation::Delete.check(&volume(status), false).is_ok());
        }
        for status in [VolumeStatus::InUse, VolumeStatus::Creating, VolumeStatus::BackingUp] {
            assert!(VolumeOperation::Delete.check(&volume(status), false).is_err());
        }
    }

    #[test]
    fn test_restore_target_and_attach() {
        assert!(VolumeOperation::RestoreTarget
            .check(&volume(VolumeStatus::InUse), false)
            .is_err());
        assert!(VolumeOperation::Attach
            .check(&volume(VolumeStatus::Maintenance), false)
            .is_err());
    }

    #[test]
    fn test_attachment_graph() {
        use AttachStatus::*;
        assert!(attach_transition_allowed(Attaching, Attached));
        assert!(attach_transition_allowed(Attaching, ErrorAttaching));
        assert!(attach_transition_allowed(Detaching, Detached));
        assert!(!attach_transition_allowed(Detached, Attached));
        assert!(!attach_transition_allowed(ErrorAttaching, Attached));
        assert!(check_attach_transition("a1", Attached, Attaching).is_err());
    }
}

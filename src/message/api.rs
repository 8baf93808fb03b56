//! User message store
//!
//! Write-once records explaining a failed operation to the end user. The
//! lifecycle manager creates them; the API exposes get/list/delete.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::catalog::{event_id, translate_detail_id, Action, Detail, ResourceType};
use crate::domain::context::OperationContext;
use crate::domain::model::new_id;
use crate::error::{Error, Result};

/// Default retention of a message
pub const DEFAULT_MESSAGE_TTL_SECS: i64 = 2_592_000;

/// Severity of a message; only errors are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageLevel {
    Error,
}

/// A user-facing diagnostic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: Option<String>,
    pub request_id: String,
    pub resource_type: ResourceType,
    pub resource_uuid: Option<String>,
    pub action: Action,
    pub detail: Detail,
    pub event_id: String,
    pub message_level: MessageLevel,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Message {
    /// Text shown to the user
    pub fn user_message(&self) -> String {
        format!("{}:{}", self.action.text(), self.detail.text())
    }
}

/// Filter for [`MessageApi::list`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageFilter {
    pub resource_uuid: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub project_id: Option<String>,
}

impl MessageFilter {
    fn matches(&self, message: &Message) -> bool {
        if let Some(ref uuid) = self.resource_uuid {
            if message.resource_uuid.as_deref() != Some(uuid.as_str()) {
                return false;
            }
        }
        if let Some(rtype) = self.resource_type {
            if message.resource_type != rtype {
                return false;
            }
        }
        if let Some(ref project) = self.project_id {
            if message.project_id.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Message store
pub struct MessageApi {
    messages: RwLock<Vec<Message>>,
    ttl: Duration,
}

impl MessageApi {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Record a message about a failed operation.
    ///
    /// The detail is resolved from the error first, then the hint, then
    /// falls back to unknown error. The message is also appended to `ctx`.
    pub fn create(
        &self,
        ctx: &mut OperationContext,
        action: Action,
        resource_type: ResourceType,
        resource_uuid: Option<&str>,
        error: Option<&Error>,
        detail: Option<Detail>,
    ) -> Message {
        let detail = translate_detail_id(error, detail);
        let now = Utc::now();
        let message = Message {
            id: new_id(),
            project_id: ctx.project_id.clone(),
            request_id: ctx.request_id.clone(),
            resource_type,
            resource_uuid: resource_uuid.map(str::to_string),
            action,
            detail,
            event_id: event_id(resource_type, action, detail),
            message_level: MessageLevel::Error,
            created_at: now,
            expires_at: now + self.ttl,
        };

        info!(
            "Recorded message {} for {} {}: {}",
            message.event_id,
            resource_type,
            resource_uuid.unwrap_or("-"),
            message.user_message()
        );

        self.messages.write().push(message.clone());
        ctx.record(message.clone());
        message
    }

    /// Record a message using the attribution carried by `ctx`
    pub fn create_from_context(
        &self,
        ctx: &mut OperationContext,
        error: Option<&Error>,
        detail: Option<Detail>,
    ) -> Option<Message> {
        let (action, resource_type) = match (ctx.message_action, ctx.message_resource_type) {
            (Some(action), Some(rtype)) => (action, rtype),
            _ => {
                warn!("Request {} carries no message target, message dropped", ctx.request_id);
                return None;
            }
        };
        let resource_id = ctx.message_resource_id.clone();
        Some(self.create(ctx, action, resource_type, resource_id.as_deref(), error, detail))
    }

    pub fn get(&self, message_id: &str) -> Result<Message> {
        self.messages
            .read()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| Error::MessageNotFound {
                message_id: message_id.to_string(),
            })
    }

    /// Messages matching `filter`, oldest first
    pub fn list(&self, filter: &MessageFilter) -> Vec<Message> {
        self.messages
            .read()
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    pub fn delete(&self, message_id: &str) -> Result<()> {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| m.id != message_id);
        if messages.len() == before {
            return Err(Error::MessageNotFound {
                message_id: message_id.to_string(),
            });
        }
        Ok(())
    }

    /// Drop messages whose retention ended before `now`
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| m.expires_at > now);
        let removed = before - messages.len();
        if removed > 0 {
            debug!("Removed {} expired messages", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

impl Default for MessageApi {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_records_into_context() {
        let api = MessageApi::default();
        let mut ctx = OperationContext::for_project("p1");

        let msg = api.create(
            &mut ctx,
            Action::BackupCreate,
            ResourceType::VolumeBackup,
            Some("b1"),
            None,
            Some(Detail::BackupServiceDown),
        );

        assert_eq!(msg.detail, Detail::BackupServiceDown);
        assert_eq!(msg.project_id.as_deref(), Some("p1"));
        assert_eq!(msg.event_id, "VOLUME_VOLUME_BACKUP_013_018");
        assert_eq!(ctx.messages().len(), 1);
        assert_eq!(api.get(&msg.id).unwrap(), msg);
    }

    #[test]
    fn test_create_from_context() {
        let api = MessageApi::default();
        let mut ctx = OperationContext::new();
        assert!(api.create_from_context(&mut ctx, None, None).is_none());

        ctx.set_message_target(Action::AttachVolume, ResourceType::Volume, "v1");
        let err = Error::InvalidVolumeAttachMode {
            mode: "rw".into(),
            volume_id: "v1".into(),
        };
        let msg = api
            .create_from_context(&mut ctx, Some(&err), Some(Detail::AttachError))
            .unwrap();
        assert_eq!(msg.detail, Detail::VolumeAttachModeInvalid);
        assert_eq!(msg.resource_uuid.as_deref(), Some("v1"));
    }

    #[test]
    fn test_list_filter_and_delete() {
        let api = MessageApi::default();
        let mut ctx = OperationContext::new();
        let first = api.create(&mut ctx, Action::ExtendVolume, ResourceType::Volume, Some("v1"), None, None);
        api.create(&mut ctx, Action::ExtendVolume, ResourceType::Volume, Some("v2"), None, None);

        let filter = MessageFilter {
            resource_uuid: Some("v1".into()),
            ..Default::default()
        };
        assert_eq!(api.list(&filter).len(), 1);
        assert_eq!(api.list(&MessageFilter::default()).len(), 2);

        api.delete(&first.id).unwrap();
        assert!(api.get(&first.id).unwrap_err().is_not_found());
        assert!(api.delete(&first.id).is_err());
    }

    #[test]
    fn test_cleanup_expired() {
        let api = MessageApi::new(10);
        let mut ctx = OperationContext::new();
        api.create(&mut ctx, Action::AttachVolume, ResourceType::Volume, None, None, None);
        assert_eq!(api.cleanup_expired(Utc::now()), 0);
        assert_eq!(api.cleanup_expired(Utc::now() + Duration::seconds(11)), 1);
        assert!(api.is_empty());
    }
}

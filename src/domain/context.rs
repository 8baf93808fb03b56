//! Request context
//!
//! Every lifecycle call takes an [`OperationContext`]. Besides identity it
//! carries the message attribution (`message_action`, resource type and id)
//! of the operation in progress and collects the user messages recorded
//! during the call, so the API layer reads them explicitly.

use serde::{Deserialize, Serialize};

use crate::message::{Action, Message, ResourceType};

/// Per-request context passed down the call chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationContext {
    pub request_id: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub is_admin: bool,
    pub message_action: Option<Action>,
    pub message_resource_type: Option<ResourceType>,
    pub message_resource_id: Option<String>,
    #[serde(skip)]
    messages: Vec<Message>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self {
            request_id: format!("req-{}", super::model::new_id()),
            ..Default::default()
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::new()
        }
    }

    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::new()
        }
    }

    /// Annotate which action and resource failures should be attributed to
    pub fn set_message_target(
        &mut self,
        action: Action,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) {
        self.message_action = Some(action);
        self.message_resource_type = Some(resource_type);
        self.message_resource_id = Some(resource_id.into());
    }

    pub fn record(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Messages recorded while serving this request
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

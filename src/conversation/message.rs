//! Message types for the conversation log.

use super::reply::SmartForm;
use crate::authorization::AuthorizationRequest;
use crate::workflow::ExecutionPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a message is in its round trip to the backend.
///
/// `Sending` moves to `Sent` or `Failed`. `Failed` can be put back into
/// `Sending` by an explicit retry. `Sent` and `Received` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sending,
    Sent,
    Failed,
    /// Arrived from the server.
    Received,
}

impl DeliveryState {
    /// Only exists locally so far.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::Sending | Self::Failed)
    }
}

/// Structured data riding along with a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_requests: Vec<AuthorizationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<ExecutionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<SmartForm>,
    /// UI-only feedback, never part of the transcript.
    #[serde(default)]
    pub feedback: bool,
}

impl MessageMetadata {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authorization_requests.is_empty()
            && self.execution_plan.is_none()
            && self.form.is_none()
            && !self.feedback
    }

    /// Fill in what `self` lacks from `other`. Fields already present win;
    /// authorization requests are unioned by service id.
    pub fn absorb(&mut self, other: Self) {
        for request in other.authorization_requests {
            if !self
                .authorization_requests
                .iter()
                .any(|r| r.service_id == request.service_id)
            {
                self.authorization_requests.push(request);
            }
        }
        if self.execution_plan.is_none() {
            self.execution_plan = other.execution_plan;
        }
        if self.form.is_none() {
            self.form = other.form;
        }
        self.feedback |= other.feedback;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    /// Why the last delivery attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// A message as it arrived from the server.
    pub fn new(role: Role, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at,
            delivery: DeliveryState::Received,
            error: None,
            metadata: MessageMetadata::default(),
        }
    }

    /// An optimistic local copy, not yet acknowledged.
    pub fn outbound(role: Role, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            delivery: DeliveryState::Sending,
            ..Self::new(role, content, created_at)
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Belongs in the rendered transcript.
    ///
    /// System messages, feedback notes and empty assistant turns are kept
    /// out.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        match self.role {
            Role::System => false,
            _ if self.metadata.feedback => false,
            Role::Assistant => !self.content.trim().is_empty(),
            Role::User => true,
        }
    }
}

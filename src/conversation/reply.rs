//! Validation of backend payloads at the boundary.
//!
//! Replies carry optional side-channel fields whose presence varies from
//! call to call. Everything is checked here so the store only ever sees
//! well-formed [`ServerReply`] values.

use super::message::{Message, MessageMetadata, Role};
use crate::authorization::AuthorizationRequest;
use crate::workflow::ExecutionPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error)]
pub enum ReplyError {
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Invalid payload: {0}")]
    Invalid(String),

    #[error("Authorization requirement {0} has no service id")]
    MissingServiceId(usize),

    #[error("Form has no fields")]
    EmptyForm,

    #[error("Form field {0} has no name")]
    UnnamedField(usize),
}

impl From<serde_json::Error> for ReplyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(e.to_string())
    }
}

/// One input the backend needs before it can proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_field_kind", rename = "type", alias = "kind")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn default_field_kind() -> String {
    "text".to_string()
}

/// Structured-input request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartForm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub fields: Vec<FormField>,
}

impl SmartForm {
    fn from_value(value: Value) -> Result<Self, ReplyError> {
        let form: Self = serde_json::from_value(value)?;
        if form.fields.is_empty() {
            return Err(ReplyError::EmptyForm);
        }
        if let Some(index) = form.fields.iter().position(|f| f.name.trim().is_empty()) {
            return Err(ReplyError::UnnamedField(index));
        }
        Ok(form)
    }
}

/// Out-of-band control data found in a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    /// Providers that need the user's consent.
    AuthorizationRequired(Vec<AuthorizationRequest>),
    /// Fields the backend needs filled in before proceeding.
    FormRequested(SmartForm),
}

/// A validated chat reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerReply {
    pub conversation_id: Option<String>,
    /// Display text. Empty when the reply was pure control data.
    pub reply: String,
    pub status: Option<String>,
    pub signals: Vec<ControlSignal>,
    pub execution_plan: Option<ExecutionPlan>,
}

#[derive(Deserialize)]
struct RawReply {
    #[serde(default, alias = "response")]
    reply: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "chat_id")]
    conversation_id: Option<String>,
    #[serde(default)]
    oauth_requirements: Option<Vec<AuthorizationRequest>>,
    #[serde(default)]
    smart_form: Option<Value>,
    #[serde(default)]
    execution_plan: Option<Value>,
}

impl ServerReply {
    /// Validate a chat response body.
    pub fn parse(value: Value) -> Result<Self, ReplyError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(text) => Self::from_text(text),
            Value::Object(_) => Self::from_raw(serde_json::from_value(value)?),
            Value::Array(_) => Err(ReplyError::NotAnObject("an array")),
            Value::Bool(_) => Err(ReplyError::NotAnObject("a boolean")),
            Value::Number(_) => Err(ReplyError::NotAnObject("a number")),
        }
    }

    fn from_raw(raw: RawReply) -> Result<Self, ReplyError> {
        let mut signals = Vec::new();

        if let Some(requests) = raw.oauth_requirements {
            if let Some(index) = requests.iter().position(|r| r.service_id.trim().is_empty()) {
                return Err(ReplyError::MissingServiceId(index));
            }
            if !requests.is_empty() {
                signals.push(ControlSignal::AuthorizationRequired(requests));
            }
        }

        if let Some(form) = raw.smart_form.filter(|v| !v.is_null()) {
            signals.push(ControlSignal::FormRequested(SmartForm::from_value(form)?));
        }

        // Plans are display-only; a bad one is not worth failing the reply.
        let execution_plan = raw
            .execution_plan
            .filter(|v| !v.is_null())
            .and_then(|v| match ExecutionPlan::from_value(v) {
                Ok(plan) if !plan.is_empty() => Some(plan),
                Ok(_) => None,
                Err(e) => {
                    warn!("ignoring malformed execution plan: {}", e);
                    None
                }
            });

        let mut reply = Self {
            conversation_id: raw.conversation_id,
            reply: String::new(),
            status: raw.status,
            signals,
            execution_plan,
        };

        if let Some(text) = raw.reply {
            let embedded = Self::from_text(text)?;
            reply.reply = embedded.reply;
            reply.signals.extend(embedded.signals);
            if reply.execution_plan.is_none() {
                reply.execution_plan = embedded.execution_plan;
            }
        }

        Ok(reply)
    }

    /// Reply text that is itself a JSON control payload is unpacked rather
    /// than shown.
    fn from_text(text: String) -> Result<Self, ReplyError> {
        match embedded_control(&text) {
            Some(object) => {
                let mut raw: RawReply = serde_json::from_value(object)?;
                // A control payload's own text field must not recurse.
                let inner_text = raw.reply.take();
                let mut reply = Self::from_raw(raw)?;
                reply.reply = inner_text.unwrap_or_default();
                Ok(reply)
            }
            None => Ok(Self {
                reply: text,
                ..Self::default()
            }),
        }
    }

    /// Nothing to show; only control data.
    #[must_use]
    pub fn is_control_only(&self) -> bool {
        self.reply.trim().is_empty() && !self.signals.is_empty()
    }

    #[must_use]
    pub fn authorization_requests(&self) -> Vec<AuthorizationRequest> {
        self.signals
            .iter()
            .filter_map(|s| match s {
                ControlSignal::AuthorizationRequired(requests) => Some(requests.clone()),
                ControlSignal::FormRequested(_) => None,
            })
            .flatten()
            .collect()
    }

    #[must_use]
    pub fn form(&self) -> Option<&SmartForm> {
        self.signals.iter().find_map(|s| match s {
            ControlSignal::FormRequested(form) => Some(form),
            ControlSignal::AuthorizationRequired(_) => None,
        })
    }

    /// Metadata to attach to the assistant message built from this reply.
    #[must_use]
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            authorization_requests: self.authorization_requests(),
            execution_plan: self.execution_plan.clone(),
            form: self.form().cloned(),
            feedback: false,
        }
    }
}

/// A JSON object hiding in reply text, if it carries control fields.
///
/// Accepts the object bare or inside a ```json fence.
fn embedded_control(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if !body.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    let is_control = ["oauth_requirements", "smart_form"]
        .iter()
        .any(|key| object.get(*key).is_some_and(|v| !v.is_null()));
    is_control.then_some(value)
}

#[derive(Deserialize)]
struct RawHistoryMessage {
    #[serde(default)]
    id: Option<Value>,
    role: String,
    #[serde(default, alias = "message", alias = "text")]
    content: String,
    #[serde(default, alias = "timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    feedback: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawHistory {
    List(Vec<RawHistoryMessage>),
    Wrapped { messages: Vec<RawHistoryMessage> },
}

/// Parse a history response into server messages.
///
/// Messages without a timestamp get `fallback_time`.
pub fn parse_history(value: Value, fallback_time: DateTime<Utc>) -> Result<Vec<Message>, ReplyError> {
    let raw = match serde_json::from_value::<RawHistory>(value)? {
        RawHistory::List(messages) | RawHistory::Wrapped { messages } => messages,
    };

    raw.into_iter()
        .map(|m| {
            let role = parse_role(&m.role)
                .ok_or_else(|| ReplyError::Invalid(format!("unknown role: {}", m.role)))?;
            let mut message = Message::new(role, m.content, m.created_at.unwrap_or(fallback_time));
            if let Some(id) = m.id {
                message.id = match id {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
            }
            message.metadata.feedback = m.feedback;
            Ok(message)
        })
        .collect()
}

fn parse_role(role: &str) -> Option<Role> {
    match role.to_ascii_lowercase().as_str() {
        "user" | "human" => Some(Role::User),
        "assistant" | "ai" | "bot" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

/// One entry of the backend's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(alias = "conversation_id", alias = "chat_id")]
    pub id: String,
    #[serde(default, alias = "name")]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSummaries {
    List(Vec<ConversationSummary>),
    Wrapped {
        #[serde(alias = "chats")]
        conversations: Vec<ConversationSummary>,
    },
}

pub fn parse_summaries(value: Value) -> Result<Vec<ConversationSummary>, ReplyError> {
    match serde_json::from_value::<RawSummaries>(value)? {
        RawSummaries::List(list) | RawSummaries::Wrapped { conversations: list } => Ok(list),
    }
}

//! Gateway error types and response normalization.

use super::transport::TransportError;
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Words in a 401 body that mark it as a stale credential rather than a
/// permission problem.
const REFRESH_HINTS: &[&str] = &["token", "expire", "invalid"];

/// A non-2xx response in uniform shape.
///
/// Object bodies are kept verbatim; anything else is wrapped as
/// `{"detail": [{"msg": ...}]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub body: Value,
}

impl ApiError {
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        let text = body.trim();
        let body = match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(Value::String(s)) if !s.trim().is_empty() => wrap_detail(s.trim()),
            Ok(Value::Null) | Ok(Value::String(_)) => wrap_detail(&default_reason(status)),
            Ok(other) => wrap_detail(&other.to_string()),
            Err(_) if !text.is_empty() => wrap_detail(text),
            Err(_) => wrap_detail(&default_reason(status)),
        };
        Self { status, body }
    }

    /// Human-readable message extracted from the body.
    ///
    /// Handles common patterns:
    /// - `{"detail": [{"msg": "..."}]}` → first msg
    /// - `{"detail": "..."}`
    /// - `{"error": {"message": "..."}}` / `{"error": "..."}`
    /// - `{"message": "..."}`
    #[must_use]
    pub fn message(&self) -> String {
        extract_error_message(&self.body).unwrap_or_else(|| self.body.to_string())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.message())
    }
}

fn wrap_detail(msg: &str) -> Value {
    json!({ "detail": [{ "msg": msg }] })
}

fn default_reason(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map_or_else(|| format!("HTTP {status}"), str::to_string)
}

fn extract_error_message(json: &Value) -> Option<String> {
    if let Some(detail) = json.get("detail") {
        if let Some(msg) = detail
            .as_array()
            .and_then(|items| items.first())
            .and_then(|first| first.get("msg").or_else(|| first.get("message")))
            .and_then(Value::as_str)
        {
            return Some(msg.to_string());
        }
        if let Some(msg) = detail.as_str() {
            return Some(msg.to_string());
        }
    }

    if let Some(error_obj) = json.get("error") {
        if let Some(msg) = error_obj.get("message").and_then(Value::as_str) {
            return Some(msg.to_string());
        }
        if let Some(msg) = error_obj.as_str() {
            return Some(msg.to_string());
        }
    }

    json.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    /// A refreshable 401 that could not be recovered. The session has been
    /// cleared by the time this is returned.
    #[error("Session expired")]
    SessionExpired,

    #[error("Not authorized: {0}")]
    AuthRejected(ApiError),

    #[error("Request rejected: {0}")]
    Validation(ApiError),

    #[error("Server error: {0}")]
    Server(ApiError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl Error {
    /// Classify a non-2xx response.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let api = ApiError::from_response(status, body);
        match status {
            401 | 403 => Self::AuthRejected(api),
            500..=u16::MAX => Self::Server(api),
            _ => Self::Validation(api),
        }
    }

    #[must_use]
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::AuthRejected(api) | Self::Validation(api) | Self::Server(api) => Some(api),
            _ => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.api_error().map(|api| api.status)
    }

    /// Text suitable for showing next to a failed message.
    ///
    /// Server errors get a generic message; their detail is only logged.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(TransportError::Timeout) => "Request timed out".to_string(),
            Self::Network(_) => "Network error. Check your connection.".to_string(),
            Self::SessionExpired => "Your session has expired. Please log in again.".to_string(),
            Self::AuthRejected(api) | Self::Validation(api) => api.message(),
            Self::Server(_) => "Something went wrong on the server. Please try again.".to_string(),
            Self::Cancelled => "Cancelled".to_string(),
            Self::Decode(_) => "Unexpected response from server".to_string(),
        }
    }
}

/// Whether a 401 body signals a stale credential worth refreshing.
pub(crate) fn is_refreshable(body: &str) -> bool {
    let lower = body.to_lowercase();
    REFRESH_HINTS.iter().any(|hint| lower.contains(hint))
}

//! Conversation message model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a conversation turn
///
/// Roles outside the four the tracer understands are kept verbatim so that
/// nothing the client sent is lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    /// System prompt
    System,
    /// End-user turn
    User,
    /// Model turn
    Assistant,
    /// Tool result
    Tool,
    /// Any other role string
    Other(String),
}

impl Role {
    /// Wire name of the role
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Other(role) => role,
        }
    }
}

impl From<String> for Role {
    fn from(role: String) -> Self {
        match role.as_str() {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::Other(role),
        }
    }
}

impl From<&str> for Role {
    fn from(role: &str) -> Self {
        Self::from(role.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(role) => role,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Structured content blocks (multi-modal payloads)
    Parts(Vec<serde_json::Value>),
}

impl MessageContent {
    /// Text of the content; for block lists, the `text` blocks joined by newlines
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Canonical JSON rendering used for hashing and storage
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => serde_json::Value::Array(parts.clone()).to_string(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Individual message within a conversation trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier, stable across calls within a session
    pub message_id: String,

    /// Trace this message was recorded in
    pub trace_id: Option<String>,

    /// Role of the turn
    pub role: Role,

    /// Content of the turn (absent for e.g. tool-call-only assistant turns)
    pub content: Option<MessageContent>,

    /// Hex digest of the canonical content
    pub content_hash: Option<String>,

    /// Whether the content carries image blocks
    pub has_images: bool,

    /// Position within the trace's conversation
    pub message_order: Option<i64>,

    /// When the message was observed
    pub message_timestamp: Option<DateTime<Utc>>,

    /// Token count, known only for the final assistant turn
    pub token_count: Option<i64>,
}

impl Message {
    /// Create a message with a fresh identifier
    pub fn new(role: impl Into<Role>, content: Option<MessageContent>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            trace_id: None,
            role: role.into(),
            content,
            content_hash: None,
            has_images: false,
            message_order: None,
            message_timestamp: Some(Utc::now()),
            token_count: None,
        }
    }

    /// Text of the message, empty when there is no content
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::as_text)
            .unwrap_or_default()
    }

    /// Whether this is an assistant turn
    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ChatAttachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Lifecycle of an assistant message while its response streams in.
/// User messages are created `Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    ReasoningActive,
    ContentActive,
    #[default]
    Finalized,
    Failed,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Finalized | MessageState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ChatAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_stopped_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_duration_seconds: Option<u64>,
    #[serde(default)]
    pub is_reasoning_streaming: bool,
    #[serde(default)]
    pub state: MessageState,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, attachments: Vec<ChatAttachment>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            attachments,
            reasoning: None,
            reasoning_started_at: None,
            reasoning_stopped_at: None,
            reasoning_duration_seconds: None,
            is_reasoning_streaming: false,
            state: MessageState::Finalized,
        }
    }

    /// Empty assistant message appended when a send begins.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            attachments: Vec::new(),
            reasoning: Some(String::new()),
            reasoning_started_at: None,
            reasoning_stopped_at: None,
            reasoning_duration_seconds: None,
            is_reasoning_streaming: false,
            state: MessageState::Pending,
        }
    }

    pub fn reasoning_text(&self) -> &str {
        self.reasoning.as_deref().unwrap_or_default()
    }

    pub fn is_failed(&self) -> bool {
        self.state == MessageState::Failed
    }
}

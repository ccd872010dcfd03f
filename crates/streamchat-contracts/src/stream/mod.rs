mod decoder;
mod extract;

use serde::Serialize;

pub use decoder::{decode, Decoded, DONE_SENTINEL, FRAME_DELIMITER, PARSE_FAILURE_MESSAGE};
pub use extract::{extract_content, extract_reasoning, extract_text};

/// Semantic event produced by [`decode`]. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    Done,
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Delta {
            content: Some(text.into()),
            reasoning: None,
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        StreamEvent::Delta {
            content: None,
            reasoning: Some(text.into()),
        }
    }
}

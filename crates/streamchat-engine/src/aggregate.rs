//! Folding rules that turn decoded stream events into assistant message
//! state. Every function takes the current time explicitly so the rules stay
//! deterministic; [`crate::session::ChatSession`] supplies the clock.

use streamchat_contracts::messages::{ChatMessage, MessageState};
use streamchat_contracts::stream::StreamEvent;

pub const FAILURE_PREFIX: &str = "Error: ";

pub fn apply_event(message: &mut ChatMessage, event: &StreamEvent, now_ms: i64) {
    match event {
        StreamEvent::Delta { content, reasoning } => {
            apply_delta(message, content.as_deref(), reasoning.as_deref(), now_ms)
        }
        StreamEvent::Done => finalize(message, now_ms),
        StreamEvent::Error { message: error } => fail(message, error),
    }
}

/// Reasoning is folded before content when one delta carries both, so the
/// reasoning-to-content handoff happens inside a single event.
pub fn apply_delta(
    message: &mut ChatMessage,
    content: Option<&str>,
    reasoning: Option<&str>,
    now_ms: i64,
) {
    if message.state.is_terminal() {
        return;
    }
    if let Some(text) = reasoning.filter(|text| !text.is_empty()) {
        apply_reasoning(message, text, now_ms);
    }
    if let Some(text) = content.filter(|text| !text.is_empty()) {
        apply_content(message, text);
    }
}

fn apply_reasoning(message: &mut ChatMessage, text: &str, now_ms: i64) {
    message
        .reasoning
        .get_or_insert_with(String::new)
        .push_str(text);
    if message.reasoning_started_at.is_none() {
        message.reasoning_started_at = Some(now_ms);
    }
    message.reasoning_stopped_at = Some(now_ms);
    message.is_reasoning_streaming = true;
    if message.state == MessageState::Pending {
        message.state = MessageState::ReasoningActive;
    }
}

fn apply_content(message: &mut ChatMessage, text: &str) {
    message.content.push_str(text);
    if message.is_reasoning_streaming {
        message.is_reasoning_streaming = false;
        freeze_reasoning_duration(message);
    }
    message.state = MessageState::ContentActive;
}

/// Stream ended (`Done` or transport closed).
pub fn finalize(message: &mut ChatMessage, now_ms: i64) {
    if message.state.is_terminal() {
        return;
    }
    let trimmed_len = message.content.trim_end().len();
    message.content.truncate(trimmed_len);

    message.reasoning = message
        .reasoning
        .take()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());

    if message.is_reasoning_streaming {
        message.reasoning_stopped_at = Some(now_ms);
        freeze_reasoning_duration(message);
    }
    message.reasoning_started_at = None;
    message.reasoning_stopped_at = None;
    message.is_reasoning_streaming = false;
    message.state = MessageState::Finalized;
}

/// Error event or transport failure: the message becomes a visible failure
/// marker and loses all reasoning state.
pub fn fail(message: &mut ChatMessage, error: &str) {
    if message.state.is_terminal() {
        return;
    }
    message.content = format!("{FAILURE_PREFIX}{}", error.trim());
    message.reasoning = None;
    message.reasoning_duration_seconds = None;
    message.reasoning_started_at = None;
    message.reasoning_stopped_at = None;
    message.is_reasoning_streaming = false;
    message.state = MessageState::Failed;
}

/// Sets `reasoning_duration_seconds` once; later calls are no-ops.
fn freeze_reasoning_duration(message: &mut ChatMessage) {
    if message.reasoning_duration_seconds.is_some() {
        return;
    }
    let Some(started) = message.reasoning_started_at else {
        return;
    };
    let stopped = message.reasoning_stopped_at.unwrap_or(started);
    message.reasoning_duration_seconds = Some(duration_seconds(started, stopped));
}

fn duration_seconds(started_ms: i64, stopped_ms: i64) -> u64 {
    let seconds = (stopped_ms.saturating_sub(started_ms) as f64 / 1000.0).round();
    seconds.max(1.0) as u64
}

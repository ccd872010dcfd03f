use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use streamchat_contracts::events::{payload_from, SessionEvent, SessionLog};
use streamchat_contracts::messages::{ChatAttachment, ChatMessage, MessageState};
use streamchat_contracts::stream::{decode, StreamEvent};
use uuid::Uuid;

use crate::aggregate;
use crate::transport::error_chain_text;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const ERROR_TEXT_MAX_CHARS: usize = 600;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ordered, shareable snapshot of a session's messages. Updates replace the
/// list and the touched entry, so a snapshot never changes under a reader.
pub type MessageList = Arc<Vec<Arc<ChatMessage>>>;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Stops the in-flight response. Cloneable and usable from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    streaming: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub cancel: CancelHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// One open conversation: the message list, the streaming flag and the
/// cancel handle of the in-flight request. Only this type writes messages.
pub struct ChatSession {
    messages: MessageList,
    streaming: Arc<AtomicBool>,
    in_flight: Option<CancelHandle>,
    clock: Box<dyn Clock>,
    log: SessionLog,
    warnings: Vec<String>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self::with_log(SessionLog::disabled(Uuid::new_v4().to_string()))
    }

    pub fn with_log(log: SessionLog) -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            streaming: Arc::new(AtomicBool::new(false)),
            in_flight: None,
            clock: Box::new(SystemClock),
            log,
            warnings: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn id(&self) -> &str {
        self.log.session_id()
    }

    pub fn messages(&self) -> MessageList {
        Arc::clone(&self.messages)
    }

    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .find(|message| message.id == id)
            .map(Arc::as_ref)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Non-fatal problems, such as event log write failures.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Appends the user message and an empty assistant placeholder, and marks
    /// the session as streaming.
    pub fn begin_send(
        &mut self,
        text: &str,
        attachments: Vec<ChatAttachment>,
    ) -> Result<PendingTurn> {
        if self.is_streaming() {
            bail!("a response is already streaming");
        }
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            bail!("nothing to send");
        }

        let attachment_count = attachments.len();
        let user = ChatMessage::user(text, attachments);
        let placeholder = ChatMessage::assistant_placeholder();
        let turn = PendingTurn {
            user_message_id: user.id.clone(),
            assistant_message_id: placeholder.id.clone(),
            cancel: CancelHandle {
                cancelled: Arc::new(AtomicBool::new(false)),
                streaming: Arc::clone(&self.streaming),
            },
        };

        let mut next = self.messages.as_ref().clone();
        next.push(Arc::new(user));
        next.push(Arc::new(placeholder));
        self.messages = Arc::new(next);
        self.streaming.store(true, Ordering::SeqCst);
        self.in_flight = Some(turn.cancel.clone());

        self.record(
            SessionEvent::MessageSent,
            json!({
                "user_message_id": turn.user_message_id,
                "assistant_message_id": turn.assistant_message_id,
                "attachments": attachment_count,
            }),
        );
        Ok(turn)
    }

    /// Replaces the message with `id` by an edited copy. Returns `false`
    /// without touching anything when the id is unknown.
    pub fn update_message(&mut self, id: &str, edit: impl FnOnce(&mut ChatMessage)) -> bool {
        let Some(index) = self.messages.iter().position(|message| message.id == id) else {
            return false;
        };
        let mut updated = self.messages[index].as_ref().clone();
        edit(&mut updated);
        let mut next = self.messages.as_ref().clone();
        next[index] = Arc::new(updated);
        self.messages = Arc::new(next);
        true
    }

    pub fn apply_event(&mut self, message_id: &str, event: &StreamEvent) -> bool {
        let Some(was_open) = self.is_open(message_id) else {
            return false;
        };
        let now = self.clock.now_millis();
        self.update_message(message_id, |message| aggregate::apply_event(message, event, now));
        if !was_open {
            return true;
        }
        match event {
            StreamEvent::Delta { .. } => {}
            StreamEvent::Done => self.record_finalized(message_id),
            StreamEvent::Error { message } => self.record(
                SessionEvent::MessageFailed,
                json!({"message_id": message_id, "error": message, "source": "stream"}),
            ),
        }
        true
    }

    /// Transport closed: finalizes the message and ends streaming.
    pub fn finish(&mut self, message_id: &str) {
        let now = self.clock.now_millis();
        let was_open = self.is_open(message_id).unwrap_or(false);
        self.update_message(message_id, |message| aggregate::finalize(message, now));
        if was_open {
            self.record_finalized(message_id);
        }
        self.end_stream();
    }

    /// Transport failure: the message shows the error and streaming ends.
    pub fn fail(&mut self, message_id: &str, err: &anyhow::Error) {
        let text = error_chain_text(err, ERROR_TEXT_MAX_CHARS);
        let was_open = self.is_open(message_id).unwrap_or(false);
        self.update_message(message_id, |message| aggregate::fail(message, &text));
        if was_open {
            self.record(
                SessionEvent::MessageFailed,
                json!({"message_id": message_id, "error": text, "source": "transport"}),
            );
        }
        self.end_stream();
    }

    /// Stops the in-flight request where it is; the placeholder keeps
    /// whatever was folded so far.
    pub fn cancel(&mut self) {
        let Some(handle) = self.in_flight.take() else {
            return;
        };
        handle.cancel();
        self.record(SessionEvent::StreamCancelled, json!({}));
    }

    pub fn remove_message(&mut self, id: &str) -> bool {
        if !self.messages.iter().any(|message| message.id == id) {
            return false;
        }
        let next: Vec<Arc<ChatMessage>> = self
            .messages
            .iter()
            .filter(|message| message.id != id)
            .cloned()
            .collect();
        self.messages = Arc::new(next);
        true
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.is_streaming() {
            bail!("cannot clear the conversation while a response is streaming");
        }
        self.messages = Arc::new(Vec::new());
        Ok(())
    }

    /// Drives one response: reads `reader` chunk by chunk, decodes frames and
    /// folds every event into the turn's placeholder, calling `on_update`
    /// after each fold. The next chunk is only requested once the previous
    /// one is fully folded.
    ///
    /// Reads happen on a worker thread, so cancelling returns promptly even
    /// while the upstream is silent. The abandoned reader is dropped once its
    /// pending read returns.
    pub fn stream_response<R: Read + Send + 'static>(
        &mut self,
        turn: &PendingTurn,
        reader: R,
        mut on_update: impl FnMut(&MessageList),
    ) -> StreamOutcome {
        let message_id = turn.assistant_message_id.as_str();
        self.record(SessionEvent::StreamStarted, json!({"message_id": message_id}));

        let body = BodyPump::spawn(reader);
        let mut pending_bytes: Vec<u8> = Vec::new();
        let mut buffer = String::new();

        loop {
            if turn.cancel.is_cancelled() {
                return self.stop_cancelled(turn);
            }
            let chunk = match body.next_chunk(&turn.cancel) {
                Ok(Pumped::Chunk(chunk)) => chunk,
                Ok(Pumped::Cancelled) => return self.stop_cancelled(turn),
                Err(err) => {
                    if turn.cancel.is_cancelled() {
                        return self.stop_cancelled(turn);
                    }
                    let err = anyhow::Error::new(err).context("stream read failed");
                    self.fail(message_id, &err);
                    on_update(&self.messages);
                    return StreamOutcome::Failed;
                }
            };
            if chunk.is_empty() {
                break;
            }

            pending_bytes.extend_from_slice(&chunk);
            buffer.push_str(&take_utf8_prefix(&mut pending_bytes));
            let decoded = decode(&buffer);
            buffer = decoded.remainder;

            for event in decoded.events {
                if turn.cancel.is_cancelled() {
                    return self.stop_cancelled(turn);
                }
                self.apply_event(message_id, &event);
                on_update(&self.messages);
                match event {
                    StreamEvent::Done => {
                        self.end_stream();
                        return StreamOutcome::Completed;
                    }
                    StreamEvent::Error { .. } => {
                        self.end_stream();
                        return StreamOutcome::Failed;
                    }
                    StreamEvent::Delta { .. } => {}
                }
            }
        }

        // A cancel that raced the end of the body still wins.
        if turn.cancel.is_cancelled() {
            return self.stop_cancelled(turn);
        }
        self.finish(message_id);
        on_update(&self.messages);
        StreamOutcome::Completed
    }

    fn stop_cancelled(&mut self, turn: &PendingTurn) -> StreamOutcome {
        turn.cancel.cancel();
        if self.in_flight.take().is_some() {
            self.record(
                SessionEvent::StreamCancelled,
                json!({"message_id": turn.assistant_message_id}),
            );
        }
        StreamOutcome::Cancelled
    }

    /// `None` when the id is unknown.
    fn is_open(&self, message_id: &str) -> Option<bool> {
        self.message(message_id)
            .map(|message| !message.state.is_terminal())
    }

    fn end_stream(&mut self) {
        self.streaming.store(false, Ordering::SeqCst);
        self.in_flight = None;
    }

    fn record_finalized(&mut self, message_id: &str) {
        let Some(message) = self.message(message_id) else {
            return;
        };
        if message.state != MessageState::Finalized {
            return;
        }
        let payload = json!({
            "message_id": message_id,
            "content_chars": message.content.chars().count(),
            "reasoning_chars": message.reasoning_text().chars().count(),
            "reasoning_duration_seconds": message.reasoning_duration_seconds,
        });
        self.record(SessionEvent::MessageFinalized, payload);
    }

    fn record(&mut self, event: SessionEvent, payload: Value) {
        if let Err(err) = self.log.emit(event, payload_from(payload)) {
            push_unique_warning(&mut self.warnings, format!("session log write failed: {err}"));
        }
    }
}

enum Pumped {
    /// Empty at end of body.
    Chunk(Vec<u8>),
    Cancelled,
}

/// Owns the response body on a worker thread and hands out one chunk per
/// request, so the consumer can keep polling its cancel flag while a read
/// is blocked.
struct BodyPump {
    requests: Sender<()>,
    chunks: Receiver<io::Result<Vec<u8>>>,
}

impl BodyPump {
    fn spawn<R: Read + Send + 'static>(mut reader: R) -> Self {
        let (requests, request_rx) = mpsc::channel::<()>();
        let (chunk_tx, chunks) = mpsc::channel::<io::Result<Vec<u8>>>();
        thread::spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            while request_rx.recv().is_ok() {
                let result = loop {
                    match reader.read(&mut buf) {
                        Ok(read) => break Ok(buf[..read].to_vec()),
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => break Err(err),
                    }
                };
                let finished = !matches!(&result, Ok(chunk) if !chunk.is_empty());
                if chunk_tx.send(result).is_err() || finished {
                    break;
                }
            }
        });
        Self { requests, chunks }
    }

    fn next_chunk(&self, cancel: &CancelHandle) -> io::Result<Pumped> {
        self.requests
            .send(())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "stream reader stopped"))?;
        loop {
            if cancel.is_cancelled() {
                return Ok(Pumped::Cancelled);
            }
            match self.chunks.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(result) => return result.map(Pumped::Chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        ErrorKind::BrokenPipe,
                        "stream reader stopped",
                    ))
                }
            }
        }
    }
}

/// Splits off the longest decodable prefix, keeping a trailing incomplete
/// multi-byte sequence for the next chunk. Invalid bytes become U+FFFD.
fn take_utf8_prefix(bytes: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                text.push_str(valid);
                bytes.clear();
                return text;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&bytes[..valid_up_to]));
                match err.error_len() {
                    None => {
                        bytes.drain(..valid_up_to);
                        return text;
                    }
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        bytes.drain(..valid_up_to + invalid);
                    }
                }
            }
        }
    }
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

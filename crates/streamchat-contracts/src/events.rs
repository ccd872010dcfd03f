use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Lifecycle points a chat session reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    MessageSent,
    StreamStarted,
    MessageFinalized,
    MessageFailed,
    StreamCancelled,
    AttachmentPrepared,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 6] = [
        SessionEvent::MessageSent,
        SessionEvent::StreamStarted,
        SessionEvent::MessageFinalized,
        SessionEvent::MessageFailed,
        SessionEvent::StreamCancelled,
        SessionEvent::AttachmentPrepared,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::MessageSent => "message_sent",
            SessionEvent::StreamStarted => "stream_started",
            SessionEvent::MessageFinalized => "message_finalized",
            SessionEvent::MessageFailed => "message_failed",
            SessionEvent::StreamCancelled => "stream_cancelled",
            SessionEvent::AttachmentPrepared => "attachment_prepared",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == value.trim())
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object payloads pass through; anything else becomes `{"value": ...}`.
pub fn payload_from(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Append-only diagnostics log for one chat session (`events.jsonl`).
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a log created with [`SessionLog::disabled`] builds events but writes nothing
#[derive(Debug, Clone)]
pub struct SessionLog {
    inner: Arc<SessionLogInner>,
}

#[derive(Debug)]
struct SessionLogInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Mutex<()>,
}

impl SessionLog {
    pub fn to_file(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), session_id.into())
    }

    pub fn disabled(session_id: impl Into<String>) -> Self {
        Self::build(None, session_id.into())
    }

    fn build(path: Option<PathBuf>, session_id: String) -> Self {
        Self {
            inner: Arc::new(SessionLogInner {
                path,
                session_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: SessionEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("type".to_string(), Value::String(event.as_str().to_string()));
        row.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            row.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(row));
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }

    /// Rows written so far, oldest first. A disabled log has none.
    pub fn read_back(&self) -> anyhow::Result<Vec<Value>> {
        match self.inner.path.as_ref() {
            Some(path) => read_events(path),
            None => Ok(Vec::new()),
        }
    }
}

/// Parses an `events.jsonl` file. A missing file reads as empty; blank
/// lines are skipped.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut rows = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{} is not a JSON event", path.display(), index + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Event types of `rows` in order; rows whose type is unknown are skipped.
pub fn event_types(rows: &[Value]) -> Vec<SessionEvent> {
    rows.iter()
        .filter_map(|row| row.get("type").and_then(Value::as_str))
        .filter_map(SessionEvent::parse)
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_one_compact_line_per_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let log = SessionLog::to_file(&path, "session-1");

        let first = log.emit(
            SessionEvent::MessageSent,
            payload_from(json!({"message_id": "m-1"})),
        )?;
        log.emit(SessionEvent::MessageFinalized, EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Value = serde_json::from_str(lines[0])?;
        assert_eq!(parsed, first);
        assert_eq!(parsed["type"], "message_sent");
        assert_eq!(parsed["session_id"], "session-1");
        assert_eq!(parsed["message_id"], "m-1");
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;

        let rows = log.read_back()?;
        assert_eq!(
            event_types(&rows),
            vec![SessionEvent::MessageSent, SessionEvent::MessageFinalized]
        );
        Ok(())
    }

    #[test]
    fn payload_overrides_default_keys() -> anyhow::Result<()> {
        let log = SessionLog::disabled("session-1");
        let emitted = log.emit(
            SessionEvent::StreamStarted,
            payload_from(json!({"session_id": "other"})),
        )?;
        assert_eq!(emitted["session_id"], "other");
        assert_eq!(emitted["type"], "stream_started");
        Ok(())
    }

    #[test]
    fn disabled_log_touches_no_files() -> anyhow::Result<()> {
        let log = SessionLog::disabled("session-1");
        assert!(log.path().is_none());
        let emitted = log.emit(SessionEvent::StreamCancelled, EventPayload::new())?;
        assert_eq!(emitted["type"], "stream_cancelled");
        assert!(log.read_back()?.is_empty());
        Ok(())
    }

    #[test]
    fn event_names_match_their_serialized_form() -> anyhow::Result<()> {
        for event in SessionEvent::ALL {
            assert_eq!(serde_json::to_value(event)?, json!(event.as_str()));
            assert_eq!(SessionEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(SessionEvent::parse("run_started"), None);
        assert_eq!(SessionEvent::AttachmentPrepared.to_string(), "attachment_prepared");
        Ok(())
    }

    #[test]
    fn non_object_payloads_are_wrapped() {
        assert!(payload_from(Value::Null).is_empty());
        assert_eq!(payload_from(json!(3))["value"], 3);
        assert_eq!(payload_from(json!({"a": 1}))["a"], 1);
    }

    #[test]
    fn read_events_reports_the_bad_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        assert!(read_events(&path)?.is_empty());

        fs::write(&path, "{\"type\":\"message_sent\"}\n\nnot json\n")?;
        let err = read_events(&path)
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        assert!(err.contains("events.jsonl:3 is not a JSON event"));
        Ok(())
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use streamchat_contracts::messages::{ChatMessage, MessageState, Role};

pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Blocking client for an OpenAI-compatible streaming chat completions
/// endpoint. Requests carry no timeout; a stalled upstream is stopped
/// through the session's cancel handle.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: HttpClient,
    endpoint: String,
    api_key: Option<String>,
}

impl CompletionClient {
    pub fn new(api_base: &str, api_key: Option<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: chat_completions_url(api_base),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends `body` and returns the response once headers arrive. The
    /// response implements `Read` over the event-stream body.
    pub fn open_stream(&self, body: &Value) -> Result<HttpResponse> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key.trim()));
        }
        let response = request
            .send()
            .with_context(|| format!("completion request to {} failed", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "completion request failed ({code}): {}",
                truncate_text(body.trim(), ERROR_BODY_MAX_CHARS)
            );
        }
        Ok(response)
    }
}

pub fn chat_completions_url(api_base: &str) -> String {
    let trimmed = api_base.trim().trim_end_matches('/');
    let base = if trimmed.is_empty() {
        DEFAULT_API_BASE
    } else {
        trimmed
    };
    if base.ends_with(CHAT_COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{base}{CHAT_COMPLETIONS_PATH}")
    }
}

/// Request payload for one send: prior conversation plus the new user turn.
///
/// The in-flight placeholder (`exclude_id`), failed replies and empty
/// assistant messages are left out of the history.
pub fn build_request_body(
    model: &str,
    system_prompt: Option<&str>,
    messages: &[Arc<ChatMessage>],
    exclude_id: Option<&str>,
) -> Value {
    let mut rows = Vec::new();
    if let Some(system) = system_prompt.map(str::trim).filter(|text| !text.is_empty()) {
        rows.push(json!({"role": "system", "content": system}));
    }
    for message in messages {
        if Some(message.id.as_str()) == exclude_id {
            continue;
        }
        if message.role == Role::Assistant
            && (message.state == MessageState::Failed
                || message.state == MessageState::Pending
                || message.content.trim().is_empty())
        {
            continue;
        }
        rows.push(request_message(message));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert("stream".to_string(), Value::Bool(true));
    body.insert("messages".to_string(), Value::Array(rows));
    Value::Object(body)
}

fn request_message(message: &ChatMessage) -> Value {
    if message.attachments.is_empty() {
        return json!({
            "role": message.role.as_str(),
            "content": message.content,
        });
    }
    let mut parts = Vec::new();
    if !message.content.trim().is_empty() {
        parts.push(json!({"type": "text", "text": message.content}));
    }
    for attachment in &message.attachments {
        parts.push(json!({
            "type": "image_url",
            "image_url": {"url": attachment.data_url},
        }));
    }
    json!({
        "role": message.role.as_str(),
        "content": parts,
    })
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use streamchat_contracts::data_url::to_data_url;
    use streamchat_contracts::messages::ChatAttachment;

    use super::*;

    /// Serves exactly one HTTP response and hands back the raw request body.
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lowered = line.to_ascii_lowercase();
                if let Some(value) = lowered.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            let response = format!(
                "{status_line}\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            String::from_utf8(request_body).unwrap()
        });
        (format!("http://{addr}/v1"), handle)
    }

    #[test]
    fn url_appends_completions_path_once() {
        assert_eq!(
            chat_completions_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url(""),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_serializes_text_and_image_parts() {
        let attachment =
            ChatAttachment::new("a.jpg", "image/jpeg", to_data_url("image/jpeg", b"abc"));
        let url = attachment.data_url.clone();
        let earlier_user = Arc::new(ChatMessage::user("hello", Vec::new()));
        let mut earlier_reply = ChatMessage::assistant_placeholder();
        earlier_reply.content = "hi!".to_string();
        earlier_reply.state = MessageState::Finalized;
        let mut failed_reply = ChatMessage::assistant_placeholder();
        failed_reply.content = "Error: boom".to_string();
        failed_reply.state = MessageState::Failed;
        let current = Arc::new(ChatMessage::user("what is this?", vec![attachment]));
        let placeholder = Arc::new(ChatMessage::assistant_placeholder());

        let messages = vec![
            earlier_user,
            Arc::new(earlier_reply),
            Arc::new(failed_reply),
            current,
            placeholder.clone(),
        ];
        let body = build_request_body(
            "test/model",
            Some("be brief"),
            &messages,
            Some(placeholder.id.as_str()),
        );

        assert_eq!(body["model"], "test/model");
        assert_eq!(body["stream"], true);
        let rows = body["messages"].as_array().cloned().unwrap_or_default();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(rows[1], json!({"role": "user", "content": "hello"}));
        assert_eq!(rows[2], json!({"role": "assistant", "content": "hi!"}));
        assert_eq!(
            rows[3],
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": url}},
                ]
            })
        );
    }

    #[test]
    fn image_only_message_omits_text_part() {
        let attachment =
            ChatAttachment::new("a.jpg", "image/jpeg", to_data_url("image/jpeg", b"abc"));
        let messages = vec![Arc::new(ChatMessage::user("", vec![attachment]))];
        let body = build_request_body("m", None, &messages, None);
        let parts = body["messages"][0]["content"].as_array().cloned().unwrap_or_default();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["type"], "image_url");
    }

    #[test]
    fn open_stream_returns_event_stream_body() -> Result<()> {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n",
        );
        let client = CompletionClient::new(&base, Some("sk-test".to_string()))?;
        let mut response = client.open_stream(&json!({"model": "m", "stream": true, "messages": []}))?;
        let mut text = String::new();
        response.read_to_string(&mut text)?;
        assert!(text.ends_with("data: [DONE]\n\n"));

        let request_body: Value = serde_json::from_str(&server.join().unwrap_or_default())?;
        assert_eq!(request_body["stream"], true);
        Ok(())
    }

    #[test]
    fn non_success_status_is_an_error_with_body() -> Result<()> {
        let (base, server) = serve_once(
            "HTTP/1.1 401 Unauthorized",
            "{\"error\":{\"message\":\"No auth credentials found\"}}",
        );
        let client = CompletionClient::new(&base, None)?;
        let err = client
            .open_stream(&json!({"model": "m"}))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        let _ = server.join();
        assert!(err.starts_with("completion request failed (401):"));
        assert!(err.contains("No auth credentials found"));
        Ok(())
    }

    #[test]
    fn error_chain_text_dedupes_and_truncates() {
        let err = anyhow::anyhow!("socket closed")
            .context("socket closed")
            .context("stream read failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "stream read failed | caused by: socket closed"
        );
        assert_eq!(error_chain_text(&err, 6), "stream…");
    }
}

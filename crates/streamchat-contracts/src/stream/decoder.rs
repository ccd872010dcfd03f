use std::borrow::Cow;

use serde_json::Value;

use super::extract::{extract_content, extract_reasoning};
use super::StreamEvent;

pub const FRAME_DELIMITER: &str = "\n\n";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const PARSE_FAILURE_MESSAGE: &str = "Failed to parse stream chunk.";

const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub events: Vec<StreamEvent>,
    /// Trailing partial frame. Callers prepend it to the next chunk.
    pub remainder: String,
}

/// Decodes every complete frame in `buffer`, the full text received so far
/// for one response (previous remainder + new chunk).
///
/// A frame is only parsed once its delimiter has arrived; whatever follows
/// the last delimiter is returned as `remainder`.
pub fn decode(buffer: &str) -> Decoded {
    let normalized: Cow<'_, str> = if buffer.contains('\r') {
        Cow::Owned(buffer.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(buffer)
    };

    let mut frames: Vec<&str> = normalized.split(FRAME_DELIMITER).collect();
    let remainder = frames.pop().unwrap_or_default().to_string();

    let mut events = Vec::new();
    for frame in frames {
        decode_frame(frame, &mut events);
    }
    Decoded { events, remainder }
}

fn decode_frame(frame: &str, events: &mut Vec<StreamEvent>) {
    // Frames without a data line are keep-alives or comments.
    let Some(payload) = frame
        .split('\n')
        .find_map(|line| line.strip_prefix(DATA_PREFIX))
    else {
        return;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        events.push(StreamEvent::Done);
        return;
    }

    let record: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => {
            events.push(StreamEvent::Error {
                message: PARSE_FAILURE_MESSAGE.to_string(),
            });
            return;
        }
    };

    if let Some(message) = upstream_error_message(&record) {
        events.push(StreamEvent::Error { message });
        return;
    }

    let content = extract_content(&record);
    let reasoning = extract_reasoning(&record);
    if content.is_empty() && reasoning.is_empty() {
        return;
    }
    events.push(StreamEvent::Delta {
        content: (!content.is_empty()).then_some(content),
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
    });
}

/// Mid-stream failures arrive as `{"error": {"message": ...}}` records.
fn upstream_error_message(record: &Value) -> Option<String> {
    match record.get("error")? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Object(object) => Some(
            object
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(object.clone()).to_string()),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_A: &str =
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

    fn decode_in_chunks(input: &str, sizes: &[usize]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut remainder = String::new();
        let mut rest = input;
        let mut idx = 0;
        while !rest.is_empty() {
            let mut take = sizes[idx % sizes.len()].max(1).min(rest.len());
            while !rest.is_char_boundary(take) {
                take += 1;
            }
            let (chunk, tail) = rest.split_at(take);
            rest = tail;
            idx += 1;
            let decoded = decode(&format!("{remainder}{chunk}"));
            events.extend(decoded.events);
            remainder = decoded.remainder;
        }
        events
    }

    #[test]
    fn decodes_content_delta_then_done() {
        let decoded = decode(SCENARIO_A);
        assert_eq!(
            decoded.events,
            vec![StreamEvent::content("Hi"), StreamEvent::Done]
        );
        assert_eq!(decoded.remainder, "");
    }

    #[test]
    fn holds_back_partial_frame_until_delimiter_arrives() {
        let first = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi";
        let decoded = decode(first);
        assert!(decoded.events.is_empty());
        assert_eq!(decoded.remainder, first);

        let mut second = decoded.remainder;
        second.push_str("\"}}]}\n\n");
        let decoded = decode(&second);
        assert_eq!(decoded.events, vec![StreamEvent::content("Hi")]);
        assert_eq!(decoded.remainder, "");
    }

    #[test]
    fn chunking_does_not_change_event_sequence() {
        let input = concat!(
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"reasoning\":\"Let me think\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"reasoning_details\":[{\"type\":\"reasoning.text\",\"text\":\" more\"}]}}]}\n\n",
            "data: {broken\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Héllo \"}}]}\n\n",
            "event: ping\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"wörld\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        let whole = decode(input).events;
        assert_eq!(whole.len(), 6);
        let schedules: [&[usize]; 6] = [&[1], &[2], &[3, 7], &[5, 1, 11], &[64], &[4096]];
        for sizes in schedules {
            assert_eq!(decode_in_chunks(input, sizes), whole, "chunk sizes {sizes:?}");
        }
    }

    #[test]
    fn done_sentinel_yields_single_done() {
        let decoded = decode("data: [DONE]\n\n");
        assert_eq!(decoded.events, vec![StreamEvent::Done]);

        let decoded = decode("data: [done]\n\n");
        assert_eq!(
            decoded.events,
            vec![StreamEvent::Error {
                message: PARSE_FAILURE_MESSAGE.to_string()
            }]
        );
    }

    #[test]
    fn malformed_frame_does_not_drop_siblings() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {not json}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        );
        let decoded = decode(input);
        assert_eq!(
            decoded.events,
            vec![
                StreamEvent::content("a"),
                StreamEvent::Error {
                    message: PARSE_FAILURE_MESSAGE.to_string()
                },
                StreamEvent::content("b"),
            ]
        );
    }

    #[test]
    fn frames_without_data_or_text_are_skipped() {
        let input = concat!(
            ": OPENROUTER PROCESSING\n\n",
            "id: 4\nevent: message\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
        );
        let decoded = decode(input);
        assert!(decoded.events.is_empty());
        assert_eq!(decoded.remainder, "");
    }

    #[test]
    fn delta_carries_only_non_empty_channels() {
        let decoded = decode(
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\",\"reasoning\":\"why\"}}]}\n\n",
        );
        assert_eq!(
            decoded.events,
            vec![StreamEvent::Delta {
                content: Some("x".to_string()),
                reasoning: Some("why".to_string()),
            }]
        );

        let decoded = decode("data: {\"choices\":[{\"delta\":{\"reasoning\":\"why\"}}]}\n\n");
        assert_eq!(decoded.events, vec![StreamEvent::reasoning("why")]);
    }

    #[test]
    fn data_line_may_follow_other_fields_in_frame() {
        let decoded = decode(
            "event: completion\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
        );
        assert_eq!(decoded.events, vec![StreamEvent::content("ok")]);
    }

    #[test]
    fn upstream_error_record_becomes_error_event() {
        let decoded = decode("data: {\"error\":{\"message\":\"rate limited\",\"code\":429}}\n\n");
        assert_eq!(
            decoded.events,
            vec![StreamEvent::Error {
                message: "rate limited".to_string()
            }]
        );
    }

    #[test]
    fn crlf_delimited_frames_decode() {
        let decoded = decode("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(
            decoded.events,
            vec![StreamEvent::content("Hi"), StreamEvent::Done]
        );
    }
}

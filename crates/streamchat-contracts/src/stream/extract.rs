use serde_json::Value;

/// Fields walked when looking for text inside an unknown record shape, in
/// the order their leaves are concatenated.
const TEXT_KEYS: [&str; 4] = ["content", "text", "summary", "data"];

const REASONING_KEYS: [&str; 2] = ["reasoning", "reasoning_details"];

/// Concatenates every string leaf reachable through strings, arrays and the
/// `content`/`text`/`summary`/`data` fields of records.
pub fn extract_text(value: &Value) -> String {
    let mut parts = Vec::new();
    collect_text(value, &mut parts);
    parts.concat()
}

fn collect_text<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text.as_str()),
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            for key in TEXT_KEYS {
                if let Some(nested) = map.get(key) {
                    collect_text(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn first_choice(record: &Value) -> Option<&Value> {
    record
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
}

fn delta_record(record: &Value) -> Option<&Value> {
    first_choice(record)
        .and_then(|choice| choice.get("delta"))
        .or_else(|| record.get("delta"))
        .filter(|value| value.is_object())
}

fn message_record(record: &Value) -> Option<&Value> {
    first_choice(record)
        .and_then(|choice| choice.get("message"))
        .or_else(|| record.get("message"))
        .filter(|value| value.is_object())
}

/// Answer text of one decoded record: the delta's `content`, falling back to
/// the message's `content` when the delta carries none.
pub fn extract_content(record: &Value) -> String {
    let from_delta = delta_record(record)
        .and_then(|delta| delta.get("content"))
        .map(extract_text)
        .unwrap_or_default();
    if !from_delta.is_empty() {
        return from_delta;
    }
    message_record(record)
        .and_then(|message| message.get("content"))
        .map(extract_text)
        .unwrap_or_default()
}

/// Reasoning text of one decoded record. `reasoning` and `reasoning_details`
/// are read independently; a chunk identical to an earlier one is dropped.
pub fn extract_reasoning(record: &Value) -> String {
    let Some(source) = delta_record(record).or_else(|| message_record(record)) else {
        return String::new();
    };
    let mut chunks: Vec<String> = Vec::new();
    for key in REASONING_KEYS {
        let Some(field) = source.get(key) else {
            continue;
        };
        let text = extract_text(field);
        if text.is_empty() || chunks.iter().any(|existing| existing == &text) {
            continue;
        }
        chunks.push(text);
    }
    chunks.concat()
}

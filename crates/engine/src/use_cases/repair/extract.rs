//! Command-batch extraction from service responses.
//!
//! Order: the parsed document's own `tavern_commands`, a chat/responses
//! envelope, an SSE stream, and finally the bracket-balanced array after a
//! `"tavern_commands"` key. Extraction never fails; an unrecoverable response
//! yields an empty batch with the raw text kept.

use serde_json::Value;

use taverndb_shared::{ExtractedCommands, ParsedResponse, RepairStrategy};

use super::json_repair::{extract_balanced_array, parse_ai_response_text};

const COMMANDS_KEY: &str = "tavern_commands";

/// JSON pointers where envelopes carry the model's text.
const ENVELOPE_CONTENT_POINTERS: [&str; 6] = [
    "/choices/0/message/content",
    "/choices/0/delta/content",
    "/response/choices/0/message/content",
    "/response/output_text",
    "/output_text",
    "/output/0/content/0/text",
];

fn commands_of(value: &Value) -> Option<Vec<Value>> {
    value.get(COMMANDS_KEY).and_then(Value::as_array).cloned()
}

fn nested_commands(text: &str) -> Option<Vec<Value>> {
    parse_ai_response_text(text)
        .response
        .as_ref()
        .and_then(commands_of)
}

fn from_envelope(payload: &Value) -> Option<Vec<Value>> {
    if !payload.is_object() {
        return None;
    }
    if let Some(commands) = commands_of(payload) {
        return Some(commands);
    }
    ENVELOPE_CONTENT_POINTERS
        .iter()
        .filter_map(|pointer| payload.pointer(pointer).and_then(Value::as_str))
        .filter(|content| !content.trim().is_empty())
        .find_map(nested_commands)
}

fn is_done_marker(data: &str) -> bool {
    data.eq_ignore_ascii_case("[done]")
}

/// Reassemble an SSE body into the model's text, or pick up direct commands from a chunk.
fn from_sse_body(raw: &str) -> Option<Vec<Value>> {
    if !raw.contains("data:") {
        return None;
    }

    let mut full_text = String::new();
    let mut has_delta = false;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();
        if data.is_empty() || is_done_marker(data.trim_end()) {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            tracing::trace!(chunk = data, "Skipping malformed SSE chunk");
            continue;
        };

        let event_type = chunk
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        if let Some(delta) = chunk.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            full_text.push_str(delta);
            has_delta = true;
        }
        if event_type == "response.output_text.delta" {
            let delta = chunk
                .get("delta")
                .or_else(|| chunk.get("text_delta"))
                .or_else(|| chunk.pointer("/output_text/delta"))
                .and_then(Value::as_str);
            if let Some(delta) = delta {
                full_text.push_str(delta);
                has_delta = true;
            }
        }
        if let Some(message) = chunk.pointer("/choices/0/message/content").and_then(Value::as_str) {
            if full_text.is_empty() {
                full_text = message.to_string();
            }
        }
        if event_type == "response.output_text.done" && !has_delta && full_text.is_empty() {
            let done = chunk
                .get("text")
                .or_else(|| chunk.get("output_text"))
                .and_then(Value::as_str);
            if let Some(done) = done {
                full_text = done.to_string();
            }
        }
        if let Some(commands) = commands_of(&chunk) {
            return Some(commands);
        }
    }

    if full_text.trim().is_empty() {
        return None;
    }
    nested_commands(&full_text)
}

fn with_fallback_note(parsed: &ParsedResponse, strategy: RepairStrategy) -> Option<String> {
    let notes: Vec<&str> = parsed
        .repair_note
        .as_deref()
        .into_iter()
        .chain([strategy.marker()])
        .collect();
    Some(notes.join(" | "))
}

/// Recover the command batch from one raw service response.
pub fn extract_service_commands(raw: &str) -> ExtractedCommands {
    let parsed = parse_ai_response_text(raw);
    let mut extracted = ExtractedCommands {
        tavern_commands: Vec::new(),
        raw_response: raw.to_string(),
        repair_note: parsed.repair_note.clone(),
        strategies: parsed.strategies.clone(),
        parse_error: None,
        action_options: parsed
            .document()
            .map(|document| document.action_option_texts())
            .unwrap_or_default(),
    };

    if let Some(commands) = parsed.response.as_ref().and_then(commands_of) {
        extracted.tavern_commands = commands;
        return extracted;
    }

    if let Some(commands) = parsed.response.as_ref().and_then(from_envelope) {
        tracing::debug!(count = commands.len(), "Commands recovered from response envelope");
        extracted.tavern_commands = commands;
        extracted.repair_note = with_fallback_note(&parsed, RepairStrategy::EnvelopeExtracted);
        extracted.strategies.push(RepairStrategy::EnvelopeExtracted);
        return extracted;
    }

    if let Some(commands) = from_sse_body(raw) {
        tracing::debug!(count = commands.len(), "Commands recovered from SSE stream");
        extracted.tavern_commands = commands;
        extracted.repair_note = with_fallback_note(&parsed, RepairStrategy::SseExtracted);
        extracted.strategies.push(RepairStrategy::SseExtracted);
        return extracted;
    }

    let balanced = extract_balanced_array(raw, COMMANDS_KEY)
        .and_then(|array| serde_json::from_str::<Value>(array).ok())
        .and_then(|value| match value {
            Value::Array(items) => Some(items),
            _ => None,
        });
    if let Some(commands) = balanced {
        tracing::warn!(count = commands.len(), "Commands recovered by balanced array extraction");
        extracted.tavern_commands = commands;
        extracted.repair_note = Some(RepairStrategy::BalancedArrayExtracted.marker().to_string());
        extracted.strategies = vec![RepairStrategy::BalancedArrayExtracted];
        return extracted;
    }

    if parsed.response.is_none() {
        tracing::warn!(raw_len = raw.len(), "No tavern_commands recoverable from response");
        extracted.parse_error = Some(parsed.error.unwrap_or_else(|| "JSON解析失败".to_string()));
    }
    extracted
}

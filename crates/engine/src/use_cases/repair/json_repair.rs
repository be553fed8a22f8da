//! Structured-document recovery from raw model text.
//!
//! Candidates are tried in order (whole text, first balanced object, fenced
//! blocks). When none parses, the base candidate goes through the syntactic
//! repairs: trailing commas, control characters inside strings, then missing
//! closing brackets and braces. Every step is deterministic.
//!
//! SSE `data:` framing is not handled here; `extract_service_commands`
//! unwraps event streams before calling in.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

use taverndb_shared::{ParsedResponse, RepairStrategy};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:[A-Za-z0-9_-]+)?\s*(.*?)```").expect("valid regex")
});

const ACTION_OPTION_KEYS: [&str; 2] = ["action_options", "可选行动列表"];

/// Tracks string-literal state while scanning JSON-ish text.
#[derive(Default)]
struct StringScanner {
    in_string: bool,
    escaped: bool,
}

impl StringScanner {
    /// Feed one char; returns true when the char is structural (outside any string).
    fn structural(&mut self, ch: char) -> bool {
        if self.escaped {
            self.escaped = false;
            return false;
        }
        if ch == '\\' {
            if self.in_string {
                self.escaped = true;
            }
            return false;
        }
        if ch == '"' {
            self.in_string = !self.in_string;
            return false;
        }
        !self.in_string
    }
}

/// Contents of every ```` ``` ```` fenced block, trimmed, empty blocks skipped.
pub fn extract_fenced_blocks(raw: &str) -> Vec<String> {
    FENCE_RE
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|block| !block.is_empty())
        .collect()
}

/// The first `{...}` span whose braces balance outside string literals.
pub fn extract_first_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut scanner = StringScanner::default();
    let mut depth = 0usize;
    for (offset, ch) in raw[start..].char_indices() {
        if !scanner.structural(ch) {
            continue;
        }
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop commas that directly precede `}` or `]` (whitespace allowed between).
pub fn remove_trailing_commas(raw: &str) -> (String, bool) {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut scanner = StringScanner::default();
    let mut changed = false;

    for (index, &ch) in chars.iter().enumerate() {
        if scanner.structural(ch) && ch == ',' {
            let next = chars[index + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                changed = true;
                continue;
            }
        }
        out.push(ch);
    }
    (out, changed)
}

/// Escape raw control characters that appear inside string literals.
pub fn escape_control_chars(raw: &str) -> (String, bool) {
    let mut out = String::with_capacity(raw.len());
    let mut scanner = StringScanner::default();
    let mut changed = false;

    for ch in raw.chars() {
        let inside = scanner.in_string && !scanner.escaped && ch != '\\' && ch != '"';
        scanner.structural(ch);
        if inside && (ch as u32) < 0x20 {
            changed = true;
            match ch {
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                other => out.push_str(&format!("\\u{:04x}", other as u32)),
            }
            continue;
        }
        out.push(ch);
    }
    (out, changed)
}

/// Close every `{` and `[` left open outside strings, innermost first.
///
/// A dangling comma before the appended closers is dropped, and a string cut
/// off mid-literal is terminated.
pub fn balance_brackets(raw: &str) -> (String, bool) {
    let mut scanner = StringScanner::default();
    let mut open = Vec::new();
    for ch in raw.chars() {
        if !scanner.structural(ch) {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }
    if open.is_empty() {
        return (raw.to_string(), false);
    }

    let mut out = raw.trim_end().to_string();
    if scanner.in_string {
        out.push('"');
    } else if out.ends_with(',') {
        out.pop();
    }
    out.extend(open.iter().rev());
    (out, true)
}

/// Locate `"key": [` and return the bracket-balanced array text.
///
/// Returns `None` when the key is absent or its array never closes.
pub fn extract_balanced_array<'a>(raw: &'a str, key: &str) -> Option<&'a str> {
    let token = format!("\"{}\"", key);
    let bytes = raw.as_bytes();
    let mut search_from = 0;

    while let Some(found) = raw[search_from..].find(&token) {
        let key_index = search_from + found;
        let mut cursor = key_index + token.len();
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if bytes.get(cursor) != Some(&b':') {
            search_from = key_index + 1;
            continue;
        }
        cursor += 1;
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if bytes.get(cursor) != Some(&b'[') {
            search_from = key_index + 1;
            continue;
        }

        let start = cursor;
        let mut scanner = StringScanner::default();
        let mut depth = 0usize;
        for (offset, ch) in raw[start..].char_indices() {
            if !scanner.structural(ch) {
                continue;
            }
            match ch {
                '[' => depth += 1,
                ']' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(&raw[start..start + offset + 1]);
                    }
                }
                _ => {}
            }
        }
        // Key matched but the array is incomplete; nothing further is safe.
        return None;
    }
    None
}

fn has_core_payload(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    object.get("logs").is_some_and(Value::is_array)
        || object.get("tavern_commands").is_some_and(Value::is_array)
        || object.get("narrative").is_some_and(Value::is_string)
        || object.get("allowed").is_some_and(Value::is_boolean)
        || object.get("messages").is_some_and(Value::is_array)
        || object.get("phone_updates").is_some_and(Value::is_object)
}

fn action_options(value: &Value) -> Option<&Vec<Value>> {
    let object = value.as_object()?;
    ACTION_OPTION_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_array))
}

fn is_action_options_only(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    !object.is_empty()
        && action_options(value).is_some()
        && object.keys().all(|k| ACTION_OPTION_KEYS.contains(&k.as_str()))
}

fn with_action_options(primary: &Value, options: &[Value]) -> Value {
    let mut merged = primary.as_object().cloned().unwrap_or_else(Map::new);
    merged.insert("action_options".to_string(), Value::Array(options.to_vec()));
    Value::Object(merged)
}

struct Candidate {
    text: String,
    note: Option<String>,
    strategy: Option<RepairStrategy>,
}

struct ParsedCandidate {
    value: Value,
    note: Option<String>,
    strategy: Option<RepairStrategy>,
}

fn join_notes(notes: impl IntoIterator<Item = String>) -> Option<String> {
    let notes: Vec<String> = notes.into_iter().filter(|n| !n.is_empty()).collect();
    if notes.is_empty() {
        None
    } else {
        Some(notes.join("，"))
    }
}

/// Recover a structured response document from raw model text.
///
/// Never panics and never returns both `response` and `error`.
pub fn parse_ai_response_text(raw: &str) -> ParsedResponse {
    let cleaned = raw.trim();
    let first_object = extract_first_object(cleaned);
    let fenced_blocks = extract_fenced_blocks(cleaned);

    let mut candidates = vec![Candidate {
        text: cleaned.to_string(),
        note: None,
        strategy: None,
    }];
    if let Some(object) = first_object.filter(|object| *object != cleaned) {
        candidates.push(Candidate {
            text: object.to_string(),
            note: Some(RepairStrategy::OutsideTextTruncated.marker().to_string()),
            strategy: Some(RepairStrategy::OutsideTextTruncated),
        });
    }
    for (index, block) in fenced_blocks.iter().enumerate() {
        let marker = RepairStrategy::FenceStripped.marker();
        let note = if index == 0 {
            marker.to_string()
        } else {
            format!("{}(块{})", marker, index + 1)
        };
        candidates.push(Candidate {
            text: block.clone(),
            note: Some(note),
            strategy: Some(RepairStrategy::FenceStripped),
        });
    }

    let mut last_error: Option<String> = None;
    let mut parsed = Vec::new();
    for candidate in candidates {
        match serde_json::from_str::<Value>(&candidate.text) {
            Ok(value) => parsed.push(ParsedCandidate {
                value,
                note: candidate.note,
                strategy: candidate.strategy,
            }),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    if !parsed.is_empty() {
        return choose_primary(parsed);
    }

    let base = first_object.unwrap_or(cleaned).trim();
    let mut strategies = Vec::new();

    let (text, changed) = remove_trailing_commas(base);
    if changed {
        strategies.push(RepairStrategy::TrailingCommasRemoved);
    }
    let (text, changed) = escape_control_chars(&text);
    if changed {
        strategies.push(RepairStrategy::ControlCharsEscaped);
    }
    let (text, changed) = balance_brackets(&text);
    if changed {
        strategies.push(RepairStrategy::BracketsBalanced);
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            let mut response = value;
            if response.get("action_options").and_then(Value::as_array).is_none() {
                let fenced_options = fenced_blocks
                    .iter()
                    .filter_map(|block| serde_json::from_str::<Value>(block).ok())
                    .find_map(|block| action_options(&block).cloned());
                if let Some(options) = fenced_options {
                    response = with_action_options(&response, &options);
                    strategies.push(RepairStrategy::ActionOptionsMerged);
                }
            }
            let note = join_notes(strategies.iter().map(|s| s.marker().to_string()))
                .unwrap_or_else(|| RepairStrategy::StructureRepaired.marker().to_string());
            if strategies.is_empty() {
                strategies.push(RepairStrategy::StructureRepaired);
            }
            tracing::debug!(note = %note, "Repaired AI response text");
            ParsedResponse {
                response: Some(response),
                repaired: true,
                repair_note: Some(note),
                error: None,
                strategies,
            }
        }
        Err(e) => {
            let error = last_error.unwrap_or_else(|| e.to_string());
            let error = if error.is_empty() {
                "JSON解析失败".to_string()
            } else {
                error
            };
            tracing::warn!(error = %error, raw_len = raw.len(), "Failed to parse AI response text");
            ParsedResponse::failed(error)
        }
    }
}

/// Pick the candidate carrying the real payload, merging a stray `action_options` block.
fn choose_primary(parsed: Vec<ParsedCandidate>) -> ParsedResponse {
    let primary_index = parsed
        .iter()
        .position(|c| has_core_payload(&c.value) && !is_action_options_only(&c.value))
        .or_else(|| parsed.iter().position(|c| has_core_payload(&c.value)))
        .unwrap_or(0);
    let primary = &parsed[primary_index];

    let primary_has_options = action_options(&primary.value).is_some_and(|o| !o.is_empty());
    if !primary_has_options {
        let extra_options = parsed
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != primary_index)
            .find_map(|(_, c)| action_options(&c.value).filter(|o| !o.is_empty()));
        if let Some(options) = extra_options {
            let mut strategies: Vec<RepairStrategy> = primary.strategy.into_iter().collect();
            strategies.push(RepairStrategy::ActionOptionsMerged);
            let note = join_notes(
                primary
                    .note
                    .clone()
                    .into_iter()
                    .chain([RepairStrategy::ActionOptionsMerged.marker().to_string()]),
            );
            return ParsedResponse {
                response: Some(with_action_options(&primary.value, options)),
                repaired: true,
                repair_note: note,
                error: None,
                strategies,
            };
        }
    }

    ParsedResponse {
        response: Some(primary.value.clone()),
        repaired: primary.note.is_some(),
        repair_note: primary.note.clone(),
        error: None,
        strategies: primary.strategy.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_json_is_not_repaired() {
        let parsed = parse_ai_response_text(r#"{"logs":[],"tavern_commands":[]}"#);
        assert!(!parsed.repaired);
        assert_eq!(parsed.repair_note, None);
        assert_eq!(parsed.tavern_commands().map(Vec::len), Some(0));
    }

    #[test]
    fn test_trailing_comma_in_command_array() {
        let parsed = parse_ai_response_text(r#"{"tavern_commands": [{"action":"a","value":{}},]}"#);
        assert!(parsed.repaired);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.tavern_commands().map(Vec::len), Some(1));
        assert!(parsed
            .repair_note
            .as_deref()
            .is_some_and(|n| n.contains("已移除尾随逗号")));
    }

    #[test]
    fn test_trailing_commas_and_missing_brace() {
        let raw = r#"{"logs":[{"sender":"narrator","text":"ok",}],"tavern_commands":[]"#;
        let parsed = parse_ai_response_text(raw);
        assert!(parsed.repaired);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.tavern_commands(), Some(&vec![]));
        let note = parsed.repair_note.unwrap_or_default();
        assert!(note.contains("已移除尾随逗号"));
        assert!(note.contains("已补齐缺失括号"));
        assert_eq!(
            parsed.strategies,
            vec![RepairStrategy::TrailingCommasRemoved, RepairStrategy::BracketsBalanced]
        );
    }

    #[test]
    fn test_control_chars_inside_strings() {
        let raw = "{\"logs\":[{\"sender\":\"旁白\",\"text\":\"第一行\n第二行\t含制表\"}],\"tavern_commands\":[]}";
        let parsed = parse_ai_response_text(raw);
        assert_eq!(parsed.error, None);
        let text = parsed.logs().and_then(|logs| logs[0]["text"].as_str()).unwrap_or_default();
        assert_eq!(text, "第一行\n第二行\t含制表");
        assert!(parsed
            .repair_note
            .as_deref()
            .is_some_and(|n| n.contains("已转义字符串内控制字符")));
    }

    #[test]
    fn test_fenced_multiline_payload() {
        let raw = [
            "```json",
            "{\"thinking_pre\":\"<thinking>计划开始</thinking>\",\"logs\":[{\"sender\":\"旁白\",\"text\":\"清晨的街道",
            "出现了新的脚步声\"}],\"tavern_commands\":[]}",
            "```",
        ]
        .join("\n");
        let parsed = parse_ai_response_text(&raw);
        assert_eq!(parsed.error, None);
        let response = parsed.response.expect("recovered");
        assert!(response["thinking_pre"].as_str().unwrap_or_default().contains("<thinking>"));
        assert!(response["logs"][0]["text"].as_str().unwrap_or_default().contains("清晨的街道"));
    }

    #[test]
    fn test_txt_fence() {
        let raw = "```txt\n{\"logs\":[{\"sender\":\"旁白\",\"text\":\"段落一。\"}],\"tavern_commands\":[]}\n```";
        let parsed = parse_ai_response_text(raw);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.logs().map(|l| l[0]["text"].clone()), Some(json!("段落一。")));
        assert_eq!(parsed.strategies, vec![RepairStrategy::OutsideTextTruncated]);
    }

    #[test]
    fn test_prose_around_object_is_truncated() {
        let parsed = parse_ai_response_text("Sure! {\"tavern_commands\":[]} Hope this helps.");
        assert_eq!(parsed.repair_note.as_deref(), Some("已截断JSON之外内容"));
        assert!(parsed.repaired);
    }

    #[test]
    fn test_action_options_block_is_merged() {
        let raw = "{\"logs\":[],\"tavern_commands\":[]}\n```json\n{\"action_options\":[\"走\",\"跑\"]}\n```";
        let parsed = parse_ai_response_text(raw);
        let response = parsed.response.expect("recovered");
        assert_eq!(response["action_options"], json!(["走", "跑"]));
        assert_eq!(response["logs"], json!([]));
        assert!(parsed
            .repair_note
            .as_deref()
            .is_some_and(|n| n.contains("已合并追加的action_options块")));
    }

    #[test]
    fn test_unrecoverable_text_reports_error() {
        let parsed = parse_ai_response_text("plain text without any json payload");
        assert!(parsed.response.is_none());
        assert!(!parsed.repaired);
        assert!(parsed.error.is_some());
    }

    #[test]
    fn test_reparse_is_deterministic() {
        let raw = "{\"tavern_commands\":[{\"action\":\"set\",\"key\":\"a\",\"value\":\"x\ny\"},]";
        assert_eq!(parse_ai_response_text(raw), parse_ai_response_text(raw));
    }

    #[test]
    fn test_never_panics_on_odd_input() {
        for raw in ["", "{", "}", "[", "\"", "{\"a\":\"\\", "```", "```json```", "{\"a\":[1,2,", "中文{"] {
            let parsed = parse_ai_response_text(raw);
            assert!(parsed.response.is_some() || parsed.error.is_some());
        }
    }

    #[test]
    fn test_truncated_command_array_is_closed() {
        let parsed = parse_ai_response_text(r#"{"tavern_commands":[{"action":"set","key":"a","value":1}"#);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.strategies, vec![RepairStrategy::BracketsBalanced]);
        let commands = parsed.tavern_commands().expect("commands recovered");
        assert_eq!(commands, &vec![json!({"action": "set", "key": "a", "value": 1})]);
    }

    #[test]
    fn test_brackets_close_in_reverse_order() {
        assert_eq!(balance_brackets(r#"{"a":[{"b":[1"#), (r#"{"a":[{"b":[1]}]}"#.to_string(), true));
        assert_eq!(balance_brackets(r#"{"a":[1,2, "#), (r#"{"a":[1,2]}"#.to_string(), true));
        assert_eq!(balance_brackets(r#"{"t":"[{"#), (r#"{"t":"[{"}"#.to_string(), true));
        assert_eq!(balance_brackets(r#"{"a":[]}"#), (r#"{"a":[]}"#.to_string(), false));
    }

    #[test]
    fn test_trailing_comma_inside_string_is_kept() {
        let (text, changed) = remove_trailing_commas(r#"{"t":"a, ]"}"#);
        assert!(!changed);
        assert_eq!(text, r#"{"t":"a, ]"}"#);
    }

    #[test]
    fn test_balanced_array_skips_brackets_in_strings() {
        let raw = r#"noise "tavern_commands" : [{"action":"a","value":"]["}] tail"#;
        assert_eq!(
            extract_balanced_array(raw, "tavern_commands"),
            Some(r#"[{"action":"a","value":"]["}]"#)
        );
        assert_eq!(extract_balanced_array(r#""tavern_commands": [1, 2"#, "tavern_commands"), None);
        assert_eq!(extract_balanced_array(r#""tavern_commands": 5"#, "tavern_commands"), None);
    }
}

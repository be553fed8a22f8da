//! Lenient field access over command payloads.
//!
//! AI payloads mix camelCase, snake_case and Chinese keys and send numbers as
//! strings. Every accessor takes a list of aliases; the first alias is the
//! canonical name used in error messages.

use serde_json::{Map, Value};

use taverndb_domain::{Command, DomainError};

#[derive(Clone, Copy)]
pub(crate) struct Payload<'a> {
    action: &'a str,
    map: &'a Map<String, Value>,
}

impl<'a> Payload<'a> {
    pub fn new(action: &'a str, map: &'a Map<String, Value>) -> Self {
        Self { action, map }
    }

    /// The command's fields as an object; anything else is a validation error.
    pub fn of(command: &'a Command) -> Result<Self, DomainError> {
        let action = command.action.as_str();
        match command.fields_payload() {
            Some(Value::Object(map)) => Ok(Self::new(action, map)),
            Some(Value::Null) | None => Err(DomainError::validation(format!(
                "{} missing payload",
                action
            ))),
            Some(_) => Err(DomainError::validation(format!(
                "{} payload must be an object",
                action
            ))),
        }
    }

    pub fn action(&self) -> &'a str {
        self.action
    }

    pub fn map(&self) -> &'a Map<String, Value> {
        self.map
    }

    pub fn value(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.map.get(*key))
            .find(|value| !value.is_null())
    }

    pub fn missing(&self, keys: &[&str]) -> DomainError {
        DomainError::validation(format!(
            "{} missing field {}",
            self.action,
            keys.first().copied().unwrap_or("value")
        ))
    }

    fn wrong_type(&self, keys: &[&str], expected: &str) -> DomainError {
        DomainError::validation(format!(
            "{} field {} must be {}",
            self.action,
            keys.first().copied().unwrap_or("value"),
            expected
        ))
    }

    /// Trimmed non-empty text; numbers are stringified.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        self.value(keys).and_then(as_text)
    }

    pub fn require_text(&self, keys: &[&str]) -> Result<String, DomainError> {
        self.text(keys).ok_or_else(|| self.missing(keys))
    }

    /// Integer field; absent is `None`, present but non-numeric is an error.
    pub fn int(&self, keys: &[&str]) -> Result<Option<i64>, DomainError> {
        match self.value(keys) {
            None => Ok(None),
            Some(value) => as_int(value)
                .map(Some)
                .ok_or_else(|| self.wrong_type(keys, "a number")),
        }
    }

    pub fn require_int(&self, keys: &[&str]) -> Result<i64, DomainError> {
        self.int(keys)?.ok_or_else(|| self.missing(keys))
    }

    pub fn int_or(&self, keys: &[&str], default: i64) -> Result<i64, DomainError> {
        Ok(self.int(keys)?.unwrap_or(default))
    }

    pub fn flag(&self, keys: &[&str]) -> bool {
        self.value(keys).and_then(as_flag).unwrap_or(false)
    }

    pub fn flag_or(&self, keys: &[&str], default: bool) -> bool {
        self.value(keys).and_then(as_flag).unwrap_or(default)
    }

    pub fn array(&self, keys: &[&str]) -> Result<Option<&'a Vec<Value>>, DomainError> {
        match self.value(keys) {
            None => Ok(None),
            Some(Value::Array(items)) => Ok(Some(items)),
            Some(_) => Err(self.wrong_type(keys, "an array")),
        }
    }

    /// String list; a single string counts as a one-element list.
    pub fn text_list(&self, keys: &[&str]) -> Vec<String> {
        match self.value(keys) {
            Some(Value::Array(items)) => items.iter().filter_map(as_text).collect(),
            Some(value) => as_text(value).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integers, floats (floored) and numeric strings.
pub(crate) fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.floor() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.parse::<i64>().ok().or_else(|| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.floor() as i64)
            })
        }
        _ => None,
    }
}

pub(crate) fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "是" => Some(true),
            "false" | "no" | "0" | "否" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Saturating conversion for dice and hit point arithmetic.
pub(crate) fn clamp_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_aliases_and_lenient_numbers() {
        let fields = map(json!({"hit_dc": "15", "攻击加值": 4.7, "flag": "yes"}));
        let payload = Payload::new("resolve_attack_check", &fields);
        assert_eq!(payload.int(&["hitDc", "hit_dc"]), Ok(Some(15)));
        assert_eq!(payload.int(&["attackBonus", "攻击加值"]), Ok(Some(4)));
        assert!(payload.flag(&["flag"]));
        assert_eq!(payload.int(&["missing"]), Ok(None));
    }

    #[test]
    fn test_errors_name_action_and_field() {
        let fields = map(json!({"dc": "high"}));
        let payload = Payload::new("resolve_saving_throw", &fields);
        let err = payload.int(&["dc"]).expect_err("non numeric");
        assert!(err.to_string().contains("resolve_saving_throw field dc"));
        let err = payload.require_text(&["sheetId", "sheet_id"]).expect_err("missing");
        assert!(err.to_string().contains("missing field sheetId"));
    }

    #[test]
    fn test_text_list_accepts_single_string() {
        let fields = map(json!({"ids": "D1", "kinds": ["d6", " ", 20]}));
        let payload = Payload::new("x", &fields);
        assert_eq!(payload.text_list(&["ids"]), vec!["D1"]);
        assert_eq!(payload.text_list(&["kinds"]), vec!["d6", "20"]);
    }
}

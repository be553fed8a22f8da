//! System log entries shown to the player.

use serde::{Deserialize, Serialize};

/// Sender name used for engine-generated messages.
pub const SYSTEM_SENDER: &str = "系统";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    System,
    Narrative,
    Dialogue,
}

/// A log line consumed by the rendering layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemLogEntry {
    pub id: String,
    pub sender: String,
    pub text: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: LogKind,
}

impl SystemLogEntry {
    pub fn system(id: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            sender: SYSTEM_SENDER.to_string(),
            text: text.into(),
            timestamp,
            kind: LogKind::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_uses_type_key() {
        let entry = SystemLogEntry::system("tx-1:rollback", "回合事务回滚", 42);
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["type"], "system");
        assert_eq!(value["sender"], "系统");
        assert_eq!(value["timestamp"], 42);
    }
}

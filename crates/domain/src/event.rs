//! Structured transaction outcome events.
//!
//! The event is the source of truth; the player-facing log text is rendered
//! from it and keeps the stable phrases the UI matches on
//! ("回合事务回滚" for any rollback, "并发冲突" for version or lock conflicts).

use serde::{Deserialize, Serialize};

use crate::log::SystemLogEntry;
use crate::table_meta::ReasonCode;

/// Conflict lines shown in a rollback message.
const MAX_CONFLICT_LINES: usize = 3;

/// A single rejected patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchConflict {
    pub sheet_id: String,
    pub row_id: String,
    pub reason: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PatchConflict {
    pub fn new(sheet_id: impl Into<String>, row_id: impl Into<String>, reason: ReasonCode) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            reason,
            expected: None,
            actual: None,
            field: None,
            owner: None,
            source: None,
        }
    }

    pub fn version(mut self, expected: u64, actual: u64) -> Self {
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// One-line description, e.g. `LOG_Summary/AM0001 sheet_version_conflict expected=4 actual=5`.
    pub fn line(&self) -> String {
        let head = format!("{}/{}", self.sheet_id, self.row_id);
        match self.reason {
            ReasonCode::SheetVersionConflict | ReasonCode::RowVersionConflict => format!(
                "{} {} expected={} actual={}",
                head,
                self.reason,
                display_opt(self.expected),
                display_opt(self.actual)
            ),
            ReasonCode::CellLocked => format!(
                "{} cell_locked field={}",
                head,
                self.field.as_deref().unwrap_or("-")
            ),
            ReasonCode::RowLocked => format!(
                "{} row_locked owner={}",
                head,
                self.owner.as_deref().unwrap_or("unknown")
            ),
            ReasonCode::SourceNotAllowed => format!(
                "{} source_not_allowed source={}",
                head,
                self.source.as_deref().filter(|s| !s.is_empty()).unwrap_or("unspecified")
            ),
            ReasonCode::ApplyError => format!("{} apply_error", head),
        }
    }
}

fn display_opt(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Outcome of one turn transaction attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxEvent {
    Committed {
        tx_id: String,
        command_count: usize,
        applied_patches: usize,
    },
    RolledBack {
        tx_id: String,
        reason: ReasonCode,
        command_count: usize,
        patch_count: usize,
        conflicts: Vec<PatchConflict>,
    },
}

impl TxEvent {
    pub fn tx_id(&self) -> &str {
        match self {
            TxEvent::Committed { tx_id, .. } | TxEvent::RolledBack { tx_id, .. } => tx_id,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, TxEvent::RolledBack { .. })
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            TxEvent::RolledBack { reason, .. } => Some(*reason),
            TxEvent::Committed { .. } => None,
        }
    }

    /// Player-facing text for this event.
    pub fn render(&self) -> String {
        match self {
            TxEvent::Committed {
                command_count,
                applied_patches,
                ..
            } => format!(
                "回合事务提交成功：命令 {} 条，sheet patch {} 条。",
                command_count, applied_patches
            ),
            TxEvent::RolledBack {
                reason,
                command_count,
                patch_count,
                conflicts,
                ..
            } => {
                let detail = conflicts
                    .iter()
                    .take(MAX_CONFLICT_LINES)
                    .map(PatchConflict::line)
                    .collect::<Vec<_>>()
                    .join(" | ");
                match reason {
                    ReasonCode::ApplyError => format!(
                        "回合事务回滚：命令 {} 条，sheet patch {} 条，已撤销本批次状态变更。",
                        command_count, patch_count
                    ),
                    ReasonCode::SourceNotAllowed => format!(
                        "回合事务回滚：校验失败 source_not_allowed {} 条，已撤销本批次状态变更。{}",
                        conflicts.len(),
                        detail
                    ),
                    _ => format!(
                        "回合事务回滚：检测到并发冲突 {} 条，已撤销本批次状态变更。{}",
                        conflicts.len(),
                        detail
                    ),
                }
            }
        }
    }

    /// Render as a system log entry with id `<txId>:commit` or `<txId>:rollback`.
    pub fn to_log(&self, timestamp: i64) -> SystemLogEntry {
        let suffix = if self.is_rollback() { "rollback" } else { "commit" };
        SystemLogEntry::system(format!("{}:{}", self.tx_id(), suffix), self.render(), timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rolled_back(reason: ReasonCode, conflicts: Vec<PatchConflict>) -> TxEvent {
        TxEvent::RolledBack {
            tx_id: "tx-1-abc".into(),
            reason,
            command_count: 2,
            patch_count: 1,
            conflicts,
        }
    }

    #[test]
    fn test_apply_error_rollback_text() {
        let text = rolled_back(ReasonCode::ApplyError, vec![]).render();
        assert!(text.contains("回合事务回滚"));
        assert!(!text.contains("并发冲突"));
    }

    #[test]
    fn test_version_conflict_rollback_text() {
        let conflict = PatchConflict::new("X", "r1", ReasonCode::SheetVersionConflict).version(4, 5);
        let event = rolled_back(ReasonCode::SheetVersionConflict, vec![conflict]);
        let text = event.render();
        assert!(text.contains("回合事务回滚"));
        assert!(text.contains("并发冲突"));
        assert!(text.contains("X/r1 sheet_version_conflict expected=4 actual=5"));
        assert_eq!(event.to_log(7).id, "tx-1-abc:rollback");
    }

    #[test]
    fn test_source_conflict_line_defaults_unspecified() {
        let conflict = PatchConflict::new("LOG_Summary", "AM1", ReasonCode::SourceNotAllowed);
        assert_eq!(conflict.line(), "LOG_Summary/AM1 source_not_allowed source=unspecified");
    }

    #[test]
    fn test_at_most_three_conflict_lines() {
        let conflicts = (0..5)
            .map(|i| PatchConflict::new("S", format!("r{}", i), ReasonCode::RowLocked))
            .collect();
        let text = rolled_back(ReasonCode::RowLocked, conflicts).render();
        assert_eq!(text.matches("row_locked").count(), 3);
        assert!(text.contains("并发冲突 5 条"));
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let value = serde_json::to_value(rolled_back(ReasonCode::ApplyError, vec![])).expect("serialize");
        assert_eq!(value["kind"], "rolled_back");
        assert_eq!(value["reason"], "apply_error");
    }
}

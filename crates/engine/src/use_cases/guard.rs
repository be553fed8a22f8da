//! Per-service command admission.
//!
//! Filters a service's command batch before dispatch. The memory service owns
//! the log sheets, the state services may not touch them, and the map service
//! is limited to map actions. Rejected commands are dropped with a reason;
//! the guard never touches state.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use taverndb_domain::sheet::is_log_sheet;
use taverndb_domain::{Action, TavernCommand};
use taverndb_shared::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardRejectReason {
    /// Log sheets and log actions belong to the memory service
    MemoryOwned,
    /// Sheet outside the configured allowlist
    SheetNotAllowed,
    NotSupportedAction,
}

impl GuardRejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardRejectReason::MemoryOwned => "memory_owned",
            GuardRejectReason::SheetNotAllowed => "sheet_not_allowed",
            GuardRejectReason::NotSupportedAction => "not_supported_action",
        }
    }
}

impl fmt::Display for GuardRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardReject {
    pub reason: GuardRejectReason,
    pub action: String,
    pub sheet_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardResult {
    pub commands: Vec<TavernCommand>,
    pub rejected: Vec<GuardReject>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandGuard {
    /// When set, state services may only write these sheets
    state_sheet_allowlist: Option<BTreeSet<String>>,
}

impl CommandGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state_sheet_allowlist<I, S>(mut self, sheets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state_sheet_allowlist = Some(sheets.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(&self, service: ServiceKind, commands: Vec<TavernCommand>) -> GuardResult {
        let mut result = GuardResult::default();
        for command in commands {
            match self.check(service, &command) {
                Ok(()) => result.commands.push(command),
                Err(reject) => {
                    tracing::warn!(
                        service = %service,
                        action = %reject.action,
                        sheet_id = reject.sheet_id.as_deref().unwrap_or("-"),
                        reason = %reject.reason,
                        "Command rejected by guard"
                    );
                    result.rejected.push(reject);
                }
            }
        }
        result
    }

    fn check(&self, service: ServiceKind, command: &TavernCommand) -> Result<(), GuardReject> {
        let action = Action::parse(&command.action);
        let action_name = action.as_str().to_string();
        let sheets = sheet_ids(command);
        let reject = |reason, sheet_id: Option<&String>| GuardReject {
            reason,
            action: action_name.clone(),
            sheet_id: sheet_id.cloned(),
        };

        match service {
            ServiceKind::Memory => match action {
                Action::AppendLogSummary | Action::AppendLogOutline => Ok(()),
                Action::UpsertSheetRows | Action::DeleteSheetRows => {
                    match sheets.iter().find(|sheet| !is_log_sheet(sheet)) {
                        Some(foreign) => Err(reject(GuardRejectReason::MemoryOwned, Some(foreign))),
                        None if sheets.is_empty() => {
                            Err(reject(GuardRejectReason::NotSupportedAction, None))
                        }
                        None => Ok(()),
                    }
                }
                _ => Err(reject(GuardRejectReason::NotSupportedAction, sheets.first())),
            },
            ServiceKind::Map => match action {
                Action::SetMapVisuals | Action::UpsertBattleMapRows => Ok(()),
                _ => Err(reject(GuardRejectReason::NotSupportedAction, None)),
            },
            ServiceKind::Story | ServiceKind::State | ServiceKind::StateWriter => match action {
                Action::AppendLogSummary | Action::AppendLogOutline => {
                    Err(reject(GuardRejectReason::MemoryOwned, None))
                }
                Action::UpsertSheetRows | Action::DeleteSheetRows => {
                    if let Some(log_sheet) = sheets.iter().find(|sheet| is_log_sheet(sheet)) {
                        return Err(reject(GuardRejectReason::MemoryOwned, Some(log_sheet)));
                    }
                    if let Some(allowlist) = &self.state_sheet_allowlist {
                        if let Some(outside) = sheets.iter().find(|sheet| !allowlist.contains(*sheet)) {
                            return Err(reject(GuardRejectReason::SheetNotAllowed, Some(outside)));
                        }
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }
}

/// Target sheets of a sheet command: one payload object or an array of them.
fn sheet_ids(command: &TavernCommand) -> Vec<String> {
    let payloads: Vec<&Value> = match &command.value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value) => vec![value],
        None => Vec::new(),
    };
    payloads
        .into_iter()
        .filter_map(|payload| {
            ["sheetId", "sheet_id", "sheet"]
                .iter()
                .find_map(|key| payload.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|sheet| !sheet.is_empty())
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(sheet: &str) -> TavernCommand {
        TavernCommand::new("upsert_sheet_rows").with_value(json!({"sheetId": sheet, "rows": [{"id": "r1"}]}))
    }

    #[test]
    fn test_memory_service_keeps_log_writes_only() {
        let guard = CommandGuard::new();
        let result = guard.filter(
            ServiceKind::Memory,
            vec![
                TavernCommand::new("append_log_summary").with_value(json!("s")),
                upsert("LOG_Outline"),
                upsert("NPC_Registry"),
                TavernCommand::new("set").with_key("character.currency").with_value(json!(1)),
            ],
        );
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.rejected.len(), 2);
        assert_eq!(result.rejected[0].reason, GuardRejectReason::MemoryOwned);
        assert_eq!(result.rejected[0].sheet_id.as_deref(), Some("NPC_Registry"));
        assert_eq!(result.rejected[1].reason, GuardRejectReason::NotSupportedAction);
        assert_eq!(result.rejected[1].action, "set");
    }

    #[test]
    fn test_state_service_may_not_touch_log_sheets() {
        let guard = CommandGuard::new();
        let mixed = TavernCommand::new("upsert_sheet_rows").with_value(json!([
            {"sheetId": "NPC_Registry", "rows": [{"NPC_ID": "N1"}]},
            {"sheetId": "LOG_Summary", "rows": [{"编码索引": "AM0001"}]}
        ]));
        let result = guard.filter(
            ServiceKind::State,
            vec![
                mixed,
                TavernCommand::new("append_log_outline").with_value(json!("o")),
                upsert("NPC_Registry"),
                TavernCommand::new("apply_econ_delta").with_value(json!({"account": "character.currency", "delta": 1})),
            ],
        );
        let reasons: Vec<_> = result.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons, vec!["memory_owned", "memory_owned"]);
        assert_eq!(result.commands.len(), 2);
    }

    #[test]
    fn test_state_allowlist() {
        let guard = CommandGuard::new().with_state_sheet_allowlist(["CHARACTER_Resources"]);
        let result = guard.filter(
            ServiceKind::StateWriter,
            vec![upsert("CHARACTER_Resources"), upsert("NPC_Registry")],
        );
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.rejected[0].reason, GuardRejectReason::SheetNotAllowed);
    }

    #[test]
    fn test_map_service_limited_to_map_actions() {
        let guard = CommandGuard::new();
        let result = guard.filter(
            ServiceKind::Map,
            vec![
                TavernCommand::new("set_map_visuals").with_value(json!({"SceneName": "Dungeon"})),
                TavernCommand::new("resolve_attack_check").with_value(json!({"hitDc": 12})),
            ],
        );
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.rejected[0].reason.to_string(), "not_supported_action");
    }
}

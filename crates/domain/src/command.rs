//! Tavern commands: the wire shape emitted by AI services and the normalized
//! form handlers consume.
//!
//! Two payload dialects coexist on the wire: a structured `value` object, and a
//! flat `key` + `value` path assignment. `Command::from_wire` folds both into
//! one `CommandPayload` so handlers never branch on the dialect.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single instruction as emitted by an AI service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TavernCommand {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Legacy markers (`txId`, `turn`, `回合`, `atomic`, `transaction`) and anything else
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TavernCommand {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    /// Lenient conversion from an arbitrary JSON element; non-objects yield `None`.
    ///
    /// The action may arrive as `action`, `type`, `command` or `mode`; scalar
    /// keys and markers are stringified rather than rejected.
    pub fn from_json(element: &Value) -> Option<Self> {
        let object = element.as_object()?;
        let mut extra = object.clone();
        let mut take_string = |name: &str| -> Option<String> {
            extra.remove(name).and_then(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
        };

        let action = take_string("action")
            .or_else(|| take_string("type"))
            .or_else(|| take_string("command"))
            .or_else(|| take_string("mode"))
            .unwrap_or_default();
        let key = take_string("key");
        let source = take_string("source");
        let transaction_id = take_string("transactionId");
        let value = extra.remove("value");
        let turn_id = extra.remove("turnId").filter(|v| !v.is_null());

        Some(Self {
            action,
            value,
            key,
            source,
            turn_id,
            transaction_id,
            extra,
        })
    }

    /// Trimmed, lowercased action name.
    pub fn normalized_action(&self) -> String {
        self.action.trim().to_lowercase()
    }

    /// Shared transaction marker: `transactionId`, `txId`, `turnId`, `turn` or `回合`.
    pub fn transaction_marker(&self) -> Option<String> {
        let from_value = |v: &Value| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        self.transaction_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.extra.get("txId").and_then(from_value))
            .or_else(|| self.turn_id.as_ref().and_then(from_value))
            .or_else(|| self.extra.get("turn").and_then(from_value))
            .or_else(|| self.extra.get("回合").and_then(from_value))
    }

    /// Explicit `atomic: true` or `transaction: true` on the command.
    pub fn requests_atomic(&self) -> bool {
        ["atomic", "transaction"]
            .iter()
            .any(|flag| self.extra.get(*flag) == Some(&Value::Bool(true)))
    }

    /// Trimmed source, or `None` when the command is unstamped.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Writer label for journals: the source, else the action name.
    pub fn source_label(&self) -> String {
        match self.source() {
            Some(source) => source.to_string(),
            None => {
                let action = self.normalized_action();
                if action.is_empty() {
                    "unknown".to_string()
                } else {
                    action
                }
            }
        }
    }
}

/// Every action the dispatcher knows, plus a fallback for anything else
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    // Path dialect
    Set,
    Add,
    Push,
    Delete,
    // Combat
    SetEncounterRows,
    UpsertBattleMapRows,
    SetMapVisuals,
    SetInitiative,
    ConsumeDiceRows,
    RefillDicePool,
    RollDiceCheck,
    SetActionEconomy,
    SpendActionResource,
    ResolveAttackCheck,
    ResolveSavingThrow,
    ResolveDamageRoll,
    AppendCombatResolution,
    // Social and logs
    AppendLogSummary,
    AppendLogOutline,
    SetActionOptions,
    UpsertNpc,
    UpsertInventory,
    // Economy
    ApplyEconDelta,
    AppendEconLedger,
    // Sheets
    UpsertSheetRows,
    DeleteSheetRows,
    /// Unrecognized action name, kept verbatim
    Unknown(String),
}

/// Actions whose partial application would corrupt combat or map state.
pub const DEFAULT_TRANSACTIONAL_ACTIONS: [Action; 13] = [
    Action::SetEncounterRows,
    Action::UpsertBattleMapRows,
    Action::SetMapVisuals,
    Action::SetInitiative,
    Action::ConsumeDiceRows,
    Action::RefillDicePool,
    Action::RollDiceCheck,
    Action::SetActionEconomy,
    Action::SpendActionResource,
    Action::ResolveAttackCheck,
    Action::ResolveSavingThrow,
    Action::ResolveDamageRoll,
    Action::AppendCombatResolution,
];

impl Action {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "set" => Action::Set,
            "add" => Action::Add,
            "push" => Action::Push,
            "delete" => Action::Delete,
            "set_encounter_rows" => Action::SetEncounterRows,
            "upsert_battle_map_rows" => Action::UpsertBattleMapRows,
            "set_map_visuals" => Action::SetMapVisuals,
            "set_initiative" => Action::SetInitiative,
            "consume_dice_rows" => Action::ConsumeDiceRows,
            "refill_dice_pool" => Action::RefillDicePool,
            "roll_dice_check" => Action::RollDiceCheck,
            "set_action_economy" => Action::SetActionEconomy,
            "spend_action_resource" => Action::SpendActionResource,
            "resolve_attack_check" => Action::ResolveAttackCheck,
            "resolve_saving_throw" => Action::ResolveSavingThrow,
            "resolve_damage_roll" => Action::ResolveDamageRoll,
            "append_combat_resolution" => Action::AppendCombatResolution,
            "append_log_summary" => Action::AppendLogSummary,
            "append_log_outline" => Action::AppendLogOutline,
            "set_action_options" => Action::SetActionOptions,
            "upsert_npc" => Action::UpsertNpc,
            "upsert_inventory" => Action::UpsertInventory,
            "apply_econ_delta" => Action::ApplyEconDelta,
            "append_econ_ledger" => Action::AppendEconLedger,
            "upsert_sheet_rows" => Action::UpsertSheetRows,
            "delete_sheet_rows" => Action::DeleteSheetRows,
            other => Action::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Set => "set",
            Action::Add => "add",
            Action::Push => "push",
            Action::Delete => "delete",
            Action::SetEncounterRows => "set_encounter_rows",
            Action::UpsertBattleMapRows => "upsert_battle_map_rows",
            Action::SetMapVisuals => "set_map_visuals",
            Action::SetInitiative => "set_initiative",
            Action::ConsumeDiceRows => "consume_dice_rows",
            Action::RefillDicePool => "refill_dice_pool",
            Action::RollDiceCheck => "roll_dice_check",
            Action::SetActionEconomy => "set_action_economy",
            Action::SpendActionResource => "spend_action_resource",
            Action::ResolveAttackCheck => "resolve_attack_check",
            Action::ResolveSavingThrow => "resolve_saving_throw",
            Action::ResolveDamageRoll => "resolve_damage_roll",
            Action::AppendCombatResolution => "append_combat_resolution",
            Action::AppendLogSummary => "append_log_summary",
            Action::AppendLogOutline => "append_log_outline",
            Action::SetActionOptions => "set_action_options",
            Action::UpsertNpc => "upsert_npc",
            Action::UpsertInventory => "upsert_inventory",
            Action::ApplyEconDelta => "apply_econ_delta",
            Action::AppendEconLedger => "append_econ_ledger",
            Action::UpsertSheetRows => "upsert_sheet_rows",
            Action::DeleteSheetRows => "delete_sheet_rows",
            Action::Unknown(name) => name,
        }
    }

    pub fn is_path_action(&self) -> bool {
        matches!(self, Action::Set | Action::Add | Action::Push | Action::Delete)
    }

    pub fn is_transactional(&self) -> bool {
        DEFAULT_TRANSACTIONAL_ACTIONS.contains(self)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dotted-path assignment (`character.currency` = 100)
#[derive(Debug, Clone, PartialEq)]
pub struct PathAssignment {
    /// Dotted path with any `gameState.` prefix removed; may be empty when missing
    pub path: String,
    pub value: Option<Value>,
}

/// Canonical payload after dialect normalization
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Structured fields for a handler action (always an object or array, or `Null` when absent)
    Fields(Value),
    /// Path-style assignment for `set`/`add`/`push`/`delete`
    Path(PathAssignment),
}

/// A command after normalization, in batch order
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Position in the submitted batch
    pub index: usize,
    pub action: Action,
    pub payload: CommandPayload,
    /// Trimmed writer identity; empty for legacy unstamped commands
    pub source: String,
}

impl Command {
    pub fn from_wire(index: usize, wire: &TavernCommand) -> Self {
        let action = Action::parse(&wire.action);
        let payload = if action.is_path_action() {
            CommandPayload::Path(Self::path_assignment(wire))
        } else {
            CommandPayload::Fields(Self::fields(wire))
        };
        Self {
            index,
            action,
            payload,
            source: wire.source().unwrap_or_default().to_string(),
        }
    }

    /// `key` + `value`, or a value object carrying `key`/`path` and `value`.
    fn path_assignment(wire: &TavernCommand) -> PathAssignment {
        let (raw_path, value) = match (&wire.key, &wire.value) {
            (Some(key), value) => (key.clone(), value.clone()),
            (None, Some(Value::Object(object))) => {
                let path = object
                    .get("key")
                    .or_else(|| object.get("path"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (path, object.get("value").cloned())
            }
            (None, value) => (String::new(), value.clone()),
        };
        let trimmed = raw_path.trim();
        let path = trimmed
            .strip_prefix("gameState.")
            .unwrap_or(trimmed)
            .to_string();
        PathAssignment { path, value }
    }

    /// The value object; a flat `key` folds into it as a field.
    fn fields(wire: &TavernCommand) -> Value {
        match (&wire.key, &wire.value) {
            (None, Some(value)) => value.clone(),
            (None, None) => Value::Null,
            (Some(key), Some(Value::Object(object))) => {
                let mut merged = object.clone();
                merged
                    .entry("key".to_string())
                    .or_insert_with(|| Value::String(key.clone()));
                Value::Object(merged)
            }
            (Some(key), value) => {
                let mut merged = Map::new();
                merged.insert(key.clone(), value.clone().unwrap_or(Value::Null));
                Value::Object(merged)
            }
        }
    }

    pub fn fields_payload(&self) -> Option<&Value> {
        match &self.payload {
            CommandPayload::Fields(value) => Some(value),
            CommandPayload::Path(_) => None,
        }
    }
}

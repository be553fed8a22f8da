//! The game-state document mutated turn by turn.
//!
//! Known sections are typed; anything else the narrator invents lands in the
//! flattened `extra` maps so path-style commands can still address it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;
use crate::ledger::LedgerEntry;
use crate::sheet::SheetRow;
use crate::table_meta::TableMeta;
use crate::value_objects::DiceKind;

/// Root mutable document of one game session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameState {
    pub turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    pub character: CharacterState,
    pub familia: FamiliaState,
    pub inventory: Vec<InventoryItem>,
    pub npcs: Vec<NpcRecord>,
    /// Rows of `LOG_Summary`, keyed by `编码索引`
    pub log_summaries: Vec<SheetRow>,
    /// Rows of `LOG_Outline`, keyed by `编码索引`
    pub log_outlines: Vec<SheetRow>,
    pub action_options: Vec<String>,
    pub dice_pool: Vec<DiceRow>,
    pub combat: CombatState,
    /// Shadow rows for every other sheet, by sheet id
    pub sheets: BTreeMap<String, Vec<SheetRow>>,
    pub economic_ledger: Vec<LedgerEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GameState {
    /// Serialize into a JSON document for path-style edits.
    pub fn to_document(&self) -> Result<Value, DomainError> {
        serde_json::to_value(self).map_err(|e| DomainError::parse(e.to_string()))
    }

    /// Rebuild from a JSON document; type mismatches on typed sections fail.
    pub fn from_document(document: Value) -> Result<Self, DomainError> {
        serde_json::from_value(document).map_err(|e| DomainError::validation(e.to_string()))
    }

    /// Timestamp label for generated records: game time when known, else `fallback`.
    pub fn time_label(&self, fallback: &str) -> String {
        self.game_time
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterState {
    pub name: String,
    /// Personal currency balance
    pub currency: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hp: Option<HitPoints>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FamiliaState {
    pub name: String,
    /// Faction treasury
    pub funds: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub quantity: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NpcRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub present: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A pre-rolled die waiting in the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRow {
    pub id: String,
    pub kind: DiceKind,
    pub value: i32,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub rolled_at: String,
    #[serde(default)]
    pub used: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitPoints {
    pub current: i32,
    pub max: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CombatState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_economy: Option<ActionEconomy>,
    /// Newest last; capped by the resolution handlers
    pub resolutions: Vec<CombatResolutionEvent>,
    pub units: Vec<CombatUnit>,
    pub initiative: Vec<InitiativeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_visuals: Option<Value>,
}

impl CombatState {
    pub fn unit_mut(&mut self, unit_id: &str) -> Option<&mut CombatUnit> {
        self.units.iter_mut().find(|unit| unit.unit_id == unit_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CombatUnit {
    pub unit_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hp: Option<HitPoints>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeEntry {
    pub unit_id: String,
    #[serde(default)]
    pub name: String,
    pub initiative: i32,
}

/// Per-round action budget
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEconomy {
    pub round: u32,
    #[serde(default)]
    pub current_actor: String,
    #[serde(default)]
    pub resources: Vec<UnitResources>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnitResources {
    pub unit_id: String,
    pub action: i32,
    pub bonus_action: i32,
    pub reaction: i32,
    pub movement: i32,
}

impl UnitResources {
    /// Resolve a resource by wire name (English or the narrator's Chinese label).
    pub fn resource_mut(&mut self, resource: &str) -> Option<&mut i32> {
        match resource.trim() {
            "action" | "动作" => Some(&mut self.action),
            "bonusAction" | "bonus_action" | "附赠动作" => Some(&mut self.bonus_action),
            "reaction" | "反应" => Some(&mut self.reaction),
            "movement" | "移动" => Some(&mut self.movement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Roll,
    Contest,
    Damage,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStep {
    pub label: String,
    pub value: i32,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ResolutionStep {
    pub fn new(label: impl Into<String>, value: i32, kind: StepKind) -> Self {
        Self {
            label: label.into(),
            value,
            kind,
            note: None,
        }
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A structured record of one combat resolution step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatResolutionEvent {
    pub id: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub turn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<i32>,
    pub result: String,
    #[serde(default)]
    pub steps: Vec<ResolutionStep>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Game state plus the engine-owned table metadata, persisted together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: GameState,
    #[serde(rename = "__tableMeta", default)]
    pub table_meta: TableMeta,
}

impl SessionSnapshot {
    pub fn new(state: GameState) -> Self {
        Self {
            state,
            table_meta: TableMeta::default(),
        }
    }
}

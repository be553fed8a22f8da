//! Named sheets and the row-level patches proposed against them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A sheet row is an open JSON object; its key field depends on the sheet.
pub type SheetRow = Map<String, Value>;

pub const SYS_GLOBAL_STATE: &str = "SYS_GlobalState";
pub const LOG_SUMMARY: &str = "LOG_Summary";
pub const LOG_OUTLINE: &str = "LOG_Outline";
pub const CHARACTER_RESOURCES: &str = "CHARACTER_Resources";
pub const NPC_REGISTRY: &str = "NPC_Registry";
pub const ITEM_INVENTORY: &str = "ITEM_Inventory";
pub const ECON_LEDGER: &str = "ECON_Ledger";
pub const DICE_POOL: &str = "DICE_Pool";

/// The only row id the global-state sheet may hold.
pub const GLOBAL_STATE_ROW_ID: &str = "GLOBAL_STATE";

/// Log sheets owned by the memory service.
pub const LOG_SHEETS: [&str; 2] = [LOG_SUMMARY, LOG_OUTLINE];

pub fn is_log_sheet(sheet_id: &str) -> bool {
    LOG_SHEETS.contains(&sheet_id)
}

/// Key field used to match rows when a payload does not name one.
pub fn default_key_field(sheet_id: &str) -> &'static str {
    match sheet_id {
        SYS_GLOBAL_STATE => "_global_id",
        "SYS_CommandAudit" => "command_id",
        "SYS_TransactionAudit" => "tx_id",
        "SYS_ValidationIssue" => "issue_id",
        NPC_REGISTRY => "NPC_ID",
        ITEM_INVENTORY => "物品ID",
        "QUEST_Active" => "任务ID",
        "FACTION_Standing" => "势力ID",
        ECON_LEDGER => "ledger_id",
        "COMBAT_Encounter" | "COMBAT_BattleMap" => "单位名称",
        LOG_SUMMARY | LOG_OUTLINE => "编码索引",
        DICE_POOL => "ID",
        "SKILL_Library" => "SKILL_ID",
        "CHARACTER_Skills" | "CHARACTER_Feats" => "LINK_ID",
        "FEAT_Library" => "FEAT_ID",
        "CHARACTER_Registry" | "CHARACTER_Attributes" | CHARACTER_RESOURCES => "CHAR_ID",
        "STORY_Mainline" => "mainline_id",
        "STORY_Triggers" => "trigger_id",
        "CONTRACT_Registry" => "contract_id",
        "EXPLORATION_Map_Data" => "LocationName",
        "COMBAT_Map_Visuals" => "SceneName",
        _ => "id",
    }
}

/// Key under which a row's version is tracked: `Sheet::Row`.
pub fn row_version_key(sheet_id: &str, row_id: &str) -> String {
    format!("{}::{}", sheet_id, row_id)
}

/// Read a row id from a row; strings are trimmed, finite numbers are stringified.
pub fn read_row_id(row: &SheetRow, key_field: &str) -> Option<String> {
    match row.get(key_field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOperation {
    Upsert,
    Delete,
}

impl PatchOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchOperation::Upsert => "upsert",
            PatchOperation::Delete => "delete",
        }
    }
}

/// A row-level change a handler proposes against a named sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetPatch {
    pub sheet_id: String,
    pub operation: PatchOperation,
    pub row_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<SheetRow>,
    /// Writer identity, e.g. `ms:memory`; empty for legacy unstamped commands
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sheet_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_row_version: Option<u64>,
    /// Fields touched by an upsert; consulted by cell locks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    /// Owner allowed through row/cell locks it holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
}

impl SheetPatch {
    pub fn upsert(
        sheet_id: impl Into<String>,
        row_id: impl Into<String>,
        row: SheetRow,
        source: impl Into<String>,
    ) -> Self {
        let changed_fields = row.keys().cloned().collect();
        Self {
            sheet_id: sheet_id.into(),
            operation: PatchOperation::Upsert,
            row_id: row_id.into(),
            row: Some(row),
            source: source.into(),
            expected_sheet_version: None,
            expected_row_version: None,
            changed_fields,
            lock_owner: None,
        }
    }

    pub fn delete(
        sheet_id: impl Into<String>,
        row_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            operation: PatchOperation::Delete,
            row_id: row_id.into(),
            row: None,
            source: source.into(),
            expected_sheet_version: None,
            expected_row_version: None,
            changed_fields: Vec::new(),
            lock_owner: None,
        }
    }

    pub fn with_expected_sheet_version(mut self, version: u64) -> Self {
        self.expected_sheet_version = Some(version);
        self
    }

    pub fn with_expected_row_version(mut self, version: u64) -> Self {
        self.expected_row_version = Some(version);
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    pub fn row_version_key(&self) -> String {
        row_version_key(&self.sheet_id, &self.row_id)
    }
}

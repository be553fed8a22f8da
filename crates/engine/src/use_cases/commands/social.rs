//! Narrative handlers: memory logs, action options, NPCs and the inventory.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

use taverndb_domain::{Command, DomainError, GameState, InventoryItem, NpcRecord, SheetRow};

use super::payload::{as_flag, as_int, as_text, Payload};
use super::HandlerContext;

pub(crate) const LOG_INDEX_FIELD: &str = "编码索引";

/// Dialogue lines the narrator attributes to a generic player label.
static PLAYER_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:player|user|you|\{\{user\}\})\s*([:：])").expect("valid regex")
});

const SUMMARY_KEYS: [&str; 5] = ["摘要", "summary", "text", "content", "纪要"];
const OUTLINE_KEYS: [&str; 6] = ["大纲", "outline", "标题", "title", "事件列表", "summary"];

#[derive(Clone, Copy)]
enum MemoryLog {
    Summary,
    Outline,
}

impl MemoryLog {
    fn content_keys(self) -> &'static [&'static str] {
        match self {
            MemoryLog::Summary => &SUMMARY_KEYS,
            MemoryLog::Outline => &OUTLINE_KEYS,
        }
    }

    fn canonical_field(self) -> &'static str {
        match self {
            MemoryLog::Summary => "摘要",
            MemoryLog::Outline => "大纲",
        }
    }

    fn rows(self, state: &mut GameState) -> &mut Vec<SheetRow> {
        match self {
            MemoryLog::Summary => &mut state.log_summaries,
            MemoryLog::Outline => &mut state.log_outlines,
        }
    }
}

pub(super) fn append_log_summary(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    append_log_rows(state, command, ctx, MemoryLog::Summary)
}

pub(super) fn append_log_outline(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    append_log_rows(state, command, ctx, MemoryLog::Outline)
}

fn append_log_rows(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
    kind: MemoryLog,
) -> Result<(), DomainError> {
    let action = command.action.as_str();
    let rows = log_rows(command, kind)?;
    let time = ctx.time_label(state);
    let location = state.current_location.clone().unwrap_or_default();
    let turn = state.turn;
    let player = state.character.name.trim().to_string();

    let mut prepared = Vec::with_capacity(rows.len());
    for mut row in rows {
        let payload = Payload::new(action, &row);
        let content_keys = kind.content_keys();
        if payload.value(content_keys).is_none() {
            return Err(payload.missing(content_keys));
        }
        // Canonicalize the content field so the sheet always carries it.
        if !row.contains_key(kind.canonical_field()) {
            if let Some(text) = Payload::new(action, &row).text(content_keys) {
                row.insert(kind.canonical_field().to_string(), Value::String(text));
            }
        }
        let index = Payload::new(action, &row).text(&[LOG_INDEX_FIELD, "amIndex", "index"]);
        row.remove("amIndex");
        row.remove("index");
        if !player.is_empty() {
            replace_player_labels(&mut row, &player);
        }
        prepared.push((index, row));
    }

    let target = kind.rows(state);
    for (index, mut row) in prepared {
        let index = index.unwrap_or_else(|| format!("AM{:04}", target.len() + 1));
        row.insert(LOG_INDEX_FIELD.to_string(), Value::String(index.clone()));
        let existing = target
            .iter_mut()
            .find(|existing| existing.get(LOG_INDEX_FIELD).and_then(as_text).as_deref() == Some(index.as_str()));
        match existing {
            Some(existing) => existing.extend(row),
            None => {
                row.entry("回合").or_insert_with(|| Value::from(turn));
                row.entry("时间").or_insert_with(|| Value::String(time.clone()));
                row.entry("地点").or_insert_with(|| Value::String(location.clone()));
                target.push(row);
            }
        }
    }
    Ok(())
}

/// A bare string, a single row, an array of rows, or `{rows: [...]}`.
fn log_rows(command: &Command, kind: MemoryLog) -> Result<Vec<SheetRow>, DomainError> {
    let rows = match command.fields_payload() {
        Some(Value::String(text)) if !text.trim().is_empty() => {
            let mut row = Map::new();
            row.insert(kind.canonical_field().to_string(), Value::String(text.trim().to_string()));
            return Ok(vec![row]);
        }
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => match ["rows", "records", "data"].iter().find_map(|k| map.get(*k)) {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![Value::Object(map.clone())],
        },
        _ => Vec::new(),
    };
    if rows.is_empty() {
        return Err(DomainError::validation(format!(
            "{} requires a non-empty value",
            command.action
        )));
    }
    rows.into_iter()
        .map(|row| match row {
            Value::Object(map) => Ok(map),
            _ => Err(DomainError::validation(format!(
                "{} rows must be objects",
                command.action
            ))),
        })
        .collect()
}

/// Rewrite `{{user}}` and generic dialogue speakers to the player's name.
fn replace_player_labels(row: &mut SheetRow, player: &str) {
    for value in row.values_mut() {
        if let Value::String(text) = value {
            let replaced = PLAYER_LABEL_RE
                .replace_all(text, |caps: &regex_lite::Captures<'_>| format!("{}{}", player, &caps[1]))
                .replace("{{user}}", player);
            *text = replaced;
        }
    }
}

pub(super) fn set_action_options(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let items = match command.fields_payload() {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => match map.get("options").or_else(|| map.get("选项")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(DomainError::validation(format!(
                    "{} field options must be an array",
                    command.action
                )))
            }
        },
        _ => {
            return Err(DomainError::validation(format!(
                "{} requires an array of options",
                command.action
            )))
        }
    };
    state.action_options = items.iter().filter_map(as_text).collect();
    Ok(())
}

// =============================================================================
// NPCs
// =============================================================================

const NPC_FIELD_ALIASES: [(&str, &str); 8] = [
    ("姓名", "name"),
    ("名字", "name"),
    ("NPC_ID", "id"),
    ("当前状态", "status"),
    ("状态", "status"),
    ("好感度", "affinity"),
    ("是否在场", "present"),
    ("在场", "present"),
];

const PRESENT_STATUSES: [&str; 5] = ["在场", "online", "present", "active", "here"];

pub(super) fn upsert_npc(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let entries = object_entries(command)?;
    let player = state.character.name.trim().to_string();

    for entry in entries {
        let mut fields = canonical_fields(&entry, &NPC_FIELD_ALIASES);
        normalize_presence(&mut fields);

        let id = fields.get("id").and_then(as_text);
        let name = fields.get("name").and_then(as_text);
        if id.is_none() && name.is_none() {
            return Err(DomainError::validation(format!(
                "{} entries require id or name",
                command.action
            )));
        }
        if is_player_reference(id.as_deref(), name.as_deref(), &player) {
            tracing::debug!(id = ?id, name = ?name, "Skipping player reference in NPC upsert");
            continue;
        }

        let position = state.npcs.iter().position(|npc| match (&id, &npc.id) {
            (Some(id), Some(existing)) => id == existing,
            _ => name.as_deref().is_some_and(|name| npc.name == name),
        });
        match position {
            Some(position) => {
                let merged = overlay(&state.npcs[position], fields, command)?;
                state.npcs[position] = merged;
            }
            None => {
                let record: NpcRecord = from_fields(fields, command)?;
                state.npcs.push(record);
            }
        }
    }
    Ok(())
}

/// Collapse status and presence into a consistent pair.
fn normalize_presence(fields: &mut Map<String, Value>) {
    let explicit = fields.get("present").and_then(as_flag);
    let status = fields.get("status").and_then(as_text);
    let present = match (explicit, status.as_deref()) {
        (Some(flag), _) => Some(flag),
        (None, Some(status)) => Some(PRESENT_STATUSES.contains(&status.to_ascii_lowercase().as_str())),
        (None, None) => None,
    };
    if let Some(present) = present {
        fields.insert("present".to_string(), Value::Bool(present));
        fields.insert(
            "status".to_string(),
            Value::String(if present { "在场" } else { "离场" }.to_string()),
        );
    }
}

fn is_player_reference(id: Option<&str>, name: Option<&str>, player: &str) -> bool {
    let marker = |value: &str| {
        let value = value.trim();
        value.eq_ignore_ascii_case("{{user}}")
            || value.to_ascii_uppercase().starts_with("PLAYER_")
            || (!player.is_empty() && value == player)
    };
    id.is_some_and(marker) || name.is_some_and(marker)
}

// =============================================================================
// Inventory
// =============================================================================

const ITEM_FIELD_ALIASES: [(&str, &str); 9] = [
    ("名称", "name"),
    ("物品名称", "name"),
    ("item_name", "name"),
    ("itemName", "name"),
    ("数量", "quantity"),
    ("qty", "quantity"),
    ("count", "quantity"),
    ("物品ID", "id"),
    ("ITEM_ID", "id"),
];

pub(super) fn upsert_inventory(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let entries = object_entries(command)?;
    let mut applied = 0usize;

    for entry in entries {
        let mut fields = canonical_fields(&entry, &ITEM_FIELD_ALIASES);
        let id = fields.get("id").and_then(as_text);
        let Some(name) = fields.get("name").and_then(as_text) else {
            tracing::debug!(entry = %serde_json::Value::Object(entry.clone()), "Skipping inventory row without a name");
            continue;
        };
        let quantity = match fields.get("quantity") {
            None => None,
            Some(value) => Some(as_int(value).ok_or_else(|| {
                DomainError::validation(format!("{} field quantity must be a number", command.action))
            })?),
        };
        if let Some(quantity) = quantity {
            fields.insert("quantity".to_string(), Value::from(quantity));
        }

        let position = state.inventory.iter().position(|item| match (&id, &item.id) {
            (Some(id), Some(existing)) => id == existing,
            _ => item.name == name,
        });
        match (position, quantity) {
            (Some(position), Some(quantity)) if quantity <= 0 => {
                state.inventory.remove(position);
            }
            (Some(position), _) => {
                let merged = overlay(&state.inventory[position], fields, command)?;
                state.inventory[position] = merged;
            }
            (None, Some(quantity)) if quantity <= 0 => {}
            (None, _) => {
                fields.entry("quantity").or_insert_with(|| Value::from(1));
                let item: InventoryItem = from_fields(fields, command)?;
                state.inventory.push(item);
            }
        }
        applied += 1;
    }

    if applied == 0 {
        return Err(DomainError::validation(format!(
            "{} had no rows with an item name",
            command.action
        )));
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// An object, an array of objects, or `{rows: [...]}`. Non-object entries are rejected.
fn object_entries(command: &Command) -> Result<Vec<Map<String, Value>>, DomainError> {
    let items: Vec<Value> = match command.fields_payload() {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => match map.get("rows") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![Value::Object(map.clone())],
        },
        _ => Vec::new(),
    };
    if items.is_empty() {
        return Err(DomainError::validation(format!(
            "{} requires an object or array value",
            command.action
        )));
    }
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(DomainError::validation(format!(
                "{} entries must be objects",
                command.action
            ))),
        })
        .collect()
}

/// Rename alias keys to their canonical names; canonical keys win when both are present.
fn canonical_fields(entry: &Map<String, Value>, aliases: &[(&str, &str)]) -> Map<String, Value> {
    let mut fields = Map::new();
    for (key, value) in entry {
        match aliases.iter().find(|(alias, _)| alias == key) {
            Some((_, canonical)) => {
                if !entry.contains_key(*canonical) {
                    fields.insert(canonical.to_string(), value.clone());
                }
            }
            None => {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
    fields
}

fn overlay<T>(existing: &T, fields: Map<String, Value>, command: &Command) -> Result<T, DomainError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut document = serde_json::to_value(existing).map_err(|e| DomainError::parse(e.to_string()))?;
    if let Value::Object(map) = &mut document {
        map.extend(fields);
    }
    serde_json::from_value(document)
        .map_err(|e| DomainError::validation(format!("{} produced an invalid record: {}", command.action, e)))
}

fn from_fields<T>(fields: Map<String, Value>, command: &Command) -> Result<T, DomainError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| DomainError::validation(format!("{} produced an invalid record: {}", command.action, e)))
}

//! Sheet row writes.
//!
//! Rows land in the state's shadow store for their sheet (`LOG_Summary` and
//! `LOG_Outline` share the memory log lists) and every touched row yields one
//! `SheetPatch` for the version store to validate.

use serde_json::{Map, Value};

use taverndb_domain::sheet::{
    default_key_field, read_row_id, GLOBAL_STATE_ROW_ID, LOG_OUTLINE, LOG_SUMMARY, SYS_GLOBAL_STATE,
};
use taverndb_domain::{Command, DomainError, GameState, SheetPatch, SheetRow};

use super::payload::{as_int, as_text, Payload};

const SHEET_KEYS: [&str; 4] = ["sheetId", "sheet_id", "sheet", "tableId"];
const ROWS_KEYS: [&str; 4] = ["rows", "row", "records", "data"];
const KEY_FIELD_KEYS: [&str; 2] = ["keyField", "key_field"];
const SHEET_VERSION_KEYS: [&str; 2] = ["expectedSheetVersion", "expected_sheet_version"];
const ROW_VERSION_KEYS: [&str; 2] = ["expectedRowVersion", "expected_row_version"];
const LOCK_OWNER_KEYS: [&str; 2] = ["lockOwner", "lock_owner"];
const CHANGED_FIELDS_KEYS: [&str; 2] = ["changedFields", "changed_fields"];
const ROW_ID_KEYS: [&str; 3] = ["rowIds", "row_ids", "ids"];

/// Row keys tried when a row lacks its sheet's key field.
const FALLBACK_ID_FIELDS: [&str; 4] = ["id", "ID", "key", "KEY"];

/// Control fields carried by a write payload rather than by its rows.
struct WriteHeader {
    sheet_id: String,
    key_field: String,
    expected_sheet_version: Option<u64>,
    expected_row_version: Option<u64>,
    lock_owner: Option<String>,
    changed_fields: Option<Vec<String>>,
}

impl WriteHeader {
    fn parse(payload: &Payload<'_>) -> Result<Self, DomainError> {
        let sheet_id = payload.require_text(&SHEET_KEYS)?;
        let key_field = payload
            .text(&KEY_FIELD_KEYS)
            .unwrap_or_else(|| default_key_field(&sheet_id).to_string());
        let changed_fields = payload
            .value(&CHANGED_FIELDS_KEYS)
            .map(|_| payload.text_list(&CHANGED_FIELDS_KEYS));
        Ok(Self {
            expected_sheet_version: version(payload, &SHEET_VERSION_KEYS)?,
            expected_row_version: version(payload, &ROW_VERSION_KEYS)?,
            lock_owner: payload.text(&LOCK_OWNER_KEYS),
            changed_fields,
            sheet_id,
            key_field,
        })
    }

    fn stamp(&self, mut patch: SheetPatch, row_version: Option<u64>) -> SheetPatch {
        if let Some(version) = self.expected_sheet_version {
            patch = patch.with_expected_sheet_version(version);
        }
        if let Some(version) = row_version.or(self.expected_row_version) {
            patch = patch.with_expected_row_version(version);
        }
        if let Some(owner) = &self.lock_owner {
            patch = patch.with_lock_owner(owner.clone());
        }
        patch
    }

    fn is_control_field(key: &str) -> bool {
        SHEET_KEYS
            .iter()
            .chain(&KEY_FIELD_KEYS)
            .chain(&SHEET_VERSION_KEYS)
            .chain(&ROW_VERSION_KEYS)
            .chain(&LOCK_OWNER_KEYS)
            .chain(&CHANGED_FIELDS_KEYS)
            .any(|control| *control == key)
    }
}

fn version(payload: &Payload<'_>, keys: &[&str]) -> Result<Option<u64>, DomainError> {
    payload
        .int(keys)?
        .map(|value| {
            u64::try_from(value).map_err(|_| {
                DomainError::validation(format!(
                    "{} field {} must be non-negative",
                    payload.action(),
                    keys[0]
                ))
            })
        })
        .transpose()
}

/// One payload object, or an array of them.
fn payload_objects(command: &Command) -> Result<Vec<&Map<String, Value>>, DomainError> {
    match command.fields_payload() {
        Some(Value::Object(map)) => Ok(vec![map]),
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    DomainError::validation(format!("{} payloads must be objects", command.action))
                })
            })
            .collect(),
        _ => Err(DomainError::validation(format!(
            "{} missing field sheetId",
            command.action
        ))),
    }
}

/// Shadow rows backing a sheet.
fn shadow_rows<'a>(state: &'a mut GameState, sheet_id: &str) -> &'a mut Vec<SheetRow> {
    match sheet_id {
        LOG_SUMMARY => &mut state.log_summaries,
        LOG_OUTLINE => &mut state.log_outlines,
        other => state.sheets.entry(other.to_string()).or_default(),
    }
}

pub(super) fn upsert_sheet_rows(state: &mut GameState, command: &Command) -> Result<Vec<SheetPatch>, DomainError> {
    let action = command.action.as_str();
    let mut writes = Vec::new();
    for map in payload_objects(command)? {
        let payload = Payload::new(action, map);
        let header = WriteHeader::parse(&payload)?;
        let rows = incoming_rows(&payload)?;
        if rows.is_empty() {
            return Err(payload.missing(&ROWS_KEYS));
        }
        writes.push((header, rows));
    }

    let global_rows: usize = writes
        .iter()
        .filter(|(header, _)| header.sheet_id == SYS_GLOBAL_STATE)
        .map(|(_, rows)| rows.len())
        .sum();
    if global_rows > 1 {
        return Err(DomainError::validation(format!(
            "{} accepts a single row per batch (got {})",
            SYS_GLOBAL_STATE, global_rows
        )));
    }

    let mut patches = Vec::new();
    for (header, rows) in writes {
        for (position, mut row) in rows.into_iter().enumerate() {
            let row_version = version(&Payload::new(action, &row), &ROW_VERSION_KEYS)?;
            for key in ROW_VERSION_KEYS {
                row.remove(key);
            }
            let row_id = assign_row_id(&header, &mut row).ok_or_else(|| {
                DomainError::validation(format!(
                    "{} row {} missing field {}",
                    action, position, header.key_field
                ))
            })?;
            if header.sheet_id == SYS_GLOBAL_STATE {
                mirror_global_state(state, &row)?;
            }

            let target = shadow_rows(state, &header.sheet_id);
            let existing = target
                .iter_mut()
                .find(|existing| read_row_id(existing, &header.key_field).as_deref() == Some(row_id.as_str()));
            match existing {
                Some(existing) => existing.extend(row.clone()),
                None => target.push(row.clone()),
            }

            let mut patch = SheetPatch::upsert(&header.sheet_id, row_id, row, &command.source);
            if let Some(fields) = &header.changed_fields {
                patch.changed_fields = fields.clone();
            }
            patches.push(header.stamp(patch, row_version));
        }
    }

    Ok(patches)
}

pub(super) fn delete_sheet_rows(state: &mut GameState, command: &Command) -> Result<Vec<SheetPatch>, DomainError> {
    let action = command.action.as_str();
    let mut patches = Vec::new();

    for map in payload_objects(command)? {
        let payload = Payload::new(action, map);
        let header = WriteHeader::parse(&payload)?;
        let ids = payload.text_list(&ROW_ID_KEYS);
        if ids.is_empty() {
            return Err(payload.missing(&ROW_ID_KEYS));
        }

        let target = shadow_rows(state, &header.sheet_id);
        for row_id in ids {
            let position = target
                .iter()
                .position(|row| read_row_id(row, &header.key_field).as_deref() == Some(row_id.as_str()));
            let Some(position) = position else {
                tracing::debug!(sheet = %header.sheet_id, row = %row_id, "Delete of absent row skipped");
                continue;
            };
            target.remove(position);
            let patch = SheetPatch::delete(&header.sheet_id, row_id, &command.source);
            patches.push(header.stamp(patch, None));
        }
    }

    Ok(patches)
}

/// `rows` (array or single object), else the payload itself minus control fields.
fn incoming_rows(payload: &Payload<'_>) -> Result<Vec<SheetRow>, DomainError> {
    match payload.value(&ROWS_KEYS) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .cloned()
                    .ok_or_else(|| DomainError::validation(format!("{} rows must be objects", payload.action())))
            })
            .collect(),
        Some(Value::Object(row)) => Ok(vec![row.clone()]),
        Some(_) => Err(DomainError::validation(format!(
            "{} field rows must be an array",
            payload.action()
        ))),
        None => {
            let inline: SheetRow = payload
                .map()
                .iter()
                .filter(|(key, _)| !WriteHeader::is_control_field(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Ok(if inline.is_empty() { Vec::new() } else { vec![inline] })
        }
    }
}

/// Resolve the row id, writing it back under the key field when it came from a fallback.
fn assign_row_id(header: &WriteHeader, row: &mut SheetRow) -> Option<String> {
    if header.sheet_id == SYS_GLOBAL_STATE && read_row_id(row, &header.key_field).is_none() {
        row.insert(header.key_field.clone(), Value::String(GLOBAL_STATE_ROW_ID.to_string()));
    }
    if let Some(id) = read_row_id(row, &header.key_field) {
        return Some(id);
    }
    let id = FALLBACK_ID_FIELDS
        .iter()
        .find_map(|field| read_row_id(row, field))?;
    row.insert(header.key_field.clone(), Value::String(id.clone()));
    Some(id)
}

/// Keep the typed clock and location in step with the global-state row.
fn mirror_global_state(state: &mut GameState, row: &SheetRow) -> Result<(), DomainError> {
    let field = |keys: &[&str]| keys.iter().find_map(|key| row.get(*key)).filter(|v| !v.is_null());

    if let Some(time) = field(&["当前时间", "gameTime", "game_time"]).and_then(as_text) {
        state.game_time = Some(time);
    }
    if let Some(location) = field(&["当前地点", "currentLocation", "current_location"]).and_then(as_text) {
        state.current_location = Some(location);
    }
    if let Some(turn) = field(&["回合", "turn"]) {
        let turn = as_int(turn)
            .and_then(|turn| u32::try_from(turn).ok())
            .ok_or_else(|| DomainError::validation(format!("{} field 回合 must be a turn number", SYS_GLOBAL_STATE)))?;
        state.turn = turn;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::command;
    use super::*;
    use serde_json::json;
    use taverndb_domain::{PatchOperation, TavernCommand};

    fn upsert(value: Value) -> Command {
        command(TavernCommand::new("upsert_sheet_rows").with_source("ms:state").with_value(value))
    }

    #[test]
    fn test_upsert_merges_by_default_key_and_emits_patches() {
        let mut state = GameState::default();
        let first = upsert(json!({"sheetId": "NPC_Registry", "rows": [{"NPC_ID": "N1", "姓名": "Eina", "好感度": 10}]}));
        upsert_sheet_rows(&mut state, &first).expect("insert");
        let second = upsert(json!({
            "sheetId": "NPC_Registry",
            "expectedSheetVersion": 1,
            "rows": [{"NPC_ID": "N1", "好感度": 15, "expectedRowVersion": 1}]
        }));
        let patches = upsert_sheet_rows(&mut state, &second).expect("merge");

        let rows = &state.sheets["NPC_Registry"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["姓名"], "Eina");
        assert_eq!(rows[0]["好感度"], 15);

        assert_eq!(patches.len(), 1);
        let patch = &patches[0];
        assert_eq!(patch.row_id, "N1");
        assert_eq!(patch.source, "ms:state");
        assert_eq!(patch.expected_sheet_version, Some(1));
        assert_eq!(patch.expected_row_version, Some(1));
        assert_eq!(patch.changed_fields, vec!["NPC_ID".to_string(), "好感度".to_string()]);
        assert!(!patch.row.as_ref().is_some_and(|row| row.contains_key("expectedRowVersion")));
    }

    #[test]
    fn test_log_sheets_share_memory_lists() {
        let mut state = GameState::default();
        let cmd = upsert(json!({"sheet_id": "LOG_Summary", "row": {"编码索引": "AM0001", "摘要": "a"}}));
        upsert_sheet_rows(&mut state, &cmd).expect("upsert");
        assert_eq!(state.log_summaries.len(), 1);
        assert!(state.sheets.is_empty());
    }

    #[test]
    fn test_global_state_single_row_and_mirror() {
        let mut state = GameState::default();
        let cmd = upsert(json!({"sheetId": "SYS_GlobalState", "rows": [{"当前地点": "巴别塔前", "当前时间": "第2日 10:10", "回合": 4}]}));
        let patches = upsert_sheet_rows(&mut state, &cmd).expect("global");
        assert_eq!(patches[0].row_id, GLOBAL_STATE_ROW_ID);
        assert_eq!(state.current_location.as_deref(), Some("巴别塔前"));
        assert_eq!(state.game_time.as_deref(), Some("第2日 10:10"));
        assert_eq!(state.turn, 4);

        let two = upsert(json!({"sheetId": "SYS_GlobalState", "rows": [{"a": 1}, {"b": 2}]}));
        assert!(matches!(upsert_sheet_rows(&mut state, &two), Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_global_state_rows_counted_across_payloads() {
        let mut state = GameState::default();
        let cmd = upsert(json!([
            {"sheetId": "SYS_GlobalState", "rows": [{"当前地点": "A"}]},
            {"sheetId": "SYS_GlobalState", "rows": [{"当前地点": "B"}]}
        ]));
        let err = upsert_sheet_rows(&mut state, &cmd).expect_err("two global rows");
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(err.to_string().contains("got 2"));
        assert_eq!(state.current_location, None);
        assert!(state.sheets.is_empty());

        let mixed = upsert(json!([
            {"sheetId": "SYS_GlobalState", "rows": [{"当前地点": "A"}]},
            {"sheetId": "NPC_Registry", "rows": [{"NPC_ID": "N1"}]}
        ]));
        assert_eq!(upsert_sheet_rows(&mut state, &mixed).expect("one global row").len(), 2);
    }

    #[test]
    fn test_fallback_id_and_missing_id() {
        let mut state = GameState::default();
        let cmd = upsert(json!({"sheetId": "QUEST_Active", "rows": [{"id": "Q1", "名称": "护送"}]}));
        let patches = upsert_sheet_rows(&mut state, &cmd).expect("fallback");
        assert_eq!(patches[0].row_id, "Q1");
        assert_eq!(state.sheets["QUEST_Active"][0]["任务ID"], "Q1");

        let bad = upsert(json!({"sheetId": "QUEST_Active", "rows": [{"名称": "无编号"}]}));
        let err = upsert_sheet_rows(&mut state, &bad).expect_err("no id");
        assert!(err.to_string().contains("任务ID"));
    }

    #[test]
    fn test_inline_row_and_payload_array() {
        let mut state = GameState::default();
        let cmd = upsert(json!([
            {"sheetId": "ITEM_Inventory", "物品ID": "I1", "名称": "药水"},
            {"sheetId": "FACTION_Standing", "keyField": "name", "rows": [{"name": "赫斯缇雅眷族"}]}
        ]));
        let patches = upsert_sheet_rows(&mut state, &cmd).expect("payloads");
        assert_eq!(patches.len(), 2);
        assert!(!state.sheets["ITEM_Inventory"][0].contains_key("sheetId"));
        assert_eq!(patches[1].row_id, "赫斯缇雅眷族");
    }

    #[test]
    fn test_delete_rows_skips_absent() {
        let mut state = GameState::default();
        upsert_sheet_rows(&mut state, &upsert(json!({"sheetId": "NPC_Registry", "rows": [{"NPC_ID": "N1"}, {"NPC_ID": "N2"}]})))
            .expect("seed");
        let cmd = command(TavernCommand::new("delete_sheet_rows").with_value(json!({
            "sheetId": "NPC_Registry", "rowIds": ["N1", "N9"]
        })));
        let patches = delete_sheet_rows(&mut state, &cmd).expect("delete");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].operation, PatchOperation::Delete);
        assert_eq!(state.sheets["NPC_Registry"].len(), 1);

        let empty = command(TavernCommand::new("delete_sheet_rows").with_value(json!({"sheetId": "NPC_Registry"})));
        assert!(delete_sheet_rows(&mut state, &empty).is_err());
    }
}

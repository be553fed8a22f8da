//! Turn transactions against realistic command batches.

use serde_json::json;

use taverndb_domain::{CellLock, ReasonCode, RowLock, SessionSnapshot, TavernCommand, TxStatus};

use crate::use_cases::repair::parse_ai_response_text;
use crate::use_cases::transaction::version_store::MEMORY_LOCK_OWNER;
use crate::use_cases::transaction::TransactionOptions;

use super::e2e_helpers::*;

fn memory_summary_row(source: &str) -> TavernCommand {
    TavernCommand::new("upsert_sheet_rows")
        .with_source(source)
        .with_value(json!({
            "sheetId": "LOG_Summary",
            "rows": [{"id": "AM0001", "摘要": "冒险者抵达欧拉丽公会。"}]
        }))
}

#[test]
fn test_atomic_combat_batch_rolls_back_on_handler_error() {
    let base = SessionSnapshot::default();
    let commands = vec![
        TavernCommand::new("set_action_economy")
            .with_transaction_id("t1")
            .with_value(json!({"round": 1, "currentActor": "PC_MAIN", "resources": [{"unitId": "PC_MAIN"}]})),
        TavernCommand::new("resolve_attack_check")
            .with_transaction_id("t1")
            .with_value(json!({"attackBonus": 3})),
    ];

    let result = transact(&base, &commands, &TransactionOptions::default());

    assert!(result.rolled_back);
    assert_eq!(result.reason(), Some(ReasonCode::ApplyError));
    assert_eq!(result.snapshot.state, base.state);
    assert!(result.snapshot.state.combat.action_economy.is_none());
    assert!(result.logs.iter().any(|log| log.text.contains("回合事务回滚")));
    assert_eq!(result.snapshot.table_meta.conflict_stats.count(ReasonCode::ApplyError), 1);
    assert_eq!(
        result.snapshot.table_meta.last_journal().map(|entry| entry.turn_id.clone()),
        Some(Some("t1".to_string()))
    );
}

#[test]
fn test_memory_upsert_commits_against_fresh_meta() {
    let base = SessionSnapshot::default();
    let result = transact(&base, &[memory_summary_row("ms:memory")], &TransactionOptions::default());

    assert!(!result.rolled_back, "logs: {:?}", result.logs);
    let meta = &result.snapshot.table_meta;
    assert_eq!(meta.sheet_version("LOG_Summary"), 1);
    assert_eq!(meta.row_version("LOG_Summary", "AM0001"), 1);
    assert_eq!(meta.tx_journal.len(), 1);
    assert_eq!(meta.tx_journal[0].status, TxStatus::Committed);
    assert_eq!(meta.tx_journal[0].sources, vec!["ms:memory".to_string()]);
    assert_eq!(
        meta.find_row_lock("LOG_Summary", "AM0001").map(|lock| lock.owner.as_str()),
        Some(MEMORY_LOCK_OWNER)
    );
    assert_eq!(result.snapshot.state.log_summaries.len(), 1);
}

#[test]
fn test_foreign_writer_on_memory_sheet_is_source_not_allowed() {
    let base = SessionSnapshot::default();
    let result = transact(&base, &[memory_summary_row("ms:state")], &TransactionOptions::default());

    assert!(result.rolled_back);
    assert_eq!(result.reason(), Some(ReasonCode::SourceNotAllowed));
    assert!(result.snapshot.state.log_summaries.is_empty());
    let meta = &result.snapshot.table_meta;
    assert_eq!(meta.conflict_stats.count(ReasonCode::SourceNotAllowed), 1);
    assert_eq!(meta.sheet_version("LOG_Summary"), 0);
    assert_eq!(meta.tx_journal[0].status, TxStatus::RolledBack);
    assert!(result.logs.iter().any(|log| log.text.contains("source_not_allowed")));
}

#[test]
fn test_state_writer_owns_character_resources() {
    let write = |source: &str| {
        TavernCommand::new("upsert_sheet_rows")
            .with_source(source)
            .with_value(json!({"sheetId": "CHARACTER_Resources", "rows": [{"CHAR_ID": "PC_MAIN", "法利": 300}]}))
    };
    let base = SessionSnapshot::default();
    let options = TransactionOptions::default();

    let denied = transact(&base, &[write("ms:state")], &options);
    assert_eq!(denied.reason(), Some(ReasonCode::SourceNotAllowed));

    let accepted = transact(&base, &[write("ms:state-writer")], &options);
    assert!(!accepted.rolled_back);
    assert_eq!(accepted.snapshot.table_meta.sheet_version("CHARACTER_Resources"), 1);
}

#[test]
fn test_stale_sheet_version_is_rejected() {
    let mut base = SessionSnapshot::default();
    base.table_meta.sheet_versions.insert("NPC_Registry".to_string(), 5);
    let command = TavernCommand::new("upsert_sheet_rows").with_value(json!({
        "sheetId": "NPC_Registry",
        "expectedSheetVersion": 4,
        "rows": [{"NPC_ID": "NPC_Loki", "姓名": "洛基"}]
    }));

    let result = transact(&base, &[command], &TransactionOptions::default());

    assert!(result.rolled_back);
    assert_eq!(result.reason(), Some(ReasonCode::SheetVersionConflict));
    assert_eq!(result.snapshot.state, base.state);
    assert_eq!(result.snapshot.table_meta.sheet_version("NPC_Registry"), 5);
    assert!(result.logs.iter().any(|log| log.text.contains("并发冲突")));
}

#[test]
fn test_stale_row_version_rolls_back_whole_batch() {
    let mut snapshot = SessionSnapshot::default();
    let seed = TavernCommand::new("upsert_sheet_rows").with_value(json!({
        "sheetId": "NPC_Registry",
        "rows": [{"NPC_ID": "NPC_Hestia", "好感度": 10}]
    }));
    snapshot = transact(&snapshot, &[seed.clone()], &TransactionOptions::default()).snapshot;
    snapshot = transact(&snapshot, &[seed], &TransactionOptions::default()).snapshot;
    assert_eq!(snapshot.table_meta.row_version("NPC_Registry", "NPC_Hestia"), 2);

    let commands = vec![
        TavernCommand::new("set").with_key("currentLocation").with_value(json!("炉神的工坊")),
        TavernCommand::new("upsert_sheet_rows").with_value(json!({
            "sheetId": "NPC_Registry",
            "rows": [{"NPC_ID": "NPC_Hestia", "好感度": 40, "expectedRowVersion": 1}]
        })),
    ];
    let result = transact(&snapshot, &commands, &TransactionOptions::default());

    assert!(result.rolled_back);
    assert_eq!(result.reason(), Some(ReasonCode::RowVersionConflict));
    assert_eq!(result.snapshot.state, snapshot.state);
    assert_eq!(result.snapshot.table_meta.row_version("NPC_Registry", "NPC_Hestia"), 2);
    assert_eq!(result.snapshot.table_meta.conflict_stats.count(ReasonCode::RowVersionConflict), 1);
    assert_eq!(result.snapshot.table_meta.tx_journal.len(), 3);
    assert!(result
        .logs
        .iter()
        .any(|log| log.text.contains("NPC_Registry/NPC_Hestia row_version_conflict expected=1 actual=2")));
}

#[test]
fn test_locked_cell_blocks_writes_naming_the_field() {
    let mut base = SessionSnapshot::default();
    base.table_meta.lock_cell(CellLock {
        sheet_id: "NPC_Registry".to_string(),
        row_id: "NPC_Loki".to_string(),
        field: "好感度".to_string(),
        owner: "gm".to_string(),
        reason: None,
        created_at: T0_MILLIS,
    });
    let write = |changed: serde_json::Value| {
        TavernCommand::new("upsert_sheet_rows").with_value(json!({
            "sheetId": "NPC_Registry",
            "changedFields": changed,
            "rows": [{"NPC_ID": "NPC_Loki", "称号": "诡计之神"}]
        }))
    };

    let blocked = transact(&base, &[write(json!(["好感度"]))], &TransactionOptions::default());
    assert_eq!(blocked.reason(), Some(ReasonCode::CellLocked));
    assert_eq!(blocked.snapshot.table_meta.conflict_stats.count(ReasonCode::CellLocked), 1);
    assert!(blocked.logs.iter().any(|log| log.text.contains("cell_locked field=好感度")));

    let other_field = transact(&base, &[write(json!(["称号"]))], &TransactionOptions::default());
    assert!(!other_field.rolled_back, "logs: {:?}", other_field.logs);
}

#[test]
fn test_versions_grow_by_one_per_commit() {
    let mut snapshot = SessionSnapshot::default();
    for turn in 0..3u64 {
        let command = TavernCommand::new("upsert_sheet_rows").with_value(json!({
            "sheetId": "NPC_Registry",
            "expectedSheetVersion": turn,
            "rows": [{"NPC_ID": format!("NPC_{}", turn)}, {"NPC_ID": "NPC_Hestia", "好感度": turn}]
        }));
        let result = transact(&snapshot, &[command], &TransactionOptions::default());
        assert!(!result.rolled_back, "turn {} logs: {:?}", turn, result.logs);
        snapshot = result.snapshot;
    }

    assert_eq!(snapshot.table_meta.sheet_version("NPC_Registry"), 3);
    assert_eq!(snapshot.table_meta.row_version("NPC_Registry", "NPC_Hestia"), 3);
    assert_eq!(snapshot.table_meta.row_version("NPC_Registry", "NPC_0"), 1);
    assert_eq!(snapshot.table_meta.tx_journal.len(), 3);
}

#[test]
fn test_memory_lock_blocks_writes_without_owner() {
    let mut base = SessionSnapshot::default();
    base.table_meta.lock_row(RowLock {
        sheet_id: "LOG_Summary".to_string(),
        row_id: "AM0001".to_string(),
        owner: MEMORY_LOCK_OWNER.to_string(),
        reason: None,
        created_at: T0_MILLIS,
    });

    let locked = transact(&base, &[memory_summary_row("ms:memory")], &TransactionOptions::default());
    assert_eq!(locked.reason(), Some(ReasonCode::RowLocked));

    let owned = TavernCommand::new("upsert_sheet_rows")
        .with_source("ms:memory")
        .with_value(json!({
            "sheetId": "LOG_Summary",
            "lockOwner": MEMORY_LOCK_OWNER,
            "rows": [{"id": "AM0001", "摘要": "修订"}]
        }));
    let result = transact(&base, &[owned], &TransactionOptions::default());
    assert!(!result.rolled_back, "logs: {:?}", result.logs);
}

#[test]
fn test_trailing_comma_response_is_repaired() {
    let parsed = parse_ai_response_text(r#"{"tavern_commands": [{"action":"a","value":{}},]}"#);

    assert!(parsed.repaired);
    assert_eq!(parsed.error, None);
    assert_eq!(parsed.tavern_commands().map(Vec::len), Some(1));
}

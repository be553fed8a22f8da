//! Full turns through `App::submit_turn`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use taverndb_domain::{EconomicAccount, ReasonCode};
use taverndb_shared::ServiceKind;

use crate::app::App;
use crate::infrastructure::app_settings::EngineSettings;
use crate::infrastructure::lane_queue::TaskError;
use crate::use_cases::{GuardRejectReason, TurnOutcome};

use super::e2e_helpers::*;

#[tokio::test]
async fn test_committed_turn_survives_sqlite_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let settings = EngineSettings {
        db_path: Some(dir.path().join("sessions.db")),
        ..fast_settings()
    };

    let app = App::new(settings.clone()).await.expect("app");
    let raw = response(json!([
        {"action": "set", "key": "gameState.currentLocation", "value": "欧拉丽 · 公会本部"},
        {"action": "set", "key": "gameState.turn", "value": 2}
    ]));
    let report = expect_applied(run_turn(&app, "s-sqlite", ServiceKind::State, raw).await);
    assert!(!report.rolled_back);
    app.shutdown().await;
    drop(app);

    let reopened = App::new(settings).await.expect("reopen");
    let saved = reopened
        .sessions
        .load("s-sqlite")
        .await
        .expect("load")
        .expect("session saved");
    assert_eq!(saved.state.current_location.as_deref(), Some("欧拉丽 · 公会本部"));
    assert_eq!(saved.state.turn, 2);
    assert_eq!(saved.table_meta.tx_journal.len(), 1);
}

#[tokio::test]
async fn test_unparseable_response_is_an_outcome_not_an_error() {
    let app = test_app(fast_settings());

    let outcome = run_turn(&app, "s1", ServiceKind::Story, "抱歉，我无法继续这个故事。").await;

    assert!(matches!(outcome, TurnOutcome::Unparseable { ref error, .. } if error.is_some()));
    assert_eq!(app.sessions.load("s1").await.expect("load"), None);
}

#[tokio::test]
async fn test_fenced_response_with_noise_is_applied() {
    let app = test_app(fast_settings());
    let raw = "好的，这是本回合的结果：\n```json\n{\n  \"thinking_pre\": \"玩家走进酒馆\",\n  \"logs\": [{\"sender\": \"旁白\", \"text\": \"...\"}],\n  \"tavern_commands\": [\n    {\"action\": \"set\", \"key\": \"gameState.currentLocation\", \"value\": \"丰饶的女主人\"},\n  ]\n}\n```";

    let report = expect_applied(run_turn(&app, "s1", ServiceKind::Story, raw).await);

    assert!(report.repair_note.is_some());
    assert_eq!(report.snapshot.state.current_location.as_deref(), Some("丰饶的女主人"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let app = test_app(fast_settings());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let raw = response(json!([{"action": "set", "key": "currentLocation", "value": "巴别塔"}]));

    let outcome = app
        .submit_turn("s1", ServiceKind::Story, move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            let raw = raw.clone();
            async move {
                if attempt == 1 {
                    anyhow::bail!("HTTP 503 Service Unavailable");
                }
                Ok(raw)
            }
        })
        .join()
        .await
        .expect("turn");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let report = expect_applied(outcome);
    assert_eq!(report.snapshot.state.current_location.as_deref(), Some("巴别塔"));
}

#[tokio::test]
async fn test_non_retryable_failure_fails_the_task() {
    let app = test_app(fast_settings());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result = app
        .submit_turn("s1", ServiceKind::Memory, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<String, _>(anyhow::anyhow!("HTTP 401 invalid api key")) }
        })
        .join()
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(TaskError::Failed(ref message)) if message.contains("ms:memory call failed")));
    assert_eq!(app.sessions.load("s1").await.expect("load"), None);
}

#[tokio::test]
async fn test_turns_after_shutdown_are_aborted() {
    let app = test_app(fast_settings());
    app.shutdown().await;

    let result = app
        .submit_turn("s1", ServiceKind::Story, |_| async { Ok::<_, anyhow::Error>(response(json!([]))) })
        .join()
        .await;

    assert!(matches!(result, Err(TaskError::Failed(ref message)) if message.contains("aborted")));
}

#[tokio::test]
async fn test_memory_log_pairing_across_turns() {
    let app = test_app(fast_settings());
    let summary = json!({"action": "upsert_sheet_rows", "value": {"sheetId": "LOG_Summary", "rows": [{"编码索引": "AM0001", "摘要": "初入地下城"}]}});
    let outline = json!({"action": "upsert_sheet_rows", "value": {"sheetId": "LOG_Outline", "rows": [{"编码索引": "AM0001", "大纲": "第一卷"}]}});

    let rejected = expect_applied(run_turn(&app, "s1", ServiceKind::Memory, response(json!([summary.clone()]))).await);
    assert!(rejected.rolled_back);
    assert_eq!(rejected.reason, Some(ReasonCode::ApplyError));

    let committed = expect_applied(run_turn(&app, "s1", ServiceKind::Memory, response(json!([summary, outline]))).await);
    assert!(!committed.rolled_back, "logs: {:?}", committed.logs);

    let saved = app.sessions.load("s1").await.expect("load").expect("saved");
    assert_eq!(saved.state.log_summaries.len(), 1);
    assert_eq!(saved.state.log_outlines.len(), 1);
    assert_eq!(saved.table_meta.sheet_version("LOG_Summary"), 1);
    assert_eq!(saved.table_meta.conflict_stats.count(ReasonCode::ApplyError), 1);
    assert_eq!(saved.table_meta.tx_journal.len(), 2);
}

#[tokio::test]
async fn test_state_service_log_writes_are_dropped() {
    let app = test_app(fast_settings());
    let raw = response(json!([
        {"action": "append_log_summary", "value": "越权写入"},
        {"action": "set", "key": "currentLocation", "value": "公会"}
    ]));

    let report = expect_applied(run_turn(&app, "s1", ServiceKind::State, raw).await);

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].reason, GuardRejectReason::MemoryOwned);
    assert!(report.snapshot.state.log_summaries.is_empty());
    assert_eq!(report.snapshot.state.current_location.as_deref(), Some("公会"));
}

#[tokio::test]
async fn test_ledger_records_every_balance_change_once() {
    let app = test_app(fast_settings());

    let first = expect_applied(
        run_turn(
            &app,
            "s1",
            ServiceKind::State,
            response(json!([{"action": "set", "key": "gameState.character.currency", "value": 500}])),
        )
        .await,
    );
    assert_eq!(first.projected_ledger.len(), 1);

    let second = expect_applied(
        run_turn(
            &app,
            "s1",
            ServiceKind::State,
            response(json!([
                {"action": "apply_econ_delta", "value": {"account": "character.currency", "delta": -120, "reason": "购买回复药"}},
                {"action": "add", "key": "gameState.familia.funds", "value": 1000}
            ])),
        )
        .await,
    );
    assert!(!second.rolled_back, "logs: {:?}", second.logs);
    assert_eq!(second.projected_ledger.len(), 1);
    assert_eq!(second.projected_ledger[0].account, EconomicAccount::FamiliaFunds);

    let ledger = &second.snapshot.state.economic_ledger;
    assert_eq!(ledger.len(), 3);
    assert_eq!(second.snapshot.state.character.currency, 380);
    assert_eq!(second.snapshot.state.familia.funds, 1000);
    assert!(ledger.iter().any(|entry| entry.reason == "购买回复药" && entry.delta == -120));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let app = test_app(fast_settings());
    let raw = response(json!([{"action": "set", "key": "currentLocation", "value": "酒馆"}]));

    expect_applied(run_turn(&app, "alice", ServiceKind::Story, raw).await);

    let ids = app.sessions.list_ids().await.expect("list");
    assert_eq!(ids, vec!["alice".to_string()]);
    assert_eq!(app.sessions.load("bob").await.expect("load"), None);
}

//! E2E test helpers for constructing the engine stack.

use std::sync::Arc;

use serde_json::{json, Value};

use taverndb_domain::{SessionSnapshot, TavernCommand};
use taverndb_shared::ServiceKind;

use crate::app::App;
use crate::infrastructure::app_settings::EngineSettings;
use crate::infrastructure::clock::{FixedClock, FixedRandom};
use crate::infrastructure::memory_store::InMemoryKeyValueStore;
use crate::infrastructure::ports::KeyValueStore;
use crate::infrastructure::retry::RetryPolicy;
use crate::use_cases::commands::{normalize_commands, run_handlers, EconomyPolicy, HandlerContext};
use crate::use_cases::transaction::{apply_turn_transaction, TransactionOptions, TransactionResult};
use crate::use_cases::{TurnOutcome, TurnReport};

/// Fixed wall clock for every E2E test (2023-11-14T22:13:20Z).
pub const T0_MILLIS: i64 = 1_700_000_000_000;

/// Settings with millisecond retries and room for lanes to run side by side.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy::new(3, 1),
        queue_max_concurrent: 4,
        ..EngineSettings::default()
    }
}

/// App over a fresh in-memory store with deterministic clock and dice.
pub fn test_app(settings: EngineSettings) -> App {
    test_app_with_store(settings, Arc::new(InMemoryKeyValueStore::new()))
}

pub fn test_app_with_store(settings: EngineSettings, store: Arc<dyn KeyValueStore>) -> App {
    App::with_ports(
        settings,
        store,
        Arc::new(FixedClock::at_millis(T0_MILLIS)),
        Arc::new(FixedRandom(10)),
    )
}

/// Wrap a command array in a service response document.
pub fn response(commands: Value) -> String {
    json!({ "logs": [], "tavern_commands": commands }).to_string()
}

/// Submit one turn whose service call returns `raw` and wait for it.
pub async fn run_turn(app: &App, session_id: &str, service: ServiceKind, raw: impl Into<String>) -> TurnOutcome {
    let raw = raw.into();
    app.submit_turn(session_id, service, move |_| {
        let raw = raw.clone();
        async move { Ok::<_, anyhow::Error>(raw) }
    })
    .join()
    .await
    .expect("turn task should complete")
}

pub fn expect_applied(outcome: TurnOutcome) -> TurnReport {
    match outcome {
        TurnOutcome::Applied(report) => *report,
        TurnOutcome::Unparseable { raw, error } => {
            panic!("expected applied turn, got unparseable ({:?}): {}", error, raw)
        }
    }
}

/// Run a batch straight through the transaction engine with the default handlers.
pub fn transact(base: &SessionSnapshot, commands: &[TavernCommand], options: &TransactionOptions) -> TransactionResult {
    let clock = FixedClock::at_millis(T0_MILLIS);
    let random = FixedRandom(10);
    let economy = EconomyPolicy::default();
    let normalized = normalize_commands(commands);
    let ctx = HandlerContext::new(&clock, &random, &economy);
    apply_turn_transaction(
        base,
        commands,
        |state| run_handlers(state, &normalized, &ctx),
        options,
        &clock,
        &random,
    )
}

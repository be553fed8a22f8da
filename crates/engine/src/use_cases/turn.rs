//! Turn pipeline: one raw service response in, one committed (or rolled back)
//! session snapshot out.
//!
//! Steps: extract commands, stamp the service source, guard, load the
//! session, check batch rules (log pairing, at most one global-state row),
//! apply the transaction, project ledger entries for balance changes no
//! handler recorded, persist.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use taverndb_domain::sheet::{LOG_OUTLINE, LOG_SUMMARY, SYS_GLOBAL_STATE};
use taverndb_domain::{
    append_ledger_entries, Action, EconomicAccount, LedgerEntry, ReasonCode, SessionSnapshot,
    SystemLogEntry, TavernCommand,
};
use taverndb_shared::ServiceKind;

use crate::infrastructure::app_settings::{EngineSettings, DEFAULT_LEDGER_LIMIT};
use crate::infrastructure::ports::{ClockPort, RandomPort, RepoError};
use crate::infrastructure::session_repository::SessionRepository;
use crate::use_cases::commands::{normalize_commands, run_handlers, EconomyPolicy, HandlerContext};
use crate::use_cases::guard::{CommandGuard, GuardReject};
use crate::use_cases::ledger::collect_economic_ledger_entries;
use crate::use_cases::repair::extract_service_commands;
use crate::use_cases::transaction::{
    apply_turn_transaction, reject_turn_transaction, TransactionOptions, TransactionResult,
};

const PAIRING_LOG_TEXT: &str = "记忆写入失败：LOG_Summary 与 LOG_Outline 必须成对写入，本批次已拒绝。";
const GLOBAL_STATE_LOG_TEXT: &str = "全局状态写入失败：SYS_GlobalState 每批次最多写入一行，本批次已拒绝。";

const SHEET_ID_KEYS: [&str; 4] = ["sheetId", "sheet_id", "sheet", "tableId"];
const ROWS_KEYS: [&str; 4] = ["rows", "row", "records", "data"];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Session storage failed: {0}")]
    Storage(#[from] RepoError),
}

/// Pipeline policy
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub transaction: TransactionOptions,
    pub economy: EconomyPolicy,
    pub ledger_limit: usize,
    pub enforce_log_pairing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transaction: TransactionOptions::default(),
            economy: EconomyPolicy::default(),
            ledger_limit: DEFAULT_LEDGER_LIMIT,
            enforce_log_pairing: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut economy = EconomyPolicy::default();
        if let Some(floor) = settings.currency_floor {
            economy = economy.with_floor(EconomicAccount::CharacterCurrency, floor);
        }
        Self {
            transaction: TransactionOptions {
                journal_limit: settings.journal_limit,
                ..TransactionOptions::default()
            },
            economy,
            ledger_limit: settings.ledger_limit,
            enforce_log_pairing: settings.enforce_log_pairing,
        }
    }
}

/// What happened to one turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub session_id: String,
    pub service: ServiceKind,
    pub tx_id: Option<String>,
    pub rolled_back: bool,
    pub reason: Option<ReasonCode>,
    pub has_error: bool,
    pub logs: Vec<SystemLogEntry>,
    pub applied_patches: usize,
    pub rejected: Vec<GuardReject>,
    /// Entries appended by projection, not by handlers
    pub projected_ledger: Vec<LedgerEntry>,
    pub repair_note: Option<String>,
    /// Player choices carried by the response document
    pub action_options: Vec<String>,
    pub snapshot: SessionSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Applied(Box<TurnReport>),
    /// Nothing recoverable in the response; the session was not touched
    Unparseable { raw: String, error: Option<String> },
}

pub struct TurnPipeline {
    sessions: SessionRepository,
    /// Held from load to save so concurrent turns never interleave
    commit_lock: Mutex<()>,
    guard: CommandGuard,
    clock: Arc<dyn ClockPort>,
    random: Arc<dyn RandomPort>,
    config: PipelineConfig,
}

impl TurnPipeline {
    pub fn new(
        sessions: SessionRepository,
        guard: CommandGuard,
        clock: Arc<dyn ClockPort>,
        random: Arc<dyn RandomPort>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sessions,
            commit_lock: Mutex::new(()),
            guard,
            clock,
            random,
            config,
        }
    }

    pub async fn run(
        &self,
        session_id: &str,
        raw_response: &str,
        service: ServiceKind,
    ) -> Result<TurnOutcome, PipelineError> {
        let extracted = extract_service_commands(raw_response);
        if extracted.is_unparseable() {
            tracing::warn!(
                session_id,
                service = %service,
                error = extracted.parse_error.as_deref().unwrap_or("-"),
                "Unparseable service response"
            );
            return Ok(TurnOutcome::Unparseable {
                raw: extracted.raw_response,
                error: extracted.parse_error,
            });
        }
        if let Some(note) = &extracted.repair_note {
            tracing::warn!(
                session_id,
                service = %service,
                repair_note = %note,
                fallback = extracted.used_fallback(),
                "Service response repaired"
            );
        }

        let commands = stamp_source(extracted.commands(), service);
        let guarded = self.guard.filter(service, commands);

        let _commit = self.commit_lock.lock().await;
        let base = self.sessions.load_or_default(session_id).await?;

        let result = self.apply(&base, &guarded.commands);
        let mut snapshot = result.snapshot;
        let projected_ledger = if result.rolled_back {
            Vec::new()
        } else {
            self.project_ledger(&base, &mut snapshot, &guarded.commands)
        };

        self.sessions.save(session_id, &snapshot).await?;
        tracing::info!(
            session_id,
            service = %service,
            commands = guarded.commands.len(),
            rejected = guarded.rejected.len(),
            rolled_back = result.rolled_back,
            "Turn processed"
        );

        Ok(TurnOutcome::Applied(Box::new(TurnReport {
            session_id: session_id.to_string(),
            service,
            tx_id: result.event.as_ref().map(|event| event.tx_id().to_string()),
            rolled_back: result.rolled_back,
            reason: result.event.as_ref().and_then(|event| event.reason()),
            has_error: result.has_error,
            logs: result.logs,
            applied_patches: result.applied_patches,
            rejected: guarded.rejected,
            projected_ledger,
            repair_note: extracted.repair_note,
            action_options: extracted.action_options,
            snapshot,
        })))
    }

    fn apply(&self, base: &SessionSnapshot, commands: &[TavernCommand]) -> TransactionResult {
        let options = &self.config.transaction;
        if let Some((rule, text)) = self.batch_violation(commands) {
            tracing::warn!(commands = commands.len(), rule, "Batch rule violated");
            let now_ms = self.clock.now_millis();
            let log = SystemLogEntry::system(format!("{}-{}", rule, now_ms), text, now_ms);
            return reject_turn_transaction(
                base,
                commands,
                vec![log],
                options,
                self.clock.as_ref(),
                self.random.as_ref(),
            );
        }

        let normalized = normalize_commands(commands);
        let ctx = HandlerContext::new(self.clock.as_ref(), self.random.as_ref(), &self.config.economy);
        apply_turn_transaction(
            base,
            commands,
            |state| run_handlers(state, &normalized, &ctx),
            options,
            self.clock.as_ref(),
            self.random.as_ref(),
        )
    }

    /// First batch-level rule the commands break, as `(rule, log text)`.
    fn batch_violation(&self, commands: &[TavernCommand]) -> Option<(&'static str, &'static str)> {
        if self.config.enforce_log_pairing && !is_log_pairing_complete(commands) {
            return Some(("pairing", PAIRING_LOG_TEXT));
        }
        if global_state_row_count(commands) > 1 {
            return Some(("global-state", GLOBAL_STATE_LOG_TEXT));
        }
        None
    }

    /// Append projected entries for accounts the handlers left unrecorded.
    fn project_ledger(
        &self,
        base: &SessionSnapshot,
        snapshot: &mut SessionSnapshot,
        commands: &[TavernCommand],
    ) -> Vec<LedgerEntry> {
        let recorded: BTreeSet<EconomicAccount> =
            appended_entries(&base.state.economic_ledger, &snapshot.state.economic_ledger)
                .iter()
                .map(|entry| entry.account)
                .collect();

        let timestamp = snapshot.state.time_label(&self.clock.now().to_rfc3339());
        let entries: Vec<LedgerEntry> = collect_economic_ledger_entries(
            &base.state,
            &snapshot.state,
            commands,
            snapshot.state.turn,
            &timestamp,
            self.random.as_ref(),
        )
        .into_iter()
        .filter(|entry| !recorded.contains(&entry.account))
        .collect();

        if !entries.is_empty() {
            tracing::debug!(entries = entries.len(), "Projected ledger entries");
            append_ledger_entries(
                &mut snapshot.state.economic_ledger,
                entries.clone(),
                self.config.ledger_limit.max(1),
            );
        }
        entries
    }
}

/// Entries handlers appended this turn: everything after the base ledger's
/// last entry, which retention may have shifted forward.
fn appended_entries<'a>(base: &[LedgerEntry], current: &'a [LedgerEntry]) -> &'a [LedgerEntry] {
    let Some(last) = base.last() else {
        return current;
    };
    match current.iter().rposition(|entry| entry == last) {
        Some(position) => &current[position + 1..],
        None => current,
    }
}

/// Commands without a source are stamped with the issuing service's.
fn stamp_source(commands: Vec<TavernCommand>, service: ServiceKind) -> Vec<TavernCommand> {
    commands
        .into_iter()
        .map(|mut command| {
            if command.source().is_none() {
                command.source = Some(service.source().to_string());
            }
            command
        })
        .collect()
}

/// Payload objects of a sheet upsert; the value may be one payload or an array.
fn upsert_payloads(command: &TavernCommand) -> Vec<&Value> {
    if Action::parse(&command.action) != Action::UpsertSheetRows {
        return Vec::new();
    }
    match command.value.as_ref() {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

fn payload_sheet(payload: &Value) -> Option<&str> {
    SHEET_ID_KEYS
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
}

/// A batch writing one of the memory logs must also write the other.
pub fn is_log_pairing_complete(commands: &[TavernCommand]) -> bool {
    let mut summary = false;
    let mut outline = false;
    for command in commands {
        match Action::parse(&command.action) {
            Action::AppendLogSummary => summary = true,
            Action::AppendLogOutline => outline = true,
            _ => {}
        }
        for payload in upsert_payloads(command) {
            match payload_sheet(payload) {
                Some(LOG_SUMMARY) => summary = true,
                Some(LOG_OUTLINE) => outline = true,
                _ => {}
            }
        }
    }
    summary == outline
}

/// `SYS_GlobalState` rows written by the whole batch.
pub fn global_state_row_count(commands: &[TavernCommand]) -> usize {
    commands
        .iter()
        .flat_map(upsert_payloads)
        .filter(|payload| payload_sheet(payload) == Some(SYS_GLOBAL_STATE))
        .map(|payload| match ROWS_KEYS.iter().find_map(|key| payload.get(*key)) {
            Some(Value::Array(rows)) => rows.len(),
            _ => 1,
        })
        .sum()
}

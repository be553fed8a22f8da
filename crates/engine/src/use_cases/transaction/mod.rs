//! Turn transaction engine.
//!
//! `apply_turn_transaction` runs a command batch through the handlers on a
//! copy of the session, validates the proposed sheet patches, and either
//! commits the new state or returns the base state with only `TableMeta`
//! bookkeeping changed. It never fails: every outcome is a valid snapshot.
//!
//! Check order, first failure wins:
//!
//! 1. atomic batch with a handler error -> `apply_error`
//! 2. patch source not allowed on its sheet -> `source_not_allowed`
//! 3. stale version or lock violation -> first conflict's reason
//!
//! Checks 2 and 3 apply to every batch, atomic or not. Conflict stats count
//! each conflict under its own reason.

pub mod version_store;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex_lite::Regex;

use taverndb_domain::{
    Action, GameState, JournalEntry, PatchConflict, PatchTrace, ReasonCode, SessionSnapshot,
    SheetPatch, SourceOwnershipRules, SystemLogEntry, TavernCommand, TxEvent, TxStatus,
};

use crate::infrastructure::app_settings::DEFAULT_JOURNAL_LIMIT;
use crate::infrastructure::clock::base36_suffix;
use crate::infrastructure::ports::{ClockPort, RandomPort};
use crate::use_cases::commands::HandlerResult;

static SOFT_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)失败|异常|错误|invalid|missing|out of bounds").expect("valid regex")
});

// =============================================================================
// Options and Result
// =============================================================================

/// Per-call transaction policy
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Treat any multi-command batch as all-or-nothing
    pub force_atomic: bool,
    pub ownership_rules: SourceOwnershipRules,
    /// Replaces the built-in transactional action table when set
    pub transactional_actions: Option<Vec<Action>>,
    pub journal_limit: usize,
    /// Journal turn id; falls back to the first command's transaction marker
    pub turn_id: Option<String>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            force_atomic: false,
            ownership_rules: SourceOwnershipRules::default(),
            transactional_actions: None,
            journal_limit: DEFAULT_JOURNAL_LIMIT,
            turn_id: None,
        }
    }
}

impl TransactionOptions {
    fn is_transactional(&self, action: &Action) -> bool {
        match &self.transactional_actions {
            Some(table) => table.contains(action),
            None => action.is_transactional(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// Committed snapshot, or the base snapshot plus meta bookkeeping on rollback
    pub snapshot: SessionSnapshot,
    pub rolled_back: bool,
    pub has_error: bool,
    pub logs: Vec<SystemLogEntry>,
    pub applied_patches: usize,
    /// `None` only for an empty batch
    pub event: Option<TxEvent>,
}

impl TransactionResult {
    pub fn reason(&self) -> Option<ReasonCode> {
        self.event.as_ref().and_then(TxEvent::reason)
    }

    pub fn tx_id(&self) -> Option<&str> {
        self.event.as_ref().map(TxEvent::tx_id)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Whether the batch must apply all-or-nothing.
///
/// A batch of at most one command never is. Otherwise any of: `force_atomic`,
/// an explicit `atomic`/`transaction` flag, a shared transaction marker, or
/// at least one transactional action.
pub fn is_atomic_batch(commands: &[TavernCommand], options: &TransactionOptions) -> bool {
    if commands.len() <= 1 {
        return false;
    }
    options.force_atomic
        || commands.iter().any(|command| {
            command.requests_atomic()
                || command.transaction_marker().is_some()
                || options.is_transactional(&Action::parse(&command.action))
        })
}

/// Handler logs that read like a failure count as an error even without `has_error`.
pub fn has_soft_error(logs: &[SystemLogEntry]) -> bool {
    logs.iter().any(|log| SOFT_ERROR_RE.is_match(&log.text))
}

/// Run `run_handlers` over the base state and commit or roll back the result.
pub fn apply_turn_transaction<F>(
    base: &SessionSnapshot,
    commands: &[TavernCommand],
    run_handlers: F,
    options: &TransactionOptions,
    clock: &dyn ClockPort,
    random: &dyn RandomPort,
) -> TransactionResult
where
    F: FnOnce(&GameState) -> HandlerResult,
{
    if commands.is_empty() {
        return TransactionResult {
            snapshot: base.clone(),
            rolled_back: false,
            has_error: false,
            logs: Vec::new(),
            applied_patches: 0,
            event: None,
        };
    }

    let atomic = is_atomic_batch(commands, options);
    let outcome = run_handlers(&base.state);
    let errored = outcome.has_error || has_soft_error(&outcome.logs);
    let attempt = Attempt::new(base, commands, options, clock, random);

    if atomic && errored {
        return attempt.roll_back(ReasonCode::ApplyError, Vec::new(), outcome);
    }

    let provenance = version_store::check_provenance(&outcome.sheet_patches, &options.ownership_rules);
    if !provenance.is_empty() {
        return attempt.roll_back(ReasonCode::SourceNotAllowed, provenance, outcome);
    }

    let conflicts = version_store::check_versions_and_locks(&outcome.sheet_patches, &base.table_meta);
    if let Some(first) = conflicts.first() {
        let reason = first.reason;
        return attempt.roll_back(reason, conflicts, outcome);
    }

    attempt.commit(atomic, errored, outcome)
}

/// Reject a batch without running it, as an atomic `apply_error` rollback.
///
/// Used by callers whose own batch-level checks failed; `logs` explain why.
pub fn reject_turn_transaction(
    base: &SessionSnapshot,
    commands: &[TavernCommand],
    logs: Vec<SystemLogEntry>,
    options: &TransactionOptions,
    clock: &dyn ClockPort,
    random: &dyn RandomPort,
) -> TransactionResult {
    let outcome = HandlerResult {
        new_state: base.state.clone(),
        has_error: true,
        logs,
        sheet_patches: Vec::new(),
    };
    Attempt::new(base, commands, options, clock, random).roll_back(ReasonCode::ApplyError, Vec::new(), outcome)
}

/// Bookkeeping shared by the commit and rollback paths of one attempt.
struct Attempt<'a> {
    base: &'a SessionSnapshot,
    commands: &'a [TavernCommand],
    options: &'a TransactionOptions,
    tx_id: String,
    now_ms: i64,
}

impl<'a> Attempt<'a> {
    fn new(
        base: &'a SessionSnapshot,
        commands: &'a [TavernCommand],
        options: &'a TransactionOptions,
        clock: &dyn ClockPort,
        random: &dyn RandomPort,
    ) -> Self {
        let now_ms = clock.now_millis();
        Self {
            base,
            commands,
            options,
            tx_id: format!("tx-{}-{}", now_ms, base36_suffix(random, 6)),
            now_ms,
        }
    }

    fn commit(self, atomic: bool, errored: bool, outcome: HandlerResult) -> TransactionResult {
        let patches = outcome.sheet_patches;
        let mut table_meta = self.base.table_meta.clone();
        version_store::commit(&mut table_meta, &patches, self.now_ms);
        table_meta.push_journal(
            self.journal_entry(TxStatus::Committed, None, patches.len(), &patches),
            self.options.journal_limit.max(1),
        );

        let event = TxEvent::Committed {
            tx_id: self.tx_id.clone(),
            command_count: self.commands.len(),
            applied_patches: patches.len(),
        };
        let mut logs = outcome.logs;
        if atomic {
            logs.push(event.to_log(self.now_ms));
        }

        tracing::info!(
            tx_id = %self.tx_id,
            commands = self.commands.len(),
            patches = patches.len(),
            atomic,
            has_error = errored,
            "Turn transaction committed"
        );

        TransactionResult {
            snapshot: SessionSnapshot {
                state: outcome.new_state,
                table_meta,
            },
            rolled_back: false,
            has_error: errored,
            logs,
            applied_patches: patches.len(),
            event: Some(event),
        }
    }

    fn roll_back(
        self,
        reason: ReasonCode,
        conflicts: Vec<PatchConflict>,
        outcome: HandlerResult,
    ) -> TransactionResult {
        let patches = outcome.sheet_patches;
        let mut table_meta = self.base.table_meta.clone();
        if conflicts.is_empty() {
            table_meta.conflict_stats.record(reason, 1, self.now_ms);
        }
        for conflict in &conflicts {
            table_meta.conflict_stats.record(conflict.reason, 1, self.now_ms);
        }
        table_meta.push_journal(
            self.journal_entry(TxStatus::RolledBack, Some(reason), 0, &patches),
            self.options.journal_limit.max(1),
        );

        tracing::warn!(
            tx_id = %self.tx_id,
            reason = %reason,
            conflicts = conflicts.len(),
            commands = self.commands.len(),
            patches = patches.len(),
            "Turn transaction rolled back"
        );

        let event = TxEvent::RolledBack {
            tx_id: self.tx_id.clone(),
            reason,
            command_count: self.commands.len(),
            patch_count: patches.len(),
            conflicts,
        };
        let mut logs = outcome.logs;
        logs.push(event.to_log(self.now_ms));

        TransactionResult {
            snapshot: SessionSnapshot {
                state: self.base.state.clone(),
                table_meta,
            },
            rolled_back: true,
            has_error: true,
            logs,
            applied_patches: 0,
            event: Some(event),
        }
    }

    fn journal_entry(
        &self,
        status: TxStatus,
        reason: Option<ReasonCode>,
        applied_patches: usize,
        patches: &[SheetPatch],
    ) -> JournalEntry {
        let mut seen = BTreeSet::new();
        let sources = self
            .commands
            .iter()
            .map(TavernCommand::source_label)
            .filter(|label| seen.insert(label.clone()))
            .collect();

        JournalEntry {
            tx_id: self.tx_id.clone(),
            turn_id: self
                .options
                .turn_id
                .clone()
                .or_else(|| self.commands.iter().find_map(TavernCommand::transaction_marker)),
            status,
            reason,
            command_count: self.commands.len(),
            applied_patches,
            patches: patches
                .iter()
                .map(|patch| PatchTrace {
                    sheet_id: patch.sheet_id.clone(),
                    row_id: patch.row_id.clone(),
                    operation: patch.operation,
                    changed_fields: patch.changed_fields.clone(),
                })
                .collect(),
            sources,
            timestamp: self.now_ms,
        }
    }
}

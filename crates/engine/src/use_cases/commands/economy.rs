//! Economy handlers and the per-account floor policy.

use std::collections::BTreeMap;

use serde_json::Value;

use taverndb_domain::{append_ledger_entries, Command, DomainError, EconomicAccount, GameState, LedgerEntry};

use super::payload::{as_int, Payload};
use super::{generated_id, HandlerContext};

/// Entries retained by the ledger handlers.
pub(crate) const HANDLER_LEDGER_LIMIT: usize = 500;

const ACCOUNT_KEYS: [&str; 4] = ["account", "账户", "key", "path"];
const DELTA_KEYS: [&str; 3] = ["delta", "变动", "amount"];
const REASON_KEYS: [&str; 3] = ["reason", "原因", "note"];

/// Optional minimum balance per account.
///
/// Balances may go negative unless a floor is configured; a delta that would
/// land below the floor is rejected rather than clamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EconomyPolicy {
    floors: BTreeMap<EconomicAccount, i64>,
}

impl EconomyPolicy {
    pub fn with_floor(mut self, account: EconomicAccount, floor: i64) -> Self {
        self.floors.insert(account, floor);
        self
    }

    pub fn floor(&self, account: EconomicAccount) -> Option<i64> {
        self.floors.get(&account).copied()
    }
}

pub(super) fn apply_econ_delta(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let account: EconomicAccount = payload.require_text(&ACCOUNT_KEYS)?.parse()?;
    let delta = payload.require_int(&DELTA_KEYS)?;
    let reason = payload
        .text(&REASON_KEYS)
        .unwrap_or_else(|| format!("经济变动 {}", account));

    let before = account.read(state);
    let after = before.checked_add(delta).ok_or_else(|| {
        DomainError::constraint(format!("{} delta {} overflows {}", command.action, delta, account))
    })?;
    if let Some(floor) = ctx.economy.floor(account) {
        if after < floor {
            return Err(DomainError::constraint(format!(
                "{} would take {} to {} (floor {})",
                command.action, account, after, floor
            )));
        }
    }

    account.write(state, after);
    let entry = LedgerEntry {
        id: ledger_id(account, ctx),
        turn: state.turn,
        timestamp: ctx.time_label(state),
        account,
        before,
        delta,
        after,
        reason,
        command_ref: Some(format!("{}:{}", command.index + 1, command.action)),
    };
    append_ledger_entries(&mut state.economic_ledger, vec![entry], HANDLER_LEDGER_LIMIT);
    Ok(())
}

/// Record ledger rows without moving any balance.
pub(super) fn append_econ_ledger(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let action = command.action.as_str();
    let rows: Vec<&Value> = match command.fields_payload() {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value) if value.is_object() => match value.get("rows").or_else(|| value.get("entries")) {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => vec![value],
        },
        _ => Vec::new(),
    };
    if rows.is_empty() {
        return Err(DomainError::validation(format!("{} requires ledger rows", action)));
    }

    let mut entries = Vec::with_capacity(rows.len());
    for (position, row) in rows.into_iter().enumerate() {
        let Value::Object(map) = row else {
            return Err(DomainError::validation(format!("{} row {} must be an object", action, position)));
        };
        let payload = Payload::new(action, map);
        let account: EconomicAccount = payload.require_text(&ACCOUNT_KEYS)?.parse()?;
        let delta = payload.require_int(&DELTA_KEYS)?;
        let before = payload.int(&["before", "变动前"])?;
        let after = payload.int(&["after", "变动后"])?;
        let (before, after) = match (before, after) {
            (Some(before), Some(after)) if before.checked_add(delta) != Some(after) => {
                return Err(DomainError::validation(format!(
                    "{} row {} is inconsistent: {} + {} != {}",
                    action, position, before, delta, after
                )))
            }
            (Some(before), Some(after)) => (before, after),
            (Some(before), None) => (before, before.saturating_add(delta)),
            (None, Some(after)) => (after.saturating_sub(delta), after),
            (None, None) => {
                let current = account.read(state);
                (current.saturating_sub(delta), current)
            }
        };

        entries.push(LedgerEntry {
            id: payload
                .text(&["id", "ledger_id"])
                .unwrap_or_else(|| ledger_id(account, ctx)),
            turn: map
                .get("turn")
                .or_else(|| map.get("回合"))
                .and_then(as_int)
                .and_then(|turn| u32::try_from(turn).ok())
                .unwrap_or(state.turn),
            timestamp: payload
                .text(&["timestamp", "时间"])
                .unwrap_or_else(|| ctx.time_label(state)),
            account,
            before,
            delta,
            after,
            reason: payload
                .text(&REASON_KEYS)
                .unwrap_or_else(|| format!("流水记录 {}", account)),
            command_ref: Some(format!("{}:{}", command.index + 1, action)),
        });
    }

    append_ledger_entries(&mut state.economic_ledger, entries, HANDLER_LEDGER_LIMIT);
    Ok(())
}

fn ledger_id(account: EconomicAccount, ctx: &HandlerContext<'_>) -> String {
    generated_id(&format!("ECO_{}", account.id_fragment()), ctx)
}

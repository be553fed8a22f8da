//! Economic ledger projection.
//!
//! Reconciles tracked account balances between two states and describes each
//! change as a ledger entry. Projection is read-only; callers append the
//! entries with `append_ledger_entries`.

use taverndb_domain::{EconomicAccount, GameState, LedgerEntry, TavernCommand};

use crate::infrastructure::clock::base36_suffix;
use crate::infrastructure::ports::RandomPort;

/// Most command references recorded on one entry.
const MAX_COMMAND_REFS: usize = 5;

/// One entry per account whose balance differs between `before` and `after`.
pub fn collect_economic_ledger_entries(
    before: &GameState,
    after: &GameState,
    commands: &[TavernCommand],
    turn: u32,
    timestamp: &str,
    random: &dyn RandomPort,
) -> Vec<LedgerEntry> {
    EconomicAccount::ALL
        .into_iter()
        .filter_map(|account| {
            let old = account.read(before);
            let new = account.read(after);
            if old == new {
                return None;
            }
            let refs = command_refs(commands, account);
            let reason = if refs.is_empty() {
                format!("状态推导更新 {}", account)
            } else {
                format!("命令批次更新 {}", account)
            };
            Some(LedgerEntry {
                id: format!("ECO_{}_{}_{}", turn, account.id_fragment(), base36_suffix(random, 5)),
                turn,
                timestamp: timestamp.to_string(),
                account,
                before: old,
                delta: new.saturating_sub(old),
                after: new,
                reason,
                command_ref: (!refs.is_empty()).then(|| refs.join(" | ")),
            })
        })
        .collect()
}

/// `<position>:<action>:<key>` for commands whose key path names the account.
fn command_refs(commands: &[TavernCommand], account: EconomicAccount) -> Vec<String> {
    commands
        .iter()
        .enumerate()
        .filter_map(|(index, command)| {
            let key = command_key(command)?;
            account
                .path_aliases()
                .iter()
                .any(|alias| key.contains(alias))
                .then(|| format!("{}:{}:{}", index + 1, command.normalized_action(), key))
        })
        .take(MAX_COMMAND_REFS)
        .collect()
}

fn command_key(command: &TavernCommand) -> Option<String> {
    let key = command
        .key
        .clone()
        .or_else(|| command.extra.get("path").and_then(|v| v.as_str()).map(str::to_string))?;
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clock::FixedRandom;
    use serde_json::json;

    fn states(currency: (i64, i64), funds: (i64, i64)) -> (GameState, GameState) {
        let mut before = GameState::default();
        before.character.currency = currency.0;
        before.familia.funds = funds.0;
        let mut after = before.clone();
        after.character.currency = currency.1;
        after.familia.funds = funds.1;
        (before, after)
    }

    #[test]
    fn test_unchanged_accounts_produce_nothing() {
        let (before, after) = states((10, 10), (5, 5));
        let entries = collect_economic_ledger_entries(&before, &after, &[], 3, "t", &FixedRandom(0));
        assert!(entries.is_empty());
    }

    #[test]
    fn test_command_batch_reason_and_refs() {
        let (before, after) = states((100, 70), (0, 0));
        let commands = vec![
            TavernCommand::new("set").with_key("gameState.currentLocation").with_value(json!("Bar")),
            TavernCommand::new("Add").with_key("gameState.角色.法利").with_value(json!(-30)),
        ];
        let entries = collect_economic_ledger_entries(&before, &after, &commands, 4, "第4日", &FixedRandom(1));

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.account, EconomicAccount::CharacterCurrency);
        assert_eq!((entry.before, entry.delta, entry.after), (100, -30, 70));
        assert_eq!(entry.reason, "命令批次更新 character.currency");
        assert_eq!(entry.command_ref.as_deref(), Some("2:add:gameState.角色.法利"));
        assert_eq!(entry.id, "ECO_4_character_currency_11111");
        assert_eq!(entry.timestamp, "第4日");
    }

    #[test]
    fn test_derived_change_has_no_ref() {
        let (before, after) = states((0, 0), (500, 650));
        let entries = collect_economic_ledger_entries(&before, &after, &[], 1, "t", &FixedRandom(0));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "状态推导更新 familia.funds");
        assert_eq!(entries[0].command_ref, None);
    }

    #[test]
    fn test_refs_are_capped() {
        let (before, after) = states((0, 7), (0, 0));
        let commands: Vec<_> = (0..7)
            .map(|_| TavernCommand::new("add").with_key("character.currency").with_value(json!(1)))
            .collect();
        let entries = collect_economic_ledger_entries(&before, &after, &commands, 1, "t", &FixedRandom(0));
        let refs = entries[0].command_ref.as_deref().unwrap_or_default();
        assert_eq!(refs.split(" | ").count(), MAX_COMMAND_REFS);
        assert!(refs.starts_with("1:add:character.currency"));
    }
}

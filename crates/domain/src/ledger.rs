//! Economic accounts and ledger entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::state::GameState;

/// A tracked monetary account inside the game state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EconomicAccount {
    #[serde(rename = "character.currency")]
    CharacterCurrency,
    #[serde(rename = "familia.funds")]
    FamiliaFunds,
}

impl EconomicAccount {
    pub const ALL: [EconomicAccount; 2] = [
        EconomicAccount::CharacterCurrency,
        EconomicAccount::FamiliaFunds,
    ];

    /// Dotted state path of the balance.
    pub fn path(self) -> &'static str {
        match self {
            EconomicAccount::CharacterCurrency => "character.currency",
            EconomicAccount::FamiliaFunds => "familia.funds",
        }
    }

    /// Path spellings a command may use to reference this account.
    pub fn path_aliases(self) -> &'static [&'static str] {
        match self {
            EconomicAccount::CharacterCurrency => &["character.currency", "角色.法利"],
            EconomicAccount::FamiliaFunds => &["familia.funds", "眷族.资金"],
        }
    }

    pub fn read(self, state: &GameState) -> i64 {
        match self {
            EconomicAccount::CharacterCurrency => state.character.currency,
            EconomicAccount::FamiliaFunds => state.familia.funds,
        }
    }

    pub fn write(self, state: &mut GameState, value: i64) {
        match self {
            EconomicAccount::CharacterCurrency => state.character.currency = value,
            EconomicAccount::FamiliaFunds => state.familia.funds = value,
        }
    }

    /// Identifier fragment used inside ledger ids.
    pub fn id_fragment(self) -> String {
        self.path().replace('.', "_")
    }
}

impl fmt::Display for EconomicAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for EconomicAccount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix("gameState.").unwrap_or(trimmed);
        Self::ALL
            .into_iter()
            .find(|account| account.path_aliases().contains(&trimmed))
            .ok_or_else(|| DomainError::parse(format!("Unknown economic account: {}", s)))
    }
}

/// One before/after record for an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub turn: u32,
    pub timestamp: String,
    pub account: EconomicAccount,
    pub before: i64,
    pub delta: i64,
    pub after: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_ref: Option<String>,
}

/// Append entries, dropping the oldest beyond `limit`.
pub fn append_ledger_entries(ledger: &mut Vec<LedgerEntry>, entries: Vec<LedgerEntry>, limit: usize) {
    ledger.extend(entries);
    if ledger.len() > limit {
        let overflow = ledger.len() - limit;
        ledger.drain(..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            turn: 1,
            timestamp: "t".into(),
            account: EconomicAccount::CharacterCurrency,
            before: 0,
            delta: 1,
            after: 1,
            reason: "r".into(),
            command_ref: None,
        }
    }

    #[test]
    fn test_account_parses_aliases() {
        assert_eq!(
            "gameState.角色.法利".parse::<EconomicAccount>(),
            Ok(EconomicAccount::CharacterCurrency)
        );
        assert_eq!(
            "familia.funds".parse::<EconomicAccount>(),
            Ok(EconomicAccount::FamiliaFunds)
        );
        assert!("character.hp".parse::<EconomicAccount>().is_err());
    }

    #[test]
    fn test_read_write_account() {
        let mut state = GameState::default();
        EconomicAccount::FamiliaFunds.write(&mut state, 900);
        assert_eq!(EconomicAccount::FamiliaFunds.read(&state), 900);
        assert_eq!(state.familia.funds, 900);
    }

    #[test]
    fn test_append_trims_oldest() {
        let mut ledger = vec![entry("a"), entry("b")];
        append_ledger_entries(&mut ledger, vec![entry("c"), entry("d")], 3);
        let ids: Vec<_> = ledger.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_account_serializes_as_path() {
        let json = serde_json::to_string(&EconomicAccount::CharacterCurrency).expect("serialize");
        assert_eq!(json, "\"character.currency\"");
    }
}

//! Source-ownership policy for protected sheets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sheet::{CHARACTER_RESOURCES, LOG_OUTLINE, LOG_SUMMARY, SYS_GLOBAL_STATE};

/// Which writers may patch which sheets
///
/// A sheet listed in `protected_sheets` accepts a patch only when the patch
/// source starts with one of that sheet's prefixes or one of the global
/// `allowed_source_prefixes`. Sheets not listed are open to every writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceOwnershipRules {
    /// Sheet id -> allowed source prefixes for that sheet
    pub protected_sheets: BTreeMap<String, Vec<String>>,
    /// Prefixes allowed on every protected sheet
    pub allowed_source_prefixes: Vec<String>,
    /// Let patches without a source through (legacy command paths never stamp one)
    pub allow_unstamped: bool,
}

impl Default for SourceOwnershipRules {
    fn default() -> Self {
        let mut protected_sheets = BTreeMap::new();
        for sheet in [LOG_SUMMARY, LOG_OUTLINE] {
            protected_sheets.insert(sheet.to_string(), vec!["ms:memory".to_string()]);
        }
        for sheet in [SYS_GLOBAL_STATE, CHARACTER_RESOURCES] {
            protected_sheets.insert(sheet.to_string(), vec!["ms:state-writer".to_string()]);
        }
        Self {
            protected_sheets,
            allowed_source_prefixes: Vec::new(),
            allow_unstamped: true,
        }
    }
}

impl SourceOwnershipRules {
    /// No protected sheets at all.
    pub fn open() -> Self {
        Self {
            protected_sheets: BTreeMap::new(),
            allowed_source_prefixes: Vec::new(),
            allow_unstamped: true,
        }
    }

    pub fn protect(mut self, sheet_id: impl Into<String>, prefixes: &[&str]) -> Self {
        self.protected_sheets.insert(
            sheet_id.into(),
            prefixes.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn is_protected(&self, sheet_id: &str) -> bool {
        self.protected_sheets.contains_key(sheet_id)
    }

    pub fn is_allowed(&self, sheet_id: &str, source: &str) -> bool {
        let Some(prefixes) = self.protected_sheets.get(sheet_id) else {
            return true;
        };
        let source = source.trim();
        if source.is_empty() {
            return self.allow_unstamped;
        }
        prefixes
            .iter()
            .chain(self.allowed_source_prefixes.iter())
            .any(|prefix| source.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_writer_prefix_is_not_matched_by_state() {
        let rules = SourceOwnershipRules::default();
        assert!(!rules.is_allowed(SYS_GLOBAL_STATE, "ms:state"));
        assert!(rules.is_allowed(SYS_GLOBAL_STATE, "ms:state-writer"));
    }

    #[test]
    fn test_log_sheets_owned_by_memory() {
        let rules = SourceOwnershipRules::default();
        assert!(rules.is_allowed(LOG_SUMMARY, "ms:memory"));
        assert!(rules.is_allowed(LOG_SUMMARY, "ms:memory:am"));
        assert!(!rules.is_allowed(LOG_OUTLINE, "ms:story"));
    }

    #[test]
    fn test_unprotected_sheet_is_open() {
        let rules = SourceOwnershipRules::default();
        assert!(rules.is_allowed("NPC_Registry", "ms:story"));
    }

    #[test]
    fn test_unstamped_policy() {
        let mut rules = SourceOwnershipRules::default();
        assert!(rules.is_allowed(LOG_SUMMARY, ""));
        rules.allow_unstamped = false;
        assert!(!rules.is_allowed(LOG_SUMMARY, "  "));
    }

    #[test]
    fn test_global_prefix_applies_to_all_protected_sheets() {
        let mut rules = SourceOwnershipRules::default();
        rules.allowed_source_prefixes.push("gm:".into());
        assert!(rules.is_allowed(LOG_SUMMARY, "gm:override"));
        assert!(rules.is_allowed(CHARACTER_RESOURCES, "gm:override"));
    }

    #[test]
    fn test_open_rules_allow_every_writer() {
        let rules = SourceOwnershipRules::open();
        assert!(!rules.is_protected(LOG_SUMMARY));
        assert!(rules.is_allowed(LOG_SUMMARY, "ms:state"));
        assert!(rules.is_allowed(SYS_GLOBAL_STATE, "ms:story"));
    }

    #[test]
    fn test_protect_adds_a_custom_sheet() {
        let rules = SourceOwnershipRules::open().protect("QUEST_Active", &["ms:story", "gm:"]);
        assert!(rules.is_protected("QUEST_Active"));
        assert!(!rules.is_protected(LOG_SUMMARY));
        assert!(rules.is_allowed("QUEST_Active", "gm:quest"));
        assert!(!rules.is_allowed("QUEST_Active", "ms:state"));
    }
}

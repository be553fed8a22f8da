//! Engine-owned table metadata: versions, locks, conflict counters, journal.
//!
//! Only the turn transaction engine writes this structure. It travels next to
//! the `GameState` (see `SessionSnapshot`) and is committed or rolled back
//! together with it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sheet::{row_version_key, PatchOperation};

/// Why a turn transaction was rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// A handler reported an error inside an atomic batch
    ApplyError,
    /// A writer patched a protected sheet it does not own
    SourceNotAllowed,
    /// Stale `expectedSheetVersion`
    SheetVersionConflict,
    /// Stale `expectedRowVersion`
    RowVersionConflict,
    /// Row locked by another owner
    RowLocked,
    /// Cell locked by another owner
    CellLocked,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::ApplyError => "apply_error",
            ReasonCode::SourceNotAllowed => "source_not_allowed",
            ReasonCode::SheetVersionConflict => "sheet_version_conflict",
            ReasonCode::RowVersionConflict => "row_version_conflict",
            ReasonCode::RowLocked => "row_locked",
            ReasonCode::CellLocked => "cell_locked",
        }
    }

    /// Version and lock failures are concurrency conflicts; the rest are validation failures.
    pub fn is_concurrency_conflict(self) -> bool {
        matches!(
            self,
            ReasonCode::SheetVersionConflict
                | ReasonCode::RowVersionConflict
                | ReasonCode::RowLocked
                | ReasonCode::CellLocked
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative conflict counters; never decremented
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStats {
    pub total: u64,
    #[serde(default)]
    pub by_reason: BTreeMap<ReasonCode, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl ConflictStats {
    pub fn record(&mut self, reason: ReasonCode, count: u64, now_ms: i64) {
        self.total += count;
        *self.by_reason.entry(reason).or_insert(0) += count;
        self.updated_at = Some(now_ms);
    }

    pub fn count(&self, reason: ReasonCode) -> u64 {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Committed,
    RolledBack,
}

/// Per-patch summary kept in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTrace {
    pub sheet_id: String,
    pub row_id: String,
    pub operation: PatchOperation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

/// One audit record per transaction attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    pub command_count: usize,
    pub applied_patches: usize,
    #[serde(default)]
    pub patches: Vec<PatchTrace>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowLock {
    pub sheet_id: String,
    pub row_id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellLock {
    pub sheet_id: String,
    pub row_id: String,
    pub field: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: i64,
}

/// Version counters, locks, conflict statistics and the transaction journal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableMeta {
    pub sheet_versions: BTreeMap<String, u64>,
    /// Keyed by `Sheet::Row`
    pub row_versions: BTreeMap<String, u64>,
    pub row_locks: Vec<RowLock>,
    pub cell_locks: Vec<CellLock>,
    pub conflict_stats: ConflictStats,
    pub tx_journal: Vec<JournalEntry>,
}

impl TableMeta {
    /// Versions start at an implicit 0.
    pub fn sheet_version(&self, sheet_id: &str) -> u64 {
        self.sheet_versions.get(sheet_id).copied().unwrap_or(0)
    }

    pub fn row_version(&self, sheet_id: &str, row_id: &str) -> u64 {
        self.row_versions
            .get(&row_version_key(sheet_id, row_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn find_row_lock(&self, sheet_id: &str, row_id: &str) -> Option<&RowLock> {
        self.row_locks
            .iter()
            .find(|lock| lock.sheet_id == sheet_id && lock.row_id == row_id)
    }

    pub fn cell_locks_for<'a>(
        &'a self,
        sheet_id: &'a str,
        row_id: &'a str,
    ) -> impl Iterator<Item = &'a CellLock> + 'a {
        self.cell_locks
            .iter()
            .filter(move |lock| lock.sheet_id == sheet_id && lock.row_id == row_id)
    }

    /// Add a row lock unless the same owner already holds it.
    pub fn lock_row(&mut self, lock: RowLock) {
        let exists = self.row_locks.iter().any(|item| {
            item.sheet_id == lock.sheet_id && item.row_id == lock.row_id && item.owner == lock.owner
        });
        if !exists {
            self.row_locks.push(lock);
        }
    }

    /// Remove row locks; `owner: None` removes every owner's lock.
    pub fn unlock_row(&mut self, sheet_id: &str, row_id: &str, owner: Option<&str>) {
        self.row_locks.retain(|lock| {
            !(lock.sheet_id == sheet_id
                && lock.row_id == row_id
                && owner.map_or(true, |o| lock.owner == o))
        });
    }

    /// Add a cell lock; a blank field is ignored.
    pub fn lock_cell(&mut self, mut lock: CellLock) {
        lock.field = lock.field.trim().to_string();
        if lock.field.is_empty() {
            return;
        }
        let exists = self.cell_locks.iter().any(|item| {
            item.sheet_id == lock.sheet_id
                && item.row_id == lock.row_id
                && item.field == lock.field
                && item.owner == lock.owner
        });
        if !exists {
            self.cell_locks.push(lock);
        }
    }

    /// Remove cell locks on one field; `owner: None` removes every owner's lock.
    pub fn unlock_cell(&mut self, sheet_id: &str, row_id: &str, field: &str, owner: Option<&str>) {
        self.cell_locks.retain(|lock| {
            !(lock.sheet_id == sheet_id
                && lock.row_id == row_id
                && lock.field == field
                && owner.map_or(true, |o| lock.owner == o))
        });
    }

    /// Append a journal entry, keeping only the newest `limit` entries.
    pub fn push_journal(&mut self, entry: JournalEntry, limit: usize) {
        self.tx_journal.push(entry);
        if self.tx_journal.len() > limit {
            let overflow = self.tx_journal.len() - limit;
            self.tx_journal.drain(..overflow);
        }
    }

    pub fn last_journal(&self) -> Option<&JournalEntry> {
        self.tx_journal.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tx_id: &str) -> JournalEntry {
        JournalEntry {
            tx_id: tx_id.to_string(),
            turn_id: None,
            status: TxStatus::Committed,
            reason: None,
            command_count: 1,
            applied_patches: 0,
            patches: Vec::new(),
            sources: Vec::new(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_versions_default_to_zero() {
        let meta = TableMeta::default();
        assert_eq!(meta.sheet_version("LOG_Summary"), 0);
        assert_eq!(meta.row_version("LOG_Summary", "AM0001"), 0);
    }

    #[test]
    fn test_journal_is_capped_oldest_first() {
        let mut meta = TableMeta::default();
        for i in 0..5 {
            meta.push_journal(entry(&format!("tx-{}", i)), 3);
        }
        let ids: Vec<_> = meta.tx_journal.iter().map(|e| e.tx_id.as_str()).collect();
        assert_eq!(ids, vec!["tx-2", "tx-3", "tx-4"]);
    }

    #[test]
    fn test_conflict_stats_record() {
        let mut stats = ConflictStats::default();
        stats.record(ReasonCode::SheetVersionConflict, 1, 10);
        stats.record(ReasonCode::SheetVersionConflict, 2, 20);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(ReasonCode::SheetVersionConflict), 3);
        assert_eq!(stats.updated_at, Some(20));
    }

    #[test]
    fn test_row_lock_dedup_and_unlock() {
        let mut meta = TableMeta::default();
        let lock = RowLock {
            sheet_id: "LOG_Summary".into(),
            row_id: "AM0001".into(),
            owner: "am-special".into(),
            reason: None,
            created_at: 1,
        };
        meta.lock_row(lock.clone());
        meta.lock_row(lock);
        assert_eq!(meta.row_locks.len(), 1);
        meta.unlock_row("LOG_Summary", "AM0001", Some("someone-else"));
        assert_eq!(meta.row_locks.len(), 1);
        meta.unlock_row("LOG_Summary", "AM0001", None);
        assert!(meta.row_locks.is_empty());
    }

    #[test]
    fn test_reason_code_serializes_snake_case() {
        let json = serde_json::to_string(&ReasonCode::SourceNotAllowed).expect("serialize");
        assert_eq!(json, "\"source_not_allowed\"");
        assert!(ReasonCode::RowVersionConflict.is_concurrency_conflict());
        assert!(!ReasonCode::SourceNotAllowed.is_concurrency_conflict());
    }

    #[test]
    fn test_blank_cell_lock_is_ignored() {
        let mut meta = TableMeta::default();
        meta.lock_cell(CellLock {
            sheet_id: "NPC_Registry".into(),
            row_id: "N1".into(),
            field: "  ".into(),
            owner: "gm".into(),
            reason: None,
            created_at: 0,
        });
        assert!(meta.cell_locks.is_empty());
    }

    #[test]
    fn test_unlock_cell_matches_field_and_owner() {
        let mut meta = TableMeta::default();
        for (field, owner) in [("好感度", "gm"), ("好感度", "am-special"), ("姓名", "gm")] {
            meta.lock_cell(CellLock {
                sheet_id: "NPC_Registry".into(),
                row_id: "NPC_Loki".into(),
                field: field.into(),
                owner: owner.into(),
                reason: None,
                created_at: 0,
            });
        }
        assert_eq!(meta.cell_locks_for("NPC_Registry", "NPC_Loki").count(), 3);

        meta.unlock_cell("NPC_Registry", "NPC_Loki", "好感度", Some("gm"));
        assert_eq!(meta.cell_locks.len(), 2);
        meta.unlock_cell("NPC_Registry", "NPC_Loki", "好感度", None);
        assert_eq!(meta.cell_locks.len(), 1);
        assert_eq!(meta.cell_locks[0].field, "姓名");
    }
}

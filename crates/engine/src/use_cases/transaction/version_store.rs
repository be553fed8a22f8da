//! Sheet/row version store over `TableMeta`.
//!
//! Every check reads the meta as it was before the transaction began, so two
//! patches in one batch that both expect the same base version both pass.
//! Commit bumps each touched sheet and each touched row once.

use std::collections::BTreeSet;

use taverndb_domain::sheet::is_log_sheet;
use taverndb_domain::{
    PatchConflict, PatchOperation, ReasonCode, RowLock, SheetPatch, SourceOwnershipRules, TableMeta,
};

/// Owner stamped on memory rows locked at commit.
pub const MEMORY_LOCK_OWNER: &str = "am-special";
const MEMORY_LOCK_REASON: &str = "memory-autolock";
const MEMORY_SOURCE_PREFIX: &str = "ms:memory";

/// Patches whose source may not write their sheet.
pub fn check_provenance(patches: &[SheetPatch], rules: &SourceOwnershipRules) -> Vec<PatchConflict> {
    patches
        .iter()
        .filter(|patch| !rules.is_allowed(&patch.sheet_id, &patch.source))
        .map(|patch| {
            PatchConflict::new(&patch.sheet_id, &patch.row_id, ReasonCode::SourceNotAllowed)
                .with_source(patch.source.trim())
        })
        .collect()
}

/// Stale version reads and lock violations, in patch order.
pub fn check_versions_and_locks(patches: &[SheetPatch], meta: &TableMeta) -> Vec<PatchConflict> {
    let mut conflicts = Vec::new();
    for patch in patches {
        if let Some(expected) = patch.expected_sheet_version {
            let actual = meta.sheet_version(&patch.sheet_id);
            if expected != actual {
                conflicts.push(
                    PatchConflict::new(&patch.sheet_id, &patch.row_id, ReasonCode::SheetVersionConflict)
                        .version(expected, actual),
                );
            }
        }
        if let Some(expected) = patch.expected_row_version {
            let actual = meta.row_version(&patch.sheet_id, &patch.row_id);
            if expected != actual {
                conflicts.push(
                    PatchConflict::new(&patch.sheet_id, &patch.row_id, ReasonCode::RowVersionConflict)
                        .version(expected, actual),
                );
            }
        }

        let owner = patch.lock_owner.as_deref().map(str::trim);
        if let Some(lock) = meta.find_row_lock(&patch.sheet_id, &patch.row_id) {
            if owner != Some(lock.owner.as_str()) {
                conflicts.push(
                    PatchConflict::new(&patch.sheet_id, &patch.row_id, ReasonCode::RowLocked)
                        .with_owner(&lock.owner),
                );
            }
        }
        for lock in meta.cell_locks_for(&patch.sheet_id, &patch.row_id) {
            if owner == Some(lock.owner.as_str()) {
                continue;
            }
            let touches_field = patch.operation == PatchOperation::Delete
                || patch.changed_fields.is_empty()
                || patch.changed_fields.iter().any(|field| field.trim() == lock.field);
            if touches_field {
                conflicts.push(
                    PatchConflict::new(&patch.sheet_id, &patch.row_id, ReasonCode::CellLocked)
                        .with_field(&lock.field)
                        .with_owner(&lock.owner),
                );
            }
        }
    }
    conflicts
}

/// Bump versions for the committed patches and lock new memory rows.
pub fn commit(meta: &mut TableMeta, patches: &[SheetPatch], now_ms: i64) {
    let sheets: BTreeSet<&str> = patches.iter().map(|p| p.sheet_id.as_str()).collect();
    let rows: BTreeSet<String> = patches.iter().map(SheetPatch::row_version_key).collect();

    for sheet in sheets {
        *meta.sheet_versions.entry(sheet.to_string()).or_insert(0) += 1;
    }
    for key in rows {
        *meta.row_versions.entry(key).or_insert(0) += 1;
    }

    for patch in patches.iter().filter(|p| is_memory_row_upsert(p)) {
        meta.lock_row(RowLock {
            sheet_id: patch.sheet_id.clone(),
            row_id: patch.row_id.clone(),
            owner: MEMORY_LOCK_OWNER.to_string(),
            reason: Some(MEMORY_LOCK_REASON.to_string()),
            created_at: now_ms,
        });
    }
}

/// `AM<digits>` upserts into a log sheet written by the memory service.
fn is_memory_row_upsert(patch: &SheetPatch) -> bool {
    patch.operation == PatchOperation::Upsert
        && is_log_sheet(&patch.sheet_id)
        && patch.source.trim().starts_with(MEMORY_SOURCE_PREFIX)
        && is_am_index(&patch.row_id)
}

fn is_am_index(row_id: &str) -> bool {
    let upper = row_id.trim().to_uppercase();
    upper
        .strip_prefix("AM")
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

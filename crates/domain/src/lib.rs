//! TavernDB Domain
//!
//! Vocabulary and invariants for the turn-transaction core:
//!
//! - `state` - the `GameState` document and the persisted `SessionSnapshot`
//! - `table_meta` - engine-owned sheet/row versions, locks, conflict stats, journal
//! - `command` - wire `TavernCommand`, the closed `Action` set, normalized `Command`
//! - `sheet` - sheet ids, default key fields, `SheetPatch`
//! - `ownership` - source-ownership rules for protected sheets
//! - `event` / `log` - structured transaction events and rendered system logs
//! - `ledger` - economic accounts and ledger entries
//! - `value_objects` - dice expressions and d20 checks
//!
//! No I/O and no RNG: randomness is injected by callers.

pub mod command;
pub mod error;
pub mod event;
pub mod ledger;
pub mod log;
pub mod ownership;
pub mod sheet;
pub mod state;
pub mod table_meta;
pub mod value_objects;

pub use command::{
    Action, Command, CommandPayload, PathAssignment, TavernCommand, DEFAULT_TRANSACTIONAL_ACTIONS,
};
pub use error::DomainError;
pub use event::{PatchConflict, TxEvent};
pub use ledger::{append_ledger_entries, EconomicAccount, LedgerEntry};
pub use log::{LogKind, SystemLogEntry, SYSTEM_SENDER};
pub use ownership::SourceOwnershipRules;
pub use sheet::{PatchOperation, SheetPatch, SheetRow};
pub use state::{
    ActionEconomy, CharacterState, CombatResolutionEvent, CombatState, CombatUnit, DiceRow,
    FamiliaState, GameState, HitPoints, InitiativeEntry, InventoryItem, NpcRecord,
    ResolutionStep, SessionSnapshot, StepKind, UnitResources,
};
pub use table_meta::{
    CellLock, ConflictStats, JournalEntry, PatchTrace, ReasonCode, RowLock, TableMeta, TxStatus,
};
pub use value_objects::{D20Check, DiceExpression, DiceKind, DiceParseError, DiceRollResult, RollMode};

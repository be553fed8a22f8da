//! Use cases - turn processing orchestration.
//!
//! Each module covers one step of a turn: response repair, command admission,
//! handler dispatch, the transaction around it, and ledger projection.
//! `turn` composes them.

pub mod commands;
pub mod guard;
pub mod ledger;
pub mod repair;
pub mod transaction;
pub mod turn;

pub use guard::{CommandGuard, GuardReject, GuardRejectReason};
pub use transaction::{apply_turn_transaction, TransactionOptions, TransactionResult};
pub use turn::{PipelineConfig, PipelineError, TurnOutcome, TurnPipeline, TurnReport};

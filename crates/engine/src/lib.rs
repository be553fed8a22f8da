//! TavernDB Engine library.
//!
//! Turns raw AI service responses into committed session state.
//!
//! ## Structure
//!
//! - `use_cases/` - Response repair, command handlers, turn transactions, ledger projection
//! - `infrastructure/` - External dependency implementations (ports + adapters), queue, retry
//! - `app` - Application composition

pub mod app;
pub mod infrastructure;
pub mod use_cases;

/// End-to-end turn scenarios against the composed engine.
#[cfg(test)]
mod e2e_tests;

pub use app::App;

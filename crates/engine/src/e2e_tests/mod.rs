//! End-to-end turn tests.
//!
//! These tests drive the composed engine the way an orchestrator does:
//! - Raw service text in, through repair, guard, transaction and ledger projection
//! - Sessions persisted through the key-value port (memory or SQLite via tempfile)
//! - Service calls scheduled on the lane queue with retry
//!
//! # Running E2E Tests
//!
//! ```bash
//! cargo test -p taverndb-engine --lib e2e_tests
//! ```

mod e2e_helpers;
mod transaction_scenario_tests;
mod turn_flow_tests;

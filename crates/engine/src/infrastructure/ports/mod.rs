//! Port traits for infrastructure boundaries.
//!
//! These are the ONLY abstractions in the engine. Everything else is concrete types.
//! Ports exist for:
//! - Key-value persistence (could swap in-memory -> SQLite -> browser storage)
//! - Clock/Random (for testing)

mod error;
mod repos;
mod testing;

pub use error::RepoError;
pub use repos::KeyValueStore;
pub use testing::{ClockPort, RandomPort};

#[cfg(test)]
pub use repos::MockKeyValueStore;
#[cfg(test)]
pub use testing::{MockClockPort, MockRandomPort};

//! Infrastructure implementations.
//!
//! Contains port trait implementations for external dependencies.

pub mod app_settings;
pub mod clock;
pub mod lane_queue;
pub mod memory_store;
pub mod ports;
pub mod retry;
pub mod session_repository;
pub mod sqlite_store;

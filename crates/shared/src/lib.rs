//! TavernDB Protocol - Wire shapes exchanged with AI services
//!
//! This crate contains the documents that cross the boundary between the
//! AI-service orchestration layer and the engine:
//! - Parsed/recovered response documents and their repair provenance
//! - Extracted `tavern_commands` batches
//! - Service identities used as command sources
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde, serde_json, tracing and the domain vocabulary
//! 2. **No business logic** - Pure data types and serialization

pub mod response;
pub mod service;

pub use response::{AiResponse, ExtractedCommands, ParsedResponse, RepairStrategy};
pub use service::ServiceKind;

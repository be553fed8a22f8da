//! Recovery of structured responses and command batches from noisy model output.

mod extract;
mod json_repair;

pub use extract::extract_service_commands;
pub use json_repair::parse_ai_response_text;

//! Unified error types for the domain layer
//!
//! Command payloads come from a language model, so most failures here are
//! recoverable: handlers turn a `DomainError` into a system log and an error
//! flag instead of propagating it.

use thiserror::Error;

use crate::value_objects::DiceParseError;

/// Unified error type for domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A payload field is missing or has the wrong shape
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced row, unit, or account does not exist
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    /// Business rule violation (sheet row limits, account floors)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Parse error (for value objects)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl DomainError {
    /// Creates a validation error for malformed payloads.
    ///
    /// # Example
    /// ```ignore
    /// let Some(sheet_id) = payload.get("sheetId").and_then(Value::as_str) else {
    ///     return Err(DomainError::validation("upsert_sheet_rows missing field sheetId"));
    /// };
    /// ```
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Create a constraint violation error
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}

impl From<DiceParseError> for DomainError {
    fn from(err: DiceParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = DomainError::validation("sheetId missing");
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(err.to_string(), "Validation failed: sheetId missing");
    }

    #[test]
    fn test_not_found_error() {
        let err = DomainError::not_found("CombatUnit", "U-7");
        assert!(err.to_string().contains("CombatUnit"));
        assert!(err.to_string().contains("U-7"));
    }

    #[test]
    fn test_dice_parse_error_converts() {
        let err: DomainError = DiceParseError::Empty.into();
        assert!(matches!(err, DomainError::Parse(_)));
    }
}

//! Error types for replix
//!
//! Provides the error type shared by the core primitives.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, ReplixError>;

/// Unified error type for core operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplixError {
    // ===== Expression Errors =====
    #[error("Invalid RSE expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    // ===== Endpoint Errors =====
    #[error("Invalid endpoint attribute {key}={value}")]
    InvalidAttribute { key: String, value: String },

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplixError {
    pub(crate) fn expression(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReplixError::expression("tier=1&", "unexpected end of expression");
        assert_eq!(
            err.to_string(),
            "Invalid RSE expression 'tier=1&': unexpected end of expression"
        );
    }

    #[test]
    fn test_attribute_error_display() {
        let err = ReplixError::InvalidAttribute {
            key: "tier".to_string(),
            value: "gold".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid endpoint attribute tier=gold");
    }
}

//! Structured error model for connector operations.
//!
//! [`ConnectorError`] carries a classification, a machine-readable code and
//! optional diagnostic details. Construct via the category factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a connector error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid connector configuration or unsupported request.
    Config,
    /// Endpoint unreachable or connection parameters unusable.
    Connection,
    /// Failure while producing rows.
    Read,
    /// Failure while staging or committing rows.
    Write,
    /// The run was cancelled while the connector was working.
    Cancelled,
    /// Bug or broken invariant inside the connector.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Connection => "connection",
            Self::Read => "read",
            Self::Write => "write",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error from a connector operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct ConnectorError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ConnectorError {
    fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Invalid configuration or unsupported request.
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, code, message)
    }

    /// Endpoint unreachable.
    #[must_use]
    pub fn connection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, code, message)
    }

    /// Read-side failure.
    #[must_use]
    pub fn read(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Read, code, message)
    }

    /// Write-side failure.
    #[must_use]
    pub fn write(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Write, code, message)
    }

    /// Cancellation observed by the connector.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Cancelled, "CANCELLED", message)
    }

    /// Internal connector error.
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category_and_code() {
        let err = ConnectorError::read("BAD_LINE", "line 3 is not a JSON object");
        assert_eq!(
            err.to_string(),
            "[read] BAD_LINE: line 3 is not a JSON object"
        );
    }

    #[test]
    fn cancelled_factory_sets_category() {
        let err = ConnectorError::cancelled("interrupted");
        assert!(err.is_cancelled());
        assert_eq!(err.code, "CANCELLED");
    }

    #[test]
    fn details_serialize_only_when_present() {
        let bare = serde_json::to_value(ConnectorError::config("X", "y")).unwrap();
        assert!(bare.get("details").is_none());

        let detailed = ConnectorError::config("X", "y")
            .with_details(serde_json::json!({"field": "object"}));
        let value = serde_json::to_value(detailed).unwrap();
        assert_eq!(value["details"]["field"], "object");
        assert_eq!(value["category"], "config");
    }
}

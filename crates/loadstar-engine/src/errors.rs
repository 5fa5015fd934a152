//! Task error model.
//!
//! [`TaskError`] is what a stream run ends with. Connector failures are
//! classified by which side raised them; parser and validator failures
//! arrive as `anyhow` chains and become [`TaskError::Configuration`].

use loadstar_types::error::{ConnectorError, ErrorCategory};

/// Coarse classification of a [`TaskError`], stable for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Read,
    Write,
    Cancelled,
    Store,
    Assertion,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Connection => "connection",
            Self::Read => "read",
            Self::Write => "write",
            Self::Cancelled => "cancelled",
            Self::Store => "store",
            Self::Assertion => "assertion",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of a task or a batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("read error: {0}")]
    Read(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Which side of a transfer raised a connector error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl TaskError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Read(_) => ErrorKind::Read,
            Self::Write(_) => ErrorKind::Write,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Store(_) => ErrorKind::Store,
            Self::Assertion(_) => ErrorKind::Assertion,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Flatten an `anyhow` chain from the parser or validator.
    #[must_use]
    pub fn configuration(err: &anyhow::Error) -> Self {
        Self::Configuration(format!("{err:#}"))
    }

    /// Classify a connector error raised by `side`. Details, when present,
    /// are appended to the message.
    #[must_use]
    pub fn from_connector(side: Side, err: &ConnectorError) -> Self {
        let text = match &err.details {
            Some(details) => format!("{err} {details}"),
            None => err.to_string(),
        };
        match err.category {
            ErrorCategory::Config => Self::Configuration(text),
            ErrorCategory::Connection => Self::Connection(text),
            ErrorCategory::Cancelled => Self::Cancelled(err.message.clone()),
            _ => match side {
                Side::Source => Self::Read(text),
                Side::Target => Self::Write(text),
            },
        }
    }
}

//! Store error types.

/// Errors produced by [`ExecutionStore`](crate::ExecutionStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored column held a value this version cannot interpret.
    #[error("invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("execution store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StoreError::Sqlite(inner);
        assert!(err.to_string().contains("sqlite"), "got: {err}");
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(
            StoreError::LockPoisoned.to_string(),
            "execution store lock poisoned"
        );
    }

    #[test]
    fn invalid_value_names_column() {
        let err = StoreError::InvalidValue {
            column: "status",
            value: "paused".into(),
        };
        assert_eq!(err.to_string(), "invalid stored value in status: paused");
    }
}

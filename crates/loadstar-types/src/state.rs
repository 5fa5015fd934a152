//! Execution history model types.
//!
//! Pure data types used by `ExecutionStore` implementations and by the
//! engine when it records runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier shared by every stream run within one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Create a new execution identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for ExecutionId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Stable identity of a (source connection, target connection, stream) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for StreamId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Hex-encoded content digest of a canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    #[must_use]
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of a single task execution.
///
/// Transitions are monotonic: `Created -> Running -> {Success, Error}`.
/// `Created -> Error` is allowed for runs rejected before they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Created,
    Running,
    Success,
    Error,
}

impl ExecStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running | Self::Error)
                | (Self::Running, Self::Success | Self::Error)
        )
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// One row of execution history.
///
/// Created when a run starts and updated in place, keyed by
/// `(exec_id, stream_id)`, when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exec_id: ExecutionId,
    pub stream_id: StreamId,
    pub stream_name: String,
    pub task_digest: ContentDigest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_digest: Option<ContentDigest>,
    pub status: ExecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub rows: u64,
    pub bytes: u64,
    /// Accumulated progress text. Never pushed to the status endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub pid: u32,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// An [`ExecutionRecord`] as read back from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExecution {
    /// Store-local identifier.
    pub id: i64,
    #[serde(flatten)]
    pub record: ExecutionRecord,
    pub updated_at: DateTime<Utc>,
}

/// Immutable copy of a task configuration, inserted once per digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub digest: ContentDigest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub mode: String,
    /// Sanitized configuration (no credentials, no inline data).
    pub config: serde_json::Value,
}

/// Immutable copy of a replication manifest, inserted once per digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSnapshot {
    pub digest: ContentDigest,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub manifest: serde_json::Value,
}

/// Last persisted incremental value for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Column the value was taken from (e.g. `"updated_at"`).
    pub update_key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Filter for listing execution history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionQuery {
    pub status: Option<ExecStatus>,
    pub exec_id: Option<ExecutionId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            status: None,
            exec_id: None,
            since: None,
            limit: 50,
        }
    }
}

/// Row counts per table, used by the `history` command summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub task_snapshots: u64,
    pub replication_snapshots: u64,
    pub executions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_display_and_as_str() {
        let id = ExecutionId::new("2f3a");
        assert_eq!(id.as_str(), "2f3a");
        assert_eq!(id.to_string(), "2f3a");
    }

    #[test]
    fn digest_short_handles_short_values() {
        assert_eq!(ContentDigest::new("abc").short(), "abc");
        let full = ContentDigest::new("0123456789abcdef0123");
        assert_eq!(full.short(), "0123456789ab");
    }

    #[test]
    fn status_round_trips_storage_string() {
        for status in [
            ExecStatus::Created,
            ExecStatus::Running,
            ExecStatus::Success,
            ExecStatus::Error,
        ] {
            assert_eq!(ExecStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecStatus::parse("completed"), None);
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [ExecStatus::Success, ExecStatus::Error] {
            assert!(terminal.is_terminal());
            for next in [
                ExecStatus::Created,
                ExecStatus::Running,
                ExecStatus::Success,
                ExecStatus::Error,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn forward_transitions_allowed() {
        assert!(ExecStatus::Created.can_transition_to(ExecStatus::Running));
        assert!(ExecStatus::Created.can_transition_to(ExecStatus::Error));
        assert!(ExecStatus::Running.can_transition_to(ExecStatus::Success));
        assert!(!ExecStatus::Created.can_transition_to(ExecStatus::Success));
        assert!(!ExecStatus::Running.can_transition_to(ExecStatus::Created));
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&ExecStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
    }

    #[test]
    fn record_serialization_omits_empty_output() {
        let record = ExecutionRecord {
            exec_id: ExecutionId::new("e1"),
            stream_id: StreamId::new("s1"),
            stream_name: "public.users".into(),
            task_digest: ContentDigest::new("d1"),
            replication_digest: None,
            status: ExecStatus::Created,
            error: None,
            start_time: None,
            end_time: None,
            rows: 0,
            bytes: 0,
            output: String::new(),
            pid: 1,
            version: "0.1.0".into(),
            project_id: None,
            file_path: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("output").is_none());
        assert_eq!(value["status"], "created");
    }
}

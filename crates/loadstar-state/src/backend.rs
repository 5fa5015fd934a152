//! Execution store trait definition.
//!
//! [`ExecutionStore`] defines the storage contract for configuration
//! snapshots, execution records and incremental checkpoints. Model types
//! live in [`loadstar_types::state`].

use loadstar_types::state::{
    CheckpointState, ExecutionId, ExecutionQuery, ExecutionRecord, ReplicationSnapshot,
    StoreStats, StoredExecution, StreamId, TaskSnapshot,
};

use crate::error;

/// Storage contract for execution history.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn ExecutionStore>`.
/// Snapshots are first-writer-wins; execution records are append-then-update
/// and never deleted.
pub trait ExecutionStore: Send + Sync {
    /// Insert a task snapshot unless one with the same digest exists.
    ///
    /// Returns `true` when a new row was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn insert_task_snapshot(&self, snapshot: &TaskSnapshot) -> error::Result<bool>;

    /// Insert a replication snapshot unless one with the same digest exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn insert_replication_snapshot(&self, snapshot: &ReplicationSnapshot) -> error::Result<bool>;

    /// Append an execution record, returning its store-local id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn insert_execution(&self, record: &ExecutionRecord) -> error::Result<i64>;

    /// Update the most recent record for `(record.exec_id, record.stream_id)`.
    ///
    /// Returns `false` when no such record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn update_execution(&self, record: &ExecutionRecord) -> error::Result<bool>;

    /// Most recent record for an (execution id, stream id) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn find_execution(
        &self,
        exec_id: &ExecutionId,
        stream_id: &StreamId,
    ) -> error::Result<Option<StoredExecution>>;

    /// Records matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn list_executions(&self, query: &ExecutionQuery) -> error::Result<Vec<StoredExecution>>;

    /// Last incremental checkpoint persisted for a stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn get_checkpoint(&self, stream_id: &StreamId) -> error::Result<Option<CheckpointState>>;

    /// Upsert the incremental checkpoint for a stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn set_checkpoint(&self, stream_id: &StreamId, checkpoint: &CheckpointState)
        -> error::Result<()>;

    /// Row counts per table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn stats(&self) -> error::Result<StoreStats>;
}

//! Execution history persistence for the Loadstar engine.
//!
//! Provides the [`ExecutionStore`] trait and a [`SqliteExecutionStore`]
//! implementation holding configuration snapshots, execution records and
//! incremental checkpoints.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod schema;
pub mod sqlite;

pub use backend::ExecutionStore;
pub use error::StoreError;
pub use sqlite::SqliteExecutionStore;

//! Task and replication execution engine for Loadstar.

pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod connector;
pub mod context;
pub mod digest;
pub mod errors;
pub mod monitor;
pub mod pattern;
pub mod recorder;
pub mod replication;
pub mod runner;
pub mod settings;
pub mod supervisor;
pub mod task;

// Re-export public API for convenience
pub use context::RunContext;
pub use errors::{ErrorKind, TaskError};
pub use recorder::{ExecutionRecorder, RunOrigin};
pub use replication::{BatchOutcome, ReplicationReport};
pub use runner::{Engine, RunOutcome, TaskOutcome};
pub use settings::EngineSettings;
pub use supervisor::{ExitStatus, ProcessSignal, Supervisor};
pub use task::{prepare, ExecutionStatus, PreparedTask, TaskController, TaskExecution, TaskSummary};

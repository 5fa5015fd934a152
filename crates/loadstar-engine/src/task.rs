//! Lifecycle of one source-to-target transfer.
//!
//! [`prepare`] validates a configuration and resolves its endpoints.
//! [`TaskController::execute`] then drives the transfer: the source and the
//! target run on blocking threads joined by a bounded row channel, a monitor
//! samples the shared [`TaskExecution`], and the outcome is captured as the
//! execution's terminal state rather than returned as an error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use loadstar_types::error::ConnectorError;
use loadstar_types::mode::{Mode, WriteMode};
use loadstar_types::state::{CheckpointState, ContentDigest, ExecStatus, ExecutionId, StreamId};
use serde::Serialize;
use tokio::sync::watch;

use crate::checkpoint::{choose_incremental_value, resolve_read_spec, HighWaterMark, ReadRequest};
use crate::cleanup::{run_actions, CleanupAction, CleanupHandle, CleanupList};
use crate::config::types::TaskConfig;
use crate::config::validator::validate_task;
use crate::connector::channel::CONSUMER_STOPPED;
use crate::connector::{
    row_channel, Connection, ConnectorRegistry, ProgressSink, SourceConnector, TargetConnector,
    WriteRequest, WriteSummary,
};
use crate::context::RunContext;
use crate::errors::{Side, TaskError};
use crate::monitor::{self, is_stalled, MonitorConfig, RateTracker, Rates, POST_SQL_PHASE, PRE_SQL_PHASE};
use crate::settings::EngineSettings;

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

/// A validated configuration with its endpoints resolved.
#[derive(Clone)]
pub struct PreparedTask {
    pub config: TaskConfig,
    pub source: Connection,
    pub target: Connection,
    pub mode: Mode,
    pub write_mode: WriteMode,
    pub digest: ContentDigest,
    pub stream_id: StreamId,
    reader: Arc<dyn SourceConnector>,
    writer: Arc<dyn TargetConnector>,
}

impl std::fmt::Debug for PreparedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTask")
            .field("stream", &self.config.stream_name())
            .field("object", &self.config.target.object)
            .field("source", &self.source.sanitized())
            .field("target", &self.target.sanitized())
            .field("mode", &self.mode)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

impl PreparedTask {
    #[must_use]
    pub fn stream_name(&self) -> &str {
        self.config.stream_name()
    }
}

/// Validate `config` and resolve both endpoints.
///
/// # Errors
///
/// Returns [`TaskError::Configuration`] for invalid configuration or an
/// endpoint lacking the needed capability, and [`TaskError::Connection`]
/// when a connection cannot be resolved. Connection names are looked up in
/// the task's `env` before the registry's own sources.
pub fn prepare(config: TaskConfig, registry: &ConnectorRegistry) -> Result<PreparedTask, TaskError> {
    validate_task(&config).map_err(|e| TaskError::configuration(&e))?;

    let (source, source_endpoint) = registry.resolve_in(&config.source.conn, &config.env)?;
    let (target, target_endpoint) = registry.resolve_in(&config.target.conn, &config.env)?;
    let reader = source_endpoint.source().ok_or_else(|| {
        TaskError::Configuration(format!("connection '{}' cannot be read from", source.name))
    })?;
    let writer = target_endpoint.target().ok_or_else(|| {
        TaskError::Configuration(format!("connection '{}' cannot be written to", target.name))
    })?;

    let mode = config.effective_mode();
    let write_mode = mode.write_mode(&config.source.primary_key);
    let digest = crate::digest::task_digest(&config)
        .map_err(|e| TaskError::Internal(format!("failed to digest configuration: {e}")))?;
    let stream_id =
        crate::digest::stream_id(&config.source.conn, &config.target.conn, config.stream_name());

    Ok(PreparedTask {
        config,
        source,
        target,
        mode,
        write_mode,
        digest,
        stream_id,
        reader,
        writer,
    })
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Point-in-time view of an execution, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatus {
    pub status: ExecStatus,
    pub progress: String,
    pub rows: u64,
    pub bytes: u64,
    pub rates: Rates,
    pub stalled: bool,
    pub elapsed: Duration,
    pub error: Option<String>,
}

struct ExecutionState {
    status: ExecStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    rows: u64,
    bytes: u64,
    last_increment: Instant,
    progress: String,
    history: Vec<String>,
    rates: Rates,
    stalled: bool,
    error: Option<TaskError>,
    cleanup: CleanupList,
    finished: bool,
}

impl ExecutionState {
    fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn view(&self) -> ExecutionStatus {
        ExecutionStatus {
            status: self.status,
            progress: self.progress.clone(),
            rows: self.rows,
            bytes: self.bytes,
            rates: self.rates,
            stalled: self.stalled,
            elapsed: self.elapsed(),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }

    fn transition(&mut self, next: ExecStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                from = self.status.as_str(),
                to = next.as_str(),
                "Ignoring invalid status transition"
            );
            false
        }
    }
}

struct ExecutionInner {
    exec_id: ExecutionId,
    stream_id: StreamId,
    stream_name: String,
    state: Mutex<ExecutionState>,
    status_tx: watch::Sender<ExecutionStatus>,
}

/// Shared run record of one task.
///
/// Counters, progress text and the cleanup list sit behind a single lock.
/// Clones share the same record.
#[derive(Clone)]
pub struct TaskExecution {
    inner: Arc<ExecutionInner>,
}

impl std::fmt::Debug for TaskExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecution")
            .field("exec_id", &self.inner.exec_id)
            .field("stream", &self.inner.stream_name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl TaskExecution {
    #[must_use]
    pub fn new(exec_id: ExecutionId, stream_id: StreamId, stream_name: impl Into<String>) -> Self {
        let state = ExecutionState {
            status: ExecStatus::Created,
            start_time: None,
            end_time: None,
            started_at: None,
            finished_at: None,
            rows: 0,
            bytes: 0,
            last_increment: Instant::now(),
            progress: String::new(),
            history: Vec::new(),
            rates: Rates::default(),
            stalled: false,
            error: None,
            cleanup: CleanupList::default(),
            finished: false,
        };
        let (status_tx, _) = watch::channel(state.view());
        Self {
            inner: Arc::new(ExecutionInner {
                exec_id,
                stream_id,
                stream_name: stream_name.into(),
                state: Mutex::new(state),
                status_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &ExecutionState) {
        self.inner.status_tx.send_replace(state.view());
    }

    #[must_use]
    pub fn exec_id(&self) -> &ExecutionId {
        &self.inner.exec_id
    }

    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.inner.stream_id
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.inner.stream_name
    }

    #[must_use]
    pub fn status(&self) -> ExecStatus {
        self.state().status
    }

    #[must_use]
    pub fn error(&self) -> Option<TaskError> {
        self.state().error.clone()
    }

    #[must_use]
    pub fn view(&self) -> ExecutionStatus {
        self.state().view()
    }

    /// Every progress message set so far, oldest first.
    #[must_use]
    pub fn progress_history(&self) -> Vec<String> {
        self.state().history.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    /// Receiver of status updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn set_progress(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state();
        state.history.push(message.clone());
        state.progress = message;
        self.publish(&state);
    }

    /// Created -> Running. False if the execution was already started.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.state();
        if state.status != ExecStatus::Created || !state.transition(ExecStatus::Running) {
            return false;
        }
        state.start_time = Some(Utc::now());
        state.started_at = Some(Instant::now());
        state.last_increment = Instant::now();
        self.publish(&state);
        true
    }

    /// Defer `action` to finalization. Once finalized, it runs immediately.
    ///
    /// Actions run under the execution lock and must not call back into
    /// this execution.
    pub fn add_cleanup(&self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        self.push_cleanup(label.into(), Box::new(action));
    }

    fn push_cleanup(&self, label: String, action: CleanupAction) {
        let mut state = self.state();
        if state.finished {
            drop(state);
            tracing::debug!(action = %label, "Execution already finalized; running cleanup now");
            run_actions(vec![(label, action)]);
            return;
        }
        state.cleanup.push(label, action);
    }

    /// Handle for connectors to register cleanup on this execution.
    #[must_use]
    pub fn cleanup_handle(&self) -> CleanupHandle {
        let execution = self.clone();
        CleanupHandle::new(move |label, action| execution.push_cleanup(label, action))
    }

    #[must_use]
    pub fn pending_cleanup(&self) -> usize {
        self.state().cleanup.len()
    }

    /// Run pending cleanup actions. Each action runs at most once however
    /// often this is called. Returns how many ran.
    pub fn run_cleanup(&self) -> usize {
        let mut state = self.state();
        run_actions(state.cleanup.drain())
    }

    /// Run cleanup, then move to the terminal status. Only the first call
    /// has any effect.
    pub(crate) fn finalize(&self, result: Result<(), TaskError>) -> bool {
        let mut state = self.state();
        if state.finished {
            return false;
        }
        let ran = run_actions(state.cleanup.drain());
        if ran > 0 {
            tracing::debug!(stream = %self.inner.stream_name, actions = ran, "Cleanup finished");
        }
        state.finished = true;
        state.stalled = false;
        state.end_time = Some(Utc::now());
        state.finished_at = Some(Instant::now());
        match result {
            Ok(()) => {
                state.transition(ExecStatus::Success);
            }
            Err(err) => {
                state.transition(ExecStatus::Error);
                state.error = Some(err);
            }
        }
        self.publish(&state);
        true
    }

    /// One monitor tick. Returns `None` once the execution is finished, in
    /// which case nothing is recorded.
    pub(crate) fn sample(
        &self,
        tracker: &mut RateTracker,
        now: Instant,
        stall_window: Duration,
    ) -> Option<ExecutionStatus> {
        let mut state = self.state();
        if state.finished {
            return None;
        }
        state.rates = tracker.observe(now, state.rows, state.bytes);
        let stalled = is_stalled(state.last_increment, now, stall_window, &state.progress);
        if stalled && !state.stalled {
            tracing::warn!(
                stream = %self.inner.stream_name,
                rows = state.rows,
                window_secs = stall_window.as_secs(),
                "Task appears stalled: no rows moved within the stall window"
            );
        }
        state.stalled = stalled;
        self.publish(&state);
        Some(state.view())
    }

    fn summary(&self) -> TaskSummary {
        let state = self.state();
        TaskSummary {
            exec_id: self.inner.exec_id.clone(),
            stream_id: self.inner.stream_id.clone(),
            stream_name: self.inner.stream_name.clone(),
            status: state.status,
            rows_read: state.rows,
            bytes_read: state.bytes,
            rows_written: 0,
            bytes_written: 0,
            checkpoint: None,
            error: state.error.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            duration: state.elapsed(),
        }
    }
}

impl ProgressSink for TaskExecution {
    fn record_row(&self, bytes: u64) {
        let mut state = self.state();
        state.rows += 1;
        state.bytes += bytes;
        state.last_increment = Instant::now();
        state.stalled = false;
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Terminal outcome of one execution.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub exec_id: ExecutionId,
    pub stream_id: StreamId,
    pub stream_name: String,
    pub status: ExecStatus,
    pub rows_read: u64,
    pub bytes_read: u64,
    pub rows_written: u64,
    pub bytes_written: u64,
    /// High-water mark to persist; only set on success.
    pub checkpoint: Option<CheckpointState>,
    pub error: Option<TaskError>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl TaskSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Success
    }
}

struct TransferOutput {
    written: WriteSummary,
    high_water: Option<HighWaterMark>,
}

fn check_cancelled(ctx: &RunContext) -> Result<(), TaskError> {
    match ctx.cancellation_reason() {
        Some(reason) => Err(TaskError::Cancelled(reason)),
        None => Ok(()),
    }
}

/// Pick the error that explains a failed transfer. A source that stopped
/// because the target went away defers to the target's error.
fn transfer_error(
    ctx: &RunContext,
    source: Option<ConnectorError>,
    target: Option<ConnectorError>,
) -> TaskError {
    if let Some(reason) = ctx.cancellation_reason() {
        return TaskError::Cancelled(reason);
    }
    match (source, target) {
        (Some(src), Some(tgt)) if src.code == CONSUMER_STOPPED => {
            TaskError::from_connector(Side::Target, &tgt)
        }
        (Some(src), _) => TaskError::from_connector(Side::Source, &src),
        (None, Some(tgt)) => TaskError::from_connector(Side::Target, &tgt),
        (None, None) => TaskError::Internal("transfer failed without an error".into()),
    }
}

/// Drives a [`PreparedTask`] through its lifecycle.
pub struct TaskController {
    task: PreparedTask,
    execution: TaskExecution,
    settings: EngineSettings,
    stored_checkpoint: Option<CheckpointState>,
}

impl TaskController {
    #[must_use]
    pub fn new(task: PreparedTask, settings: EngineSettings) -> Self {
        let execution = TaskExecution::new(
            settings.exec_id.clone(),
            task.stream_id.clone(),
            task.stream_name(),
        );
        Self {
            task,
            execution,
            settings,
            stored_checkpoint: None,
        }
    }

    /// Last checkpoint persisted for this stream.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Option<CheckpointState>) -> Self {
        self.stored_checkpoint = checkpoint;
        self
    }

    #[must_use]
    pub fn task(&self) -> &PreparedTask {
        &self.task
    }

    #[must_use]
    pub fn execution(&self) -> &TaskExecution {
        &self.execution
    }

    /// Run the transfer to a terminal state.
    ///
    /// Errors are not returned: they become the execution's terminal error
    /// and are reported in the summary.
    pub async fn execute(&self, ctx: &RunContext) -> TaskSummary {
        let execution = &self.execution;
        if !execution.start() {
            tracing::warn!(stream = execution.stream_name(), "Task was already executed");
            return execution.summary();
        }
        tracing::info!(
            stream = execution.stream_name(),
            object = %self.task.config.target.object,
            mode = self.task.mode.as_str(),
            exec_id = %execution.exec_id(),
            "Task started"
        );

        let monitor = monitor::spawn(execution.clone(), MonitorConfig::from(&self.settings));
        let result = self.transfer(ctx).await;
        let output = match result {
            Ok(output) => {
                execution.finalize(Ok(()));
                Some(output)
            }
            Err(err) => {
                execution.finalize(Err(err));
                None
            }
        };
        monitor.stop().await;

        let mut summary = execution.summary();
        if let Some(output) = output {
            summary.rows_written = output.written.rows_written;
            summary.bytes_written = output.written.bytes_written;
            summary.checkpoint = output.high_water.and_then(|h| h.to_checkpoint());
        }

        match &summary.error {
            None => tracing::info!(
                stream = %summary.stream_name,
                rows = summary.rows_written,
                bytes = summary.bytes_written,
                duration_secs = summary.duration.as_secs_f64(),
                "Task succeeded"
            ),
            Some(err) => tracing::error!(
                stream = %summary.stream_name,
                kind = %err.kind(),
                error = %err,
                "Task failed"
            ),
        }
        summary
    }

    async fn transfer(&self, ctx: &RunContext) -> Result<TransferOutput, TaskError> {
        let task = &self.task;
        let config = &task.config;
        let execution = &self.execution;
        check_cancelled(ctx)?;

        if let Some(sql) = config.target.options.pre_sql.as_deref() {
            self.run_statement(PRE_SQL_PHASE, sql).await?;
        }

        let update_key = config
            .source
            .update_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        let mut last_value = None;
        if let (true, Some(key)) = (task.mode.is_incremental(), update_key) {
            let target_max = if config.incremental_value.is_some() {
                None
            } else {
                execution.set_progress("looking up incremental value");
                self.target_max(key).await?
            };
            last_value = choose_incremental_value(
                config.incremental_value.as_deref(),
                target_max,
                self.stored_checkpoint.as_ref(),
                key,
            );
            if let Some(value) = &last_value {
                tracing::info!(
                    stream = execution.stream_name(),
                    update_key = key,
                    value = %value,
                    "Resuming incremental read"
                );
            }
        }

        let spec = resolve_read_spec(&ReadRequest {
            mode: task.mode,
            stream: &config.source.stream,
            update_key,
            last_value: last_value.as_deref(),
            sql: config.source.sql.as_deref(),
            columns: &config.source.columns,
            limit: config.source.options.limit,
            strict: config
                .source
                .options
                .strict_incremental
                .unwrap_or(self.settings.strict_incremental),
            source_kind: task.source.kind,
        })?;
        tracing::debug!(stream = execution.stream_name(), predicate = %spec.predicate, "Resolved read");

        let high_water = match (task.mode.is_incremental(), update_key) {
            (true, Some(key)) => Some(HighWaterMark::new(key, last_value.clone())),
            _ => None,
        };
        let (mut tx, mut rx) = row_channel(
            self.settings.channel_capacity,
            ctx.clone(),
            Arc::new(execution.clone()),
            high_water,
        );
        let request = WriteRequest {
            object: config.target.object.clone(),
            mode: task.write_mode.clone(),
            options: config.target.options.extra.clone(),
            cleanup: execution.cleanup_handle(),
        };

        check_cancelled(ctx)?;
        execution.set_progress(format!(
            "streaming {} into {}",
            config.stream_name(),
            config.target.object
        ));

        let reader = Arc::clone(&task.reader);
        let read = tokio::task::spawn_blocking(move || {
            reader.read_rows(&spec, &mut tx)?;
            tracing::debug!(stream = %spec.stream, rows = tx.rows_sent(), "Source finished");
            tx.finish()
        });
        let writer = Arc::clone(&task.writer);
        let write = tokio::task::spawn_blocking(move || {
            let written = writer.write_rows(&request, &mut rx);
            tracing::debug!(object = %request.object, rows = rx.rows_received(), "Target finished");
            written
        });
        let (read, write) = tokio::join!(read, write);
        let read = read.map_err(|e| TaskError::Internal(format!("source worker failed: {e}")))?;
        let write = write.map_err(|e| TaskError::Internal(format!("target worker failed: {e}")))?;

        let (written, high_water) = match (read, write) {
            (Ok(high_water), Ok(written)) => (written, high_water),
            (read, write) => return Err(transfer_error(ctx, read.err(), write.err())),
        };

        if let Some(expected) = self.settings.expect_rows {
            expected
                .check("rows", written.rows_written)
                .map_err(TaskError::Assertion)?;
        }

        if let Some(sql) = config.target.options.post_sql.as_deref() {
            self.run_statement(POST_SQL_PHASE, sql).await?;
        }

        Ok(TransferOutput {
            written,
            high_water,
        })
    }

    async fn run_statement(&self, phase: &str, sql: &str) -> Result<(), TaskError> {
        self.execution.set_progress(phase);
        let writer = Arc::clone(&self.task.writer);
        let statement = sql.to_string();
        tokio::task::spawn_blocking(move || writer.execute(&statement))
            .await
            .map_err(|e| TaskError::Internal(format!("{phase} failed: {e}")))?
            .map_err(|e| TaskError::from_connector(Side::Target, &e))
    }

    async fn target_max(&self, update_key: &str) -> Result<Option<String>, TaskError> {
        let writer = Arc::clone(&self.task.writer);
        let object = self.task.config.target.object.clone();
        let column = update_key.to_string();
        tokio::task::spawn_blocking(move || writer.max_value(&object, &column))
            .await
            .map_err(|e| TaskError::Internal(format!("max value lookup failed: {e}")))?
            .map_err(|e| TaskError::from_connector(Side::Target, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{SourceConfig, TargetConfig};
    use crate::connector::ConnectionResolver;
    use crate::errors::ErrorKind;
    use loadstar_types::record::Record;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> ConnectorRegistry {
        ConnectorRegistry::new(ConnectionResolver::new(|_| None))
    }

    fn row(id: i64, updated: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), json!(id));
        r.insert("updated_at".into(), json!(updated));
        r
    }

    fn config(mode: Mode) -> TaskConfig {
        TaskConfig {
            source: SourceConfig {
                conn: "memory://src".into(),
                stream: "users".into(),
                ..SourceConfig::default()
            },
            target: TargetConfig {
                conn: "memory://dst".into(),
                object: "users_copy".into(),
                ..TargetConfig::default()
            },
            mode: Some(mode),
            ..TaskConfig::default()
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            show_progress: false,
            store_disabled: true,
            ..EngineSettings::default()
        }
    }

    #[test]
    fn prepare_rejects_unknown_connection() {
        let mut cfg = config(Mode::Append);
        cfg.source.conn = "nowhere".into();
        let err = prepare(cfg, &registry()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn prepare_rejects_upsert_without_keys() {
        let err = prepare(config(Mode::Upsert), &registry()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn prepare_resolves_write_mode_and_identity() {
        let mut cfg = config(Mode::Incremental);
        cfg.source.update_key = Some("updated_at".into());
        cfg.source.primary_key = vec!["id".into()];
        let prepared = prepare(cfg.clone(), &registry()).unwrap();
        assert_eq!(
            prepared.write_mode,
            WriteMode::Upsert {
                primary_key: vec!["id".into()]
            }
        );
        let again = prepare(cfg, &registry()).unwrap();
        assert_eq!(prepared.digest, again.digest);
        assert_eq!(prepared.stream_id, again.stream_id);
    }

    #[tokio::test]
    async fn full_refresh_copies_rows() {
        let registry = registry();
        registry
            .memory_database("src")
            .insert_rows("users", [row(1, "a"), row(2, "b")]);
        let controller = TaskController::new(prepare(config(Mode::FullRefresh), &registry).unwrap(), settings());
        let summary = controller.execute(&RunContext::new()).await;

        assert!(summary.is_success(), "{:?}", summary.error);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(summary.rows_read, 2);
        assert!(summary.checkpoint.is_none());
        assert_eq!(registry.memory_database("dst").rows("users_copy").unwrap().len(), 2);
        assert_eq!(controller.execution().status(), ExecStatus::Success);
        assert_eq!(controller.execution().view().status, ExecStatus::Success);
    }

    #[tokio::test]
    async fn read_failure_is_terminal_error() {
        let registry = registry();
        let src = registry.memory_database("src");
        src.insert_rows("users", [row(1, "a")]);
        src.fail_reads("users", "disk on fire");
        let controller = TaskController::new(prepare(config(Mode::Append), &registry).unwrap(), settings());
        let summary = controller.execute(&RunContext::new()).await;

        assert_eq!(summary.status, ExecStatus::Error);
        let err = summary.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::Read);
        assert!(err.to_string().contains("disk on fire"));
        assert!(registry.memory_database("dst").rows("users_copy").is_none());
    }

    #[tokio::test]
    async fn commit_failure_is_write_error() {
        let registry = registry();
        registry.memory_database("src").insert_rows("users", [row(1, "a")]);
        registry.memory_database("dst").fail_writes("users_copy", "quota");
        let controller = TaskController::new(prepare(config(Mode::Append), &registry).unwrap(), settings());
        let summary = controller.execute(&RunContext::new()).await;
        assert_eq!(summary.error.unwrap().kind(), ErrorKind::Write);
        assert!(registry
            .memory_database("dst")
            .table_names()
            .iter()
            .all(|t| !t.starts_with(crate::connector::memory::STAGING_PREFIX)));
    }

    #[tokio::test]
    async fn cancelled_before_start_finalizes_as_cancelled() {
        let registry = registry();
        registry.memory_database("src").insert_rows("users", [row(1, "a")]);
        let controller = TaskController::new(prepare(config(Mode::Append), &registry).unwrap(), settings());
        let ctx = RunContext::new();
        ctx.cancel("interrupted");
        let summary = controller.execute(&ctx).await;
        assert!(summary.error.unwrap().is_cancelled());
        assert!(registry.memory_database("dst").rows("users_copy").is_none());
    }

    #[tokio::test]
    async fn incremental_uses_target_max_and_tracks_high_water() {
        let registry = registry();
        registry.memory_database("src").insert_rows(
            "users",
            [row(1, "2023-01-01"), row(2, "2023-02-01"), row(3, "2023-03-01")],
        );
        registry
            .memory_database("dst")
            .insert_rows("users_copy", [row(1, "2023-01-01")]);
        let mut cfg = config(Mode::Incremental);
        cfg.source.update_key = Some("updated_at".into());
        let controller = TaskController::new(prepare(cfg, &registry).unwrap(), settings());
        let summary = controller.execute(&RunContext::new()).await;

        assert!(summary.is_success(), "{:?}", summary.error);
        // inclusive boundary re-reads the row at the checkpoint
        assert_eq!(summary.rows_written, 3);
        let checkpoint = summary.checkpoint.unwrap();
        assert_eq!(checkpoint.update_key, "updated_at");
        assert_eq!(checkpoint.value, "2023-03-01");
        let reads = registry.memory_database("src").reads();
        assert_eq!(reads[0].predicate.to_string(), "updated_at >= 2023-01-01");
    }

    #[tokio::test]
    async fn pre_and_post_sql_run_in_their_phases() {
        let registry = registry();
        registry.memory_database("src").insert_rows("users", [row(1, "a")]);
        let mut cfg = config(Mode::Append);
        cfg.target.options.pre_sql = Some("delete from users_copy".into());
        cfg.target.options.post_sql = Some("analyze users_copy".into());
        let controller = TaskController::new(prepare(cfg, &registry).unwrap(), settings());
        let summary = controller.execute(&RunContext::new()).await;

        assert!(summary.is_success(), "{:?}", summary.error);
        assert_eq!(
            registry.memory_database("dst").statements(),
            vec!["delete from users_copy", "analyze users_copy"]
        );
        let history = controller.execution().progress_history();
        assert_eq!(history.first().map(String::as_str), Some(PRE_SQL_PHASE));
        assert_eq!(history.last().map(String::as_str), Some(POST_SQL_PHASE));
    }

    #[tokio::test]
    async fn row_count_mismatch_is_assertion_error() {
        let registry = registry();
        registry.memory_database("src").insert_rows("users", [row(1, "a")]);
        let mut settings = settings();
        settings.expect_rows = Some(crate::settings::CountExpectation::Exactly(5));
        let controller = TaskController::new(prepare(config(Mode::Append), &registry).unwrap(), settings);
        let err = controller.execute(&RunContext::new()).await.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::Assertion);
        assert!(err.to_string().contains("expected 5 rows, got 1"));
    }

    #[test]
    fn cleanup_runs_once_and_late_actions_run_immediately() {
        let execution = TaskExecution::new(ExecutionId::new("e"), StreamId::new("s"), "users");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        execution.add_cleanup("first", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(execution.start());
        assert_eq!(execution.run_cleanup(), 1);
        assert_eq!(execution.run_cleanup(), 0);
        assert!(execution.finalize(Ok(())));
        assert!(!execution.finalize(Err(TaskError::Internal("late".into()))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(execution.status(), ExecStatus::Success);

        let c = count.clone();
        execution.add_cleanup("late", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(execution.pending_cleanup(), 0);
    }

    #[test]
    fn samples_after_finish_are_discarded() {
        let execution = TaskExecution::new(ExecutionId::new("e"), StreamId::new("s"), "users");
        execution.start();
        let mut tracker = RateTracker::new(Duration::from_secs(10));
        let later = Instant::now() + Duration::from_secs(120);
        let status = execution
            .sample(&mut tracker, later, Duration::from_secs(60))
            .unwrap();
        assert!(status.stalled);

        execution.record_row(10);
        let status = execution
            .sample(&mut tracker, Instant::now(), Duration::from_secs(60))
            .unwrap();
        assert!(!status.stalled);

        execution.finalize(Ok(()));
        assert!(execution
            .sample(&mut tracker, later, Duration::from_secs(60))
            .is_none());
        assert!(!execution.view().stalled);
    }

    #[test]
    fn status_updates_are_published() {
        let execution = TaskExecution::new(ExecutionId::new("e"), StreamId::new("s"), "users");
        let rx = execution.subscribe();
        execution.start();
        execution.set_progress("streaming");
        assert_eq!(rx.borrow().progress, "streaming");
        assert_eq!(rx.borrow().status, ExecStatus::Running);
    }
}

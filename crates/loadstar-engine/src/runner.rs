//! Engine entry points: single tasks, wildcard tasks and replications.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::config::parser::parse_manifest;
use crate::config::types::{
    DeclaredStream, ReplicationManifest, StreamList, StreamOverride, TaskConfig,
};
use crate::connector::{ConnectionResolver, ConnectorRegistry, SourceConnector};
use crate::context::RunContext;
use crate::errors::TaskError;
use crate::pattern;
use crate::recorder::{finish_record, resolve_project_id, start_record, ExecutionRecorder, RunOrigin};
use crate::replication::{self, ReplicationReport};
use crate::settings::{parse_bool, EngineSettings};
use crate::task::{prepare, TaskController, TaskSummary};

/// Result of running one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub stream_name: String,
    /// Absent when the task never started (rejected or dry run).
    pub summary: Option<TaskSummary>,
    rejected: Option<TaskError>,
    pub dry_run: bool,
}

impl TaskOutcome {
    fn rejected(stream_name: String, err: TaskError) -> Self {
        Self {
            stream_name,
            summary: None,
            rejected: Some(err),
            dry_run: false,
        }
    }

    /// The error that ended the task, if any.
    #[must_use]
    pub fn error(&self) -> Option<&TaskError> {
        self.rejected
            .as_ref()
            .or_else(|| self.summary.as_ref().and_then(|s| s.error.as_ref()))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }
}

/// What a [`Engine::run`] call ended up doing.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Task(TaskOutcome),
    Replication(ReplicationReport),
}

impl RunOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        match self {
            Self::Task(outcome) => outcome.is_success(),
            Self::Replication(report) => report.is_success(),
        }
    }
}

/// Connector registry, execution recorder and settings for a process.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<ConnectorRegistry>,
    recorder: ExecutionRecorder,
    settings: Arc<EngineSettings>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("exec_id", &self.settings.exec_id)
            .field("recorder", &self.recorder)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(registry: ConnectorRegistry, recorder: ExecutionRecorder, settings: EngineSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            recorder,
            settings: Arc::new(settings),
        }
    }

    /// Engine wired from settings: connections from the env file, history
    /// in the local store.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Configuration`] if the env file is malformed.
    pub fn from_settings(settings: EngineSettings) -> Result<Self, TaskError> {
        let resolver =
            ConnectionResolver::load(&settings.env_file()).map_err(|e| TaskError::configuration(&e))?;
        let recorder = ExecutionRecorder::open(&settings);
        Ok(Self::new(ConnectorRegistry::new(resolver), recorder, settings))
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    #[must_use]
    pub fn recorder(&self) -> &ExecutionRecorder {
        &self.recorder
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn source_connector(
        &self,
        conn: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn SourceConnector>, TaskError> {
        let (conn, endpoint) = self.registry.resolve_in(conn, env)?;
        endpoint.source().ok_or_else(|| {
            TaskError::Configuration(format!("connection '{}' cannot be read from", conn.name))
        })
    }

    /// Run a task, or a replication when its stream is a wildcard.
    ///
    /// # Errors
    ///
    /// Only replication-level structural errors are returned; task errors
    /// are part of the outcome.
    pub async fn run(
        &self,
        config: TaskConfig,
        origin: RunOrigin,
        ctx: &RunContext,
    ) -> Result<RunOutcome, TaskError> {
        if !pattern::has_wildcard(&config.source.stream) {
            return Ok(RunOutcome::Task(self.run_task(config, origin, ctx).await));
        }
        tracing::info!(pattern = %config.source.stream, "Running wildcard stream as a replication");
        let name = config.source.stream.clone();
        let manifest = wildcard_manifest(config);
        replication::run(self, manifest, &name, origin, &StreamOverride::default(), &[], ctx)
            .await
            .map(RunOutcome::Replication)
    }

    /// Run one task to completion.
    ///
    /// A panic inside the task is caught here and reported as an internal
    /// error.
    pub async fn run_task(&self, config: TaskConfig, origin: RunOrigin, ctx: &RunContext) -> TaskOutcome {
        let stream_name = config.stream_name().to_string();
        let engine = self.clone();
        let task_ctx = ctx.clone();
        let handle =
            tokio::spawn(async move { engine.execute_task(config, origin, &task_ctx).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = if e.is_panic() { "task panicked" } else { "task aborted" };
                tracing::error!(stream = %stream_name, error = %e, "{reason}");
                TaskOutcome::rejected(stream_name, TaskError::Internal(format!("{reason}: {e}")))
            }
        }
    }

    async fn execute_task(&self, config: TaskConfig, origin: RunOrigin, ctx: &RunContext) -> TaskOutcome {
        let stream_name = config.stream_name().to_string();
        let task = match prepare(config, &self.registry) {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(stream = %stream_name, kind = %err.kind(), error = %err, "Task rejected");
                return TaskOutcome::rejected(stream_name, err);
            }
        };

        ctx.set_telemetry("stage", "prepare");
        ctx.set_telemetry("task_mode", task.mode.as_str());
        ctx.set_telemetry("source_type", task.source.scheme.clone());
        ctx.set_telemetry("target_type", task.target.scheme.clone());

        let dry_run = match task.config.env.get("LOADSTAR_DRY_RUN") {
            Some(raw) => match parse_bool("LOADSTAR_DRY_RUN", raw) {
                Ok(flag) => flag,
                Err(err) => {
                    tracing::error!(stream = %stream_name, error = %err, "Task rejected");
                    return TaskOutcome::rejected(stream_name, err);
                }
            },
            None => self.settings.dry_run,
        };
        if dry_run {
            tracing::info!(
                stream = %stream_name,
                object = %task.config.target.object,
                mode = task.mode.as_str(),
                write_mode = task.write_mode.name(),
                digest = task.digest.short(),
                "Dry run: task prepared, nothing transferred"
            );
            return TaskOutcome {
                stream_name,
                summary: None,
                rejected: None,
                dry_run: true,
            };
        }

        let start = start_record(&task, &self.settings.exec_id, &origin);
        self.recorder.record_start(&task, &start).await;
        let stored = if task.mode.is_incremental() {
            self.recorder.checkpoint(&task.stream_id).await
        } else {
            None
        };

        ctx.set_telemetry("stage", "transfer");
        let controller = TaskController::new(task, (*self.settings).clone()).with_checkpoint(stored);
        let summary = controller.execute(ctx).await;
        ctx.set_telemetry("stage", "finish");
        ctx.set_telemetry("task_status", summary.status.as_str());
        ctx.set_telemetry("rows", summary.rows_written);

        let record = finish_record(&start, &summary, &controller.execution().progress_history());
        self.recorder.record_finish(&record).await;
        if let (true, Some(checkpoint)) = (summary.is_success(), summary.checkpoint.clone()) {
            tracing::debug!(
                stream = %stream_name,
                update_key = %checkpoint.update_key,
                value = %checkpoint.value,
                "Saving checkpoint"
            );
            self.recorder.save_checkpoint(&summary.stream_id, checkpoint).await;
        }

        TaskOutcome {
            stream_name,
            summary: Some(summary),
            rejected: None,
            dry_run: false,
        }
    }

    /// Load a manifest file and run the selected streams.
    ///
    /// `env` entries are layered over the manifest's own `env`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Configuration`] when the file cannot be loaded
    /// or the manifest is structurally invalid.
    pub async fn run_replication(
        &self,
        path: &Path,
        caller: &StreamOverride,
        filters: &[String],
        env: &BTreeMap<String, String>,
        ctx: &RunContext,
    ) -> Result<ReplicationReport, TaskError> {
        let mut manifest = parse_manifest(path)
            .with_context(|| format!("replication '{}'", path.display()))
            .map_err(|e| TaskError::configuration(&e))?;
        manifest
            .env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let name = path
            .file_stem()
            .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned());
        let origin = RunOrigin {
            replication_digest: None,
            project_id: resolve_project_id(self.settings.project_id.as_deref(), Some(path)),
            file_path: Some(path.display().to_string()),
        };
        self.run_manifest(manifest, &name, origin, caller, filters, ctx).await
    }

    /// Run an already parsed manifest.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Configuration`] for structural manifest errors.
    pub async fn run_manifest(
        &self,
        manifest: ReplicationManifest,
        name: &str,
        origin: RunOrigin,
        caller: &StreamOverride,
        filters: &[String],
        ctx: &RunContext,
    ) -> Result<ReplicationReport, TaskError> {
        replication::run(self, manifest, name, origin, caller, filters, ctx).await
    }

    /// Wait for background work (status pushes) to finish.
    pub async fn close(&self) {
        self.recorder.flush().await;
    }
}

/// One-pattern manifest equivalent to a wildcard task.
fn wildcard_manifest(config: TaskConfig) -> ReplicationManifest {
    let defaults = StreamOverride {
        object: Some(config.target.object),
        mode: config.mode,
        columns: (!config.source.columns.is_empty()).then_some(config.source.columns),
        primary_key: (!config.source.primary_key.is_empty()).then_some(config.source.primary_key),
        update_key: config.source.update_key,
        sql: config.source.sql,
        disabled: None,
        depends_on: None,
        source_options: (!config.source.options.is_empty()).then_some(config.source.options),
        target_options: (!config.target.options.is_empty()).then_some(config.target.options),
    };
    ReplicationManifest {
        source: config.source.conn,
        target: config.target.conn,
        defaults,
        streams: StreamList(vec![DeclaredStream {
            name: config.source.stream,
            config: StreamOverride::default(),
        }]),
        env: config.env,
    }
}

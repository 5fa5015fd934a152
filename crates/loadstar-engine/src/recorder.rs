//! Best-effort persistence of execution history.
//!
//! Every store call runs on a blocking thread and every failure is logged
//! and absorbed: a broken or missing store never fails a run. Records may
//! also be pushed to a remote status endpoint.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use loadstar_state::{ExecutionStore, SqliteExecutionStore};
use loadstar_types::state::{
    CheckpointState, ContentDigest, ExecStatus, ExecutionId, ExecutionRecord, ReplicationSnapshot,
    StreamId, TaskSnapshot,
};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::types::ReplicationManifest;
use crate::connector::Connection;
use crate::digest::sha256_hex;
use crate::settings::{EngineSettings, BOOKKEEPING_ENV_KEYS};
use crate::task::{PreparedTask, TaskSummary};

const STATUS_PUSH_ATTEMPTS: u32 = 3;
const STATUS_PUSH_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_PUSH_BACKOFF: Duration = Duration::from_millis(100);

/// Where a task run came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOrigin {
    pub replication_digest: Option<ContentDigest>,
    pub project_id: Option<String>,
    pub file_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshots and records
// ---------------------------------------------------------------------------

fn sanitize_conn(conn: &str) -> String {
    Connection::from_url(conn, conn).map_or_else(|| conn.to_string(), |c| c.sanitized())
}

/// Configuration as persisted: connection URLs reduced to their scheme and
/// bookkeeping env entries dropped.
#[must_use]
pub fn task_snapshot(task: &PreparedTask, project_id: Option<String>) -> TaskSnapshot {
    let mut config = task.config.clone();
    config.source.conn = task.source.sanitized();
    config.target.conn = task.target.sanitized();
    config
        .env
        .retain(|k, _| !BOOKKEEPING_ENV_KEYS.contains(&k.as_str()));
    TaskSnapshot {
        digest: task.digest.clone(),
        project_id,
        mode: task.mode.as_str().to_string(),
        config: serde_json::to_value(&config).unwrap_or(Value::Null),
    }
}

#[must_use]
pub fn replication_snapshot(
    manifest: &ReplicationManifest,
    digest: ContentDigest,
    name: &str,
    project_id: Option<String>,
) -> ReplicationSnapshot {
    let mut manifest = manifest.clone();
    manifest.source = sanitize_conn(&manifest.source);
    manifest.target = sanitize_conn(&manifest.target);
    manifest
        .env
        .retain(|k, _| !BOOKKEEPING_ENV_KEYS.contains(&k.as_str()));
    ReplicationSnapshot {
        digest,
        name: name.to_string(),
        project_id,
        manifest: serde_json::to_value(&manifest).unwrap_or(Value::Null),
    }
}

/// Record inserted when a run starts.
#[must_use]
pub fn start_record(task: &PreparedTask, exec_id: &ExecutionId, origin: &RunOrigin) -> ExecutionRecord {
    ExecutionRecord {
        exec_id: exec_id.clone(),
        stream_id: task.stream_id.clone(),
        stream_name: task.stream_name().to_string(),
        task_digest: task.digest.clone(),
        replication_digest: origin.replication_digest.clone(),
        status: ExecStatus::Created,
        error: None,
        start_time: Some(Utc::now()),
        end_time: None,
        rows: 0,
        bytes: 0,
        output: String::new(),
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        project_id: origin.project_id.clone(),
        file_path: origin.file_path.clone(),
    }
}

/// The start record brought up to date with a finished run.
#[must_use]
pub fn finish_record(start: &ExecutionRecord, summary: &TaskSummary, output: &[String]) -> ExecutionRecord {
    let succeeded = summary.is_success();
    ExecutionRecord {
        status: summary.status,
        error: summary.error.as_ref().map(ToString::to_string),
        start_time: summary.start_time.or(start.start_time),
        end_time: summary.end_time.or_else(|| Some(Utc::now())),
        rows: if succeeded { summary.rows_written } else { summary.rows_read },
        bytes: if succeeded { summary.bytes_written } else { summary.bytes_read },
        output: output.join("\n"),
        ..start.clone()
    }
}

/// Project identifier for runs of a config file: the explicit id, else the
/// root commit of the enclosing git repository, else a digest of the
/// file's directory.
#[must_use]
pub fn resolve_project_id(explicit: Option<&str>, config_path: Option<&Path>) -> Option<String> {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return Some(id.to_string());
    }
    let path = config_path?;
    let dir = path
        .canonicalize()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .or_else(|| path.parent().map(Path::to_path_buf))?;

    let root_commit = std::process::Command::new("git")
        .args(["rev-list", "--max-parents=0", "HEAD"])
        .current_dir(&dir)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .map(|line| line.trim().to_string())
        })
        .filter(|commit| !commit.is_empty());

    Some(root_commit.unwrap_or_else(|| sha256_hex(dir.to_string_lossy().as_bytes())))
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StatusPush {
    url: String,
    client: reqwest::Client,
}

impl StatusPush {
    async fn send(&self, record: &ExecutionRecord) {
        for attempt in 1..=STATUS_PUSH_ATTEMPTS {
            match self.client.post(&self.url).json(record).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => tracing::debug!(
                    attempt,
                    status = %resp.status(),
                    "Status endpoint rejected update"
                ),
                Err(e) => tracing::debug!(attempt, error = %e, "Status push failed"),
            }
            if attempt < STATUS_PUSH_ATTEMPTS {
                tokio::time::sleep(STATUS_PUSH_BACKOFF * attempt).await;
            }
        }
        tracing::warn!(
            exec_id = %record.exec_id,
            stream = %record.stream_name,
            "Giving up on status push"
        );
    }
}

/// Facade over an optional [`ExecutionStore`] and status endpoint.
#[derive(Clone, Default)]
pub struct ExecutionRecorder {
    store: Option<Arc<dyn ExecutionStore>>,
    status: Option<StatusPush>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ExecutionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRecorder")
            .field("store", &self.store.is_some())
            .field("status_url", &self.status.as_ref().map(|s| s.url.as_str()))
            .finish_non_exhaustive()
    }
}

impl ExecutionRecorder {
    /// A recorder that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(store: Option<Arc<dyn ExecutionStore>>, status_url: Option<String>) -> Self {
        let status = status_url.and_then(|url| {
            match reqwest::Client::builder().timeout(STATUS_PUSH_TIMEOUT).build() {
                Ok(client) => Some(StatusPush { url, client }),
                Err(e) => {
                    tracing::warn!(error = %e, "Status push disabled: HTTP client unavailable");
                    None
                }
            }
        });
        Self {
            store,
            status,
            pending: Arc::default(),
        }
    }

    /// Open the SQLite store named by `settings`. Any failure leaves
    /// persistence disabled.
    #[must_use]
    pub fn open(settings: &EngineSettings) -> Self {
        let store: Option<Arc<dyn ExecutionStore>> = if settings.store_disabled {
            tracing::debug!("Execution store disabled");
            None
        } else {
            let path = settings.store_path();
            match SqliteExecutionStore::open(&path) {
                Ok(store) => {
                    tracing::debug!(path = %path.display(), "Execution store opened");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Execution store unavailable; continuing without history"
                    );
                    None
                }
            }
        };
        Self::new(store, settings.status_url.clone())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn ExecutionStore>> {
        self.store.clone()
    }

    async fn with_store<T, F>(&self, operation: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ExecutionStore) -> loadstar_state::error::Result<T> + Send + 'static,
    {
        let store = self.store.clone()?;
        match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(operation, error = %e, "Execution store operation failed");
                None
            }
            Err(e) => {
                tracing::warn!(operation, error = %e, "Execution store task failed");
                None
            }
        }
    }

    fn push_status(&self, record: &ExecutionRecord) {
        let Some(push) = self.status.clone() else {
            return;
        };
        let mut record = record.clone();
        record.output.clear();
        let handle = tokio::spawn(async move { push.send(&record).await });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Insert the task snapshot if absent, then the start record. Returns
    /// the store-local id of the record.
    pub async fn record_start(
        &self,
        task: &PreparedTask,
        record: &ExecutionRecord,
    ) -> Option<i64> {
        let snapshot = task_snapshot(task, record.project_id.clone());
        let row = record.clone();
        let id = self
            .with_store("record_start", move |store| {
                if store.insert_task_snapshot(&snapshot)? {
                    tracing::debug!(digest = snapshot.digest.short(), "Stored task snapshot");
                }
                store.insert_execution(&row)
            })
            .await;
        self.push_status(record);
        id
    }

    /// Update the record of a run in place.
    pub async fn record_finish(&self, record: &ExecutionRecord) {
        let row = record.clone();
        let updated = self
            .with_store("record_finish", move |store| store.update_execution(&row))
            .await;
        if updated == Some(false) {
            tracing::debug!(
                exec_id = %record.exec_id,
                stream = %record.stream_name,
                "No execution record to update"
            );
        }
        self.push_status(record);
    }

    pub async fn record_replication(&self, snapshot: ReplicationSnapshot) {
        let inserted = self
            .with_store("record_replication", move |store| {
                store.insert_replication_snapshot(&snapshot)
            })
            .await;
        if inserted == Some(true) {
            tracing::debug!("Stored replication snapshot");
        }
    }

    pub async fn checkpoint(&self, stream_id: &StreamId) -> Option<CheckpointState> {
        let stream_id = stream_id.clone();
        self.with_store("get_checkpoint", move |store| store.get_checkpoint(&stream_id))
            .await
            .flatten()
    }

    pub async fn save_checkpoint(&self, stream_id: &StreamId, checkpoint: CheckpointState) {
        let stream_id = stream_id.clone();
        self.with_store("set_checkpoint", move |store| {
            store.set_checkpoint(&stream_id, &checkpoint)
        })
        .await;
    }

    /// Wait for in-flight status pushes.
    pub async fn flush(&self) {
        let pending: Vec<_> = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in pending {
            if let Err(e) = handle.await {
                tracing::debug!(error = %e, "Status push task ended abnormally");
            }
        }
    }
}

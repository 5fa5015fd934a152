//! End-to-end runs through the public engine API against in-memory
//! endpoints and a SQLite execution store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loadstar_engine::checkpoint::ReadSpec;
use loadstar_engine::config::parser::parse_manifest_str;
use loadstar_engine::config::types::{SourceConfig, StreamOverride, TargetConfig, TaskConfig};
use loadstar_engine::connector::memory::MemoryDatabase;
use loadstar_engine::connector::{
    Connection, ConnectionResolver, ConnectorRegistry, Endpoint, EndpointKind, RowSender,
    SourceConnector,
};
use loadstar_engine::{
    prepare, Engine, EngineSettings, ErrorKind, ExecutionRecorder, ExitStatus, ProcessSignal,
    RunContext, RunOrigin, Supervisor, TaskController,
};
use loadstar_state::{ExecutionStore, SqliteExecutionStore};
use loadstar_types::error::ConnectorError;
use loadstar_types::mode::Mode;
use loadstar_types::record::Record;
use loadstar_types::state::{ExecStatus, ExecutionQuery};
use serde_json::json;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn quiet() -> EngineSettings {
    EngineSettings {
        show_progress: false,
        store_disabled: true,
        ..EngineSettings::default()
    }
}

fn registry() -> ConnectorRegistry {
    ConnectorRegistry::new(ConnectionResolver::new(|_| None))
}

fn engine_with(recorder: ExecutionRecorder) -> Engine {
    Engine::new(registry(), recorder, quiet())
}

fn recording(store: Arc<dyn ExecutionStore>) -> ExecutionRecorder {
    ExecutionRecorder::new(Some(store), None)
}

fn row(id: i64, updated_at: &str) -> Record {
    let mut record = Record::new();
    record.insert("id".into(), json!(id));
    record.insert("updated_at".into(), json!(updated_at));
    record
}

fn task(stream: &str, object: &str, mode: Mode) -> TaskConfig {
    TaskConfig {
        source: SourceConfig {
            conn: "memory://src".into(),
            stream: stream.into(),
            ..SourceConfig::default()
        },
        target: TargetConfig {
            conn: "memory://dst".into(),
            object: object.into(),
            ..TargetConfig::default()
        },
        mode: Some(mode),
        ..TaskConfig::default()
    }
}

fn incremental_task() -> TaskConfig {
    let mut config = task("events", "events", Mode::Incremental);
    config.source.update_key = Some("updated_at".into());
    config
}

/// Source that counts discovery calls and delegates to a memory database.
struct CountingSource {
    inner: MemoryDatabase,
    discoveries: Arc<AtomicUsize>,
}

impl SourceConnector for CountingSource {
    fn discover(&self, pattern: &str) -> Result<Vec<String>, ConnectorError> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        self.inner.discover(pattern)
    }

    fn read_rows(&self, spec: &ReadSpec, rows: &mut RowSender) -> Result<(), ConnectorError> {
        self.inner.read_rows(spec, rows)
    }
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replication_counts_disabled_and_failed_streams() {
    let engine = engine_with(ExecutionRecorder::disabled());
    let src = engine.registry().memory_database("src");
    for table in ["a", "b", "c"] {
        src.insert_rows(table, [row(1, "2024-01-01")]);
    }
    src.fail_reads("c", "relation is locked");

    let manifest = parse_manifest_str(
        r"
source: memory://src
target: memory://dst
defaults:
  mode: full-refresh
  object: copy_{stream_table}
streams:
  a:
    disabled: true
  b:
  c:
",
    )
    .unwrap();

    let report = engine
        .run_manifest(
            manifest,
            "abc",
            RunOrigin::default(),
            &StreamOverride::default(),
            &[],
            &RunContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.declared, 3);
    assert_eq!(report.matched, 3);
    assert_eq!(report.run, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.disabled, 1);
    assert!(!report.is_success());
    let failure = &report.failures["c"];
    assert_eq!(failure.kind, ErrorKind::Read);
    assert!(failure.message.contains("relation is locked"), "{}", failure.message);

    let dst = engine.registry().memory_database("dst");
    assert_eq!(dst.table_names(), ["copy_b"]);
}

#[tokio::test]
async fn wildcard_streams_are_discovered_once() {
    let discoveries = Arc::new(AtomicUsize::new(0));
    let backing = MemoryDatabase::default();
    for table in ["sales.orders", "sales.refunds", "ops.jobs"] {
        backing.insert_rows(table, [row(1, "2024-01-01")]);
    }

    let mut registry = registry();
    let counter = discoveries.clone();
    let db = backing.clone();
    registry.register(
        "counting",
        Arc::new(move |_conn: &Connection| -> Result<Endpoint, ConnectorError> {
            Ok(Endpoint::new(EndpointKind::Database).with_source(Arc::new(CountingSource {
                inner: db.clone(),
                discoveries: counter.clone(),
            })))
        }),
    );
    let engine = Engine::new(registry, ExecutionRecorder::disabled(), quiet());

    let manifest = parse_manifest_str(
        r"
source: counting://warehouse
target: memory://dst
defaults:
  object: '{stream_schema}_{stream_table}'
streams:
  sales.*:
",
    )
    .unwrap();
    let declared = manifest.clone();

    let report = engine
        .run_manifest(
            manifest,
            "sales",
            RunOrigin::default(),
            &StreamOverride::default(),
            &[],
            &RunContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(discoveries.load(Ordering::SeqCst), 1);
    assert_eq!(report.matched, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(declared.streams.len(), 1);
    let mut tables = engine.registry().memory_database("dst").table_names();
    tables.sort();
    assert_eq!(tables, ["sales_orders", "sales_refunds"]);
}

#[tokio::test]
async fn stream_filter_limits_the_run() {
    let engine = engine_with(ExecutionRecorder::disabled());
    let src = engine.registry().memory_database("src");
    for table in ["users", "orders", "order_items"] {
        src.insert_rows(table, [row(1, "2024-01-01")]);
    }
    let manifest = parse_manifest_str(
        r"
source: memory://src
target: memory://dst
defaults:
  object: '{stream_name}'
streams:
  users:
  orders:
  order_items:
",
    )
    .unwrap();

    let report = engine
        .run_manifest(
            manifest,
            "shop",
            RunOrigin::default(),
            &StreamOverride::default(),
            &["order*".to_string()],
            &RunContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.declared, 3);
    assert_eq!(report.matched, 2);
    assert_eq!(report.succeeded, 2);
}

#[tokio::test]
async fn caller_keys_complete_a_manifest_upsert() {
    let engine = engine_with(ExecutionRecorder::disabled());
    engine
        .registry()
        .memory_database("src")
        .insert_rows("a", [row(1, "2024-01-01"), row(2, "2024-01-02")]);
    let manifest = parse_manifest_str(
        r"
source: memory://src
target: memory://dst
defaults:
  object: '{stream_name}'
streams:
  a:
    mode: upsert
",
    )
    .unwrap();
    let caller = StreamOverride {
        primary_key: Some(vec!["id".to_string()]),
        update_key: Some("updated_at".to_string()),
        ..StreamOverride::default()
    };

    let report = engine
        .run_manifest(manifest, "keys", RunOrigin::default(), &caller, &[], &RunContext::new())
        .await
        .unwrap();

    assert_eq!(report.run, 1);
    assert_eq!(report.succeeded, 1, "{:?}", report.failures);
    assert_eq!(engine.registry().memory_database("dst").rows("a").unwrap().len(), 2);
}

#[tokio::test]
async fn stream_missing_keys_fails_alone() {
    let engine = engine_with(ExecutionRecorder::disabled());
    let src = engine.registry().memory_database("src");
    for table in ["a", "b"] {
        src.insert_rows(table, [row(1, "2024-01-01")]);
    }
    let manifest = parse_manifest_str(
        r"
source: memory://src
target: memory://dst
defaults:
  object: '{stream_name}'
streams:
  a:
    mode: upsert
  b:
    mode: append
",
    )
    .unwrap();
    let ctx = RunContext::new();

    let report = engine
        .run_manifest(
            manifest,
            "keys",
            RunOrigin::default(),
            &StreamOverride::default(),
            &[],
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(report.run, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    let failure = &report.failures["a"];
    assert_eq!(failure.kind, ErrorKind::Configuration);
    assert!(failure.message.contains("primary key"), "{}", failure.message);
    let dst = engine.registry().memory_database("dst");
    assert!(dst.rows("a").is_none());
    assert_eq!(dst.rows("b").unwrap().len(), 1);

    let telemetry = ctx.telemetry();
    assert_eq!(telemetry["streams_run"], json!(2));
    assert_eq!(telemetry["streams_failed"], json!(1));
    assert_eq!(telemetry["task_status"], json!("success"));
    assert!(telemetry.contains_key("replication"));
}

#[tokio::test]
async fn manifest_env_names_connections() {
    let engine = engine_with(ExecutionRecorder::disabled());
    engine
        .registry()
        .memory_database("src")
        .insert_rows("users", [row(1, "2024-01-01")]);
    let manifest = parse_manifest_str(
        r"
source: MY_SRC
target: memory://dst
env:
  MY_SRC: memory://src
defaults:
  object: '{stream_name}'
streams:
  users:
",
    )
    .unwrap();

    let report = engine
        .run_manifest(
            manifest,
            "env",
            RunOrigin::default(),
            &StreamOverride::default(),
            &[],
            &RunContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1, "{:?}", report.failures);
    assert_eq!(engine.registry().memory_database("dst").rows("users").unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_mid_transfer_leaves_target_untouched() {
    let registry = registry();
    let src = registry.memory_database("src");
    src.insert_rows("events", (0..200).map(|i| row(i, "2024-01-01")));
    src.set_read_delay(Duration::from_millis(5));

    let prepared = prepare(task("events", "events", Mode::FullRefresh), &registry).unwrap();
    let controller = TaskController::new(prepared, quiet());
    let ctx = RunContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel("interrupted");
    });

    let summary = controller.execute(&ctx).await;

    assert_eq!(summary.status, ExecStatus::Error);
    assert_eq!(
        summary.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::Cancelled)
    );
    assert!(summary.rows_read < 200);
    assert_eq!(controller.execution().pending_cleanup(), 0);
    assert_eq!(controller.execution().run_cleanup(), 0);
    assert!(registry.memory_database("dst").table_names().is_empty());
}

#[tokio::test]
async fn cancel_during_replication_skips_remaining_streams() {
    let engine = engine_with(ExecutionRecorder::disabled());
    let src = engine.registry().memory_database("src");
    for table in ["a", "b", "c"] {
        src.insert_rows(table, (0..200).map(|i| row(i, "2024-01-01")));
    }
    src.set_read_delay(Duration::from_millis(5));
    let manifest = parse_manifest_str(
        r"
source: memory://src
target: memory://dst
defaults:
  mode: full-refresh
  object: '{stream_name}'
streams:
  a:
  b:
  c:
",
    )
    .unwrap();
    let ctx = RunContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel("interrupted");
    });

    let report = engine
        .run_manifest(
            manifest,
            "abc",
            RunOrigin::default(),
            &StreamOverride::default(),
            &[],
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(report.run, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failures["a"].kind, ErrorKind::Cancelled);
    assert!(engine.registry().memory_database("dst").table_names().is_empty());
}

#[tokio::test]
async fn interrupt_within_grace_reports_interrupted() {
    let engine = engine_with(ExecutionRecorder::disabled());
    let src = engine.registry().memory_database("src");
    src.insert_rows("events", (0..500).map(|i| row(i, "2024-01-01")));
    src.set_read_delay(Duration::from_millis(5));

    let (tx, rx) = mpsc::channel(1);
    let ctx = RunContext::new();
    let work_ctx = ctx.clone();
    let dst = engine.registry().memory_database("dst");
    let work = async move {
        engine
            .run_task(
                task("events", "events", Mode::FullRefresh),
                RunOrigin::default(),
                &work_ctx,
            )
            .await
            .is_success()
    };
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(ProcessSignal::Interrupt).await;
    });

    let status = Supervisor::with_grace(Duration::from_secs(5))
        .run(&ctx, rx, work)
        .await;
    assert_eq!(status, ExitStatus::Interrupted);
    assert_eq!(status.code(), 130);
    assert!(ctx.is_cancelled());
    assert!(dst.rows("events").is_none());
}

// ---------------------------------------------------------------------------
// Panics
// ---------------------------------------------------------------------------

/// Source that panics when asked for one stream and otherwise delegates.
struct PanickingSource {
    inner: MemoryDatabase,
    poisoned: &'static str,
}

impl SourceConnector for PanickingSource {
    fn discover(&self, pattern: &str) -> Result<Vec<String>, ConnectorError> {
        self.inner.discover(pattern)
    }

    fn read_rows(&self, spec: &ReadSpec, rows: &mut RowSender) -> Result<(), ConnectorError> {
        if spec.stream == self.poisoned {
            panic!("source driver crashed");
        }
        self.inner.read_rows(spec, rows)
    }
}

fn engine_with_panicking_source(backing: &MemoryDatabase, poisoned: &'static str) -> Engine {
    let mut registry = registry();
    let db = backing.clone();
    registry.register(
        "flaky",
        Arc::new(move |_conn: &Connection| -> Result<Endpoint, ConnectorError> {
            Ok(Endpoint::new(EndpointKind::Database).with_source(Arc::new(PanickingSource {
                inner: db.clone(),
                poisoned,
            })))
        }),
    );
    registry.register(
        "crashing",
        Arc::new(|_conn: &Connection| -> Result<Endpoint, ConnectorError> {
            panic!("driver failed to load")
        }),
    );
    Engine::new(registry, ExecutionRecorder::disabled(), quiet())
}

#[tokio::test]
async fn panicking_source_ends_the_task_with_an_error() {
    let backing = MemoryDatabase::default();
    backing.insert_rows("events", [row(1, "2024-01-01")]);
    let engine = engine_with_panicking_source(&backing, "events");
    let mut config = task("events", "events", Mode::FullRefresh);
    config.source.conn = "flaky://db".into();

    let outcome = engine
        .run_task(config, RunOrigin::default(), &RunContext::new())
        .await;

    assert_eq!(outcome.error().map(|e| e.kind()), Some(ErrorKind::Internal));
    assert!(engine.registry().memory_database("dst").rows("events").is_none());
}

#[tokio::test]
async fn panic_outside_the_transfer_is_caught_by_the_engine() {
    let engine = engine_with_panicking_source(&MemoryDatabase::default(), "events");
    let mut config = task("events", "events", Mode::FullRefresh);
    config.source.conn = "crashing://db".into();

    let outcome = engine
        .run_task(config, RunOrigin::default(), &RunContext::new())
        .await;

    let err = outcome.error().unwrap();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("task panicked"), "{err}");
}

#[tokio::test]
async fn panicking_stream_leaves_siblings_running() {
    let backing = MemoryDatabase::default();
    for table in ["events", "users"] {
        backing.insert_rows(table, [row(1, "2024-01-01")]);
    }
    let engine = engine_with_panicking_source(&backing, "events");
    let manifest = parse_manifest_str(
        r"
source: flaky://db
target: memory://dst
defaults:
  object: '{stream_name}'
streams:
  events:
  users:
",
    )
    .unwrap();

    let report = engine
        .run_manifest(
            manifest,
            "mixed",
            RunOrigin::default(),
            &StreamOverride::default(),
            &[],
            &RunContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.run, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures["events"].kind, ErrorKind::Internal);
    let dst = engine.registry().memory_database("dst");
    assert!(dst.rows("events").is_none());
    assert_eq!(dst.rows("users").unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Execution store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_runs_share_one_snapshot() {
    let store = Arc::new(SqliteExecutionStore::in_memory().unwrap());
    let engine = engine_with(recording(store.clone()));
    engine
        .registry()
        .memory_database("src")
        .insert_rows("users", [row(1, "2024-01-01"), row(2, "2024-01-02")]);

    for _ in 0..2 {
        let outcome = engine
            .run_task(
                task("users", "users", Mode::FullRefresh),
                RunOrigin::default(),
                &RunContext::new(),
            )
            .await;
        assert!(outcome.is_success(), "{:?}", outcome.error());
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.task_snapshots, 1);
    assert_eq!(stats.executions, 2);
    let rows = store.list_executions(&ExecutionQuery::default()).unwrap();
    assert!(rows.iter().all(|r| r.record.status == ExecStatus::Success));
    assert!(rows.iter().all(|r| r.record.rows == 2));
}

#[tokio::test]
async fn failed_run_is_recorded_with_its_error() {
    let store = Arc::new(SqliteExecutionStore::in_memory().unwrap());
    let engine = engine_with(recording(store.clone()));
    let src = engine.registry().memory_database("src");
    src.insert_rows("users", [row(1, "2024-01-01")]);
    engine
        .registry()
        .memory_database("dst")
        .fail_writes("users", "disk full");

    let outcome = engine
        .run_task(
            task("users", "users", Mode::FullRefresh),
            RunOrigin::default(),
            &RunContext::new(),
        )
        .await;
    assert_eq!(outcome.error().map(|e| e.kind()), Some(ErrorKind::Write));

    let rows = store
        .list_executions(&ExecutionQuery {
            status: Some(ExecStatus::Error),
            ..ExecutionQuery::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].record.error.as_deref().unwrap_or_default().contains("disk full"));
}

#[tokio::test]
async fn incremental_checkpoint_survives_a_new_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");

    let first = engine_with(recording(Arc::new(
        SqliteExecutionStore::open(&path).unwrap(),
    )));
    first
        .registry()
        .memory_database("src")
        .insert_rows("events", [row(1, "2024-01-01"), row(2, "2024-02-01")]);
    let outcome = first
        .run_task(incremental_task(), RunOrigin::default(), &RunContext::new())
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.error());
    let checkpoint = outcome.summary.as_ref().and_then(|s| s.checkpoint.clone()).unwrap();
    assert_eq!(checkpoint.value, "2024-02-01");
    first.close().await;
    drop(first);

    // Fresh engine, fresh (empty) target: only the stored checkpoint bounds the read.
    let second = engine_with(recording(Arc::new(
        SqliteExecutionStore::open(&path).unwrap(),
    )));
    let src = second.registry().memory_database("src");
    src.insert_rows(
        "events",
        [row(1, "2024-01-01"), row(2, "2024-02-01"), row(3, "2024-03-01")],
    );
    let outcome = second
        .run_task(incremental_task(), RunOrigin::default(), &RunContext::new())
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.error());

    let reads = src.reads();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].predicate.to_string(), "updated_at >= 2024-02-01");
    let written = second.registry().memory_database("dst").rows("events").unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(
        outcome.summary.and_then(|s| s.checkpoint).map(|c| c.value).as_deref(),
        Some("2024-03-01")
    );
}

//! Idempotent DDL for the execution store.
//!
//! Columns are only ever added, never renamed or dropped.

pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS task_snapshots (
    digest TEXT PRIMARY KEY,
    project_id TEXT,
    mode TEXT NOT NULL,
    config_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS replication_snapshots (
    digest TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project_id TEXT,
    manifest_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exec_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    stream_name TEXT NOT NULL,
    task_digest TEXT NOT NULL,
    replication_digest TEXT,
    status TEXT NOT NULL,
    error_message TEXT,
    start_time TEXT,
    end_time TEXT,
    rows INTEGER NOT NULL DEFAULT 0,
    bytes INTEGER NOT NULL DEFAULT 0,
    output TEXT NOT NULL DEFAULT '',
    pid INTEGER NOT NULL DEFAULT 0,
    version TEXT NOT NULL DEFAULT '',
    project_id TEXT,
    file_path TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_exec_stream ON executions (exec_id, stream_id);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status);
CREATE INDEX IF NOT EXISTS idx_executions_start_time ON executions (start_time);

CREATE TABLE IF NOT EXISTS checkpoints (
    stream_id TEXT PRIMARY KEY,
    update_key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

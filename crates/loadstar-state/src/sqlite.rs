//! `SQLite`-backed implementation of [`ExecutionStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are
//! stored as RFC 3339 UTC strings with millisecond precision so that text
//! ordering matches time ordering.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use loadstar_types::state::{
    CheckpointState, ContentDigest, ExecStatus, ExecutionId, ExecutionQuery, ExecutionRecord,
    ReplicationSnapshot, StoreStats, StoredExecution, StreamId, TaskSnapshot,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Row};

use crate::backend::ExecutionStore;
use crate::error::{self, StoreError};
use crate::schema::CREATE_TABLES;

const EXECUTION_COLUMNS: &str = "id, exec_id, stream_id, stream_name, task_digest, \
    replication_digest, status, error_message, start_time, end_time, rows, bytes, output, \
    pid, version, project_id, file_path, updated_at";

/// `SQLite`-backed execution store.
///
/// Create with [`SqliteExecutionStore::open`] for file-backed persistence
/// or [`SqliteExecutionStore::in_memory`] for tests.
pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

impl SqliteExecutionStore {
    /// Open or create a store database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory can't be created,
    /// or [`StoreError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the schema can't be created.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn to_sql_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_sql_time(column: &'static str, raw: &str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            column,
            value: raw.to_string(),
        })
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Column values as read, before conversion into model types.
struct RawExecution {
    id: i64,
    exec_id: String,
    stream_id: String,
    stream_name: String,
    task_digest: String,
    replication_digest: Option<String>,
    status: String,
    error: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    rows: i64,
    bytes: i64,
    output: String,
    pid: i64,
    version: String,
    project_id: Option<String>,
    file_path: Option<String>,
    updated_at: String,
}

impl RawExecution {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            exec_id: row.get(1)?,
            stream_id: row.get(2)?,
            stream_name: row.get(3)?,
            task_digest: row.get(4)?,
            replication_digest: row.get(5)?,
            status: row.get(6)?,
            error: row.get(7)?,
            start_time: row.get(8)?,
            end_time: row.get(9)?,
            rows: row.get(10)?,
            bytes: row.get(11)?,
            output: row.get(12)?,
            pid: row.get(13)?,
            version: row.get(14)?,
            project_id: row.get(15)?,
            file_path: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_stored(self) -> error::Result<StoredExecution> {
        let status = ExecStatus::parse(&self.status).ok_or(StoreError::InvalidValue {
            column: "status",
            value: self.status.clone(),
        })?;
        let start_time = self
            .start_time
            .as_deref()
            .map(|raw| from_sql_time("start_time", raw))
            .transpose()?;
        let end_time = self
            .end_time
            .as_deref()
            .map(|raw| from_sql_time("end_time", raw))
            .transpose()?;

        Ok(StoredExecution {
            id: self.id,
            record: ExecutionRecord {
                exec_id: ExecutionId::new(self.exec_id),
                stream_id: StreamId::new(self.stream_id),
                stream_name: self.stream_name,
                task_digest: ContentDigest::new(self.task_digest),
                replication_digest: self.replication_digest.map(ContentDigest::new),
                status,
                error: self.error,
                start_time,
                end_time,
                rows: from_sql_count(self.rows),
                bytes: from_sql_count(self.bytes),
                output: self.output,
                pid: u32::try_from(self.pid).unwrap_or(0),
                version: self.version,
                project_id: self.project_id,
                file_path: self.file_path,
            },
            updated_at: from_sql_time("updated_at", &self.updated_at)?,
        })
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn insert_task_snapshot(&self, snapshot: &TaskSnapshot) -> error::Result<bool> {
        let config_json = serde_json::to_string(&snapshot.config)?;
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO task_snapshots (digest, project_id, mode, config_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.digest.as_str(),
                snapshot.project_id,
                snapshot.mode,
                config_json,
                to_sql_time(&Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn insert_replication_snapshot(&self, snapshot: &ReplicationSnapshot) -> error::Result<bool> {
        let manifest_json = serde_json::to_string(&snapshot.manifest)?;
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO replication_snapshots \
             (digest, name, project_id, manifest_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.digest.as_str(),
                snapshot.name,
                snapshot.project_id,
                manifest_json,
                to_sql_time(&Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn insert_execution(&self, record: &ExecutionRecord) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO executions (exec_id, stream_id, stream_name, task_digest, \
             replication_digest, status, error_message, start_time, end_time, rows, bytes, \
             output, pid, version, project_id, file_path, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                record.exec_id.as_str(),
                record.stream_id.as_str(),
                record.stream_name,
                record.task_digest.as_str(),
                record.replication_digest.as_ref().map(ContentDigest::as_str),
                record.status.as_str(),
                record.error,
                record.start_time.as_ref().map(to_sql_time),
                record.end_time.as_ref().map(to_sql_time),
                to_sql_count(record.rows),
                to_sql_count(record.bytes),
                record.output,
                i64::from(record.pid),
                record.version,
                record.project_id,
                record.file_path,
                to_sql_time(&Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_execution(&self, record: &ExecutionRecord) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE executions SET status = ?1, error_message = ?2, start_time = ?3, \
             end_time = ?4, rows = ?5, bytes = ?6, output = ?7, updated_at = ?8 \
             WHERE id = (SELECT MAX(id) FROM executions WHERE exec_id = ?9 AND stream_id = ?10)",
            params![
                record.status.as_str(),
                record.error,
                record.start_time.as_ref().map(to_sql_time),
                record.end_time.as_ref().map(to_sql_time),
                to_sql_count(record.rows),
                to_sql_count(record.bytes),
                record.output,
                to_sql_time(&Utc::now()),
                record.exec_id.as_str(),
                record.stream_id.as_str(),
            ],
        )?;
        Ok(updated > 0)
    }

    fn find_execution(
        &self,
        exec_id: &ExecutionId,
        stream_id: &StreamId,
    ) -> error::Result<Option<StoredExecution>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE exec_id = ?1 AND stream_id = ?2 ORDER BY id DESC LIMIT 1"
        );
        let result = conn.query_row(
            &sql,
            params![exec_id.as_str(), stream_id.as_str()],
            RawExecution::from_row,
        );
        match result {
            Ok(raw) => raw.into_stored().map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    fn list_executions(&self, query: &ExecutionQuery) -> error::Result<Vec<StoredExecution>> {
        let mut conditions = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(status) = query.status {
            values.push(SqlValue::Text(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", values.len()));
        }
        if let Some(exec_id) = &query.exec_id {
            values.push(SqlValue::Text(exec_id.as_str().to_string()));
            conditions.push(format!("exec_id = ?{}", values.len()));
        }
        if let Some(since) = &query.since {
            values.push(SqlValue::Text(to_sql_time(since)));
            conditions.push(format!("start_time >= ?{}", values.len()));
        }
        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        values.push(SqlValue::Integer(
            i64::try_from(query.limit).unwrap_or(i64::MAX),
        ));
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions {filter} ORDER BY id DESC LIMIT ?{}",
            values.len()
        );

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raw_rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), RawExecution::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw_rows.into_iter().map(RawExecution::into_stored).collect()
    }

    fn get_checkpoint(&self, stream_id: &StreamId) -> error::Result<Option<CheckpointState>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT update_key, value, updated_at FROM checkpoints WHERE stream_id = ?1",
            params![stream_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );
        match result {
            Ok((update_key, value, updated_at)) => Ok(Some(CheckpointState {
                update_key,
                value,
                updated_at: from_sql_time("updated_at", &updated_at)?,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    fn set_checkpoint(
        &self,
        stream_id: &StreamId,
        checkpoint: &CheckpointState,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkpoints (stream_id, update_key, value, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(stream_id) \
             DO UPDATE SET update_key = ?2, value = ?3, updated_at = ?4",
            params![
                stream_id.as_str(),
                checkpoint.update_key,
                checkpoint.value,
                to_sql_time(&checkpoint.updated_at),
            ],
        )?;
        Ok(())
    }

    fn stats(&self) -> error::Result<StoreStats> {
        let conn = self.lock_conn()?;
        let count = |table: &str| -> error::Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
            Ok(from_sql_count(n))
        };
        Ok(StoreStats {
            task_snapshots: count("task_snapshots")?,
            replication_snapshots: count("replication_snapshots")?,
            executions: count("executions")?,
        })
    }
}

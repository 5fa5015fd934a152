//! In-process table store usable as both source and target.
//!
//! Loads stage into a `_loadstar_tmp_*` table and only touch the final
//! table at commit. Failure injection and per-row read delays make it
//! convenient for exercising the engine without external systems.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use loadstar_types::error::ConnectorError;
use loadstar_types::mode::WriteMode;
use loadstar_types::record::{record_size, Record};
use serde_json::Value;

use crate::checkpoint::{HighWaterMark, ReadSpec};
use crate::connector::{
    RowReceiver, RowSender, SourceConnector, TargetConnector, WriteRequest, WriteSummary,
};
use crate::pattern;

/// Prefix of staging tables.
pub const STAGING_PREFIX: &str = "_loadstar_tmp_";

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Record>>,
    statements: Vec<String>,
    reads: Vec<ReadSpec>,
    read_failures: BTreeMap<String, String>,
    write_failures: BTreeMap<String, String>,
    read_delay: Option<Duration>,
    staged_seq: u64,
}

/// Shared handle to one in-memory database. Clones see the same tables.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("tables", &self.table_names())
            .finish()
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDatabase {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Append rows to a table, creating it if needed.
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Record>) {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Rows of a table, if it exists.
    #[must_use]
    pub fn rows(&self, table: &str) -> Option<Vec<Record>> {
        self.state().tables.get(table).cloned()
    }

    /// All table names, staging tables included.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.state().tables.keys().cloned().collect()
    }

    /// Statements passed to `execute`, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    /// Read specifications received, in order.
    #[must_use]
    pub fn reads(&self) -> Vec<ReadSpec> {
        self.state().reads.clone()
    }

    /// Make reads of `table` fail with `message`.
    pub fn fail_reads(&self, table: &str, message: &str) {
        self.state()
            .read_failures
            .insert(table.to_string(), message.to_string());
    }

    /// Make loads into `object` fail at commit with `message`.
    pub fn fail_writes(&self, object: &str, message: &str) {
        self.state()
            .write_failures
            .insert(object.to_string(), message.to_string());
    }

    /// Pause between rows on every read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = Some(delay);
    }

    fn commit(
        state: &mut MemoryState,
        object: &str,
        mode: &WriteMode,
        staged: Vec<Record>,
    ) -> Result<(), ConnectorError> {
        match mode {
            WriteMode::Append => {
                state
                    .tables
                    .entry(object.to_string())
                    .or_default()
                    .extend(staged);
            }
            WriteMode::Truncate | WriteMode::Drop => {
                state.tables.insert(object.to_string(), staged);
            }
            WriteMode::Upsert { primary_key } => {
                if primary_key.is_empty() {
                    return Err(ConnectorError::config(
                        "MISSING_PRIMARY_KEY",
                        format!("upsert into '{object}' needs a primary key"),
                    ));
                }
                let key_of = |row: &Record| -> Vec<Value> {
                    primary_key
                        .iter()
                        .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
                        .collect()
                };
                let table = state.tables.entry(object.to_string()).or_default();
                for row in staged {
                    let key = key_of(&row);
                    match table.iter_mut().find(|existing| key_of(existing) == key) {
                        Some(existing) => *existing = row,
                        None => table.push(row),
                    }
                }
            }
        }
        Ok(())
    }
}

impl SourceConnector for MemoryDatabase {
    fn discover(&self, pattern_text: &str) -> Result<Vec<String>, ConnectorError> {
        Ok(self
            .state()
            .tables
            .keys()
            .filter(|name| !name.starts_with(STAGING_PREFIX))
            .filter(|name| pattern::matches(pattern_text, name))
            .cloned()
            .collect())
    }

    fn read_rows(&self, spec: &ReadSpec, rows: &mut RowSender) -> Result<(), ConnectorError> {
        let (source_rows, delay) = {
            let mut state = self.state();
            state.reads.push(spec.clone());
            if let Some(message) = state.read_failures.get(&spec.stream) {
                return Err(ConnectorError::read("READ_FAILED", message.clone()));
            }
            let table = state.tables.get(&spec.stream).cloned().ok_or_else(|| {
                ConnectorError::read(
                    "TABLE_NOT_FOUND",
                    format!("table '{}' does not exist", spec.stream),
                )
            })?;
            (table, state.read_delay)
        };

        let limit = spec.limit.unwrap_or(u64::MAX);
        let mut sent = 0u64;
        for record in source_rows {
            if sent >= limit {
                break;
            }
            if !spec.predicate.matches(&record) {
                continue;
            }
            rows.send(spec.project(record))?;
            sent += 1;
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }
}

impl TargetConnector for MemoryDatabase {
    fn write_rows(
        &self,
        request: &WriteRequest,
        rows: &mut RowReceiver,
    ) -> Result<WriteSummary, ConnectorError> {
        let staged_name = {
            let mut state = self.state();
            state.staged_seq += 1;
            let name = format!("{STAGING_PREFIX}{}_{}", request.object, state.staged_seq);
            state.tables.insert(name.clone(), Vec::new());
            name
        };
        let shared = Arc::clone(&self.state);
        let dropped = staged_name.clone();
        request
            .cleanup
            .register(format!("drop staging table {staged_name}"), move || {
                lock(&shared).tables.remove(&dropped);
            });

        let mut summary = WriteSummary::default();
        while let Some(record) = rows.next_row()? {
            summary.rows_written += 1;
            summary.bytes_written += record_size(&record);
            self.state()
                .tables
                .entry(staged_name.clone())
                .or_default()
                .push(record);
        }

        let mut state = self.state();
        if let Some(message) = state.write_failures.get(&request.object) {
            return Err(ConnectorError::write("COMMIT_FAILED", message.clone()));
        }
        let staged = state.tables.remove(&staged_name).unwrap_or_default();
        Self::commit(&mut state, &request.object, &request.mode, staged)?;
        Ok(summary)
    }

    fn max_value(&self, object: &str, column: &str) -> Result<Option<String>, ConnectorError> {
        let state = self.state();
        let Some(table) = state.tables.get(object) else {
            return Ok(None);
        };
        let mut hwm = HighWaterMark::new(column, None);
        for row in table {
            hwm.observe(row);
        }
        Ok(hwm.value().map(String::from))
    }

    fn execute(&self, statement: &str) -> Result<(), ConnectorError> {
        self.state().statements.push(statement.to_string());
        Ok(())
    }
}

//! Newline-delimited JSON files as a source and target.
//!
//! Objects are paths, absolute or relative to the connection root. Loads
//! write a hidden temp file next to the final file and rename it into
//! place on commit, so readers never see a partial file.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use loadstar_types::error::ConnectorError;
use loadstar_types::mode::WriteMode;
use loadstar_types::record::Record;

use crate::checkpoint::{HighWaterMark, ReadSpec};
use crate::connector::{
    RowReceiver, RowSender, SourceConnector, TargetConnector, WriteRequest, WriteSummary,
};
use crate::pattern;

#[derive(Debug, Clone)]
pub struct FileEndpoint {
    root: PathBuf,
}

fn io_error(code: &str, path: &Path, err: &std::io::Error) -> ConnectorError {
    ConnectorError::internal(code, format!("{}: {err}", path.display()))
}

impl FileEndpoint {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root taken from a `file://` URL; `file://` alone means the working directory.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let path = url.strip_prefix("file://").unwrap_or(url);
        Self::new(path)
    }

    fn resolve(&self, object: &str) -> PathBuf {
        let trimmed = object.strip_prefix("file://").unwrap_or(object);
        let path = Path::new(trimmed);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn for_each_record(
        path: &Path,
        mut visit: impl FnMut(Record) -> Result<bool, ConnectorError>,
    ) -> Result<(), ConnectorError> {
        let file = File::open(path).map_err(|e| {
            ConnectorError::read("OPEN_FAILED", format!("{}: {e}", path.display()))
        })?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ConnectorError::read("READ_FAILED", e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|e| {
                ConnectorError::read(
                    "BAD_LINE",
                    format!("{}:{}: {e}", path.display(), idx + 1),
                )
                .with_details(serde_json::json!({"line": idx + 1, "column": e.column()}))
            })?;
            if !visit(record)? {
                break;
            }
        }
        Ok(())
    }
}

impl SourceConnector for FileEndpoint {
    fn discover(&self, pattern_text: &str) -> Result<Vec<String>, ConnectorError> {
        let (prefix, file_pattern) = match pattern_text.rfind('/') {
            Some(idx) => pattern_text.split_at(idx + 1),
            None => ("", pattern_text),
        };
        if pattern::has_wildcard(prefix) {
            return Err(ConnectorError::config(
                "UNSUPPORTED_PATTERN",
                format!("wildcards are only supported in file names: {pattern_text}"),
            ));
        }
        let dir = self.resolve(if prefix.is_empty() { "." } else { prefix });
        let entries = fs::read_dir(&dir).map_err(|e| io_error("LIST_FAILED", &dir, &e))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("LIST_FAILED", &dir, &e))?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && pattern::matches(file_pattern, &name) {
                found.push(format!("{prefix}{name}"));
            }
        }
        found.sort();
        Ok(found)
    }

    fn read_rows(&self, spec: &ReadSpec, rows: &mut RowSender) -> Result<(), ConnectorError> {
        if spec.sql.is_some() {
            return Err(ConnectorError::config(
                "UNSUPPORTED_QUERY",
                "file sources do not run queries",
            ));
        }
        let path = self.resolve(&spec.stream);
        let limit = spec.limit.unwrap_or(u64::MAX);
        let mut sent = 0u64;
        Self::for_each_record(&path, |record| {
            if sent >= limit {
                return Ok(false);
            }
            if spec.predicate.matches(&record) {
                rows.send(spec.project(record))?;
                sent += 1;
            }
            Ok(true)
        })
    }
}

impl TargetConnector for FileEndpoint {
    fn write_rows(
        &self,
        request: &WriteRequest,
        rows: &mut RowReceiver,
    ) -> Result<WriteSummary, ConnectorError> {
        if matches!(request.mode, WriteMode::Upsert { .. }) {
            return Err(ConnectorError::config(
                "UNSUPPORTED_MODE",
                "file targets do not support upsert",
            ));
        }
        let target = self.resolve(&request.object);
        let dir = target
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir).map_err(|e| io_error("MKDIR_FAILED", &dir, &e))?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ConnectorError::config("BAD_OBJECT", format!("not a file path: {}", request.object))
            })?;

        let staged = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
        let removable = staged.clone();
        request
            .cleanup
            .register(format!("remove staged file {}", staged.display()), move || {
                if let Err(e) = fs::remove_file(&removable) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %removable.display(), error = %e, "Failed to remove staged file");
                    }
                }
            });

        let file = File::create(&staged).map_err(|e| io_error("STAGE_FAILED", &staged, &e))?;
        let mut writer = BufWriter::new(file);
        let write_err = |e: std::io::Error| io_error("STAGE_FAILED", &staged, &e);

        if request.mode == WriteMode::Append && target.exists() {
            let existing = fs::read(&target).map_err(|e| io_error("READ_FAILED", &target, &e))?;
            writer.write_all(&existing).map_err(write_err)?;
            if existing.last().is_some_and(|b| *b != b'\n') {
                writer.write_all(b"\n").map_err(write_err)?;
            }
        }

        let mut summary = WriteSummary::default();
        while let Some(record) = rows.next_row()? {
            let line = serde_json::to_vec(&record)
                .map_err(|e| ConnectorError::write("ENCODE_FAILED", e.to_string()))?;
            writer.write_all(&line).map_err(write_err)?;
            writer.write_all(b"\n").map_err(write_err)?;
            summary.rows_written += 1;
            summary.bytes_written += line.len() as u64 + 1;
        }
        writer.flush().map_err(write_err)?;
        drop(writer);

        fs::rename(&staged, &target).map_err(|e| {
            ConnectorError::write("COMMIT_FAILED", format!("{}: {e}", target.display()))
        })?;
        Ok(summary)
    }

    fn max_value(&self, object: &str, column: &str) -> Result<Option<String>, ConnectorError> {
        let path = self.resolve(object);
        if !path.exists() {
            return Ok(None);
        }
        let mut hwm = HighWaterMark::new(column, None);
        Self::for_each_record(&path, |record| {
            hwm.observe(&record);
            Ok(true)
        })?;
        Ok(hwm.value().map(String::from))
    }
}

//! Read-window resolution and incremental checkpoint tracking.
//!
//! [`resolve_read_spec`] decides how much of a source to request: the whole
//! object, a row-limited slice, or everything past the last checkpoint.
//! [`HighWaterMark`] follows the update key while rows flow so the runner
//! can persist the next checkpoint once both sides confirm.

use std::cmp::Ordering;
use std::fmt;

use chrono::Utc;
use loadstar_types::mode::Mode;
use loadstar_types::record::{compare_cursor_text, compare_to_cursor, cursor_text, Record};
use loadstar_types::state::CheckpointState;

use crate::config::types::OptionMap;
use crate::connector::EndpointKind;
use crate::errors::TaskError;

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    GreaterOrEqual,
    Greater,
}

impl Comparator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GreaterOrEqual => ">=",
            Self::Greater => ">",
        }
    }

    fn admits(self, ordering: Ordering) -> bool {
        match self {
            Self::GreaterOrEqual => ordering != Ordering::Less,
            Self::Greater => ordering == Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub update_key: String,
    pub comparator: Comparator,
    pub value: String,
}

/// Row filter handed to the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Read everything.
    Always,
    /// Read rows whose update key is past the bound.
    After(Bound),
}

impl Predicate {
    /// Whether a materialized row passes the filter.
    ///
    /// Rows without a comparable update-key value never pass a bound.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Always => true,
            Self::After(bound) => record
                .get(&bound.update_key)
                .and_then(|value| compare_to_cursor(value, &bound.value))
                .is_some_and(|ordering| bound.comparator.admits(ordering)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("1=1"),
            Self::After(bound) => write!(
                f,
                "{} {} {}",
                bound.update_key,
                bound.comparator.as_str(),
                bound.value
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Read specification
// ---------------------------------------------------------------------------

/// What a source connector is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSpec {
    /// Object to read (table, file path, endpoint).
    pub stream: String,
    /// Fully rendered query, when one applies.
    pub sql: Option<String>,
    pub columns: Vec<String>,
    pub predicate: Predicate,
    /// Never set together with a bounded predicate.
    pub limit: Option<u64>,
    pub options: OptionMap,
}

impl ReadSpec {
    /// Full read of `stream`, no filter.
    #[must_use]
    pub fn full(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            sql: None,
            columns: Vec::new(),
            predicate: Predicate::Always,
            limit: None,
            options: OptionMap::new(),
        }
    }

    /// Keep only the selected columns of a row, in selection order.
    #[must_use]
    pub fn project(&self, record: Record) -> Record {
        if self.columns.is_empty() {
            return record;
        }
        let mut record = record;
        self.columns
            .iter()
            .filter_map(|col| record.remove(col).map(|v| (col.clone(), v)))
            .collect()
    }
}

/// Inputs to [`resolve_read_spec`].
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    pub mode: Mode,
    pub stream: &'a str,
    pub update_key: Option<&'a str>,
    pub last_value: Option<&'a str>,
    pub sql: Option<&'a str>,
    pub columns: &'a [String],
    pub limit: Option<u64>,
    /// Exclusive boundary (`>`) instead of inclusive (`>=`).
    pub strict: bool,
    pub source_kind: EndpointKind,
}

fn field_list(columns: &[String]) -> String {
    if columns.is_empty() {
        "*".to_string()
    } else {
        columns.join(", ")
    }
}

/// Compute the read specification for one run.
///
/// # Errors
///
/// Returns [`TaskError::Configuration`] for an incremental mode without an
/// update key.
pub fn resolve_read_spec(req: &ReadRequest<'_>) -> Result<ReadSpec, TaskError> {
    let mut spec = ReadSpec::full(req.stream);
    spec.columns = req.columns.to_vec();

    if !req.mode.is_incremental() {
        spec.limit = req.limit;
        spec.sql = req.sql.map(|sql| {
            sql.replace("{incremental_where_cond}", "1=1")
                .replace("{fields}", &field_list(req.columns))
        });
        return Ok(spec);
    }

    let update_key = req
        .update_key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            TaskError::Configuration(format!(
                "mode '{}' requires an update key for stream '{}'",
                req.mode, req.stream
            ))
        })?;

    if req.limit.is_some() {
        tracing::debug!(
            stream = req.stream,
            "Ignoring row limit: incremental reads are bounded by the checkpoint"
        );
    }

    spec.predicate = match req.last_value.filter(|v| !v.is_empty()) {
        Some(value) => Predicate::After(Bound {
            update_key: update_key.to_string(),
            comparator: if req.strict {
                Comparator::Greater
            } else {
                Comparator::GreaterOrEqual
            },
            value: value.to_string(),
        }),
        None => Predicate::Always,
    };
    let condition = spec.predicate.to_string();

    spec.sql = match req.sql {
        Some(sql) => Some(
            sql.replace("{incremental_where_cond}", &condition)
                .replace("{update_key}", update_key)
                .replace("{incremental_value}", req.last_value.unwrap_or_default())
                .replace("{fields}", &field_list(req.columns)),
        ),
        None if req.source_kind == EndpointKind::Database => Some(format!(
            "select {} from {} where {}",
            field_list(req.columns),
            req.stream,
            condition
        )),
        None => None,
    };

    Ok(spec)
}

/// Pick the value bounding an incremental read.
///
/// An explicit configured value wins, then the target's current maximum,
/// then the last checkpoint stored for the same update key.
#[must_use]
pub fn choose_incremental_value(
    configured: Option<&str>,
    target_max: Option<String>,
    stored: Option<&CheckpointState>,
    update_key: &str,
) -> Option<String> {
    configured
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or(target_max.filter(|v| !v.is_empty()))
        .or_else(|| {
            stored
                .filter(|cp| cp.update_key == update_key)
                .map(|cp| cp.value.clone())
        })
}

// ---------------------------------------------------------------------------
// High-water mark
// ---------------------------------------------------------------------------

/// Largest update-key value seen in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighWaterMark {
    update_key: String,
    value: Option<String>,
}

impl HighWaterMark {
    /// Start tracking, seeded with the value the read was bounded by.
    #[must_use]
    pub fn new(update_key: impl Into<String>, start: Option<String>) -> Self {
        Self {
            update_key: update_key.into(),
            value: start,
        }
    }

    pub fn observe(&mut self, record: &Record) {
        let Some(candidate) = record.get(&self.update_key).and_then(cursor_text) else {
            return;
        };
        let replace = match &self.value {
            Some(current) => compare_cursor_text(&candidate, current) == Ordering::Greater,
            None => true,
        };
        if replace {
            self.value = Some(candidate);
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    #[must_use]
    pub fn update_key(&self) -> &str {
        &self.update_key
    }

    /// Checkpoint to persist, if any value was observed.
    #[must_use]
    pub fn to_checkpoint(&self) -> Option<CheckpointState> {
        self.value.as_ref().map(|value| CheckpointState {
            update_key: self.update_key.clone(),
            value: value.clone(),
            updated_at: Utc::now(),
        })
    }
}

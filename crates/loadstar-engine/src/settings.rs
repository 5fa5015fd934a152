//! Engine settings read from the `LOADSTAR_*` environment.

use std::path::PathBuf;
use std::time::Duration;

use loadstar_types::state::ExecutionId;

use crate::errors::TaskError;

/// Env keys that carry bookkeeping, not semantics. Excluded from digests
/// and from stored snapshots.
pub const BOOKKEEPING_ENV_KEYS: [&str; 2] = ["LOADSTAR_PROJECT_ID", "LOADSTAR_CONFIG_PATH"];

pub const CONFIG_PATH_ENV: &str = "LOADSTAR_CONFIG_PATH";

const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(10);
const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;

/// Row- or stream-count expectation used by the assertion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountExpectation {
    Exactly(u64),
    MoreThan(u64),
}

impl CountExpectation {
    /// Parse `N` or `>N`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when `raw` is neither form.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (more_than, digits) = match raw.strip_prefix('>') {
            Some(rest) => (true, rest.trim()),
            None => (false, raw),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("invalid count expectation '{raw}' (expected N or >N)"))?;
        Ok(if more_than {
            Self::MoreThan(n)
        } else {
            Self::Exactly(n)
        })
    }

    /// Check `actual`, describing the mismatch on failure.
    ///
    /// # Errors
    ///
    /// Returns the mismatch text when `actual` does not satisfy the expectation.
    pub fn check(self, what: &str, actual: u64) -> Result<(), String> {
        match self {
            Self::Exactly(n) if actual != n => {
                Err(format!("expected {n} {what}, got {actual}"))
            }
            Self::MoreThan(n) if actual <= n => {
                Err(format!("expected more than {n} {what}, got {actual}"))
            }
            _ => Ok(()),
        }
    }
}

/// Settings shared by every task of one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub exec_id: ExecutionId,
    pub dry_run: bool,
    pub expect_rows: Option<CountExpectation>,
    pub expect_streams: Option<CountExpectation>,
    pub show_progress: bool,
    pub stall_window: Duration,
    pub sample_interval: Duration,
    pub rate_window: Duration,
    /// Use `>` instead of `>=` for incremental predicates by default.
    pub strict_incremental: bool,
    pub status_url: Option<String>,
    pub home_dir: PathBuf,
    pub store_disabled: bool,
    pub project_id: Option<String>,
    pub channel_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            exec_id: new_exec_id(),
            dry_run: false,
            expect_rows: None,
            expect_streams: None,
            show_progress: true,
            stall_window: DEFAULT_STALL_WINDOW,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            rate_window: DEFAULT_RATE_WINDOW,
            strict_incremental: false,
            status_url: None,
            home_dir: PathBuf::from(".loadstar"),
            store_disabled: false,
            project_id: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Fresh execution id for runs that were not given one.
#[must_use]
pub fn new_exec_id() -> ExecutionId {
    ExecutionId::new(uuid::Uuid::new_v4().simple().to_string())
}

pub(crate) fn parse_bool(key: &str, raw: &str) -> Result<bool, TaskError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "n" | "off" | "" => Ok(false),
        other => Err(TaskError::Configuration(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

impl EngineSettings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Configuration`] for malformed values.
    pub fn from_env() -> Result<Self, TaskError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Configuration`] for malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TaskError> {
        let mut settings = Self::default();
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(id) = present("LOADSTAR_EXEC_ID") {
            settings.exec_id = ExecutionId::new(id.trim());
        }
        if let Some(raw) = present("LOADSTAR_DRY_RUN") {
            settings.dry_run = parse_bool("LOADSTAR_DRY_RUN", &raw)?;
        }
        if let Some(raw) = present("LOADSTAR_ROW_CNT") {
            settings.expect_rows =
                Some(CountExpectation::parse(&raw).map_err(TaskError::Configuration)?);
        }
        if let Some(raw) = present("LOADSTAR_STREAM_CNT") {
            settings.expect_streams =
                Some(CountExpectation::parse(&raw).map_err(TaskError::Configuration)?);
        }
        if let Some(raw) = present("LOADSTAR_SHOW_PROGRESS") {
            settings.show_progress = parse_bool("LOADSTAR_SHOW_PROGRESS", &raw)?;
        }
        if let Some(raw) = present("LOADSTAR_STALL_WINDOW_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                TaskError::Configuration(format!(
                    "LOADSTAR_STALL_WINDOW_SECS: expected seconds, got '{raw}'"
                ))
            })?;
            settings.stall_window = Duration::from_secs(secs);
        }
        if let Some(raw) = present("LOADSTAR_GREATER_THAN_EQUAL") {
            settings.strict_incremental = !parse_bool("LOADSTAR_GREATER_THAN_EQUAL", &raw)?;
        }
        settings.status_url = present("LOADSTAR_STATUS_URL");
        if let Some(raw) = present("LOADSTAR_DISABLE_STORE") {
            settings.store_disabled = parse_bool("LOADSTAR_DISABLE_STORE", &raw)?;
        }
        settings.project_id = present("LOADSTAR_PROJECT_ID");

        settings.home_dir = match present("LOADSTAR_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => present("HOME")
                .map_or_else(|| PathBuf::from("."), PathBuf::from)
                .join(".loadstar"),
        };

        Ok(settings)
    }

    /// Location of the execution store database.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.home_dir.join("loadstar.db")
    }

    /// Location of the connections file.
    #[must_use]
    pub fn env_file(&self) -> PathBuf {
        self.home_dir.join("env.yaml")
    }
}

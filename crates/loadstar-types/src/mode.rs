//! Read and write modes.
//!
//! [`Mode`] is what users configure; [`WriteMode`] is what a target
//! connector is asked to do once the mode is resolved against the keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User-facing load mode of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Replace the target object each run.
    #[default]
    #[serde(alias = "full-refresh", alias = "drop")]
    FullRefresh,
    /// Keep the target object, replace its contents.
    Truncate,
    /// Insert every row read.
    Append,
    /// Merge rows on the primary key.
    Upsert,
    /// Read only rows past the last checkpoint, then append or merge.
    Incremental,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullRefresh => "full_refresh",
            Self::Truncate => "truncate",
            Self::Append => "append",
            Self::Upsert => "upsert",
            Self::Incremental => "incremental",
        }
    }

    /// Whether reads are bounded by an incremental checkpoint.
    #[must_use]
    pub fn is_incremental(self) -> bool {
        matches!(self, Self::Incremental | Self::Upsert)
    }

    /// Resolve the write strategy handed to the target.
    ///
    /// `Incremental` merges when a primary key is known and appends otherwise.
    #[must_use]
    pub fn write_mode(self, primary_key: &[String]) -> WriteMode {
        match self {
            Self::FullRefresh => WriteMode::Drop,
            Self::Truncate => WriteMode::Truncate,
            Self::Append => WriteMode::Append,
            Self::Upsert => WriteMode::Upsert {
                primary_key: primary_key.to_vec(),
            },
            Self::Incremental if primary_key.is_empty() => WriteMode::Append,
            Self::Incremental => WriteMode::Upsert {
                primary_key: primary_key.to_vec(),
            },
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full_refresh" | "drop" => Ok(Self::FullRefresh),
            "truncate" => Ok(Self::Truncate),
            "append" => Ok(Self::Append),
            "upsert" => Ok(Self::Upsert),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!(
                "unknown mode '{other}' (expected full-refresh, truncate, append, upsert or incremental)"
            )),
        }
    }
}

/// Stage-then-commit strategy a target applies to its final object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    /// Insert staged rows into the final object.
    Append,
    /// Merge staged rows into the final object by key.
    Upsert {
        /// Columns forming the primary key for merge matching.
        primary_key: Vec<String>,
    },
    /// Replace the contents of the final object.
    Truncate,
    /// Replace the final object itself.
    Drop,
}

impl WriteMode {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Upsert { .. } => "upsert",
            Self::Truncate => "truncate",
            Self::Drop => "drop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_accepts_aliases() {
        let m: Mode = serde_yaml_like("\"full-refresh\"");
        assert_eq!(m, Mode::FullRefresh);
        let m: Mode = serde_yaml_like("\"drop\"");
        assert_eq!(m, Mode::FullRefresh);
        assert_eq!("Full-Refresh".parse::<Mode>(), Ok(Mode::FullRefresh));
        assert!("merge".parse::<Mode>().is_err());
    }

    fn serde_yaml_like(json: &str) -> Mode {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn incremental_resolves_by_primary_key() {
        assert_eq!(Mode::Incremental.write_mode(&[]), WriteMode::Append);
        assert_eq!(
            Mode::Incremental.write_mode(&["id".to_string()]),
            WriteMode::Upsert {
                primary_key: vec!["id".into()]
            }
        );
    }

    #[test]
    fn full_refresh_drops_and_truncate_truncates() {
        assert_eq!(Mode::FullRefresh.write_mode(&[]), WriteMode::Drop);
        assert_eq!(Mode::Truncate.write_mode(&[]), WriteMode::Truncate);
    }

    #[test]
    fn upsert_reads_incrementally() {
        assert!(Mode::Upsert.is_incremental());
        assert!(Mode::Incremental.is_incremental());
        assert!(!Mode::Append.is_incremental());
    }

    #[test]
    fn write_mode_upsert_json_format() {
        let mode = WriteMode::Upsert {
            primary_key: vec!["id".into()],
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "upsert");
        assert_eq!(json["primary_key"], serde_json::json!(["id"]));
    }
}

//! Semantic validation for parsed task and manifest configuration.
//!
//! Validators collect every problem before failing so a single run reports
//! all of them.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use loadstar_types::mode::Mode;

use crate::config::types::{
    normalize_name, Merge, ReplicationManifest, StreamOverride, TaskConfig,
};

fn validate_keys(
    mode: Mode,
    primary_key: &[String],
    update_key: Option<&str>,
    context: &str,
    errors: &mut Vec<String>,
) {
    let has_update_key = update_key.is_some_and(|k| !k.trim().is_empty());
    match mode {
        Mode::Upsert => {
            if primary_key.is_empty() {
                errors.push(format!("{context}: mode 'upsert' requires a primary key"));
            }
            if !has_update_key {
                errors.push(format!("{context}: mode 'upsert' requires an update key"));
            }
        }
        Mode::Incremental if !has_update_key => {
            errors.push(format!("{context}: mode 'incremental' requires an update key"));
        }
        _ => {}
    }
    if primary_key.iter().any(|k| k.trim().is_empty()) {
        errors.push(format!("{context}: primary key columns must not be empty"));
    }
}

/// Validate a task configuration.
///
/// # Errors
///
/// Returns an error listing all validation failures.
pub fn validate_task(config: &TaskConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.source.conn.trim().is_empty() {
        errors.push("Source connection (source.conn) must not be empty".to_string());
    }
    if config.target.conn.trim().is_empty() {
        errors.push("Target connection (target.conn) must not be empty".to_string());
    }
    if config.source.stream.trim().is_empty() && config.source.sql.is_none() {
        errors.push("Source stream (source.stream) must not be empty".to_string());
    }
    if config.target.object.trim().is_empty() {
        errors.push("Target object (target.object) must not be empty".to_string());
    }
    if config.source.columns.iter().any(|c| c.trim().is_empty()) {
        errors.push("Source columns must not contain empty names".to_string());
    }
    if config.source.options.limit == Some(0) {
        errors.push("source.options.limit must be > 0".to_string());
    }

    validate_keys(
        config.effective_mode(),
        &config.source.primary_key,
        config.source.update_key.as_deref(),
        "Task",
        &mut errors,
    );

    if !errors.is_empty() {
        bail!("Task validation failed:\n  - {}", errors.join("\n  - "));
    }
    Ok(())
}

/// Validate a replication manifest before any stream runs.
///
/// Every declared stream, disabled or not, must resolve a target object
/// once defaults are applied. Mode and key requirements are checked per
/// stream on the merged task.
///
/// # Errors
///
/// Returns an error listing all validation failures.
pub fn validate_manifest(manifest: &ReplicationManifest) -> Result<()> {
    let mut errors = Vec::new();

    if manifest.source.trim().is_empty() {
        errors.push("Replication source must not be empty".to_string());
    }
    if manifest.target.trim().is_empty() {
        errors.push("Replication target must not be empty".to_string());
    }
    if manifest.streams.is_empty() {
        errors.push("Replication must declare at least one stream".to_string());
    }

    let mut seen = BTreeSet::new();
    for stream in manifest.streams.iter() {
        let context = format!("Stream '{}'", stream.name);
        let normalized = normalize_name(&stream.name);
        if normalized.is_empty() {
            errors.push("Stream names must not be empty".to_string());
            continue;
        }
        if !seen.insert(normalized.clone()) {
            errors.push(format!("{context}: declared more than once (names are case-insensitive)"));
        }

        let merged: StreamOverride = stream.config.clone().merge(manifest.defaults.clone());
        if merged.object.as_deref().map_or(true, |o| o.trim().is_empty()) {
            errors.push(format!(
                "{context}: no target object (set `object` on the stream or in `defaults`)"
            ));
        }
        if merged
            .depends_on
            .iter()
            .flatten()
            .any(|dep| normalize_name(dep) == normalized)
        {
            errors.push(format!("{context}: depends on itself"));
        }
    }

    if !errors.is_empty() {
        bail!("Replication validation failed:\n  - {}", errors.join("\n  - "));
    }
    Ok(())
}

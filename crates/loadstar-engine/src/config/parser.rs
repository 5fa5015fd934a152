//! Task and manifest YAML parsing with environment variable substitution.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::types::{OptionMap, ReplicationManifest, TaskConfig};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                if !missing.iter().any(|m| m == var_name) {
                    missing.push(var_name.to_string());
                }
            }
        }
    }

    if !missing.is_empty() {
        bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result)
}

/// Parse a task YAML (or JSON) string after env var substitution.
///
/// # Errors
///
/// Returns an error if substitution fails or the document is invalid.
pub fn parse_task_str(yaml_str: &str) -> Result<TaskConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    serde_yaml::from_str(&substituted).context("Failed to parse task configuration")
}

/// Parse a task file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or its content is invalid.
pub fn parse_task(path: &Path) -> Result<TaskConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;
    parse_task_str(&content)
}

/// Load a task from a file path, or parse `arg` itself when no such file exists.
///
/// # Errors
///
/// Returns an error if neither interpretation yields a valid task.
pub fn load_task(arg: &str) -> Result<TaskConfig> {
    let path = Path::new(arg);
    if path.is_file() {
        parse_task(path)
    } else {
        parse_task_str(arg).context("Argument is neither a task file nor an inline task")
    }
}

/// Parse a replication manifest string after env var substitution.
///
/// # Errors
///
/// Returns an error if substitution fails or the YAML is invalid.
pub fn parse_manifest_str(yaml_str: &str) -> Result<ReplicationManifest> {
    let substituted = substitute_env_vars(yaml_str)?;
    serde_yaml::from_str(&substituted).context("Failed to parse replication YAML")
}

/// Parse a replication manifest file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_manifest(path: &Path) -> Result<ReplicationManifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read replication file: {}", path.display()))?;
    parse_manifest_str(&content)
        .with_context(|| format!("Invalid replication file: {}", path.display()))
}

/// Parse an inline JSON or YAML option payload such as `--src-options`.
///
/// YAML keys containing `:` are rejected: `limit:10` is almost always a
/// missing space, which YAML would silently read as a single key.
///
/// # Errors
///
/// Returns an error if the payload is not a mapping or has a suspicious key.
pub fn parse_payload(payload: &str) -> Result<OptionMap> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Ok(OptionMap::new());
    }
    if let Ok(map) = serde_json::from_str::<OptionMap>(trimmed) {
        return Ok(map);
    }

    let map: OptionMap = serde_yaml::from_str(trimmed)
        .with_context(|| format!("Payload is not a JSON or YAML mapping: {trimmed}"))?;
    let bad: Vec<&String> = map.keys().filter(|k| k.contains(':')).collect();
    if !bad.is_empty() {
        let keys: Vec<&str> = bad.iter().map(|k| k.as_str()).collect();
        bail!(
            "Invalid key(s) {}: add a space after the colon",
            keys.join(", ")
        );
    }
    Ok(map)
}

/// Parse an inline `--env` payload into string values.
///
/// # Errors
///
/// Returns an error under the same conditions as [`parse_payload`].
pub fn parse_env_payload(payload: &str) -> Result<BTreeMap<String, String>> {
    Ok(parse_payload(payload)?
        .into_iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, text)
        })
        .collect())
}

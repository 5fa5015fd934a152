//! Expands a replication manifest into an ordered plan of tasks and runs
//! it, one stream at a time, isolating failures per stream.

use std::collections::{BTreeMap, BTreeSet};

use loadstar_types::state::ContentDigest;
use serde::Serialize;

use crate::config::types::{
    normalize_name, DeclaredStream, Merge, ReplicationManifest, SourceConfig, StreamOverride,
    TargetConfig, TaskConfig,
};
use crate::config::validator::validate_manifest;
use crate::connector::SourceConnector;
use crate::context::RunContext;
use crate::errors::{ErrorKind, Side, TaskError};
use crate::pattern;
use crate::recorder::{replication_snapshot, RunOrigin};
use crate::runner::Engine;

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// A manifest with its wildcard declarations expanded.
///
/// Built once per run; the source manifest is left untouched.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: ReplicationManifest,
    pub digest: ContentDigest,
    pub streams: Vec<DeclaredStream>,
}

/// Replace each wildcard declaration with the matching objects the source
/// reports. Explicit declarations take precedence over expanded ones.
///
/// # Errors
///
/// Returns the source's discovery error.
pub fn expand_wildcards(
    manifest: &ReplicationManifest,
    source: &dyn SourceConnector,
) -> Result<Vec<DeclaredStream>, TaskError> {
    let explicit: BTreeSet<String> = manifest
        .streams
        .iter()
        .filter(|s| !s.is_wildcard())
        .map(|s| normalize_name(&s.name))
        .collect();

    let mut seen = BTreeSet::new();
    let mut expanded = Vec::new();
    for declared in manifest.streams.iter() {
        if !declared.is_wildcard() {
            if seen.insert(normalize_name(&declared.name)) {
                expanded.push(declared.clone());
            }
            continue;
        }
        let found = source
            .discover(&declared.name)
            .map_err(|e| TaskError::from_connector(Side::Source, &e))?;
        tracing::info!(
            pattern = %declared.name,
            matched = found.len(),
            "Expanded wildcard stream"
        );
        for name in found {
            let key = normalize_name(&name);
            if explicit.contains(&key) || !seen.insert(key) {
                continue;
            }
            expanded.push(DeclaredStream {
                name,
                config: declared.config.clone(),
            });
        }
    }
    Ok(expanded)
}

/// Streams matching any filter (exact or wildcard, case-insensitive), in
/// declaration order. No filters selects everything.
#[must_use]
pub fn select_streams<'a>(streams: &'a [DeclaredStream], filters: &[String]) -> Vec<&'a DeclaredStream> {
    let filters: Vec<&str> = filters
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    streams
        .iter()
        .filter(|s| filters.is_empty() || filters.iter().any(|f| pattern::matches(f, &s.name)))
        .collect()
}

/// Declaration order, adjusted so every stream runs after the streams it
/// depends on. Ties keep declaration order.
///
/// # Errors
///
/// Returns [`TaskError::Configuration`] for unknown dependencies and cycles.
pub fn order_streams(
    streams: Vec<DeclaredStream>,
    defaults: &StreamOverride,
) -> Result<Vec<DeclaredStream>, TaskError> {
    let names: Vec<String> = streams.iter().map(|s| normalize_name(&s.name)).collect();
    let known: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    let mut deps: Vec<BTreeSet<String>> = Vec::with_capacity(streams.len());
    for stream in &streams {
        let declared = stream
            .config
            .depends_on
            .as_ref()
            .or(defaults.depends_on.as_ref());
        let mut set = BTreeSet::new();
        for dep in declared.into_iter().flatten() {
            let dep = normalize_name(dep);
            if !known.contains(dep.as_str()) {
                return Err(TaskError::Configuration(format!(
                    "stream '{}' depends on unknown stream '{dep}'",
                    stream.name
                )));
            }
            set.insert(dep);
        }
        deps.push(set);
    }
    if deps.iter().all(BTreeSet::is_empty) {
        return Ok(streams);
    }

    let mut emitted: BTreeSet<String> = BTreeSet::new();
    let mut order = Vec::with_capacity(streams.len());
    let mut remaining: Vec<usize> = (0..streams.len()).collect();
    while !remaining.is_empty() {
        let Some(pos) = remaining
            .iter()
            .position(|&i| deps[i].iter().all(|d| emitted.contains(d)))
        else {
            let stuck: Vec<&str> = remaining.iter().map(|&i| streams[i].name.as_str()).collect();
            return Err(TaskError::Configuration(format!(
                "dependency cycle between streams: {}",
                stuck.join(", ")
            )));
        };
        let idx = remaining.remove(pos);
        emitted.insert(names[idx].clone());
        order.push(idx);
    }

    let mut slots: Vec<Option<DeclaredStream>> = streams.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn sanitize_part(part: &str) -> String {
    part.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Fill `{stream_*}` placeholders of an object template from a stream name.
#[must_use]
pub fn render_object(template: &str, stream_name: &str) -> String {
    if !template.contains("{stream_") {
        return template.to_string();
    }
    let name = stream_name.trim().replace('"', "");
    let (schema, table) = match name.rsplit_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("", name.as_str()),
    };
    let file = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let (file_name, file_ext) = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (file, ""),
    };
    template
        .replace("{stream_name}", &sanitize_part(&name))
        .replace("{stream_schema}", &sanitize_part(schema))
        .replace("{stream_table}", &sanitize_part(table))
        .replace("{stream_file_name}", &sanitize_part(file_name))
        .replace("{stream_file_ext}", &sanitize_part(file_ext))
}

/// Task configuration for one stream: caller override, then the stream's
/// own settings, then manifest defaults, merged field by field.
#[must_use]
pub fn stream_config(
    manifest: &ReplicationManifest,
    stream: &DeclaredStream,
    caller: &StreamOverride,
) -> (TaskConfig, bool) {
    let merged = caller
        .clone()
        .merge(stream.config.clone().merge(manifest.defaults.clone()));
    let disabled = merged.is_disabled();
    let object = merged
        .object
        .as_deref()
        .map(|template| render_object(template, &stream.name))
        .unwrap_or_default();
    let config = TaskConfig {
        source: SourceConfig {
            conn: manifest.source.clone(),
            stream: stream.name.clone(),
            columns: merged.columns.unwrap_or_default(),
            primary_key: merged.primary_key.unwrap_or_default(),
            update_key: merged.update_key,
            sql: merged.sql,
            options: merged.source_options.unwrap_or_default(),
        },
        target: TargetConfig {
            conn: manifest.target.clone(),
            object,
            options: merged.target_options.unwrap_or_default(),
        },
        mode: merged.mode,
        incremental_value: None,
        env: manifest.env.clone(),
    };
    (config, disabled)
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TaskError> for StreamFailure {
    fn from(err: &TaskError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Success,
    /// Nothing matched the selection.
    Warning,
    Failure,
}

/// Aggregate result of a replication run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    /// Streams after wildcard expansion.
    pub declared: usize,
    pub matched: usize,
    pub run: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub disabled: usize,
    /// Not run because the batch was cancelled.
    pub skipped: usize,
    pub failures: BTreeMap<String, StreamFailure>,
}

impl ReplicationReport {
    #[must_use]
    pub fn outcome(&self) -> BatchOutcome {
        if self.failed > 0 {
            BatchOutcome::Failure
        } else if self.matched == 0 {
            BatchOutcome::Warning
        } else {
            BatchOutcome::Success
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Validate, expand and run a manifest.
///
/// Structural problems (invalid manifest, failed discovery, bad
/// dependencies, stream count mismatch) abort before any stream runs.
pub(crate) async fn run(
    engine: &Engine,
    manifest: ReplicationManifest,
    name: &str,
    origin: RunOrigin,
    caller: &StreamOverride,
    filters: &[String],
    ctx: &RunContext,
) -> Result<ReplicationReport, TaskError> {
    validate_manifest(&manifest).map_err(|e| TaskError::configuration(&e))?;
    let digest = crate::digest::manifest_digest(&manifest)
        .map_err(|e| TaskError::Internal(format!("failed to digest manifest: {e}")))?;

    let streams = if manifest.streams.iter().any(DeclaredStream::is_wildcard) {
        let source = engine.source_connector(&manifest.source, &manifest.env)?;
        let declared = manifest.clone();
        tokio::task::spawn_blocking(move || expand_wildcards(&declared, source.as_ref()))
            .await
            .map_err(|e| TaskError::Internal(format!("stream discovery failed: {e}")))??
    } else {
        manifest.streams.0.clone()
    };
    let streams = order_streams(streams, &manifest.defaults)?;

    engine
        .recorder()
        .record_replication(replication_snapshot(
            &manifest,
            digest.clone(),
            name,
            origin.project_id.clone(),
        ))
        .await;

    let resolved = ResolvedManifest {
        manifest,
        digest,
        streams,
    };
    run_resolved(engine, &resolved, origin, caller, filters, ctx).await
}

async fn run_resolved(
    engine: &Engine,
    resolved: &ResolvedManifest,
    mut origin: RunOrigin,
    caller: &StreamOverride,
    filters: &[String],
    ctx: &RunContext,
) -> Result<ReplicationReport, TaskError> {
    origin.replication_digest = Some(resolved.digest.clone());
    let selected = select_streams(&resolved.streams, filters);
    let mut report = ReplicationReport {
        declared: resolved.streams.len(),
        matched: selected.len(),
        ..ReplicationReport::default()
    };

    if let Some(expected) = engine.settings().expect_streams {
        expected
            .check("streams", report.matched as u64)
            .map_err(TaskError::Configuration)?;
    }
    if selected.is_empty() {
        tracing::warn!(
            declared = report.declared,
            filters = ?filters,
            "No streams matched the selection"
        );
        return Ok(report);
    }

    let plan: Vec<(String, TaskConfig, bool)> = selected
        .iter()
        .map(|stream| {
            let (config, disabled) = stream_config(&resolved.manifest, stream, caller);
            (stream.name.clone(), config, disabled)
        })
        .collect();

    ctx.set_telemetry("replication", resolved.digest.short());
    ctx.set_telemetry("stream_count", report.matched);
    tracing::info!(
        digest = resolved.digest.short(),
        declared = report.declared,
        matched = report.matched,
        "Replication started"
    );

    let total = plan.len();
    for (idx, (name, config, disabled)) in plan.into_iter().enumerate() {
        if disabled {
            tracing::info!(stream = %name, "Skipping disabled stream");
            report.disabled += 1;
            continue;
        }
        if ctx.is_cancelled() {
            report.skipped += 1;
            continue;
        }
        tracing::info!(stream = %name, position = idx + 1, total, "Running stream");
        report.run += 1;
        let outcome = engine.run_task(config, origin.clone(), ctx).await;
        match outcome.error() {
            None => report.succeeded += 1,
            Some(err) => {
                report.failed += 1;
                report.failures.insert(name, StreamFailure::from(err));
            }
        }
    }

    ctx.set_telemetry("streams_run", report.run);
    ctx.set_telemetry("streams_failed", report.failed);
    if report.skipped > 0 {
        tracing::warn!(skipped = report.skipped, "Replication cancelled; remaining streams skipped");
    }
    for (stream, failure) in &report.failures {
        tracing::error!(stream = %stream, kind = %failure.kind, error = %failure.message, "Stream failed");
    }
    tracing::info!(
        matched = report.matched,
        run = report.run,
        succeeded = report.succeeded,
        failed = report.failed,
        disabled = report.disabled,
        "Replication finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_manifest_str;
    use crate::connector::memory::MemoryDatabase;
    use serde_json::Map;

    fn declared(names: &[&str]) -> Vec<DeclaredStream> {
        names
            .iter()
            .map(|n| DeclaredStream {
                name: (*n).to_string(),
                config: StreamOverride::default(),
            })
            .collect()
    }

    fn names(streams: &[DeclaredStream]) -> Vec<&str> {
        streams.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn selection_is_union_of_filters() {
        let streams = declared(&["public.users", "public.orders", "audit.log"]);
        let all = select_streams(&streams, &[]);
        assert_eq!(all.len(), 3);
        let picked = select_streams(&streams, &["PUBLIC.*".into(), "audit.log".into()]);
        assert_eq!(picked.len(), 3);
        let picked = select_streams(&streams, &["public.users".into(), "public.u*".into()]);
        assert_eq!(picked.len(), 1);
        assert!(select_streams(&streams, &["nothing".into()]).is_empty());
    }

    #[test]
    fn wildcards_expand_with_explicit_precedence() {
        let db = MemoryDatabase::default();
        for table in ["sales.a", "sales.b", "sales.c", "hr.x"] {
            db.insert_rows(table, [Map::new()]);
        }
        let manifest = parse_manifest_str(
            "source: memory://s\ntarget: memory://t\ndefaults:\n  object: \"{stream_table}\"\nstreams:\n  sales.*:\n    mode: append\n  sales.b:\n    mode: truncate\n",
        )
        .unwrap();
        let expanded = expand_wildcards(&manifest, &db).unwrap();
        assert_eq!(names(&expanded), ["sales.a", "sales.c", "sales.b"]);
        assert_eq!(expanded[2].config.mode, Some(loadstar_types::mode::Mode::Truncate));
        assert_eq!(manifest.streams.len(), 2);
    }

    #[test]
    fn dependencies_reorder_stably() {
        let mut streams = declared(&["a", "b", "c", "d"]);
        streams[0].config.depends_on = Some(vec!["C".into()]);
        let ordered = order_streams(streams, &StreamOverride::default()).unwrap();
        assert_eq!(names(&ordered), ["b", "c", "a", "d"]);
    }

    #[test]
    fn dependency_cycles_and_unknowns_rejected() {
        let mut streams = declared(&["a", "b"]);
        streams[0].config.depends_on = Some(vec!["b".into()]);
        streams[1].config.depends_on = Some(vec!["a".into()]);
        let err = order_streams(streams, &StreamOverride::default()).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");

        let mut streams = declared(&["a"]);
        streams[0].config.depends_on = Some(vec!["ghost".into()]);
        let err = order_streams(streams, &StreamOverride::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn object_templates() {
        assert_eq!(render_object("raw.{stream_table}", "Public.Users"), "raw.users");
        assert_eq!(render_object("{stream_schema}_{stream_table}", "sales.order-items"), "sales_order_items");
        assert_eq!(render_object("{stream_name}", "public.users"), "public_users");
        assert_eq!(
            render_object("out/{stream_file_name}.{stream_file_ext}", "data/2024 Report.CSV"),
            "out/2024_report.csv"
        );
        assert_eq!(render_object("fixed", "anything"), "fixed");
    }

    #[test]
    fn merge_caller_then_stream_then_defaults() {
        let manifest = parse_manifest_str(
            "source: s\ntarget: t\ndefaults:\n  object: \"dw.{stream_table}\"\n  mode: append\n  primary_key: id\nstreams:\n  app.users:\n    mode: upsert\n    update_key: updated_at\n",
        )
        .unwrap();
        let stream = &manifest.streams.0[0];
        let caller = StreamOverride {
            update_key: Some("modified".into()),
            ..StreamOverride::default()
        };
        let (config, disabled) = stream_config(&manifest, stream, &caller);
        assert!(!disabled);
        assert_eq!(config.target.object, "dw.users");
        assert_eq!(config.mode, Some(loadstar_types::mode::Mode::Upsert));
        assert_eq!(config.source.primary_key, vec!["id"]);
        assert_eq!(config.source.update_key.as_deref(), Some("modified"));
        assert_eq!(config.source.conn, "s");
    }

    #[test]
    fn report_outcomes() {
        let mut report = ReplicationReport::default();
        assert_eq!(report.outcome(), BatchOutcome::Warning);
        report.matched = 2;
        report.run = 2;
        report.succeeded = 2;
        assert_eq!(report.outcome(), BatchOutcome::Success);
        report.succeeded = 1;
        report.failed = 1;
        assert_eq!(report.outcome(), BatchOutcome::Failure);
        assert!(!report.is_success());
    }
}

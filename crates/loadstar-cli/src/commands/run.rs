use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use loadstar_engine::config::parser::{load_task, parse_env_payload, parse_payload};
use loadstar_engine::config::types::{
    OptionMap, SourceOptions, StreamOverride, TargetOptions, TaskConfig,
};
use loadstar_engine::recorder::resolve_project_id;
use loadstar_engine::settings::CONFIG_PATH_ENV;
use loadstar_engine::supervisor::os_signals;
use loadstar_engine::{
    Engine, EngineSettings, ReplicationReport, RunContext, RunOrigin, RunOutcome, Supervisor,
    TaskOutcome,
};
use loadstar_types::mode::Mode;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Task file, or an inline YAML/JSON task
    #[arg(short, long, conflicts_with = "replication")]
    config: Option<String>,
    /// Replication manifest file
    #[arg(short, long)]
    replication: Option<PathBuf>,
    /// Source connection name or URL
    #[arg(long)]
    src_conn: Option<String>,
    /// Source stream (table, file or pattern)
    #[arg(long)]
    src_stream: Option<String>,
    /// Source options as JSON or YAML
    #[arg(long)]
    src_options: Option<String>,
    /// Target connection name or URL
    #[arg(long)]
    tgt_conn: Option<String>,
    /// Target object
    #[arg(long)]
    tgt_object: Option<String>,
    /// Target options as JSON or YAML
    #[arg(long)]
    tgt_options: Option<String>,
    /// Write mode (full-refresh, truncate, append, upsert, incremental)
    #[arg(short, long)]
    mode: Option<Mode>,
    /// Primary key columns, comma separated
    #[arg(long, value_delimiter = ',')]
    primary_key: Vec<String>,
    /// Update key column for incremental reads
    #[arg(long)]
    update_key: Option<String>,
    /// Maximum rows to read (non-incremental modes)
    #[arg(long)]
    limit: Option<u64>,
    /// Replication streams to run, comma separated; `*` wildcards allowed
    #[arg(long, value_delimiter = ',')]
    streams: Vec<String>,
    /// Environment overrides as JSON or YAML
    #[arg(long)]
    env: Option<String>,
    /// Prepare everything but move no rows
    #[arg(long)]
    dry_run: bool,
}

fn options_from<T: serde::de::DeserializeOwned>(payload: &str, flag: &str) -> Result<T> {
    let map: OptionMap = parse_payload(payload).with_context(|| format!("invalid {flag}"))?;
    serde_json::from_value(serde_json::Value::Object(map.into_iter().collect()))
        .with_context(|| format!("invalid {flag}"))
}

impl RunArgs {
    fn source_options(&self) -> Result<SourceOptions> {
        let mut options: SourceOptions = match &self.src_options {
            Some(payload) => options_from(payload, "--src-options")?,
            None => SourceOptions::default(),
        };
        options.limit = self.limit.or(options.limit);
        Ok(options)
    }

    fn target_options(&self) -> Result<TargetOptions> {
        match &self.tgt_options {
            Some(payload) => options_from(payload, "--tgt-options"),
            None => Ok(TargetOptions::default()),
        }
    }

    /// Flags expressed as a stream override.
    fn stream_override(&self) -> Result<StreamOverride> {
        let source_options = self.source_options()?;
        let target_options = self.target_options()?;
        Ok(StreamOverride {
            object: self.tgt_object.clone(),
            mode: self.mode,
            primary_key: (!self.primary_key.is_empty()).then(|| self.primary_key.clone()),
            update_key: self.update_key.clone(),
            source_options: (!source_options.is_empty()).then_some(source_options),
            target_options: (!target_options.is_empty()).then_some(target_options),
            ..StreamOverride::default()
        })
    }

    /// Task from `--config` (if any) with the flags applied on top.
    fn task_config(&self) -> Result<TaskConfig> {
        let mut config = match &self.config {
            Some(arg) => load_task(arg)?,
            None => TaskConfig::default(),
        };
        if let Some(conn) = &self.src_conn {
            config.source.conn.clone_from(conn);
        }
        if let Some(stream) = &self.src_stream {
            config.source.stream.clone_from(stream);
        }
        if let Some(conn) = &self.tgt_conn {
            config.target.conn.clone_from(conn);
        }
        let config = config.with_override(self.stream_override()?);
        Ok(config)
    }
}

/// Execute the `run` command and return the process exit code.
pub async fn execute(args: RunArgs) -> Result<i32> {
    let mut settings = EngineSettings::from_env()?;
    settings.dry_run |= args.dry_run;
    let env = match &args.env {
        Some(payload) => parse_env_payload(payload).context("invalid --env")?,
        None => BTreeMap::new(),
    };

    let engine = Engine::from_settings(settings.clone())?;
    let ctx = RunContext::new();

    let job = if let Some(path) = args.replication.clone() {
        if args.src_conn.is_some() || args.tgt_conn.is_some() || args.src_stream.is_some() {
            bail!("--src-conn, --src-stream and --tgt-conn cannot be combined with --replication");
        }
        Job::Replication {
            path,
            caller: args.stream_override()?,
            streams: args.streams.clone(),
            env,
        }
    } else {
        let mut config = args.task_config()?;
        config.env.extend(env);
        let config_path = args
            .config
            .as_deref()
            .map(Path::new)
            .filter(|p| p.is_file())
            .map(Path::to_path_buf);
        if let Some(path) = &config_path {
            config
                .env
                .insert(CONFIG_PATH_ENV.to_string(), path.display().to_string());
        }
        let origin = RunOrigin {
            replication_digest: None,
            project_id: config_path
                .as_deref()
                .and_then(|p| resolve_project_id(settings.project_id.as_deref(), Some(p))),
            file_path: config_path.map(|p| p.display().to_string()),
        };
        Job::Task {
            config: Box::new(config),
            origin,
        }
    };

    tracing::info!(exec_id = %settings.exec_id, dry_run = settings.dry_run, "Starting run");
    let work_ctx = ctx.clone();
    let work = async move {
        let ok = job.run(&engine, &work_ctx).await;
        engine.close().await;
        ok
    };
    let status = Supervisor::default().run(&ctx, os_signals(), work).await;
    tracing::debug!(telemetry = ?ctx.telemetry(), "Run telemetry");
    Ok(status.code())
}

enum Job {
    Task {
        config: Box<TaskConfig>,
        origin: RunOrigin,
    },
    Replication {
        path: PathBuf,
        caller: StreamOverride,
        streams: Vec<String>,
        env: BTreeMap<String, String>,
    },
}

impl Job {
    async fn run(self, engine: &Engine, ctx: &RunContext) -> bool {
        match self {
            Self::Task { config, origin } => match engine.run(*config, origin, ctx).await {
                Ok(RunOutcome::Task(outcome)) => print_task(&outcome),
                Ok(RunOutcome::Replication(report)) => print_report(&report),
                Err(err) => {
                    eprintln!("Run failed: {err}");
                    false
                }
            },
            Self::Replication {
                path,
                caller,
                streams,
                env,
            } => match engine
                .run_replication(&path, &caller, &streams, &env, ctx)
                .await
            {
                Ok(report) => print_report(&report),
                Err(err) => {
                    eprintln!("Replication '{}' failed: {err}", path.display());
                    false
                }
            },
        }
    }
}

fn print_task(outcome: &TaskOutcome) -> bool {
    if outcome.dry_run {
        println!("Dry run: stream '{}' prepared, nothing moved.", outcome.stream_name);
        return true;
    }
    match (&outcome.summary, outcome.error()) {
        (Some(summary), None) => {
            println!("Stream '{}' completed successfully.", outcome.stream_name);
            println!("  Rows written:  {}", summary.rows_written);
            println!("  Bytes written: {}", format_bytes(summary.bytes_written));
            println!("  Duration:      {:.2}s", summary.duration.as_secs_f64());
            if let Some(checkpoint) = &summary.checkpoint {
                println!(
                    "  Checkpoint:    {} = {}",
                    checkpoint.update_key, checkpoint.value
                );
            }
            true
        }
        (_, Some(err)) => {
            eprintln!("Stream '{}' failed ({}): {err}", outcome.stream_name, err.kind());
            false
        }
        (None, None) => true,
    }
}

fn print_report(report: &ReplicationReport) -> bool {
    println!("Replication finished.");
    println!("  Declared:  {}", report.declared);
    println!("  Matched:   {}", report.matched);
    println!("  Run:       {}", report.run);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Failed:    {}", report.failed);
    if report.disabled > 0 {
        println!("  Disabled:  {}", report.disabled);
    }
    if report.skipped > 0 {
        println!("  Skipped:   {}", report.skipped);
    }
    if report.matched == 0 {
        println!("Warning: no streams matched the selection.");
    }
    for (stream, failure) in &report.failures {
        eprintln!("  {stream} ({}): {}", failure.kind, failure.message);
    }
    report.is_success()
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

use anyhow::{bail, Context, Result};
use loadstar_engine::EngineSettings;
use loadstar_state::{ExecutionStore, SqliteExecutionStore};
use loadstar_types::state::{ExecStatus, ExecutionQuery, StoredExecution};

/// Execute the `history` command: list recent executions, newest first.
pub fn execute(status: Option<&str>, limit: usize) -> Result<()> {
    let status = match status {
        Some(raw) => match ExecStatus::parse(raw) {
            Some(status) => Some(status),
            None => bail!("unknown status '{raw}'"),
        },
        None => None,
    };

    let settings = EngineSettings::from_env()?;
    let path = settings.store_path();
    if !path.exists() {
        println!("No execution history at {}", path.display());
        return Ok(());
    }
    let store = SqliteExecutionStore::open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let rows = store.list_executions(&ExecutionQuery {
        status,
        limit,
        ..ExecutionQuery::default()
    })?;

    if rows.is_empty() {
        println!("No executions recorded.");
        return Ok(());
    }
    println!(
        "{:<6} {:<28} {:<30} {:<10} {:>12} {:>20}",
        "ID", "EXEC", "STREAM", "STATUS", "ROWS", "STARTED"
    );
    for row in &rows {
        println!("{}", format_row(row));
    }
    Ok(())
}

fn format_row(row: &StoredExecution) -> String {
    let started = row
        .record
        .start_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    let mut line = format!(
        "{:<6} {:<28} {:<30} {:<10} {:>12} {:>20}",
        row.id,
        row.record.exec_id,
        truncate(&row.record.stream_name, 30),
        row.record.status,
        row.record.rows,
        started
    );
    if let Some(error) = &row.record.error {
        line.push_str("\n       error: ");
        line.push_str(error.lines().next().unwrap_or_default());
    }
    line
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('~');
    out
}

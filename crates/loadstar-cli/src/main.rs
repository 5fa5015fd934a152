mod commands;
mod logging;

use clap::{Parser, Subcommand};

use crate::commands::run::RunArgs;
use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "loadstar",
    version,
    about = "Move rows between databases and files, one stream or a whole replication"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task or a replication
    Run(Box<RunArgs>),
    /// Show recent executions from the local history
    History {
        /// Only show executions with this status (created, running, success, error)
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of executions to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Inspect configured connections
    Conns {
        #[command(subcommand)]
        command: ConnsCommand,
    },
}

#[derive(Subcommand)]
enum ConnsCommand {
    /// List resolvable connections
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    let code = match cli.command {
        Commands::Run(args) => commands::run::execute(*args).await?,
        Commands::History { status, limit } => {
            commands::history::execute(status.as_deref(), limit)?;
            0
        }
        Commands::Conns {
            command: ConnsCommand::List,
        } => {
            commands::conns::list()?;
            0
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

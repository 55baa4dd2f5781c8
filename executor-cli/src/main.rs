mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::exec::ExecArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// Run and validate step pipelines on local or container backends
#[derive(Parser, Debug)]
#[command(name = "pipex", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Worker config file (default: <config dir>/pipex/worker.yaml when present)
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Validate(ValidateArgs),
    Run(RunArgs),
    Exec(ExecArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "pipex=debug,pipeline_executor=debug"
    } else {
        "pipex=info,pipeline_executor=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Validate(args) => commands::validate::execute(args),
        Command::Run(args) => {
            let config = commands::load_worker_config(cli.config.as_deref())?;
            commands::run::execute(args, config).await
        }
        Command::Exec(args) => {
            let config = commands::load_worker_config(cli.config.as_deref())?;
            commands::exec::execute(args, config).await
        }
    }
}

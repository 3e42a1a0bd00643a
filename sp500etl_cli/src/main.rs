mod commands;
mod output;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use sp500etl_lib::PipelineConfig;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "sp500etl")]
#[command(about = "Daily S&P 500 price extract, transform and warehouse load")]
struct Cli {
    /// Config file (TOML). Defaults to ./sp500etl.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format: table or json
    #[arg(long, default_value = "table", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage for one run date
    Run(commands::run::RunArgs),
    /// Resolve the universe, fetch prices and stage the raw extract
    Extract(commands::steps::ExtractArgs),
    /// Compute lag metrics from a staged raw extract
    Transform(commands::steps::StagedArgs),
    /// Replace the warehouse partition from a staged transformed dataset
    Load(commands::steps::StagedArgs),
    /// Print the resolved ticker universe
    Universe,
    /// Create the warehouse table if it does not exist
    InitWarehouse,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sp500etl=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let format = match cli.output.as_str() {
        "json" => OutputFormat::Json,
        _ => OutputFormat::Table,
    };

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    config.apply_env()?;
    config.validate()?;

    let work = async {
        match &cli.command {
            Commands::Run(args) => commands::run::run(args, &config, &format).await,
            Commands::Extract(args) => commands::steps::extract(args, &config, &format).await,
            Commands::Transform(args) => commands::steps::transform(args, &config, &format).await,
            Commands::Load(args) => commands::steps::load(args, &config, &format).await,
            Commands::Universe => commands::universe::run(&config, &format).await,
            Commands::InitWarehouse => commands::init_warehouse::run(&config),
        }
    };

    tokio::select! {
        result = work => result,
        signal = shutdown_signal() => {
            bail!("interrupted by {}; nothing was committed for the in-flight step", signal)
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

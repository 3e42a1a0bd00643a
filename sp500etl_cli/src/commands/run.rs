//! The `run` subcommand: extract, transform and load for one run date.

use anyhow::Result;
use clap::Args;
use sp500etl_lib::{DefaultPipeline, PipelineConfig, RunStatus};

use super::{extract_progress, init_warehouse, WindowArgs};
use crate::output::{print_run_report, OutputFormat};

/// Arguments for the `run` subcommand.
#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub window: WindowArgs,

    /// Create the warehouse table before loading if it does not exist
    #[arg(long)]
    pub init_warehouse: bool,
}

pub async fn run(args: &RunArgs, config: &PipelineConfig, format: &OutputFormat) -> Result<()> {
    let window = args.window.window(config)?;
    let (pb, progress) = extract_progress();
    let pipeline = DefaultPipeline::from_config(config, Some(progress))?;
    if args.init_warehouse {
        init_warehouse::ensure_table(pipeline.loader().sink(), pipeline.table())?;
    }

    eprintln!(
        "Starting run {} (reporting {}, fetching from {})",
        window.run_date, window.reporting, window.fetch.start
    );
    let result = pipeline.run(&window).await;
    pb.finish_and_clear();
    let report = result?;

    match report.status {
        RunStatus::Success => eprintln!(
            "Run complete: {} rows for {} tickers loaded into {}",
            report.rows_loaded, report.tickers_loaded, report.table
        ),
        RunStatus::PartialSuccess => eprintln!(
            "Run complete with skips: {} rows for {} of {} tickers loaded into {} ({} skipped)",
            report.rows_loaded,
            report.tickers_loaded,
            report.tickers_attempted,
            report.table,
            report.skipped.len()
        ),
    }
    print_run_report(&report, format);
    Ok(())
}

//! Single-step subcommands. Each one reads its input from staging and
//! writes its output back, so a scheduler can run them as separate tasks.

use anyhow::{Context, Result};
use clap::Args;
use sp500etl_lib::{DefaultPipeline, PipelineConfig, StagingHandle};

use super::{extract_progress, WindowArgs};
use crate::output::{print_extract_report, print_load_summary, print_transform_report, OutputFormat};

/// Arguments for the `extract` subcommand.
#[derive(Args)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub window: WindowArgs,
}

/// Arguments for the `transform` and `load` subcommands.
#[derive(Args)]
pub struct StagedArgs {
    /// Logical run date (YYYY-MM-DD) whose staged artifact to read. Defaults to today
    #[arg(long)]
    pub run_date: Option<String>,

    /// Explicit staging key, overriding the one derived from --run-date
    #[arg(long)]
    pub handle: Option<String>,
}

impl StagedArgs {
    fn explicit_handle(&self) -> Result<Option<StagingHandle>> {
        self.handle
            .as_deref()
            .map(|key| {
                key.parse::<StagingHandle>()
                    .with_context(|| format!("invalid --handle '{}'", key))
            })
            .transpose()
    }

    fn window_args(&self) -> WindowArgs {
        WindowArgs {
            run_date: self.run_date.clone(),
            end_date: None,
        }
    }
}

pub async fn extract(
    args: &ExtractArgs,
    config: &PipelineConfig,
    format: &OutputFormat,
) -> Result<()> {
    let window = args.window.window(config)?;
    let (pb, progress) = extract_progress();
    let pipeline = DefaultPipeline::from_config(config, Some(progress))?;

    eprintln!(
        "Extracting {} (fetching {})",
        window.run_date, window.fetch
    );
    let result = pipeline.extract(&window).await;
    pb.finish_and_clear();
    let report = result?;

    eprintln!(
        "Extract complete: {} rows for {} of {} tickers staged",
        report.rows, report.fetched, report.attempted
    );
    print_extract_report(&report, format);
    Ok(())
}

pub async fn transform(
    args: &StagedArgs,
    config: &PipelineConfig,
    format: &OutputFormat,
) -> Result<()> {
    let pipeline = DefaultPipeline::from_config(config, None)?;
    let handle = match args.explicit_handle()? {
        Some(handle) => handle,
        None => pipeline.loader().raw_handle(args.window_args().run_date()?),
    };

    eprintln!("Transforming {}", handle);
    let report = pipeline.transform(&handle).await?;
    eprintln!(
        "Transform complete: {} rows for {} tickers ({} rows rejected)",
        report.rows, report.tickers, report.rejected_rows
    );
    print_transform_report(&report, format);
    Ok(())
}

pub async fn load(args: &StagedArgs, config: &PipelineConfig, format: &OutputFormat) -> Result<()> {
    let pipeline = DefaultPipeline::from_config(config, None)?;
    let handle = match args.explicit_handle()? {
        Some(handle) => handle,
        None => pipeline
            .loader()
            .transformed_handle(args.window_args().run_date()?),
    };

    eprintln!("Loading {} into {}", handle, pipeline.table());
    let summary = pipeline.load(&handle).await?;
    eprintln!(
        "Load complete: {} rows replaced partition {}",
        summary.rows, summary.partition
    );
    print_load_summary(&summary, format);
    Ok(())
}

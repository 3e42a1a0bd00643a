//! The `universe` subcommand: resolve and print the ticker list.

use anyhow::Result;
use sp500etl_lib::{PipelineConfig, UniverseResolver};

use crate::output::{print_universe, OutputFormat};

pub async fn run(config: &PipelineConfig, format: &OutputFormat) -> Result<()> {
    let resolver = UniverseResolver::new(config.universe.clone(), config.retry.clone());
    let tickers = resolver.resolve().await?;
    eprintln!("Resolved {} tickers", tickers.len());
    print_universe(&tickers, format);
    Ok(())
}

//! CLI subcommand implementations.

pub mod init_warehouse;
pub mod run;
pub mod steps;
pub mod universe;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use sp500etl_lib::extract::ProgressFn;
use sp500etl_lib::{ExtractProgress, PipelineConfig, RunDate, RunWindow};

/// Date arguments shared by every step that works on one run.
#[derive(Args, Clone, Debug, Default)]
pub struct WindowArgs {
    /// Logical run date (YYYY-MM-DD). Defaults to today
    #[arg(long)]
    pub run_date: Option<String>,

    /// Last reporting day (YYYY-MM-DD). Defaults to the latest trading session
    /// on or before the day before the run date
    #[arg(long)]
    pub end_date: Option<String>,
}

impl WindowArgs {
    pub fn run_date(&self) -> Result<RunDate> {
        match &self.run_date {
            Some(s) => Ok(s.parse::<RunDate>()?),
            None => Ok(RunDate::new(chrono::Local::now().date_naive())),
        }
    }

    pub fn window(&self, config: &PipelineConfig) -> Result<RunWindow> {
        let end = self
            .end_date
            .as_deref()
            .map(|s| {
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .with_context(|| format!("invalid --end-date '{}'", s))
            })
            .transpose()?;
        Ok(config.run_window(self.run_date()?, end)?)
    }
}

/// Extraction progress bar on stderr. Length is set from the first update.
pub fn extract_progress() -> (ProgressBar, ProgressFn) {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message("fetching daily bars...");

    let handle = pb.clone();
    let progress: ProgressFn = Arc::new(move |p: &ExtractProgress| {
        handle.set_length(p.total as u64);
        handle.set_position(p.completed as u64);
        handle.set_message(format!("{} ok, {} err ({})", p.succeeded, p.failed, p.ticker));
    });
    (pb, progress)
}

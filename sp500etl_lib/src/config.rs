//! Pipeline configuration: TOML file with defaults, then environment
//! overrides.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::extract::ExtractOptions;
use crate::retry::RetryPolicy;
use crate::types::{RunDate, RunWindow};
use crate::universe::UniverseSource;
use crate::warehouse::validate_table_name;

/// Config file picked up from the working directory when `--config` is
/// not given.
pub const DEFAULT_CONFIG_FILE: &str = "sp500etl.toml";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Calendar days in the reporting window, ending yesterday.
    pub days: u32,
    /// Extra calendar days fetched before the window to seed the lag.
    pub lookback_days: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            days: 1,
            lookback_days: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    pub chart_base_url: String,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            chart_base_url: "https://query2.finance.yahoo.com".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub root: PathBuf,
    pub prefix: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/staging"),
            prefix: "sp500/".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub path: PathBuf,
    pub table: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warehouse.db"),
            table: "SP500_DATA".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub universe: UniverseSource,
    pub window: WindowConfig,
    pub market_data: MarketDataConfig,
    pub extract: ExtractOptions,
    pub staging: StagingConfig,
    pub warehouse: WarehouseConfig,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, PipelineError> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Configuration(format!("invalid config: {}", e)))
    }

    /// Reads `path`, or [`DEFAULT_CONFIG_FILE`] if it exists, or falls back
    /// to defaults. An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::Configuration(format!("failed to read config {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Self::from_toml_str(&content)
    }

    /// Applies `SP500ETL_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), PipelineError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SP500ETL_STAGING_ROOT") {
            self.staging.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SP500ETL_WAREHOUSE_PATH") {
            self.warehouse.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SP500ETL_TABLE") {
            self.warehouse.table = v;
        }
        if let Some(v) = lookup("SP500ETL_CHART_BASE_URL") {
            self.market_data.chart_base_url = v;
        }
        if let Some(v) = lookup("SP500ETL_RETRY_MAX") {
            self.retry.max_retries = parse_env("SP500ETL_RETRY_MAX", &v)?;
        }
        if let Some(v) = lookup("SP500ETL_RETRY_BASE_MS") {
            self.retry.base_delay_ms = parse_env("SP500ETL_RETRY_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("SP500ETL_RETRY_MAX_MS") {
            self.retry.max_delay_ms = parse_env("SP500ETL_RETRY_MAX_MS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Configuration(msg));
        if self.window.days == 0 {
            return invalid("window.days must be at least 1".to_string());
        }
        if self.extract.concurrency == 0 {
            return invalid("extract.concurrency must be at least 1".to_string());
        }
        if self.extract.min_delay_ms > self.extract.max_delay_ms {
            return invalid(format!(
                "extract.min_delay_ms ({}) exceeds extract.max_delay_ms ({})",
                self.extract.min_delay_ms, self.extract.max_delay_ms
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.market_data.chart_base_url.trim().is_empty() {
            return invalid("market_data.chart_base_url is empty".to_string());
        }
        if self.staging.prefix.contains("..") || self.staging.prefix.contains('\\') {
            return invalid(format!("invalid staging prefix '{}'", self.staging.prefix));
        }
        validate_table_name(&self.warehouse.table)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        Ok(())
    }

    /// Run window for `run_date`, optionally ending on `end` instead of the
    /// day before the run.
    pub fn run_window(
        &self,
        run_date: RunDate,
        end: Option<NaiveDate>,
    ) -> Result<RunWindow, PipelineError> {
        RunWindow::new(run_date, end, self.window.days, self.window.lookback_days)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PipelineError> {
    value.trim().parse::<T>().map_err(|_| {
        PipelineError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, value))
    })
}

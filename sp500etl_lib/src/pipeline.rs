//! Stage orchestration.
//!
//! Each step reads its input from staging and writes its output back, so
//! `extract`, `transform` and `load` can run as separate invocations with
//! only a [`StagingHandle`] passed between them. [`Pipeline::run`] chains
//! all three for one run date.

use serde::Serialize;

use marketdata_api::Client;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::extract::{Extractor, PriceSource, ProgressFn, YahooSource};
use crate::load::{LoadSummary, Loader};
use crate::staging::{BlobStore, FsBlobStore, StagingHandle};
use crate::transform::transform;
use crate::types::{DateRange, RunDate, RunWindow, SkippedTicker, Ticker};
use crate::universe::UniverseResolver;
use crate::warehouse::{SqliteWarehouse, WarehouseSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every ticker in the universe made it into the warehouse.
    Success,
    /// The run completed but some tickers were skipped.
    PartialSuccess,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::PartialSuccess => f.write_str("partial success"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtractReport {
    pub handle: StagingHandle,
    pub run_date: RunDate,
    pub fetch_range: DateRange,
    pub attempted: usize,
    pub fetched: usize,
    pub rows: usize,
    pub skipped: Vec<SkippedTicker>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransformReport {
    pub handle: StagingHandle,
    pub run_date: RunDate,
    /// Reporting range after anchoring to the latest trading session.
    pub reporting: DateRange,
    pub rows: usize,
    pub tickers: usize,
    pub rejected_rows: usize,
    /// Skips from both extraction and transformation.
    pub skipped: Vec<SkippedTicker>,
}

/// Outcome of a complete run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub run_date: RunDate,
    pub status: RunStatus,
    pub reporting: DateRange,
    pub raw_handle: StagingHandle,
    pub transformed_handle: StagingHandle,
    pub table: String,
    pub tickers_attempted: usize,
    pub tickers_loaded: usize,
    pub rows_loaded: usize,
    pub rejected_rows: usize,
    pub skipped: Vec<SkippedTicker>,
}

pub struct Pipeline<S: PriceSource, B: BlobStore, W: WarehouseSink> {
    resolver: UniverseResolver,
    extractor: Extractor<S>,
    loader: Loader<B, W>,
    table: String,
}

impl<S: PriceSource, B: BlobStore, W: WarehouseSink> Pipeline<S, B, W> {
    pub fn new(
        resolver: UniverseResolver,
        extractor: Extractor<S>,
        loader: Loader<B, W>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            extractor,
            loader,
            table: table.into(),
        }
    }

    pub fn loader(&self) -> &Loader<B, W> {
        &self.loader
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn resolve_universe(&self) -> Result<Vec<Ticker>, PipelineError> {
        self.resolver.resolve().await
    }

    /// Resolves the universe, fetches the window and stages the raw extract.
    pub async fn extract(&self, window: &RunWindow) -> Result<ExtractReport, PipelineError> {
        let tickers = self.resolve_universe().await?;
        let raw = self.extractor.fetch_all(&tickers, window).await?;
        let handle = self.loader.stage_raw(&raw).await?;
        Ok(ExtractReport {
            handle,
            run_date: window.run_date,
            fetch_range: window.fetch,
            attempted: tickers.len(),
            fetched: raw.series.len(),
            rows: raw.row_count(),
            skipped: raw.skipped,
        })
    }

    /// Transforms a staged raw extract and stages the result.
    pub async fn transform(&self, raw_handle: &StagingHandle) -> Result<TransformReport, PipelineError> {
        let raw = self.loader.read_raw(raw_handle).await?;
        let transformed = transform(&raw)?;
        let mut skipped = raw.skipped.clone();
        skipped.extend(transformed.skipped.iter().cloned());
        skipped.sort_by(|a, b| a.ticker.cmp(&b.ticker));

        let handle = self
            .loader
            .stage_transformed(&transformed.dataset, &skipped)
            .await?;
        Ok(TransformReport {
            handle,
            run_date: raw.window.run_date,
            reporting: transformed.dataset.window.reporting,
            rows: transformed.dataset.len(),
            tickers: transformed.dataset.ticker_count(),
            rejected_rows: transformed.rejected.len(),
            skipped,
        })
    }

    /// Loads a staged dataset into the configured table.
    pub async fn load(&self, handle: &StagingHandle) -> Result<LoadSummary, PipelineError> {
        self.loader.load(handle, &self.table).await
    }

    /// All stages for one run window.
    pub async fn run(&self, window: &RunWindow) -> Result<RunReport, PipelineError> {
        tracing::info!(run_date = %window.run_date, reporting = %window.reporting, "run started");
        let extracted = self.extract(window).await?;
        let transformed = self.transform(&extracted.handle).await?;
        let loaded = self.load(&transformed.handle).await?;

        let status = if transformed.skipped.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::PartialSuccess
        };
        let report = RunReport {
            run_date: window.run_date,
            status,
            reporting: loaded.partition,
            raw_handle: extracted.handle,
            transformed_handle: transformed.handle,
            table: loaded.table,
            tickers_attempted: extracted.attempted,
            tickers_loaded: transformed.tickers,
            rows_loaded: loaded.rows,
            rejected_rows: transformed.rejected_rows,
            skipped: transformed.skipped,
        };
        tracing::info!(
            status = %report.status,
            rows = report.rows_loaded,
            tickers = report.tickers_loaded,
            skipped = report.skipped.len(),
            "run finished"
        );
        Ok(report)
    }
}

/// The production wiring: Yahoo chart API, filesystem staging, SQLite
/// warehouse.
pub type DefaultPipeline = Pipeline<YahooSource, FsBlobStore, SqliteWarehouse>;

impl Pipeline<YahooSource, FsBlobStore, SqliteWarehouse> {
    pub fn from_config(
        config: &PipelineConfig,
        progress: Option<ProgressFn>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let client = Client::with_base_url(&config.market_data.chart_base_url).map_err(|e| {
            PipelineError::Configuration(format!("cannot build market-data client: {}", e))
        })?;
        let source = YahooSource::new(client, config.retry.clone());
        let mut extractor = Extractor::new(source, config.extract.clone());
        if let Some(progress) = progress {
            extractor = extractor.with_progress(progress);
        }

        // Opened on first use, so extract and transform never touch the file.
        let warehouse = SqliteWarehouse::open_lazy(&config.warehouse.path);
        let loader = Loader::new(
            FsBlobStore::new(&config.staging.root),
            warehouse,
            config.staging.prefix.clone(),
            config.retry.clone(),
        );
        let resolver = UniverseResolver::new(config.universe.clone(), config.retry.clone());
        Ok(Self::new(resolver, extractor, loader, config.warehouse.table.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SymbolFetchError;
    use crate::extract::ExtractOptions;
    use crate::retry::RetryPolicy;
    use crate::schema::TableSchema;
    use crate::staging::MemoryBlobStore;
    use crate::types::{PriceRow, Stage};
    use crate::universe::UniverseSource;
    use chrono::{Days, NaiveDate};
    use std::future::Future;

    const TABLE: &str = "SP500_DATA";

    fn run_date() -> RunDate {
        RunDate::new(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap())
    }

    fn window() -> RunWindow {
        RunWindow::new(run_date(), None, 2, 5).unwrap()
    }

    /// Three days of bars ending on the 14th for every ticker except the
    /// ones listed in `failing`.
    struct SyntheticSource {
        failing: Vec<Ticker>,
    }

    impl PriceSource for SyntheticSource {
        fn fetch_daily(
            &self,
            ticker: &Ticker,
            range: &DateRange,
        ) -> impl Future<Output = Result<Vec<PriceRow>, SymbolFetchError>> + Send {
            let result = if self.failing.contains(ticker) {
                Err(SymbolFetchError::Network("connection reset by peer".to_string()))
            } else {
                let base = 100.0 + ticker.as_str().len() as f64;
                Ok((0..3u64)
                    .filter_map(|i| range.end.checked_sub_days(Days::new(2 - i)))
                    .enumerate()
                    .map(|(i, day)| {
                        let close = base + i as f64;
                        PriceRow {
                            date: day.and_hms_opt(0, 0, 0).unwrap(),
                            open: Some(close),
                            high: Some(close + 1.0),
                            low: Some(close - 1.0),
                            close: Some(close),
                            adj_close: Some(close),
                            volume: Some(1_000),
                        }
                    })
                    .collect())
            };
            async move { result }
        }
    }

    fn universe(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("S{:03}", i)).collect()
    }

    fn pipeline(
        symbols: Vec<String>,
        failing: Vec<Ticker>,
    ) -> Pipeline<SyntheticSource, MemoryBlobStore, SqliteWarehouse> {
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        warehouse
            .init_table(TABLE, &TableSchema::daily_prices())
            .unwrap();
        let extract = ExtractOptions {
            concurrency: 16,
            min_delay_ms: 0,
            max_delay_ms: 0,
            circuit_breaker_threshold: 0,
        };
        Pipeline::new(
            UniverseResolver::new(UniverseSource::Static { symbols }, RetryPolicy::none()),
            Extractor::new(SyntheticSource { failing }, extract),
            Loader::new(MemoryBlobStore::new(), warehouse, "", RetryPolicy::none()),
            TABLE,
        )
    }

    #[tokio::test]
    async fn test_partial_run_loads_remaining_tickers() {
        let failing = vec![Ticker::from("S010"), Ticker::from("S200"), Ticker::from("S499")];
        let pipeline = pipeline(universe(500), failing.clone());

        let report = pipeline.run(&window()).await.unwrap();
        assert_eq!(report.status, RunStatus::PartialSuccess);
        assert_eq!(report.tickers_attempted, 500);
        assert_eq!(report.tickers_loaded, 497);
        assert_eq!(report.rows_loaded, 497 * 2);
        let skipped: Vec<Ticker> = report.skipped.iter().map(|s| s.ticker.clone()).collect();
        assert_eq!(skipped, failing);
        assert!(report.skipped.iter().all(|s| s.stage == Stage::Extract));

        let staged = pipeline
            .loader()
            .read_transformed(&report.transformed_handle)
            .await
            .unwrap();
        assert_eq!(staged.dataset.ticker_count(), 497);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let pipeline = pipeline(universe(20), vec![]);
        let first = pipeline.run(&window()).await.unwrap();
        let count_first = pipeline.loader().sink().row_count(TABLE, None).unwrap();
        let second = pipeline.run(&window()).await.unwrap();
        let count_second = pipeline.loader().sink().row_count(TABLE, None).unwrap();

        assert_eq!(first.status, RunStatus::Success);
        assert_eq!(first.raw_handle, second.raw_handle);
        assert_eq!(first.transformed_handle, second.transformed_handle);
        assert_eq!(count_first, 40);
        assert_eq!(count_second, count_first);
    }

    #[tokio::test]
    async fn test_no_data_fails_before_staging() {
        let symbols = universe(3);
        let failing = symbols.iter().map(|s| Ticker::from(s.as_str())).collect();
        let pipeline = pipeline(symbols, failing);
        let err = pipeline.run(&window()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoDataAvailable { attempted: 3 }));
        assert!(pipeline.loader().store().is_empty());
    }

    #[tokio::test]
    async fn test_steps_compose_through_handles() {
        let pipeline = pipeline(universe(5), vec![]);
        let extracted = pipeline.extract(&window()).await.unwrap();
        assert_eq!(extracted.fetched, 5);
        assert_eq!(extracted.rows, 15);

        let transformed = pipeline.transform(&extracted.handle).await.unwrap();
        assert_eq!(transformed.rows, 10);
        assert_eq!(transformed.rejected_rows, 0);

        let loaded = pipeline.load(&transformed.handle).await.unwrap();
        assert_eq!(loaded.rows, 10);
        assert_eq!(loaded.partition, window().reporting);
    }

    #[tokio::test]
    async fn test_first_reporting_row_has_change_from_lookback() {
        let pipeline = pipeline(universe(1), vec![]);
        let report = pipeline.run(&window()).await.unwrap();
        let staged = pipeline
            .loader()
            .read_transformed(&report.transformed_handle)
            .await
            .unwrap();
        let first = &staged.dataset.rows[0];
        assert_eq!(first.date.date(), window().reporting.start);
        assert_eq!(first.close_change, Some(1.0));
    }

    #[tokio::test]
    async fn test_invalid_universe_aborts() {
        let pipeline = pipeline(vec!["AAPL".into(), "aapl".into()], vec![]);
        assert!(matches!(
            pipeline.run(&window()).await,
            Err(PipelineError::Configuration(_))
        ));
    }
}

//! Extractor: per-ticker daily bars for the fetch window.
//!
//! Fetches run on a bounded pool (Semaphore + JoinSet + mpsc) with a
//! jittered delay before each request. A failing ticker is logged and
//! skipped; the stage only fails when no ticker produced rows.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;

use marketdata_api::types::Bar;
use marketdata_api::{ChartQuery, Client};

use crate::error::{PipelineError, SymbolFetchError};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{DateRange, PriceRow, RawDataset, RunWindow, SkippedTicker, Stage, Ticker};

/// A market-data source that returns daily bars for one ticker.
pub trait PriceSource: Send + Sync + 'static {
    fn fetch_daily(
        &self,
        ticker: &Ticker,
        range: &DateRange,
    ) -> impl Future<Output = Result<Vec<PriceRow>, SymbolFetchError>> + Send;
}

/// Yahoo chart API source. Rate limiting and 5xx responses are retried
/// with the shared backoff policy before the ticker is given up on.
pub struct YahooSource {
    client: Client,
    retry: RetryPolicy,
}

impl YahooSource {
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

impl PriceSource for YahooSource {
    fn fetch_daily(
        &self,
        ticker: &Ticker,
        range: &DateRange,
    ) -> impl Future<Output = Result<Vec<PriceRow>, SymbolFetchError>> + Send {
        async move {
            let query = ChartQuery::daily(range.start, range.end);
            let label = format!("chart fetch for {}", ticker);
            let client = &self.client;
            let query = &query;
            let bars = with_retry(&self.retry, &label, move || {
                client.get_daily_bars(ticker.as_str(), query)
            })
            .await?;
            Ok(bars.into_iter().map(price_row_from_bar).collect())
        }
    }
}

fn price_row_from_bar(bar: Bar) -> PriceRow {
    PriceRow {
        date: bar.date.and_time(chrono::NaiveTime::MIN),
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        adj_close: bar.adj_close,
        volume: bar.volume,
    }
}

/// Pool sizing and politeness settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    pub concurrency: usize,
    /// Lower bound of the jittered pre-request delay.
    pub min_delay_ms: u64,
    /// Upper bound (exclusive) of the jittered pre-request delay.
    pub max_delay_ms: u64,
    /// Consecutive transport failures before the remaining fetches are
    /// abandoned. 0 disables the breaker.
    pub circuit_breaker_threshold: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            min_delay_ms: 200,
            max_delay_ms: 500,
            circuit_breaker_threshold: 10,
        }
    }
}

/// Snapshot handed to the progress callback after every finished ticker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractProgress {
    pub ticker: Ticker,
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub type ProgressFn = Arc<dyn Fn(&ExtractProgress) + Send + Sync>;

struct CircuitBreaker {
    consecutive_failures: usize,
    threshold: usize,
}

impl CircuitBreaker {
    fn new(threshold: usize) -> Self {
        Self {
            consecutive_failures: 0,
            threshold,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    fn is_tripped(&self) -> bool {
        self.threshold > 0 && self.consecutive_failures >= self.threshold
    }
}

struct FetchOutcome {
    ticker: Ticker,
    result: Result<Vec<PriceRow>, SymbolFetchError>,
}

pub struct Extractor<S: PriceSource> {
    source: Arc<S>,
    options: ExtractOptions,
    progress: Option<ProgressFn>,
}

impl<S: PriceSource> Extractor<S> {
    pub fn new(source: S, options: ExtractOptions) -> Self {
        Self {
            source: Arc::new(source),
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Rows for one ticker within `range`, ascending by date.
    pub async fn fetch(
        &self,
        ticker: &Ticker,
        range: &DateRange,
    ) -> Result<Vec<PriceRow>, SymbolFetchError> {
        fetch_one(self.source.as_ref(), ticker, range).await
    }

    /// Fetches every ticker over the window's fetch range.
    ///
    /// Per-ticker failures are recorded in [`RawDataset::skipped`]. Returns
    /// [`PipelineError::NoDataAvailable`] when no ticker produced rows.
    pub async fn fetch_all(
        &self,
        tickers: &[Ticker],
        window: &RunWindow,
    ) -> Result<RawDataset, PipelineError> {
        let total = tickers.len();
        let range = window.fetch;
        let concurrency = self.options.concurrency.max(1);
        tracing::info!(tickers = total, %range, concurrency, "extract started");

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::channel::<FetchOutcome>(concurrency * 2);
        let mut join_set = JoinSet::new();

        for ticker in tickers.iter().cloned() {
            let sem = Arc::clone(&semaphore);
            let sender = tx.clone();
            let source = Arc::clone(&self.source);
            let (min_delay, max_delay) = (self.options.min_delay_ms, self.options.max_delay_ms);

            join_set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return;
                };
                if max_delay > min_delay {
                    let delay_ms = rand::thread_rng().gen_range(min_delay..max_delay);
                    sleep(Duration::from_millis(delay_ms)).await;
                } else if min_delay > 0 {
                    sleep(Duration::from_millis(min_delay)).await;
                }
                let result = fetch_one(source.as_ref(), &ticker, &range).await;
                let _ = sender.send(FetchOutcome { ticker, result }).await;
            });
        }
        drop(tx);

        let mut series = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        let mut failed = 0usize;
        let mut breaker = CircuitBreaker::new(self.options.circuit_breaker_threshold);

        while let Some(outcome) = rx.recv().await {
            seen.insert(outcome.ticker.clone());
            match outcome.result {
                Ok(rows) => {
                    tracing::debug!(ticker = %outcome.ticker, rows = rows.len(), "fetched");
                    breaker.record_success();
                    series.insert(outcome.ticker.clone(), rows);
                }
                Err(err) => {
                    tracing::warn!(ticker = %outcome.ticker, reason = %err, "ticker skipped");
                    if matches!(
                        err,
                        SymbolFetchError::Network(_) | SymbolFetchError::InvalidResponse(_)
                    ) {
                        breaker.record_failure();
                    }
                    failed += 1;
                    skipped.push(SkippedTicker {
                        ticker: outcome.ticker.clone(),
                        stage: Stage::Extract,
                        reason: err.to_string(),
                    });
                }
            }

            if let Some(progress) = &self.progress {
                progress(&ExtractProgress {
                    ticker: outcome.ticker,
                    completed: seen.len(),
                    total,
                    succeeded: series.len(),
                    failed,
                });
            }

            if breaker.is_tripped() {
                tracing::warn!(
                    threshold = self.options.circuit_breaker_threshold,
                    "circuit breaker tripped, abandoning remaining fetches"
                );
                join_set.abort_all();
                break;
            }
        }

        let abandoned_reason = if breaker.is_tripped() {
            SymbolFetchError::CircuitOpen
        } else {
            SymbolFetchError::Network("fetch task did not complete".to_string())
        };
        for ticker in tickers {
            if !seen.contains(ticker) {
                skipped.push(SkippedTicker {
                    ticker: ticker.clone(),
                    stage: Stage::Extract,
                    reason: abandoned_reason.to_string(),
                });
            }
        }
        skipped.sort_by(|a, b| a.ticker.cmp(&b.ticker));

        if series.is_empty() {
            return Err(PipelineError::NoDataAvailable { attempted: total });
        }

        let dataset = RawDataset {
            window: *window,
            series,
            skipped,
        };
        tracing::info!(
            fetched = dataset.series.len(),
            skipped = dataset.skipped.len(),
            rows = dataset.row_count(),
            "extract finished"
        );
        Ok(dataset)
    }
}

async fn fetch_one<S: PriceSource>(
    source: &S,
    ticker: &Ticker,
    range: &DateRange,
) -> Result<Vec<PriceRow>, SymbolFetchError> {
    let mut rows = source.fetch_daily(ticker, range).await?;
    rows.retain(|row| range.contains(row.date.date()));
    if rows.is_empty() {
        return Err(SymbolFetchError::Empty);
    }
    rows.sort_by_key(|row| row.date);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunDate;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn bar(day: u32, close: f64) -> PriceRow {
        PriceRow {
            date: d(day).and_hms_opt(0, 0, 0).unwrap(),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            adj_close: Some(close),
            volume: Some(100),
        }
    }

    fn window() -> RunWindow {
        RunWindow::new(RunDate::new(d(15)), None, 1, 5).unwrap()
    }

    fn no_delay() -> ExtractOptions {
        ExtractOptions {
            concurrency: 8,
            min_delay_ms: 0,
            max_delay_ms: 0,
            circuit_breaker_threshold: 0,
        }
    }

    #[derive(Default)]
    struct FakeSource {
        responses: HashMap<Ticker, Result<Vec<PriceRow>, SymbolFetchError>>,
        calls: AtomicUsize,
    }

    impl PriceSource for FakeSource {
        fn fetch_daily(
            &self,
            ticker: &Ticker,
            _range: &DateRange,
        ) -> impl Future<Output = Result<Vec<PriceRow>, SymbolFetchError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .get(ticker)
                .cloned()
                .unwrap_or(Err(SymbolFetchError::NotFound));
            async move { response }
        }
    }

    /// Counts calls that are in flight at the same time.
    #[derive(Default)]
    struct InFlightSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl PriceSource for InFlightSource {
        fn fetch_daily(
            &self,
            _ticker: &Ticker,
            _range: &DateRange,
        ) -> impl Future<Output = Result<Vec<PriceRow>, SymbolFetchError>> + Send {
            async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.calls.fetch_add(1, Ordering::SeqCst);
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                sleep(Duration::from_millis(5)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(vec![bar(14, 1.0)])
            }
        }
    }

    fn tickers(n: usize) -> Vec<Ticker> {
        (0..n).map(|i| Ticker::new(format!("T{:03}", i))).collect()
    }

    #[tokio::test]
    async fn test_partial_failures_are_skipped() {
        let universe = tickers(500);
        let mut source = FakeSource::default();
        for (i, t) in universe.iter().enumerate() {
            let response = if i % 200 == 7 {
                Err(SymbolFetchError::Network("connection reset".into()))
            } else {
                Ok(vec![bar(13, 10.0), bar(14, 11.0)])
            };
            source.responses.insert(t.clone(), response);
        }

        let extractor = Extractor::new(source, no_delay());
        let raw = extractor.fetch_all(&universe, &window()).await.unwrap();
        assert_eq!(raw.series.len(), 497);
        assert_eq!(raw.skipped.len(), 3);
        assert!(raw.skipped.iter().all(|s| s.stage == Stage::Extract));
        assert_eq!(raw.row_count(), 994);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_fetches_bounded_by_concurrency() {
        let options = ExtractOptions {
            concurrency: 4,
            ..no_delay()
        };
        let extractor = Extractor::new(InFlightSource::default(), options.clone());
        let raw = extractor.fetch_all(&tickers(50), &window()).await.unwrap();
        assert_eq!(raw.series.len(), 50);

        let source = extractor.source.as_ref();
        let peak = source.peak.load(Ordering::SeqCst);
        assert_eq!(source.calls.load(Ordering::SeqCst), 50);
        assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
        assert!(peak >= 1);
        assert!(
            peak <= options.concurrency,
            "peak {} exceeded concurrency {}",
            peak,
            options.concurrency
        );
    }

    #[tokio::test]
    async fn test_zero_fetched_is_no_data() {
        let extractor = Extractor::new(FakeSource::default(), no_delay());
        let err = extractor
            .fetch_all(&tickers(4), &window())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoDataAvailable { attempted: 4 }));
    }

    #[tokio::test]
    async fn test_fetch_sorts_and_filters_to_range() {
        let mut source = FakeSource::default();
        source.responses.insert(
            Ticker::from("AAPL"),
            Ok(vec![bar(14, 3.0), bar(1, 0.5), bar(12, 1.0), bar(20, 9.0)]),
        );
        let extractor = Extractor::new(source, no_delay());
        let rows = extractor
            .fetch(&Ticker::from("AAPL"), &window().fetch)
            .await
            .unwrap();
        let days: Vec<u32> = rows
            .iter()
            .map(|r| chrono::Datelike::day(&r.date.date()))
            .collect();
        assert_eq!(days, vec![12, 14]);
    }

    #[tokio::test]
    async fn test_rows_outside_range_only_is_empty() {
        let mut source = FakeSource::default();
        source
            .responses
            .insert(Ticker::from("OLD"), Ok(vec![bar(1, 1.0)]));
        let extractor = Extractor::new(source, no_delay());
        let err = extractor
            .fetch(&Ticker::from("OLD"), &window().fetch)
            .await
            .unwrap_err();
        assert_eq!(err, SymbolFetchError::Empty);
    }

    #[tokio::test]
    async fn test_circuit_breaker_abandons_remaining() {
        let universe = tickers(50);
        let mut source = FakeSource::default();
        source
            .responses
            .insert(universe[0].clone(), Ok(vec![bar(14, 1.0)]));
        for t in &universe[1..] {
            source
                .responses
                .insert(t.clone(), Err(SymbolFetchError::Network("503".into())));
        }
        let options = ExtractOptions {
            concurrency: 1,
            circuit_breaker_threshold: 3,
            ..no_delay()
        };
        let extractor = Extractor::new(source, options);
        let raw = extractor.fetch_all(&universe, &window()).await.unwrap();

        assert_eq!(raw.series.len(), 1);
        assert_eq!(raw.skipped.len(), 49);
        let open = raw
            .skipped
            .iter()
            .filter(|s| s.reason == SymbolFetchError::CircuitOpen.to_string())
            .count();
        assert!(open > 0);
        assert!(extractor.source.calls.load(Ordering::SeqCst) < 50);
    }

    #[tokio::test]
    async fn test_not_found_does_not_trip_breaker() {
        let universe = tickers(20);
        let mut source = FakeSource::default();
        source
            .responses
            .insert(universe[19].clone(), Ok(vec![bar(14, 1.0)]));
        let options = ExtractOptions {
            concurrency: 1,
            circuit_breaker_threshold: 3,
            ..no_delay()
        };
        let extractor = Extractor::new(source, options);
        let raw = extractor.fetch_all(&universe, &window()).await.unwrap();
        assert_eq!(raw.series.len(), 1);
        assert!(raw
            .skipped
            .iter()
            .all(|s| s.reason == SymbolFetchError::NotFound.to_string()));
    }

    #[tokio::test]
    async fn test_progress_reports_every_ticker() {
        let universe = tickers(10);
        let mut source = FakeSource::default();
        for t in &universe {
            source.responses.insert(t.clone(), Ok(vec![bar(14, 1.0)]));
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let extractor = Extractor::new(source, no_delay()).with_progress(Arc::new(
            move |p: &ExtractProgress| {
                sink.lock().unwrap().push(p.completed);
            },
        ));
        extractor.fetch_all(&universe, &window()).await.unwrap();
        let completed = seen.lock().unwrap().clone();
        assert_eq!(completed, (1..=10).collect::<Vec<_>>());
    }
}

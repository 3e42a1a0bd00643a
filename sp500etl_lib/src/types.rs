//! Domain types shared by every pipeline stage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// An opaque ticker symbol in the market-data source's format (e.g. `BRK-B`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Ticker {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The logical date a run is executed for. Every staging key and the
/// warehouse partition of a run derive from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunDate(NaiveDate);

impl RunDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for RunDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for RunDate {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(RunDate)
            .map_err(|e| PipelineError::Configuration(format!("invalid run date '{}': {}", s, e)))
    }
}

/// A closed interval of calendar dates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::Configuration(format!(
                "date range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Inclusive lower and exclusive upper timestamp bounds, as used by the
    /// warehouse partition delete.
    pub fn timestamp_bounds(&self) -> (NaiveDateTime, NaiveDateTime) {
        let lower = self.start.and_time(chrono::NaiveTime::MIN);
        let upper = self
            .end
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX)
            .and_time(chrono::NaiveTime::MIN);
        (lower, upper)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Date bounds of one run.
///
/// `reporting` is what lands in the warehouse; `fetch` extends it backwards
/// by `lookback_days` calendar days so the first reporting day has a prior
/// close to diff against, even across weekends and holidays.
///
/// Unless `end_pinned` is set, the reporting end is only a ceiling: the
/// transformer moves it back to the latest session present in the data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub run_date: RunDate,
    pub reporting: DateRange,
    pub fetch: DateRange,
    #[serde(default)]
    pub end_pinned: bool,
}

impl RunWindow {
    /// Builds the window for `run_date`. The reporting window ends on
    /// `end` if given (pinned), otherwise the day before the run date, and
    /// spans `window_days` calendar days.
    pub fn new(
        run_date: RunDate,
        end: Option<NaiveDate>,
        window_days: u32,
        lookback_days: u32,
    ) -> Result<Self, PipelineError> {
        if window_days == 0 {
            return Err(PipelineError::Configuration(
                "window_days must be at least 1".to_string(),
            ));
        }
        let end_pinned = end.is_some();
        let end = match end {
            Some(end) => end,
            None => run_date
                .date()
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| PipelineError::Configuration("run date out of range".to_string()))?,
        };
        let start = end
            .checked_sub_days(Days::new(u64::from(window_days - 1)))
            .ok_or_else(|| PipelineError::Configuration("window start out of range".to_string()))?;
        let fetch_start = start
            .checked_sub_days(Days::new(u64::from(lookback_days)))
            .ok_or_else(|| PipelineError::Configuration("lookback out of range".to_string()))?;
        Ok(Self {
            run_date,
            reporting: DateRange::new(start, end)?,
            fetch: DateRange::new(fetch_start, end)?,
            end_pinned,
        })
    }

    /// Moves an unpinned reporting window back so it ends on `latest`, the
    /// most recent trading session found in the fetched data. The span is
    /// kept but never starts before the fetch window. Pinned windows, and
    /// sessions already at or past the end, leave the window unchanged.
    pub fn anchored_to_session(&self, latest: NaiveDate) -> RunWindow {
        if self.end_pinned || latest >= self.reporting.end || latest < self.fetch.start {
            return *self;
        }
        let span = (self.reporting.end - self.reporting.start).num_days();
        let start = latest
            .checked_sub_days(Days::new(span.unsigned_abs()))
            .unwrap_or(self.fetch.start)
            .max(self.fetch.start);
        RunWindow {
            run_date: self.run_date,
            reporting: DateRange { start, end: latest },
            fetch: self.fetch,
            end_pinned: true,
        }
    }
}

/// One daily bar for one ticker, as the source returned it.
///
/// Values are optional because sources do return gaps; the transformer
/// decides which rows are usable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDateTime,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<i64>,
}

/// A validated price row with its ticker and the two derived columns.
///
/// Field names serialize to the warehouse's case-sensitive column names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    #[serde(rename = "DATE")]
    pub date: NaiveDateTime,
    #[serde(rename = "SYMBOL")]
    pub symbol: Ticker,
    #[serde(rename = "OPEN")]
    pub open: f64,
    #[serde(rename = "HIGH")]
    pub high: f64,
    #[serde(rename = "LOW")]
    pub low: f64,
    #[serde(rename = "CLOSE")]
    pub close: f64,
    #[serde(rename = "ADJ_CLOSE")]
    pub adj_close: f64,
    #[serde(rename = "VOLUME")]
    pub volume: i64,
    pub close_change: Option<f64>,
    pub close_pct_change: Option<f64>,
}

/// Pipeline stage a ticker was dropped in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Extract => f.write_str("extract"),
            Stage::Transform => f.write_str("transform"),
        }
    }
}

/// A ticker excluded from a run, with the reason it was excluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTicker {
    pub ticker: Ticker,
    pub stage: Stage,
    pub reason: String,
}

/// Extractor output for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDataset {
    pub window: RunWindow,
    pub series: BTreeMap<Ticker, Vec<PriceRow>>,
    pub skipped: Vec<SkippedTicker>,
}

impl RawDataset {
    pub fn row_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

/// Transformer output for one run, ordered by symbol then date.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub window: RunWindow,
    pub rows: Vec<EnrichedRow>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of distinct symbols present.
    pub fn ticker_count(&self) -> usize {
        let mut count = 0;
        let mut last: Option<&Ticker> = None;
        for row in &self.rows {
            if last != Some(&row.symbol) {
                count += 1;
                last = Some(&row.symbol);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn run_window_defaults_to_yesterday() {
        let window = RunWindow::new(RunDate::new(d(2024, 6, 15)), None, 1, 5).unwrap();
        assert_eq!(window.reporting.start, d(2024, 6, 14));
        assert_eq!(window.reporting.end, d(2024, 6, 14));
        assert_eq!(window.fetch.start, d(2024, 6, 9));
        assert_eq!(window.fetch.end, d(2024, 6, 14));
    }

    #[test]
    fn run_window_with_explicit_end_and_span() {
        let window =
            RunWindow::new(RunDate::new(d(2024, 6, 15)), Some(d(2024, 6, 12)), 3, 4).unwrap();
        assert_eq!(window.reporting.start, d(2024, 6, 10));
        assert_eq!(window.reporting.end, d(2024, 6, 12));
        assert_eq!(window.fetch.start, d(2024, 6, 6));
    }

    #[test]
    fn explicit_end_pins_the_window() {
        let run_date = RunDate::new(d(2024, 6, 15));
        assert!(!RunWindow::new(run_date, None, 1, 5).unwrap().end_pinned);
        assert!(RunWindow::new(run_date, Some(d(2024, 6, 14)), 1, 5).unwrap().end_pinned);
    }

    #[test]
    fn sunday_run_anchors_to_friday_session() {
        // Run on Sunday the 16th: nominal reporting day is Saturday.
        let window = RunWindow::new(RunDate::new(d(2024, 6, 16)), None, 1, 5).unwrap();
        let anchored = window.anchored_to_session(d(2024, 6, 14));
        assert_eq!(anchored.reporting.start, d(2024, 6, 14));
        assert_eq!(anchored.reporting.end, d(2024, 6, 14));
        assert_eq!(anchored.fetch, window.fetch);
        assert!(anchored.end_pinned);
    }

    #[test]
    fn anchoring_keeps_span_within_fetch_window() {
        let window = RunWindow::new(RunDate::new(d(2024, 6, 17)), None, 3, 2).unwrap();
        // reporting 14..=16, fetch 12..=16
        let anchored = window.anchored_to_session(d(2024, 6, 13));
        assert_eq!(anchored.reporting.start, d(2024, 6, 12));
        assert_eq!(anchored.reporting.end, d(2024, 6, 13));
    }

    #[test]
    fn anchoring_leaves_pinned_or_current_windows_alone() {
        let pinned =
            RunWindow::new(RunDate::new(d(2024, 6, 16)), Some(d(2024, 6, 15)), 1, 5).unwrap();
        assert_eq!(pinned.anchored_to_session(d(2024, 6, 14)), pinned);

        let current = RunWindow::new(RunDate::new(d(2024, 6, 15)), None, 1, 5).unwrap();
        assert_eq!(current.anchored_to_session(d(2024, 6, 14)), current);
    }

    #[test]
    fn run_window_rejects_zero_days() {
        let result = RunWindow::new(RunDate::new(d(2024, 6, 15)), None, 0, 5);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn date_range_rejects_inverted() {
        assert!(DateRange::new(d(2024, 6, 2), d(2024, 6, 1)).is_err());
    }

    #[test]
    fn timestamp_bounds_are_half_open() {
        let range = DateRange::new(d(2024, 6, 14), d(2024, 6, 14)).unwrap();
        let (lower, upper) = range.timestamp_bounds();
        assert_eq!(lower, d(2024, 6, 14).and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(upper, d(2024, 6, 15).and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn run_date_parses_and_displays() {
        let date: RunDate = "2024-06-15".parse().unwrap();
        assert_eq!(date.to_string(), "2024-06-15");
        assert!("15/06/2024".parse::<RunDate>().is_err());
    }

    #[test]
    fn dataset_counts_distinct_tickers() {
        let window = RunWindow::new(RunDate::new(d(2024, 6, 15)), None, 2, 3).unwrap();
        let row = |sym: &str, day: u32| EnrichedRow {
            date: d(2024, 6, day).and_hms_opt(0, 0, 0).unwrap(),
            symbol: Ticker::from(sym),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            adj_close: 1.0,
            volume: 1,
            close_change: None,
            close_pct_change: None,
        };
        let dataset = Dataset {
            window,
            rows: vec![row("AAPL", 13), row("AAPL", 14), row("MSFT", 13)],
        };
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.ticker_count(), 2);
    }
}

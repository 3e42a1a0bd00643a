//! Transformer: validation, lag metrics, and lookback truncation.
//!
//! Each ticker is processed in isolation, so tickers run in parallel. The
//! previous close is always taken from the same ticker's previous valid
//! row; nothing ever leaks across symbols.

use chrono::NaiveDate;
use rayon::prelude::*;

use crate::error::{PipelineError, RowDefect, RowValidationError};
use crate::types::{
    Dataset, DateRange, EnrichedRow, PriceRow, RawDataset, RunWindow, SkippedTicker, Stage,
    Ticker,
};

/// Result of transforming one run.
#[derive(Clone, Debug, PartialEq)]
pub struct Transformed {
    pub dataset: Dataset,
    /// Rows dropped by validation.
    pub rejected: Vec<RowValidationError>,
    /// Tickers that produced no reporting rows.
    pub skipped: Vec<SkippedTicker>,
}

/// Output for a single ticker.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesOutcome {
    pub rows: Vec<EnrichedRow>,
    pub rejected: Vec<RowValidationError>,
}

/// `close - prev_close` and `(close - prev_close) / prev_close`.
///
/// The change is `None` without a previous close; the ratio is also `None`
/// when the previous close is zero.
pub fn close_changes(close: f64, prev_close: Option<f64>) -> (Option<f64>, Option<f64>) {
    match prev_close {
        Some(prev) => {
            let change = close - prev;
            let pct = if prev != 0.0 { Some(change / prev) } else { None };
            (Some(change), pct)
        }
        None => (None, None),
    }
}

struct ValidRow {
    date: chrono::NaiveDateTime,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    adj_close: f64,
    volume: i64,
}

fn price(value: Option<f64>, field: &'static str) -> Result<f64, RowDefect> {
    let v = value.ok_or(RowDefect::MissingField(field))?;
    if !v.is_finite() {
        return Err(RowDefect::NonFinite(field));
    }
    if v < 0.0 {
        return Err(RowDefect::NegativePrice(field));
    }
    Ok(v)
}

fn validate(row: &PriceRow) -> Result<ValidRow, RowDefect> {
    let open = price(row.open, "open")?;
    let high = price(row.high, "high")?;
    let low = price(row.low, "low")?;
    let close = price(row.close, "close")?;
    // Sources without an adjusted series report the raw close.
    let adj_close = price(row.adj_close.or(row.close), "adj_close")?;
    let volume = row.volume.ok_or(RowDefect::MissingField("volume"))?;
    if volume < 0 {
        return Err(RowDefect::NegativeVolume(volume));
    }
    let max = open.max(close).max(low);
    if high < max {
        return Err(RowDefect::HighBelowRange { high, max });
    }
    Ok(ValidRow {
        date: row.date,
        open,
        high,
        low,
        close,
        adj_close,
        volume,
    })
}

/// Validates, orders, and enriches one ticker's rows, keeping only rows
/// inside `reporting`. Earlier rows only seed the lag.
pub fn transform_series(ticker: &Ticker, rows: &[PriceRow], reporting: &DateRange) -> SeriesOutcome {
    let mut rejected = Vec::new();
    let mut valid = Vec::with_capacity(rows.len());
    for row in rows {
        match validate(row) {
            Ok(v) => valid.push(v),
            Err(defect) => rejected.push(RowValidationError {
                ticker: ticker.clone(),
                date: row.date.date(),
                defect,
            }),
        }
    }
    valid.sort_by_key(|r| r.date);

    let mut out = Vec::new();
    let mut prev: Option<(NaiveDate, f64)> = None;
    for row in valid {
        let day = row.date.date();
        if prev.map(|(d, _)| d) == Some(day) {
            rejected.push(RowValidationError {
                ticker: ticker.clone(),
                date: day,
                defect: RowDefect::DuplicateDate,
            });
            continue;
        }
        let (close_change, close_pct_change) = close_changes(row.close, prev.map(|(_, c)| c));
        prev = Some((day, row.close));
        if !reporting.contains(day) {
            continue;
        }
        out.push(EnrichedRow {
            date: row.date,
            symbol: ticker.clone(),
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            adj_close: row.adj_close,
            volume: row.volume,
            close_change,
            close_pct_change,
        });
    }

    for err in &rejected {
        tracing::warn!(ticker = %err.ticker, date = %err.date, reason = %err.defect, "row rejected");
    }
    SeriesOutcome {
        rows: out,
        rejected,
    }
}

/// Latest date with at least one valid row, across all tickers, no later
/// than the reporting end.
pub fn latest_session(raw: &RawDataset) -> Option<NaiveDate> {
    let ceiling = raw.window.reporting.end;
    raw.series
        .values()
        .flatten()
        .filter(|row| validate(row).is_ok())
        .map(|row| row.date.date())
        .filter(|day| *day <= ceiling)
        .max()
}

/// The window the dataset is reported for: an unpinned window ends on the
/// latest session in the data, so weekend and holiday runs load the most
/// recent trading day instead of an empty calendar day.
pub fn session_window(raw: &RawDataset) -> RunWindow {
    match latest_session(raw) {
        Some(latest) => {
            let window = raw.window.anchored_to_session(latest);
            if window.reporting != raw.window.reporting {
                tracing::info!(
                    nominal = %raw.window.reporting,
                    reporting = %window.reporting,
                    "reporting window moved to latest session"
                );
            }
            window
        }
        None => raw.window,
    }
}

/// Transforms every ticker of `raw` into one dataset ordered by symbol,
/// then date. Fails with [`PipelineError::NoDataAvailable`] when nothing
/// survives.
pub fn transform(raw: &RawDataset) -> Result<Transformed, PipelineError> {
    let window = session_window(raw);
    let reporting = window.reporting;
    let series: Vec<(&Ticker, &Vec<PriceRow>)> = raw.series.iter().collect();

    let outcomes: Vec<(Ticker, usize, SeriesOutcome)> = series
        .par_iter()
        .map(|(ticker, rows)| {
            (
                (*ticker).clone(),
                rows.len(),
                transform_series(ticker, rows, &reporting),
            )
        })
        .collect();

    let mut dataset_rows = Vec::new();
    let mut rejected = Vec::new();
    let mut skipped = Vec::new();
    for (ticker, input_rows, outcome) in outcomes {
        if outcome.rows.is_empty() {
            let reason = if outcome.rejected.len() >= input_rows {
                "all rows malformed"
            } else {
                "no rows in reporting window"
            };
            tracing::warn!(ticker = %ticker, reason, "ticker dropped");
            skipped.push(SkippedTicker {
                ticker,
                stage: Stage::Transform,
                reason: reason.to_string(),
            });
        } else {
            dataset_rows.extend(outcome.rows);
        }
        rejected.extend(outcome.rejected);
    }

    if dataset_rows.is_empty() {
        return Err(PipelineError::NoDataAvailable {
            attempted: raw.series.len() + raw.skipped.len(),
        });
    }

    let dataset = Dataset {
        window,
        rows: dataset_rows,
    };
    tracing::info!(
        rows = dataset.len(),
        tickers = dataset.ticker_count(),
        rejected = rejected.len(),
        dropped = skipped.len(),
        "transform finished"
    );
    Ok(Transformed {
        dataset,
        rejected,
        skipped,
    })
}

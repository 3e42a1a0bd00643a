use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Top-level envelope of a chart response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ChartResponse {
    pub chart: Chart,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Chart {
    pub result: Option<Vec<ChartResult>>,
    pub error: Option<ChartError>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChartError {
    pub code: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ChartResult {
    pub meta: ChartMeta,
    pub timestamp: Option<Vec<i64>>,
    pub indicators: Indicators,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    pub symbol: String,
    pub currency: Option<String>,
    /// Exchange offset from UTC in seconds (e.g. -14400 for New York in summer).
    pub gmtoffset: Option<i64>,
    pub exchange_timezone_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Indicators {
    #[serde(default)]
    pub quote: Vec<Quote>,
    pub adjclose: Option<Vec<AdjClose>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Quote {
    #[serde(default)]
    pub open: Vec<Option<f64>>,
    #[serde(default)]
    pub high: Vec<Option<f64>>,
    #[serde(default)]
    pub low: Vec<Option<f64>>,
    #[serde(default)]
    pub close: Vec<Option<f64>>,
    #[serde(default)]
    pub volume: Vec<Option<i64>>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AdjClose {
    #[serde(default)]
    pub adjclose: Vec<Option<f64>>,
}

/// One daily bar as returned by the API. Every field except the timestamp
/// may be missing; validation is the caller's concern.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    /// Trading date in the exchange's timezone.
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<i64>,
}

impl ChartResult {
    /// Zips the parallel indicator arrays into bars.
    ///
    /// Slots where every price and volume is null (holidays, halted
    /// sessions) are skipped. A missing adjusted-close series leaves
    /// `adj_close` empty rather than guessing.
    pub fn bars(&self) -> Result<Vec<Bar>, Error> {
        let Some(timestamps) = self.timestamp.as_ref() else {
            return Ok(Vec::new());
        };
        let quote = self
            .indicators
            .quote
            .first()
            .ok_or_else(|| Error::InvalidResponse("no quote indicators".to_string()))?;
        let adj = self
            .indicators
            .adjclose
            .as_ref()
            .and_then(|series| series.first())
            .map(|a| &a.adjclose);

        let offset = self
            .meta
            .gmtoffset
            .and_then(|secs| i32::try_from(secs).ok())
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let timestamp = DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| Error::InvalidResponse(format!("invalid timestamp: {}", ts)))?;

            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();
            let adj_close = adj.and_then(|v| v.get(i).copied().flatten());

            if open.is_none()
                && high.is_none()
                && low.is_none()
                && close.is_none()
                && volume.is_none()
            {
                continue;
            }

            bars.push(Bar {
                timestamp,
                date: timestamp.with_timezone(&offset).date_naive(),
                open,
                high,
                low,
                close,
                adj_close,
                volume,
            });
        }
        Ok(bars)
    }
}

impl ChartResponse {
    /// Unwraps the envelope into the bars of the first result.
    ///
    /// The API reports unknown symbols as `{"chart":{"result":null,
    /// "error":{"code":"Not Found",...}}}`; that case maps to
    /// [`Error::NotFound`].
    pub fn into_bars(self, symbol: &str) -> Result<Vec<Bar>, Error> {
        match (self.chart.result, self.chart.error) {
            (Some(results), _) => match results.first() {
                Some(result) => result.bars(),
                None => Err(Error::InvalidResponse("result array is empty".to_string())),
            },
            (None, Some(err)) if err.code == "Not Found" => Err(Error::NotFound {
                symbol: symbol.to_string(),
            }),
            (None, Some(err)) => Err(Error::InvalidResponse(format!(
                "{}: {}",
                err.code, err.description
            ))),
            (None, None) => Err(Error::InvalidResponse(
                "empty result with no error".to_string(),
            )),
        }
    }
}

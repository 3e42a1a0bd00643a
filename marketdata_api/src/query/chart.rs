//! Query builder for the `/v8/finance/chart/{symbol}` endpoint.

use chrono::NaiveDate;
use url::Url;

use super::common::Query;

/// Parameters for a chart request: a closed range of calendar dates
/// converted to unix seconds (`period1` at 00:00:00 UTC of the first day,
/// `period2` at 23:59:59 UTC of the last day).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartQuery {
    pub period1: i64,
    pub period2: i64,
}

impl ChartQuery {
    /// Builds a daily-bar query covering `start..=end`.
    pub fn daily(start: NaiveDate, end: NaiveDate) -> Self {
        let period1 = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();
        let period2 = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();
        Self { period1, period2 }
    }
}

impl Query for ChartQuery {
    fn add_to_url(&self, url: &Url) -> Url {
        let mut url = url.clone();
        url.query_pairs_mut()
            .append_pair("period1", &self.period1.to_string())
            .append_pair("period2", &self.period2.to_string())
            .append_pair("interval", "1d")
            .append_pair("includeAdjustedClose", "true")
            .append_pair("events", "div,splits");
        url
    }
}

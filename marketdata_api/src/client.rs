//! HTTP client for the Yahoo Finance v8 chart API.

use std::time::Duration;

use url::Url;

use crate::{
    query::{ChartQuery, Query},
    types::{Bar, ChartResponse},
    user_agent::get_user_agent,
    Error,
};

/// Request timeout for chart API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the chart API.
///
/// Holds one pooled `reqwest::Client` with a browser-like user agent and a
/// 30-second timeout. Cheap to share behind an `Arc` across fetch tasks.
pub struct Client {
    /// Base URL for the API. Defaults to `https://query2.finance.yahoo.com`.
    base_api_url: String,
    http: reqwest::Client,
}

impl Client {
    /// Creates a new client pointing at the production chart API.
    pub fn new() -> Result<Self, Error> {
        Self::with_base_url("https://query2.finance.yahoo.com")
    }

    /// Creates a new client with a custom base URL. Used for testing with wiremock.
    pub fn with_base_url(base_url: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(get_user_agent())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                tracing::error!("Failed to build HTTP client: {}", e);
                Error::RequestFailed
            })?;
        Ok(Self {
            base_api_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn get_url(&self, path: &str, query: &impl Query) -> Result<Url, Error> {
        let url = Url::parse(format!("{}{}", &self.base_api_url, path).as_str()).map_err(|e| {
            tracing::error!("Invalid URL constructed: {}", e);
            Error::RequestFailed
        })?;
        Ok(query.add_to_url(&url))
    }

    /// Fetches the raw chart envelope for a symbol.
    pub async fn get_chart(&self, symbol: &str, query: &ChartQuery) -> Result<ChartResponse, Error> {
        let url = self.get_url(&format!("/v8/finance/chart/{}", symbol), query)?;
        let resp = self
            .http
            .get(url)
            .header("accept", "application/json, text/plain, */*")
            .header("accept-language", "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to get chart for {}: {}", symbol, e);
                Error::RequestFailed
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            tracing::error!("Failed to read response body: {}", e);
            Error::RequestFailed
        })?;

        // Unknown symbols come back as 404 with a chart envelope carrying the error.
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                symbol: symbol.to_string(),
            });
        }

        if !status.is_success() {
            let snippet = truncate_body(&body);
            tracing::debug!("Chart request for {} failed with status {}: {}", symbol, status, snippet);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: snippet,
            });
        }

        serde_json::from_str::<ChartResponse>(&body).map_err(|e| {
            let snippet = truncate_body(&body);
            tracing::error!("Failed to parse chart: {} | body: {}", e, snippet);
            Error::InvalidResponse(e.to_string())
        })
    }

    /// Fetches daily bars for a symbol, ordered as the API returns them.
    pub async fn get_daily_bars(&self, symbol: &str, query: &ChartQuery) -> Result<Vec<Bar>, Error> {
        self.get_chart(symbol, query).await?.into_bars(symbol)
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 2000;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &body[..end])
    }
}

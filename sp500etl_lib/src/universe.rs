//! Universe resolution: which tickers a run covers.
//!
//! The default universe is compiled in from `seed_data/sp500_universe.yml`.
//! It can be replaced by a YAML file, an inline list, or a live scrape of the
//! Wikipedia constituents table.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use marketdata_api::user_agent::get_user_agent;

use crate::error::PipelineError;
use crate::retry::{with_retry, RetryPolicy, Transient};
use crate::types::Ticker;

pub const WIKIPEDIA_SP500_URL: &str = "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies";

/// Where the ticker list comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum UniverseSource {
    #[default]
    Embedded,
    File { path: PathBuf },
    Wikipedia {
        #[serde(default = "default_wikipedia_url")]
        url: String,
    },
    Static { symbols: Vec<String> },
}

fn default_wikipedia_url() -> String {
    WIKIPEDIA_SP500_URL.to_string()
}

/// Shape of a universe YAML file.
#[derive(Deserialize, Debug)]
pub struct UniverseFile {
    pub symbols: Vec<String>,
}

/// Normalizes a listing symbol to the market-data source format: trimmed,
/// uppercased, share-class dots replaced by dashes (`BRK.B` -> `BRK-B`).
pub fn normalize_symbol(raw: &str) -> Result<Ticker, PipelineError> {
    let symbol = raw.trim().to_ascii_uppercase().replace('.', "-");
    let mut chars = symbol.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_uppercase()
                && symbol.len() <= 10
                && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
        }
        None => false,
    };
    if !valid {
        return Err(PipelineError::Configuration(format!(
            "malformed ticker symbol '{}'",
            raw
        )));
    }
    Ok(Ticker::new(symbol))
}

/// Normalizes `raw` symbols into an ordered, duplicate-free universe.
///
/// Fails on an empty list, a malformed symbol, or two symbols that
/// normalize to the same ticker. A partial universe is never returned.
pub fn build_universe<I, S>(raw: I) -> Result<Vec<Ticker>, PipelineError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut tickers = Vec::new();
    for symbol in raw {
        let ticker = normalize_symbol(symbol.as_ref())?;
        if !seen.insert(ticker.clone()) {
            return Err(PipelineError::Configuration(format!(
                "duplicate ticker '{}' in universe",
                ticker
            )));
        }
        tickers.push(ticker);
    }
    if tickers.is_empty() {
        return Err(PipelineError::Configuration("universe is empty".to_string()));
    }
    Ok(tickers)
}

pub fn parse_universe(yaml_content: &str) -> Result<Vec<Ticker>, PipelineError> {
    let file: UniverseFile = serde_yml::from_str(yaml_content)
        .map_err(|e| PipelineError::Configuration(format!("invalid universe YAML: {}", e)))?;
    build_universe(&file.symbols)
}

/// Load the universe from the embedded seed file.
pub fn load_embedded_universe() -> Result<Vec<Ticker>, PipelineError> {
    let yaml_content = include_str!("../../seed_data/sp500_universe.yml");
    parse_universe(yaml_content)
}

/// Pulls the `Symbol` column out of the first table of the constituents page.
pub fn parse_constituents_table(html: &str) -> Result<Vec<String>, PipelineError> {
    let regex_err = |e: regex::Error| PipelineError::Configuration(format!("regex error: {}", e));
    let table_re = Regex::new(r"(?s)<table[^>]*>(.*?)</table>").map_err(regex_err)?;
    let first_cell_re = Regex::new(r"(?s)<tr[^>]*>\s*<td[^>]*>(.*?)</td>").map_err(regex_err)?;
    let tag_re = Regex::new(r"<[^>]+>").map_err(regex_err)?;

    let table = table_re
        .captures(html)
        .and_then(|c| c.get(1))
        .ok_or_else(|| {
            PipelineError::Configuration("constituents page has no table".to_string())
        })?;

    let symbols: Vec<String> = first_cell_re
        .captures_iter(table.as_str())
        .filter_map(|c| c.get(1))
        .map(|cell| tag_re.replace_all(cell.as_str(), "").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(PipelineError::Configuration(
            "constituents table has no symbol rows".to_string(),
        ));
    }
    Ok(symbols)
}

#[derive(thiserror::Error, Debug)]
enum PageError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

impl Transient for PageError {
    fn is_transient(&self) -> bool {
        match self {
            PageError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PageError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// Resolves a [`UniverseSource`] to tickers.
pub struct UniverseResolver {
    source: UniverseSource,
    retry: RetryPolicy,
}

impl UniverseResolver {
    pub fn new(source: UniverseSource, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub async fn resolve(&self) -> Result<Vec<Ticker>, PipelineError> {
        let tickers = match &self.source {
            UniverseSource::Embedded => load_embedded_universe()?,
            UniverseSource::File { path } => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    PipelineError::Configuration(format!(
                        "cannot read universe file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                parse_universe(&content)?
            }
            UniverseSource::Static { symbols } => build_universe(symbols)?,
            UniverseSource::Wikipedia { url } => {
                let html = self.fetch_page(url).await?;
                build_universe(parse_constituents_table(&html)?)?
            }
        };
        tracing::info!(count = tickers.len(), "resolved universe");
        Ok(tickers)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, PipelineError> {
        let http = reqwest::Client::builder()
            .user_agent(get_user_agent())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("http client: {}", e)))?;

        let result = with_retry(&self.retry, "universe page fetch", || {
            let http = &http;
            async move {
                let resp = http
                    .get(url)
                    .header("accept", "text/html,application/xhtml+xml")
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(PageError::Status(resp.status()));
                }
                Ok(resp.text().await?)
            }
        })
        .await;

        result.map_err(|e| {
            if e.is_transient() {
                PipelineError::TransientIo {
                    operation: format!("fetch universe from {}", url),
                    attempts: self.retry.max_attempts(),
                    source: Box::new(e),
                }
            } else {
                PipelineError::Configuration(format!("cannot fetch universe from {}: {}", url, e))
            }
        })
    }
}

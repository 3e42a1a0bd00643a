//! Error taxonomy of the pipeline.
//!
//! Per-ticker and per-row failures ([`SymbolFetchError`],
//! [`RowValidationError`]) are absorbed at the stage boundary and only
//! surface as counts and log lines. Everything in [`PipelineError`] aborts
//! the run.

use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;

use crate::schema::SchemaMismatch;
use crate::staging::{StagingError, StagingHandle};
use crate::types::Ticker;
use crate::warehouse::WarehouseError;

/// Fatal errors that abort a run or a stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Universe, window, schema, or connection settings are unusable.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Not a single ticker produced usable rows.
    #[error("no data available: none of {attempted} tickers produced rows")]
    NoDataAvailable { attempted: usize },
    /// Dataset columns do not match the target table; nothing was written.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),
    /// A transient I/O failure persisted through every retry.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    TransientIo {
        operation: String,
        attempts: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The load stage failed; carries what an operator needs to replay it.
    #[error("load of {handle} into {table} failed ({rows} rows attempted): {source}")]
    LoadFailed {
        handle: StagingHandle,
        table: String,
        rows: usize,
        #[source]
        source: Box<PipelineError>,
    },
    /// No artifact is staged under the handle given to a later stage.
    #[error("staged artifact {key} not found")]
    MissingArtifact { key: String },
    /// A staged artifact exists but cannot be decoded.
    #[error("corrupt staging artifact {key}: {reason}")]
    CorruptArtifact { key: String, reason: String },
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single ticker could not be fetched. Never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SymbolFetchError {
    #[error("symbol not found or delisted")]
    NotFound,
    #[error("empty response for requested range")]
    Empty,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not attempted: circuit breaker open")]
    CircuitOpen,
}

impl From<marketdata_api::Error> for SymbolFetchError {
    fn from(e: marketdata_api::Error) -> Self {
        match e {
            marketdata_api::Error::NotFound { .. } => Self::NotFound,
            marketdata_api::Error::InvalidResponse(msg) => Self::InvalidResponse(msg),
            other => Self::Network(other.to_string()),
        }
    }
}

/// What is wrong with a rejected row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowDefect {
    MissingField(&'static str),
    NonFinite(&'static str),
    NegativePrice(&'static str),
    NegativeVolume(i64),
    HighBelowRange { high: f64, max: f64 },
    DuplicateDate,
}

impl fmt::Display for RowDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing {}", field),
            Self::NonFinite(field) => write!(f, "non-finite {}", field),
            Self::NegativePrice(field) => write!(f, "negative {}", field),
            Self::NegativeVolume(v) => write!(f, "negative volume {}", v),
            Self::HighBelowRange { high, max } => {
                write!(f, "high {} below max(open, close, low) {}", high, max)
            }
            Self::DuplicateDate => write!(f, "duplicate date"),
        }
    }
}

/// A single rejected row, identified by ticker and date.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{ticker} {date}: {defect}")]
pub struct RowValidationError {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub defect: RowDefect,
}

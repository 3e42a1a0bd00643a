//! Error types for the chart API client.

/// Errors that can occur when making chart API requests.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An HTTP request failed (network error, timeout, or unreadable body).
    #[error("Request failed")]
    RequestFailed,
    /// The API returned a non-success status with a body snippet.
    #[error("Request failed with status {status}")]
    HttpStatus { status: u16, body: String },
    /// The API does not know the symbol (delisted, renamed, or mistyped).
    #[error("Symbol not found: {symbol}")]
    NotFound { symbol: String },
    /// The response parsed as JSON but did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Rate limiting (429), server errors and transport failures are
    /// transient; unknown symbols and malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RequestFailed => true,
            Error::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Error::NotFound { .. } | Error::InvalidResponse(_) => false,
        }
    }
}

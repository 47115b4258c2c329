use std::time::Duration;

/// Failure of a single page request.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// Network or HTTP-level failure. `status` is absent when no response
    /// arrived (connection reset, DNS, timeout).
    #[error(
        "transport error{}: {message}",
        .status.map(|s| format!(" (status {s})")).unwrap_or_default()
    )]
    Transport {
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: String,
    },
    /// The service answered with an `errors` list instead of data.
    #[error(
        "service returned errors: {}",
        .messages.iter().map(|m| m.to_string()).collect::<Vec<_>>().join("; ")
    )]
    Protocol { messages: Vec<serde_json::Value> },
    /// A successful response whose body is not a page envelope.
    #[error("malformed response body: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Transport {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Transport { status: Some(429), .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::transport(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a harvest run stopped before reaching the end of the catalog.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] FetchError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("page {page} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        page: u32,
        attempts: u32,
        #[source]
        last: FetchError,
    },
}

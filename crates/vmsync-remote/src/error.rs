use chrono::{DateTime, Utc};

/// Errors from the remote metering API.
///
/// The pipeline branches on these: `RateLimited` aborts the whole pass,
/// `NotFound` means "already gone" for deletes and "pause and restart"
/// anywhere else, `Conflict` carries the remote ID of the record that
/// already exists.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// 429 from the API. `reset_at` is the advertised reset instant, when
    /// the API sent one.
    #[error("rate limited by remote API")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// 404 from the API.
    #[error("remote record not found")]
    NotFound,

    /// 409: the record already exists remotely.
    #[error("remote record conflict, existing id {remote_id:?}")]
    Conflict { remote_id: Option<String> },

    /// 401 after a token refresh was already attempted.
    #[error("remote API authentication failed")]
    Unauthorized,

    /// Any other non-2xx status.
    #[error("remote API error: status={status}, body={body}")]
    Api { status: u16, body: String },

    /// Transport-level failure from `reqwest`, including timeouts.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization or deserialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RemoteError {
    /// Timeouts are retried once in place; everything else propagates.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Network(e) if e.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

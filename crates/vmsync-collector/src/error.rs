/// Errors from the collector boundary.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Non-2xx status from the collector API.
    #[error("collector API HTTP error: status={status}, body={body}")]
    Http { status: u16, body: String },

    /// An underlying HTTP transport error from `reqwest`.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization or deserialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The collector answered but the payload is missing a required field.
    #[error("malformed collector payload: missing {0}")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, CollectorError>;

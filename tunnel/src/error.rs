use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid API key: the relay rejected the credential")]
    InvalidCredential,
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay handshake failed: {0}")]
    Handshake(#[source] Box<tungstenite::Error>),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write to relay: {0}")]
    Write(#[source] Box<tungstenite::Error>),
    #[error("relay connection is closed")]
    Closed,
    #[error("relay connection lost: {0}")]
    Lost(String),
    #[error("events file watch failed: {0:#}")]
    Tail(anyhow::Error),
}

/// A tail-file line that could not be turned into records.
#[derive(Debug, thiserror::Error)]
pub enum LineDecodeError {
    #[error("line is neither a JSON object nor a JSON array")]
    UnrecognizedShape,
    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

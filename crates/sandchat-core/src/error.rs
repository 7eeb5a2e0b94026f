//! Error types for the chat core.

/// Reasons a submission is not started.
///
/// `MissingCredential` and `EmptyInput` are silent no-ops for the UI; `Busy`
/// means a turn is already streaming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("no API key configured")]
    MissingCredential,

    #[error("message is empty")]
    EmptyInput,

    #[error("a response is already streaming")]
    Busy,
}

/// The response stream produced data that cannot be merged.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid UTF-8 in stream: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid JSON in stream record: {reason}")]
    InvalidRecord { reason: String },

    #[error("invalid arguments for function `{name}`: {reason}")]
    InvalidArguments { name: String, reason: String },
}

/// The chat completions request failed.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Transcript persistence failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transcript io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcript json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unified error type for a chat turn.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StationError {
    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("weather request failed with HTTP status {status}")]
    FetchFailed { status: u16 },

    #[error("malformed weather response: {0}")]
    MalformedResponse(String),

    #[error("telemetry publish failed: {0}")]
    PublishFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

impl From<serde_json::Error> for StationError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StationError>;

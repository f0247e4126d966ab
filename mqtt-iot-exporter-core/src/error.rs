use thiserror::Error;

/// Errors raised while turning an inbound message into a registry mutation.
///
/// These are all recoverable: the dispatcher reports them back to the device
/// and keeps going.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown metric, please use /define first: {0}")]
    UnknownMetric(String),

    #[error("unknown metric type: {0}")]
    UnknownMetricType(String),
}

/// Common error type for the shared configuration and logging helpers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the helpers' [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

use std::sync::Arc;

/// Result type used throughout the SDK, with [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Split SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The factory was built with an empty or malformed SDK key.
    #[error("an sdk_key must be provided")]
    InvalidSdkKey,

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// The backend rejected a request with a client error. Not retried until
    /// the next sync cycle.
    #[error("request rejected by the backend with status {0}")]
    RequestRejected(u16),

    /// Streaming authentication returned a non-recoverable outcome.
    #[error("streaming authentication failed")]
    PushAuthFailed,

    /// A streaming token could not be parsed.
    #[error("malformed streaming token")]
    MalformedToken,

    /// The readiness deadline elapsed before the first sync completed.
    #[error("the SDK was not ready within the allotted time")]
    ReadyTimeout,

    /// The factory has been destroyed and can no longer be used.
    #[error("the factory has been destroyed")]
    Destroyed,

    /// A localhost flag file could not be read or parsed.
    #[error("unable to load localhost flag file: {0}")]
    LocalhostFile(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A response body could not be decoded.
    #[error("malformed response body")]
    MalformedResponse(#[source] Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedResponse(Arc::new(value))
    }
}

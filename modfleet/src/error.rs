//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of a failed platform call.
///
/// The category decides which retry counter an error is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Connection refused/reset, DNS failure, body decode failure.
    Network,
    /// The request did not complete in time.
    Timeout,
    /// The platform rejected the request because the quota is exhausted.
    RateLimited,
    /// A non-success HTTP status.
    Status(u16),
    /// Anything else (unexpected payloads, client-side bugs).
    Other,
}

/// Error returned by a [`PlatformClient`](crate::client::PlatformClient).
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

/// HTTP statuses the platform returns during short-lived blips.
const TRANSIENT_STATUSES: &[u16] = &[401, 500, 502, 503, 504, 522];

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network, message)
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Status(code), message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::RateLimited, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Other, message)
    }

    /// Whether this error is a request-level blip worth retrying generously.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ApiErrorKind::Network | ApiErrorKind::Timeout | ApiErrorKind::RateLimited => true,
            ApiErrorKind::Status(code) => TRANSIENT_STATUSES.contains(&code),
            ApiErrorKind::Other => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::RateLimited | ApiErrorKind::Status(429)
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::new(ApiErrorKind::Timeout, err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 => Self::rate_limited(err.to_string()),
            Some(status) => Self::status(status.as_u16(), err.to_string()),
            None if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() => {
                Self::network(err.to_string())
            }
            None => Self::other(err.to_string()),
        }
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

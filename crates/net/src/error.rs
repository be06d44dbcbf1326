use http::StatusCode;
use thiserror::Error;

use jobforge_timeout::BoundedError;

#[derive(Debug, Error)]
pub enum NetError {
    /// The pool was closed, usually by a timed-out caller's cancellation.
    #[error("connection pool is closed")]
    PoolClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed http exchange: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("rpc fault {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bounded(#[from] BoundedError),
}

impl NetError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Bounded(inner) if inner.is_timeout())
    }
}

impl From<url::ParseError> for NetError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

//! Error taxonomy shared by the backends and the sync loop.
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::transform::ValidationError;

/// A backend stayed unreachable for the whole retry budget.
#[derive(Debug, Error)]
#[error("{backend} unreachable after {attempts} attempt(s): {message}")]
pub struct ConnectError {
    pub backend: &'static str,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("source query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("source row is not a JSON object: {0}")]
    Row(String),
    #[error("failed to load query set {path}: {source}")]
    QuerySet {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Whole-request failure of a bulk upsert. Per-document rejections are acks.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("index responded {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected bulk response: {0}")]
    Response(String),
}

impl IndexError {
    /// Transport failures, throttling and server-side errors may clear up on
    /// their own; anything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Http(err) => !err.is_builder() && !err.is_decode(),
            IndexError::Status { status, .. } => *status == 429 || *status >= 500,
            IndexError::Response(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("state record {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

impl StateError {
    pub fn is_transient(&self) -> bool {
        match self {
            StateError::Redis(err) => err.is_io_error() || err.is_connection_dropped() || err.is_timeout(),
            StateError::Malformed { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Failures that end the process instead of the current cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Config(_))
    }
}

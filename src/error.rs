//! Error types for sync operations.

use std::io;
use thiserror::Error;

/// Errors raised by a [`BlobStore`](crate::store::BlobStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("object not found: {bucket}:{key}")]
    NotFound { bucket: String, key: String },

    /// Connection-level failure (handshake, reset, truncated body, timeout).
    ///
    /// This is the only kind the transfer retry wrapper treats as transient.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("request failed with HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// I/O error inside the store implementation.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether a single retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }

    /// Whether this error means the object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_body() || e.is_request() {
            StoreError::Transport(e.to_string())
        } else {
            StoreError::Status {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Errors that can occur during a sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Bad location pairing, missing credentials or invalid options.
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote side of a download carries no metadata file.
    #[error(
        "remote {bucket}:{prefix} has no .s3-meta-sync file; refusing to sync it over a local directory"
    )]
    RemoteWithoutMetadata { bucket: String, prefix: String },

    /// A single upload or download failed after its retry budget was spent.
    #[error("transfer of {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: StoreError,
    },

    /// Transferred bytes do not hash to the checksum recorded in the snapshot.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The metadata file could not be interpreted.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A path that cannot be expressed as a relative, forward-slash path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Blob store failure outside of a file transfer.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O error during local file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// YAML serialization/deserialization error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// A worker task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Process exit code for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => 2,
            SyncError::RemoteWithoutMetadata { .. } => 3,
            SyncError::Transfer { .. } | SyncError::ChecksumMismatch { .. } => 4,
            _ => 1,
        }
    }
}

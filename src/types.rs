//! Data structures shared by the sync stages.

use crate::error::SyncError;

/// Name of the metadata file stored at the root of both trees.
pub const META_FILE: &str = ".s3-meta-sync";

/// Which way content flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local tree is the source, remote prefix the destination.
    Upload,
    /// Remote prefix is the source, local tree the destination.
    Download,
}

impl Direction {
    /// Verb used in log lines and the summary.
    pub fn verb(&self) -> &'static str {
        match self {
            Direction::Upload => "Uploading",
            Direction::Download => "Downloading",
        }
    }
}

/// Configuration for a sync run.
///
/// # Example
///
/// ```
/// use s3_meta_sync::SyncConfig;
///
/// let config = SyncConfig {
///     parallel: 16,
///     verbose: true,
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of concurrent uploads/downloads (default: 8).
    ///
    /// Transfers are I/O-bound, so this is limited by bandwidth and the
    /// store's request rate rather than CPU cores.
    pub parallel: usize,
    /// Log every individual transfer and deletion.
    pub verbose: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel: 8,
            verbose: false,
        }
    }
}

impl SyncConfig {
    /// Rejects values that cannot drive a sync.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.parallel == 0 {
            return Err(SyncError::Config(
                "parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counts reported after a successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub direction: Direction,
    /// Files uploaded or downloaded, not counting the metadata file.
    pub transferred: usize,
    /// Files deleted at the destination.
    pub deleted: usize,
    /// Local directories removed because they became empty.
    pub pruned: usize,
    /// Whether the destination metadata file was (re)written.
    pub metadata_written: bool,
}

impl std::fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} Deleting: {}",
            self.direction.verb(),
            self.transferred,
            self.deleted
        )
    }
}

//! Parsing of `path` and `bucket:prefix` location specs.

use crate::error::SyncError;
use crate::types::{Direction, META_FILE};
use std::path::PathBuf;

/// A bucket plus key prefix. An empty prefix denotes the bucket root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub bucket: String,
    pub prefix: String,
}

impl RemoteLocation {
    /// Object key for a relative path below this prefix.
    pub fn key(&self, relative_path: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            relative_path.to_string()
        } else {
            format!("{}/{}", prefix, relative_path)
        }
    }

    /// Object key of the metadata file.
    pub fn meta_key(&self) -> String {
        self.key(META_FILE)
    }
}

impl std::fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.bucket, self.prefix)
    }
}

/// One side of a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote(RemoteLocation),
}

impl Location {
    /// Parses a location spec.
    ///
    /// `bucket:prefix` is remote when the part before the first `:` could be
    /// a bucket name. A path separator there, or a single drive letter as in
    /// `C:\data`, makes the whole spec a local path; `./backup:2024` is local.
    pub fn parse(spec: &str) -> Result<Self, SyncError> {
        match spec.split_once(':').filter(|(bucket, _)| looks_like_bucket(bucket)) {
            Some((bucket, prefix)) => {
                if bucket.is_empty() {
                    return Err(SyncError::Config(format!(
                        "missing bucket name in '{}'",
                        spec
                    )));
                }
                Ok(Location::Remote(RemoteLocation {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                }))
            }
            None => {
                if spec.is_empty() {
                    return Err(SyncError::Config("empty local path".to_string()));
                }
                Ok(Location::Local(PathBuf::from(spec)))
            }
        }
    }
}

fn looks_like_bucket(candidate: &str) -> bool {
    candidate.len() != 1 && !candidate.contains(['/', '\\'])
}

/// A validated pairing of exactly one local and one remote location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPair {
    pub direction: Direction,
    pub local: PathBuf,
    pub remote: RemoteLocation,
}

impl SyncPair {
    /// Parses both specs and checks that one is local and one remote.
    pub fn parse(source: &str, destination: &str) -> Result<Self, SyncError> {
        match (Location::parse(source)?, Location::parse(destination)?) {
            (Location::Local(local), Location::Remote(remote)) => Ok(Self {
                direction: Direction::Upload,
                local,
                remote,
            }),
            (Location::Remote(remote), Location::Local(local)) => Ok(Self {
                direction: Direction::Download,
                local,
                remote,
            }),
            (Location::Local(_), Location::Local(_)) => Err(SyncError::Config(
                "one of source or destination must be a bucket:prefix, got two local paths"
                    .to_string(),
            )),
            (Location::Remote(_), Location::Remote(_)) => Err(SyncError::Config(
                "one of source or destination must be a local path, got two remotes".to_string(),
            )),
        }
    }
}

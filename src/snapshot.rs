//! Metadata snapshots: relative path to MD5 checksum for a tree.

use crate::error::SyncError;
use crate::location::RemoteLocation;
use crate::store::BlobStore;
use crate::types::META_FILE;
use crate::verify::compute_file_md5;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Checksums of every regular file under a tree root, keyed by relative
/// forward-slash path. The metadata file itself is never an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    files: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from `(path, checksum)` pairs after validating paths.
    pub fn from_entries<I, P, C>(entries: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut files = BTreeMap::new();
        for (path, checksum) in entries {
            let path = path.into();
            validate_relative_path(&path)?;
            if path != META_FILE {
                files.insert(path, checksum.into());
            }
        }
        Ok(Self { files })
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Serializes to the metadata file format: a flat YAML mapping.
    pub fn to_yaml(&self) -> Result<String, SyncError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parses the metadata file format.
    ///
    /// Scalars are accepted in any YAML form, so a numeric file name
    /// still reads back as a string. An empty document is an empty snapshot.
    pub fn from_yaml(text: &str) -> Result<Self, SyncError> {
        let document: Option<BTreeMap<ScalarText, ScalarText>> = if text.trim().is_empty() {
            None
        } else {
            serde_yaml::from_str(text).map_err(|e| SyncError::InvalidMetadata(e.to_string()))?
        };
        Self::from_entries(
            document
                .unwrap_or_default()
                .into_iter()
                .map(|(path, checksum)| (path.0, checksum.0)),
        )
    }
}

/// A YAML scalar read back as its text.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ScalarText(String);

impl<'de> Deserialize<'de> for ScalarText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl Visitor<'_> for ScalarVisitor {
            type Value = ScalarText;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a path or checksum scalar")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ScalarText, E> {
                Ok(ScalarText(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<ScalarText, E> {
                Ok(ScalarText(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ScalarText, E> {
                Ok(ScalarText(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ScalarText, E> {
                Ok(ScalarText(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<ScalarText, E> {
                Ok(ScalarText(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<ScalarText, E> {
                Ok(ScalarText(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// Rejects paths that could resolve outside the tree root.
fn validate_relative_path(path: &str) -> Result<(), SyncError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(SyncError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Walks `root` and checksums every regular file except the metadata file.
///
/// A missing root yields an empty snapshot. File bytes are hashed raw,
/// on a blocking thread.
pub async fn local_snapshot(root: &Path) -> Result<Snapshot, SyncError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_tree(&root))
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}

fn walk_tree(root: &Path) -> Result<Snapshot, SyncError> {
    if !root.exists() {
        return Ok(Snapshot::new());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            SyncError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relative_path(root, entry.path())?;
        if relative == META_FILE {
            continue;
        }
        let checksum = compute_file_md5(entry.path())?;
        debug!("{} {}", checksum, relative);
        entries.push((relative, checksum));
    }
    Snapshot::from_entries(entries)
}

fn relative_path(root: &Path, path: &Path) -> Result<String, SyncError> {
    let stripped = path
        .strip_prefix(root)
        .map_err(|_| SyncError::InvalidPath(path.display().to_string()))?;
    let parts = stripped
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| SyncError::InvalidPath(path.display().to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}

/// Path of the metadata file inside a local tree.
pub fn local_meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

/// Reads the metadata file recorded in a local tree, if any.
pub async fn read_local_meta(root: &Path) -> Result<Option<Snapshot>, SyncError> {
    match tokio::fs::read(local_meta_path(root)).await {
        Ok(bytes) => Ok(Some(Snapshot::from_yaml(&String::from_utf8_lossy(&bytes))?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes `snapshot` as the metadata file of a local tree.
pub async fn write_local_meta(root: &Path, snapshot: &Snapshot) -> Result<(), SyncError> {
    tokio::fs::create_dir_all(root).await?;
    tokio::fs::write(local_meta_path(root), snapshot.to_yaml()?).await?;
    Ok(())
}

/// Fetches and parses the remote metadata file.
///
/// Returns `None` when the object does not exist. That is deliberately not
/// an empty snapshot: an empty remote and an untracked remote mean
/// different things to the planner.
pub async fn remote_snapshot(
    store: &dyn BlobStore,
    remote: &RemoteLocation,
) -> Result<Option<Snapshot>, SyncError> {
    let key = remote.meta_key();
    info!("Retrieving metadata from {}:{}", remote.bucket, key);
    match store.get(&remote.bucket, &key).await {
        Ok(bytes) => Ok(Some(Snapshot::from_yaml(&String::from_utf8_lossy(&bytes))?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

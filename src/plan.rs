//! Diffing two snapshots into a [`SyncPlan`].

use crate::error::SyncError;
use crate::location::RemoteLocation;
use crate::snapshot::Snapshot;
use crate::types::{Direction, META_FILE};
use std::collections::BTreeSet;

/// Work needed to make a destination match its source.
///
/// Only one of `to_upload`/`to_download` is populated, depending on
/// `direction`. When any file changes, [`META_FILE`] is part of that set;
/// it is written last, by the orchestrator, not by the file transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub direction: Direction,
    pub to_upload: BTreeSet<String>,
    pub to_download: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
    /// Local directories left empty by the deletions, relative to the root.
    pub dirs_to_remove: BTreeSet<String>,
}

impl SyncPlan {
    fn empty(direction: Direction) -> Self {
        Self {
            direction,
            to_upload: BTreeSet::new(),
            to_download: BTreeSet::new(),
            to_delete: BTreeSet::new(),
            dirs_to_remove: BTreeSet::new(),
        }
    }

    /// The upload or download set, whichever applies.
    pub fn transfers(&self) -> &BTreeSet<String> {
        match self.direction {
            Direction::Upload => &self.to_upload,
            Direction::Download => &self.to_download,
        }
    }

    fn transfers_mut(&mut self) -> &mut BTreeSet<String> {
        match self.direction {
            Direction::Upload => &mut self.to_upload,
            Direction::Download => &mut self.to_download,
        }
    }

    /// Transfers of user files, i.e. everything except the metadata file.
    pub fn file_transfers(&self) -> impl Iterator<Item = &str> {
        self.transfers()
            .iter()
            .map(String::as_str)
            .filter(|p| *p != META_FILE)
    }

    /// Whether the destination metadata file must be rewritten.
    pub fn writes_metadata(&self) -> bool {
        self.transfers().contains(META_FILE)
    }

    /// True when nothing at all is transferred or deleted.
    pub fn is_empty(&self) -> bool {
        self.transfers().is_empty() && self.to_delete.is_empty() && self.dirs_to_remove.is_empty()
    }
}

/// Computes the plan for one sync.
///
/// * `source` - Snapshot of the side being copied from. For a download this
///   is the remote metadata, `None` when the remote has none.
/// * `destination` - Snapshot of what the destination currently holds.
/// * `recorded` - The metadata file currently stored at the destination.
///
/// A download from a remote without metadata fails with
/// [`SyncError::RemoteWithoutMetadata`]: treating it as empty would delete
/// the whole local tree. For an upload, a missing source cannot happen and a
/// missing `recorded` is an ordinary first upload.
///
/// Files are compared by checksum only.
pub fn plan(
    direction: Direction,
    source: Option<&Snapshot>,
    destination: &Snapshot,
    recorded: Option<&Snapshot>,
    remote: &RemoteLocation,
) -> Result<SyncPlan, SyncError> {
    let source = source.ok_or_else(|| SyncError::RemoteWithoutMetadata {
        bucket: remote.bucket.clone(),
        prefix: remote.prefix.clone(),
    })?;

    let mut plan = SyncPlan::empty(direction);

    for (path, checksum) in source.iter() {
        if destination.get(path) != Some(checksum) {
            plan.transfers_mut().insert(path.to_string());
        }
    }
    plan.to_delete = destination
        .paths()
        .filter(|p| !source.contains(p))
        .map(str::to_string)
        .collect();

    let files_changed = !plan.transfers().is_empty() || !plan.to_delete.is_empty();
    if files_changed || recorded != Some(source) {
        plan.transfers_mut().insert(META_FILE.to_string());
    }

    if direction == Direction::Download {
        plan.dirs_to_remove = emptied_dirs(source, &plan.to_delete);
    }

    Ok(plan)
}

/// Parent directories (`a`, `a/b` for `a/b/c`) of a relative path.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// Directories holding deleted files that hold no file of the final tree.
fn emptied_dirs(source: &Snapshot, deleted: &BTreeSet<String>) -> BTreeSet<String> {
    let surviving: BTreeSet<&str> = source.paths().flat_map(ancestors).collect();
    deleted
        .iter()
        .flat_map(|p| ancestors(p))
        .filter(|dir| !surviving.contains(dir))
        .map(str::to_string)
        .collect()
}

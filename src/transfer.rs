//! Executing a [`SyncPlan`] against the local tree and the blob store.

use crate::error::{StoreError, SyncError};
use crate::location::{RemoteLocation, SyncPair};
use crate::plan::SyncPlan;
use crate::snapshot::Snapshot;
use crate::store::BlobStore;
use crate::types::{Direction, SyncConfig};
use crate::verify::verify_bytes;
use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// What an execution actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub transferred: usize,
    pub deleted: usize,
    pub pruned: usize,
}

/// Carries out the file-level part of a plan.
///
/// Implementations must not touch the metadata file: the orchestrator writes
/// it once everything here has succeeded.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        pair: &SyncPair,
        plan: &SyncPlan,
        source: &Snapshot,
    ) -> Result<ExecutionReport, SyncError>;
}

/// Runs `op`, retrying exactly once, without delay, when it fails with a
/// transient transport error. Any other failure, or a second transient one,
/// becomes [`SyncError::Transfer`] carrying the store error unchanged.
pub async fn with_transient_retry<T, F, Fut>(path: &str, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let retry_strategy = FixedInterval::from_millis(0).take(1);

    Retry::spawn(retry_strategy, || {
        let attempt = op();
        async move {
            match attempt.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() => {
                    warn!("Transfer of {} failed due to error: {}", path, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        }
    })
    .await
    .map_err(|source| SyncError::Transfer {
        path: path.to_string(),
        source,
    })
}

/// Default [`Executor`]: bounded-parallel transfers over a [`BlobStore`].
///
/// Order of work: file deletions, then pruning of emptied local
/// directories, then uploads/downloads. Deleting first lets a path switch
/// between file and directory; pruning only ever follows the deletions.
pub struct TransferExecutor {
    store: Arc<dyn BlobStore>,
    config: SyncConfig,
}

impl TransferExecutor {
    pub fn new(store: Arc<dyn BlobStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    fn progress_bar(&self, len: usize) -> indicatif::ProgressBar {
        if self.config.verbose || !atty::is(atty::Stream::Stderr) {
            return indicatif::ProgressBar::hidden();
        }
        let pb = indicatif::ProgressBar::new(len as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
        {
            pb.set_style(style.progress_chars("█▓▒░ "));
        }
        pb
    }

    async fn delete_all(&self, pair: &SyncPair, paths: Vec<String>) -> Result<usize, SyncError> {
        let deleted = stream::iter(paths)
            .map(|path| async move {
                debug!("Deleting: {}", path);
                match pair.direction {
                    Direction::Upload => {
                        self.store
                            .delete(&pair.remote.bucket, &pair.remote.key(&path))
                            .await?;
                    }
                    Direction::Download => remove_local_file(&pair.local.join(&path)).await?,
                }
                Ok::<_, SyncError>(())
            })
            .buffer_unordered(self.config.parallel)
            .try_fold(0usize, |count, ()| async move { Ok(count + 1) })
            .await?;
        Ok(deleted)
    }

    async fn transfer_all(
        &self,
        pair: &SyncPair,
        paths: Vec<String>,
        source: &Snapshot,
    ) -> Result<usize, SyncError> {
        let pb = self.progress_bar(paths.len());
        pb.set_message(format!("| {} {} files", pair.direction.verb(), paths.len()));

        let semaphore = Arc::new(Semaphore::new(self.config.parallel));
        let mut tasks: Vec<JoinHandle<Result<(), SyncError>>> = Vec::with_capacity(paths.len());

        for path in paths {
            let checksum = source
                .get(&path)
                .ok_or_else(|| SyncError::InvalidPath(format!("{} is not in the source", path)))?
                .to_string();
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let remote = pair.remote.clone();
            let local = pair.local.clone();
            let direction = pair.direction;
            let pb_clone = pb.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))?;
                debug!("{}: {}", direction.verb(), path);
                pb_clone.set_message(format!("| {}", path));

                let job = FileJob {
                    store: store.as_ref(),
                    remote: &remote,
                    local: &local,
                    path: &path,
                    checksum: &checksum,
                };
                match direction {
                    Direction::Upload => job.upload().await?,
                    Direction::Download => job.download().await?,
                }
                pb_clone.inc(1);
                Ok(())
            }));
        }

        let total = tasks.len();
        let mut pending = tasks.into_iter();
        while let Some(task) = pending.next() {
            let failure = match task.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => SyncError::Task(e.to_string()),
            };
            error!("Transfer task failed: {}", failure);
            pending.by_ref().for_each(|task| task.abort());
            pb.finish_with_message("❌ Transfer failed!");
            return Err(failure);
        }

        pb.finish_and_clear();
        Ok(total)
    }
}

#[async_trait]
impl Executor for TransferExecutor {
    async fn execute(
        &self,
        pair: &SyncPair,
        plan: &SyncPlan,
        source: &Snapshot,
    ) -> Result<ExecutionReport, SyncError> {
        let deleted = self
            .delete_all(pair, plan.to_delete.iter().cloned().collect())
            .await?;

        let pruned = if pair.direction == Direction::Download {
            prune_empty_dirs(&pair.local, &plan.dirs_to_remove).await?
        } else {
            0
        };

        let paths: Vec<String> = plan.file_transfers().map(str::to_string).collect();
        let transferred = self.transfer_all(pair, paths, source).await?;

        info!(
            "{} {} files, deleted {}, pruned {} directories",
            pair.direction.verb(),
            transferred,
            deleted,
            pruned
        );
        Ok(ExecutionReport {
            transferred,
            deleted,
            pruned,
        })
    }
}

/// One file moving in one direction.
struct FileJob<'a> {
    store: &'a dyn BlobStore,
    remote: &'a RemoteLocation,
    local: &'a Path,
    path: &'a str,
    checksum: &'a str,
}

impl FileJob<'_> {
    async fn upload(&self) -> Result<(), SyncError> {
        let body = tokio::fs::read(self.local.join(self.path)).await?;
        // Catches a file edited between the snapshot and the upload.
        verify_bytes(self.path, &body, self.checksum)?;

        let key = self.remote.key(self.path);
        with_transient_retry(self.path, || {
            self.store.put(&self.remote.bucket, &key, body.clone())
        })
        .await
    }

    async fn download(&self) -> Result<(), SyncError> {
        let key = self.remote.key(self.path);
        let body = with_transient_retry(self.path, || self.store.get(&self.remote.bucket, &key))
            .await?;
        verify_bytes(self.path, &body, self.checksum)?;

        let target = self.local.join(self.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &body).await?;
        Ok(())
    }
}

async fn remove_local_file(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes the given directories under `root`, deepest first, together with
/// any empty directories nested inside them. Directories that are already
/// gone are skipped; ones still holding an untracked file are kept.
pub(crate) async fn prune_empty_dirs(
    root: &Path,
    dirs: &BTreeSet<String>,
) -> Result<usize, SyncError> {
    let mut ordered: Vec<&String> = dirs.iter().collect();
    ordered.sort_by(|a, b| {
        b.matches('/')
            .count()
            .cmp(&a.matches('/').count())
            .then_with(|| b.cmp(a))
    });
    let ordered: Vec<PathBuf> = ordered.into_iter().map(|dir| root.join(dir)).collect();

    tokio::task::spawn_blocking(move || {
        ordered
            .iter()
            .map(|dir| remove_empty_tree(dir))
            .sum::<usize>()
    })
    .await
    .map_err(|e| SyncError::Task(e.to_string()))
}

/// Removes `dir` and every empty directory below it, children before parents.
fn remove_empty_tree(dir: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(dir).follow_links(false).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error().map(|io| io.kind()) != Some(std::io::ErrorKind::NotFound) {
                    warn!("Cannot scan {}: {}", dir.display(), e);
                }
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        match std::fs::remove_dir(entry.path()) {
            Ok(()) => {
                debug!("Removed empty directory: {}", entry.path().display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Keeping directory {}: {}", entry.path().display(), e),
        }
    }
    removed
}

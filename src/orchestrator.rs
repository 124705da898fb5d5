//! Main orchestration logic for a sync run.

use crate::error::SyncError;
use crate::location::SyncPair;
use crate::plan::{plan, SyncPlan};
use crate::snapshot::{
    local_snapshot, read_local_meta, remote_snapshot, write_local_meta, Snapshot,
};
use crate::store::BlobStore;
use crate::transfer::{with_transient_retry, Executor, TransferExecutor};
use crate::types::{Direction, SyncConfig, SyncSummary, META_FILE};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Syncs `source` to `destination`, one of which must be `bucket:prefix`.
///
/// This is the main entry point. It performs the following steps:
///
/// 1. Parses both location specs and checks the pairing
/// 2. Builds the source and destination snapshots
/// 3. Diffs them into a plan
/// 4. Deletes, prunes and transfers files
/// 5. Writes the destination metadata file, only if all of the above succeeded
///
/// # Example
///
/// ```no_run
/// use s3_meta_sync::{sync, MemoryStore, SyncConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryStore::new());
/// let summary = sync("site", "my-bucket:site", store, &SyncConfig::default()).await?;
/// println!("{}", summary);
/// # Ok(())
/// # }
/// ```
pub async fn sync(
    source: &str,
    destination: &str,
    store: Arc<dyn BlobStore>,
    config: &SyncConfig,
) -> Result<SyncSummary, SyncError> {
    let pair = SyncPair::parse(source, destination)?;
    let executor = TransferExecutor::new(Arc::clone(&store), config.clone());
    sync_pair(&pair, store.as_ref(), &executor, config).await
}

/// Runs a sync for an already validated pair with an explicit executor.
pub async fn sync_pair(
    pair: &SyncPair,
    store: &dyn BlobStore,
    executor: &dyn Executor,
    config: &SyncConfig,
) -> Result<SyncSummary, SyncError> {
    config.validate()?;
    let started = Instant::now();
    info!(
        "{} {} {} {}",
        pair.direction.verb(),
        pair.local.display(),
        match pair.direction {
            Direction::Upload => "to",
            Direction::Download => "from",
        },
        pair.remote
    );

    let (source, plan) = match pair.direction {
        Direction::Upload => plan_upload(pair, store).await?,
        Direction::Download => plan_download(pair, store).await?,
    };

    if plan.is_empty() {
        info!("Nothing changed");
    }

    let report = executor.execute(pair, &plan, &source).await?;

    if plan.writes_metadata() {
        match pair.direction {
            Direction::Upload => {
                let body = source.to_yaml()?.into_bytes();
                let key = pair.remote.meta_key();
                with_transient_retry(META_FILE, || {
                    store.put(&pair.remote.bucket, &key, body.clone())
                })
                .await?;
            }
            Direction::Download => write_local_meta(&pair.local, &source).await?,
        }
        info!("Updated {}", META_FILE);
    }

    // The source tree of an upload records what it just pushed as well.
    if pair.direction == Direction::Upload
        && recorded_local_meta(&pair.local).await?.as_ref() != Some(&source)
    {
        write_local_meta(&pair.local, &source).await?;
    }

    info!(
        "Finished in {}",
        humantime::format_duration(std::time::Duration::from_millis(
            started.elapsed().as_millis() as u64
        ))
    );

    Ok(SyncSummary {
        direction: pair.direction,
        transferred: report.transferred,
        deleted: report.deleted,
        pruned: report.pruned,
        metadata_written: plan.writes_metadata(),
    })
}

async fn plan_upload(
    pair: &SyncPair,
    store: &dyn BlobStore,
) -> Result<(Snapshot, SyncPlan), SyncError> {
    if !pair.local.is_dir() {
        return Err(SyncError::Config(format!(
            "source directory {} does not exist",
            pair.local.display()
        )));
    }

    let local = local_snapshot(&pair.local).await?;
    let recorded = remote_snapshot(store, &pair.remote).await?;

    if recorded.is_none() {
        let prefix = if pair.remote.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", pair.remote.prefix)
        };
        let untracked = store
            .list(&pair.remote.bucket, &prefix)
            .await?
            .into_iter()
            .filter(|key| !key.ends_with(META_FILE))
            .count();
        if untracked > 0 {
            warn!(
                "Remote has no {} but holds {} objects; they are left untouched",
                META_FILE, untracked
            );
        } else {
            info!("Remote has no {}, uploading everything", META_FILE);
        }
    }

    let destination = recorded.clone().unwrap_or_default();
    let plan = plan(
        Direction::Upload,
        Some(&local),
        &destination,
        recorded.as_ref(),
        &pair.remote,
    )?;
    Ok((local, plan))
}

async fn plan_download(
    pair: &SyncPair,
    store: &dyn BlobStore,
) -> Result<(Snapshot, SyncPlan), SyncError> {
    let remote = remote_snapshot(store, &pair.remote).await?;
    let local = local_snapshot(&pair.local).await?;
    let recorded = recorded_local_meta(&pair.local).await?;

    let plan = plan(
        Direction::Download,
        remote.as_ref(),
        &local,
        recorded.as_ref(),
        &pair.remote,
    )?;
    let source = remote.unwrap_or_default();
    Ok((source, plan))
}

/// The local metadata file only records what the last sync wrote, so an
/// unreadable one is treated as absent and gets rewritten.
async fn recorded_local_meta(root: &Path) -> Result<Option<Snapshot>, SyncError> {
    match read_local_meta(root).await {
        Ok(recorded) => Ok(recorded),
        Err(e @ (SyncError::InvalidMetadata(_) | SyncError::InvalidPath(_))) => {
            warn!("Ignoring unreadable local {}: {}", META_FILE, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

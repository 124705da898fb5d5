//! s3-meta-sync - rsync-style sync between a local directory and an S3 prefix
//!
//! Each side of a sync is described by a snapshot: relative path to MD5
//! checksum. The remote snapshot lives in a `.s3-meta-sync` object next to the
//! synced files, so a run never has to list or hash remote content.
//!
//! # Features
//!
//! - **Checksum Diffing**: Only new or changed files move; no mtime or size shortcuts
//! - **Obsolete-File Removal**: Files gone from the source are deleted at the destination
//! - **Empty-Directory Pruning**: Local directories emptied by a download are removed
//! - **Destructive Guard**: A remote without metadata is never synced over a local tree
//! - **Automatic Retry**: A transient transport failure is retried once per file
//! - **Parallel Transfers**: Uploads/downloads run concurrently up to a bound
//!
//! # Example
//!
//! ```no_run
//! use s3_meta_sync::{sync, S3Config, S3Store, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(S3Store::new(S3Config {
//!     access_key: "AKIA...".to_string(),
//!     secret_key: "...".to_string(),
//!     region: "us-east-1".to_string(),
//!     endpoint: None,
//!     accept_invalid_certs: false,
//!     acl: None,
//! })?);
//!
//! let summary = sync("public", "my-bucket:site", store, &SyncConfig::default()).await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod location;
pub mod orchestrator;
pub mod plan;
pub mod snapshot;
pub mod store;
pub mod transfer;
pub mod types;
pub mod verify;

pub use error::{StoreError, SyncError};
pub use location::{Location, RemoteLocation, SyncPair};
pub use orchestrator::{sync, sync_pair};
pub use plan::{plan, SyncPlan};
pub use snapshot::Snapshot;
pub use store::{BlobStore, MemoryStore, S3Config, S3Store};
pub use transfer::{ExecutionReport, Executor, TransferExecutor};
pub use types::{Direction, SyncConfig, SyncSummary, META_FILE};

use async_trait::async_trait;
use s3_meta_sync::{
    sync, BlobStore, Direction, MemoryStore, Snapshot, StoreError, SyncConfig, SyncError,
    META_FILE,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const BUCKET: &str = "bucket";

fn config() -> SyncConfig {
    SyncConfig {
        parallel: 4,
        verbose: false,
    }
}

fn remote(prefix: &str) -> String {
    format!("{}:{}", BUCKET, prefix)
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Three files across nested directories, one of them binary.
fn create_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("nested/deeper")).unwrap();
    fs::write(root.join("xxx"), b"yyy\n").unwrap();
    fs::write(root.join("nested/a.txt"), b"a").unwrap();
    fs::write(root.join("nested/deeper/b.bin"), vec![0u8, 159, 146, 150, 255]).unwrap();
    dir
}

/// Wraps a store and fails the first few gets or puts of one key with a
/// transport error.
struct FlakyStore {
    inner: MemoryStore,
    key: String,
    get_failures: AtomicUsize,
    put_failures: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl FlakyStore {
    fn failing_gets(inner: MemoryStore, key: &str, failures: usize) -> Self {
        Self::new(inner, key, failures, 0)
    }

    fn failing_puts(inner: MemoryStore, key: &str, failures: usize) -> Self {
        Self::new(inner, key, 0, failures)
    }

    fn new(inner: MemoryStore, key: &str, get_failures: usize, put_failures: usize) -> Self {
        Self {
            inner,
            key: key.to_string(),
            get_failures: AtomicUsize::new(get_failures),
            put_failures: AtomicUsize::new(put_failures),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(bucket, prefix).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        if key == self.key {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.get_failures) {
                return Err(StoreError::Transport("SSL_connect returned=1".to_string()));
            }
        }
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        if key == self.key {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.put_failures) {
                return Err(StoreError::Transport("SSL_write returned=5".to_string()));
            }
        }
        self.inner.put(bucket, key, body).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.inner.delete(bucket, key).await
    }
}

#[tokio::test]
async fn test_upload_then_download_round_trip() {
    let source = create_tree();
    fs::write(source.path().join("dots.txt"), "…").unwrap();
    let store = Arc::new(MemoryStore::new());

    let up = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();
    assert_eq!(up.direction, Direction::Upload);
    assert_eq!(up.transferred, 4);
    assert_eq!(up.deleted, 0);
    assert!(up.metadata_written);
    assert_eq!(store.object(BUCKET, "site/dots.txt").unwrap(), "…".as_bytes());
    assert!(store.object(BUCKET, "site/.s3-meta-sync").is_some());

    let target = TempDir::new().unwrap();
    let destination = target.path().join("copy");
    let down = sync(&remote("site"), path_str(&destination), store.clone(), &config())
        .await
        .unwrap();
    assert_eq!(down.direction, Direction::Download);
    assert_eq!(down.transferred, 4);

    assert_eq!(fs::read_to_string(destination.join("dots.txt")).unwrap(), "…");
    assert_eq!(
        fs::read(destination.join("nested/deeper/b.bin")).unwrap(),
        vec![0u8, 159, 146, 150, 255]
    );
    assert_eq!(fs::read(destination.join("xxx")).unwrap(), b"yyy\n");
}

#[tokio::test]
async fn test_metadata_file_format() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote(""), store.clone(), &config())
        .await
        .unwrap();

    let text = String::from_utf8(store.object(BUCKET, META_FILE).unwrap()).unwrap();
    assert!(text.contains("xxx: 0976fb571ada412514fe67273780c510"), "{}", text);
    let snapshot = Snapshot::from_yaml(&text).unwrap();
    assert_eq!(snapshot.len(), 3);
    assert!(!snapshot.contains(META_FILE));
}

#[tokio::test]
async fn test_second_sync_is_a_noop() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let again = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();
    assert_eq!(again.transferred, 0);
    assert_eq!(again.deleted, 0);
    assert!(!again.metadata_written);

    let target = TempDir::new().unwrap();
    sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();
    let again = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();
    assert_eq!(again.transferred, 0);
    assert_eq!(again.deleted, 0);
    assert!(!again.metadata_written);
}

#[tokio::test]
async fn test_only_changed_files_are_uploaded() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    fs::write(source.path().join("nested/a.txt"), b"changed").unwrap();
    let summary = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 1);
    assert!(summary.metadata_written);
    assert_eq!(store.object(BUCKET, "site/nested/a.txt").unwrap(), b"changed");
}

#[tokio::test]
async fn test_obsolete_remote_file_is_deleted() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    fs::remove_file(source.path().join("xxx")).unwrap();
    let summary = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.deleted, 1);
    assert!(store.object(BUCKET, "site/xxx").is_none());
    assert!(store.get(BUCKET, "site/xxx").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_download_deletes_obsolete_files_and_prunes_dirs() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();
    assert!(target.path().join("nested/deeper/b.bin").exists());

    fs::remove_dir_all(source.path().join("nested")).unwrap();
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let summary = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.pruned, 2);
    assert!(!target.path().join("nested").exists());
    assert!(target.path().join("xxx").exists());
}

#[tokio::test]
async fn test_download_prunes_nested_empty_dirs() {
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("keep.txt"), b"keep").unwrap();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    fs::create_dir_all(target.path().join("nested/empty")).unwrap();
    fs::write(target.path().join("nested/a.txt"), b"a").unwrap();

    let summary = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.pruned, 2);
    assert!(!target.path().join("nested").exists());
    assert_eq!(fs::read(target.path().join("keep.txt")).unwrap(), b"keep");
}

#[tokio::test]
async fn test_unreadable_local_metadata_is_rewritten_on_upload() {
    let source = create_tree();
    fs::write(source.path().join(META_FILE), "- not\n- a mapping\n").unwrap();
    let store = Arc::new(MemoryStore::new());

    let summary = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 3);
    assert!(store.object(BUCKET, "site/.s3-meta-sync").is_some());
    let local = fs::read_to_string(source.path().join(META_FILE)).unwrap();
    assert_eq!(Snapshot::from_yaml(&local).unwrap().len(), 3);
}

#[tokio::test]
async fn test_unreadable_local_metadata_is_rewritten_on_download() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();
    fs::write(target.path().join(META_FILE), "xxx: [broken\n").unwrap();

    let summary = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.deleted, 0);
    assert!(summary.metadata_written);
    let local = fs::read_to_string(target.path().join(META_FILE)).unwrap();
    assert!(local.contains("xxx: 0976fb571ada412514fe67273780c510"), "{}", local);
}

#[tokio::test]
async fn test_remote_without_metadata_refuses_to_touch_local() {
    let target = create_tree();
    let store = Arc::new(MemoryStore::new());
    store
        .put(BUCKET, "site/unrelated.txt", b"x".to_vec())
        .await
        .unwrap();

    let err = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::RemoteWithoutMetadata { .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(target.path().join("xxx").exists());
    assert!(target.path().join("nested/deeper/b.bin").exists());
    assert!(!target.path().join(META_FILE).exists());
}

#[tokio::test]
async fn test_upload_to_untracked_remote_keeps_existing_objects() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    store
        .put(BUCKET, "site/unrelated.txt", b"x".to_vec())
        .await
        .unwrap();

    let summary = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 3);
    assert_eq!(summary.deleted, 0);
    assert!(store.object(BUCKET, "site/unrelated.txt").is_some());
}

#[tokio::test]
async fn test_only_metadata_is_written_when_files_match() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();
    fs::remove_file(target.path().join(META_FILE)).unwrap();

    let summary = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.deleted, 0);
    assert!(summary.metadata_written);
    assert!(target.path().join(META_FILE).exists());
}

#[tokio::test]
async fn test_empty_tree_uploads_only_metadata() {
    let source = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let summary = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.deleted, 0);
    assert!(summary.metadata_written);
    assert_eq!(store.len(), 1);
    assert_eq!(store.object(BUCKET, "site/.s3-meta-sync").unwrap(), b"{}\n");
}

#[tokio::test]
async fn test_single_transient_download_failure_is_retried() {
    let source = create_tree();
    let store = Arc::new(FlakyStore::failing_gets(MemoryStore::new(), "site/nested/a.txt", 1));
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    let summary = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 3);
    assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    assert_eq!(fs::read(target.path().join("nested/a.txt")).unwrap(), b"a");
}

#[tokio::test]
async fn test_two_transient_failures_abort_without_metadata() {
    let source = create_tree();
    let store = Arc::new(FlakyStore::failing_gets(MemoryStore::new(), "site/nested/a.txt", 2));
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    let err = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap_err();

    match err {
        SyncError::Transfer { ref path, ref source } => {
            assert_eq!(path, "nested/a.txt");
            assert!(source.is_transient());
        }
        ref other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.exit_code(), 4);
    assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    assert!(!target.path().join(META_FILE).exists());
}

#[tokio::test]
async fn test_single_transient_upload_failure_is_retried() {
    let source = create_tree();
    let store = Arc::new(FlakyStore::failing_puts(MemoryStore::new(), "site/xxx", 1));

    let summary = sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();

    assert_eq!(summary.transferred, 3);
    assert!(summary.metadata_written);
    assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.object(BUCKET, "site/xxx").unwrap(), b"yyy\n");
}

#[tokio::test]
async fn test_failed_upload_stops_remaining_transfers() {
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("a0.txt"), b"first").unwrap();
    for i in 0..20 {
        fs::write(source.path().join(format!("f{:02}.txt", i)), format!("{}", i)).unwrap();
    }
    let store = Arc::new(FlakyStore::failing_puts(MemoryStore::new(), "site/a0.txt", 2));
    let serial = SyncConfig {
        parallel: 1,
        verbose: false,
    };

    let err = sync(path_str(source.path()), &remote("site"), store.clone(), &serial)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Transfer { ref path, .. } if path == "a0.txt"));
    assert_eq!(store.puts.load(Ordering::SeqCst), 2);

    // Aborted tasks must not keep uploading after the sync has returned.
    let settled = store.inner.len();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(store.inner.len(), settled);
    assert!(settled < 20, "{} files uploaded after the failure", settled);
    assert!(store.inner.object(BUCKET, "site/.s3-meta-sync").is_none());
}

#[tokio::test]
async fn test_tampered_remote_object_fails_checksum() {
    let source = create_tree();
    let store = Arc::new(MemoryStore::new());
    sync(path_str(source.path()), &remote("site"), store.clone(), &config())
        .await
        .unwrap();
    store
        .put(BUCKET, "site/xxx", b"tampered".to_vec())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    let err = sync(&remote("site"), path_str(target.path()), store.clone(), &config())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ChecksumMismatch { ref path, .. } if path == "xxx"));
    assert!(!target.path().join(META_FILE).exists());
}

#[tokio::test]
async fn test_two_locals_is_a_configuration_error() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let err = sync(path_str(a.path()), path_str(b.path()), store, &config())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Config(_)));
    assert_eq!(err.exit_code(), 2);
}

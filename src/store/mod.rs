//! Blob store boundary.
//!
//! The sync core only needs four operations from an object store, so it
//! talks to a [`BlobStore`] trait object. [`S3Store`] speaks the S3 REST API;
//! [`MemoryStore`] keeps objects in process and is what the tests drive.

mod memory;
mod s3;
mod sigv4;

pub use memory::MemoryStore;
pub use s3::{S3Config, S3Store};

use crate::error::StoreError;
use async_trait::async_trait;

/// Narrow object-store interface consumed by the sync engine.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Lists every object key under `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Fetches an object's bytes. A missing key is [`StoreError::NotFound`].
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Stores `body` under `key`, replacing any existing object.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError>;

    /// Removes an object. Deleting a missing key is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

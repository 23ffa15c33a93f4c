//! Object storage abstraction.
//!
//! The store owns the bytes; video rows only ever hold the key strings returned
//! from `put`/`put_streamed`. Keys passed in by callers are relative and get
//! namespaced by the backend.

pub mod multipart;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;
use crate::services::byte_source::ByteSource;

pub use s3::S3ObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a fixed-length payload. Returns the namespaced key.
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<String>;

    /// Write a stream of unknown length without holding it all in memory.
    ///
    /// An error yielded by `source` aborts the write and is returned as-is.
    async fn put_streamed(
        &self,
        key: &str,
        content_type: &str,
        source: ByteSource,
    ) -> Result<String>;

    /// Time-limited GET URL. Fails with `StorageRead` if the object does not exist.
    async fn presigned_read_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Stable display URL; not necessarily fetchable without credentials.
    fn public_url(&self, key: &str) -> String;
}

/// Joins `prefix` and `key` with exactly one slash.
pub(crate) fn namespaced_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

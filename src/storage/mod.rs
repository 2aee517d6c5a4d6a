//! Object storage layer - per-provider backends behind one capability trait
//!
//! Each backend speaks to a single provider and works on (bucket, key) pairs.
//! [`StorageRegistry`] routes full URIs to the backend registered for their scheme
//! and adds the file/prefix conveniences the orchestrator uses.

pub mod gcs;
pub mod memory;
pub mod registry;
pub mod s3;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;
use tokio::fs;

pub use crate::io::{Scheme, StorageUri};
pub use gcs::GcsStorage;
pub use memory::InMemoryStorage;
pub use registry::StorageRegistry;
pub use s3::S3Storage;

use crate::io::{md5_file, relative_key};

/// What a single upload or download did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Content was moved
    Transferred { bytes: u64 },
    /// Source and destination already had the same md5
    Skipped,
}

/// An object found under a listed prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    /// Full `<scheme>://<bucket>/<key>` URI of the object
    pub uri: String,
    /// Key relative to the listed prefix
    pub relative_path: String,
}

impl ListedObject {
    /// Build a listing entry, or None for zero-byte "directory" placeholders and
    /// for keys that only share a string prefix with the listed one
    pub(crate) fn from_key(scheme: Scheme, bucket: &str, prefix: &str, key: &str) -> Option<Self> {
        if key.is_empty() || key.ends_with('/') {
            return None;
        }
        let relative_path = relative_key(key, prefix)?;
        Some(Self {
            uri: format!("{}://{}/{}", scheme, bucket, key.trim_matches('/')),
            relative_path,
        })
    }
}

/// Operations every object storage provider supports
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Scheme this backend serves
    fn scheme(&self) -> Scheme;

    /// Upload a local file to `key`, recording its md5 as object metadata.
    ///
    /// With `cache`, an existing object whose md5 metadata matches the file is left
    /// untouched.
    async fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        cache: bool,
    ) -> Result<TransferOutcome>;

    /// Download `key` to a local file, creating parent directories.
    ///
    /// With `cache`, an existing local file whose md5 matches the object's md5
    /// metadata is left untouched.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        cache: bool,
    ) -> Result<TransferOutcome>;

    /// Stream every object stored under `prefix`
    fn list<'a>(&'a self, bucket: &'a str, prefix: &'a str)
    -> BoxStream<'a, Result<ListedObject>>;

    /// Whether an object exists at exactly `key`
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// Fail unless `path` is an existing regular file
pub(crate) async fn ensure_file(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)
        .await
        .with_context(|| format!("{} must be a file", path.display()))?;
    if !metadata.is_file() {
        bail!("{} must be a file", path.display());
    }
    Ok(metadata.len())
}

/// Whether `local_path` exists and hashes to `remote_md5`
pub(crate) async fn local_matches(local_path: &Path, remote_md5: Option<&str>) -> Result<bool> {
    let Some(remote_md5) = remote_md5 else {
        return Ok(false);
    };
    if !fs::try_exists(local_path)
        .await
        .context("Failed to check local file existence")?
    {
        return Ok(false);
    }
    Ok(md5_file(local_path).await? == remote_md5)
}

/// Write downloaded bytes, creating parent directories as needed
pub(crate) async fn write_local(local_path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = local_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(local_path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", local_path.display()))?;
    Ok(())
}

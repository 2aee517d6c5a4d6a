use anyhow::{Context, Result, anyhow};
use async_stream::try_stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use walkdir::WalkDir;

use super::{GcsStorage, ListedObject, ObjectStorage, S3Storage, Scheme, TransferOutcome};
use crate::io::StorageUri;
use crate::telemetry::TransferStats;

/// Routes storage URIs to the backend registered for their scheme
#[derive(Clone, Default)]
pub struct StorageRegistry {
    backends: HashMap<Scheme, Arc<dyn ObjectStorage>>,
}

impl StorageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the S3 and GCS backends configured from the environment
    pub async fn from_env(region: Option<String>) -> Self {
        Self::new()
            .with_backend(Arc::new(S3Storage::from_env(region).await))
            .with_backend(Arc::new(GcsStorage::from_env()))
    }

    /// Register `backend` for the scheme it serves, replacing any previous one
    pub fn with_backend(mut self, backend: Arc<dyn ObjectStorage>) -> Self {
        self.backends.insert(backend.scheme(), backend);
        self
    }

    fn backend(&self, scheme: Scheme) -> Result<&Arc<dyn ObjectStorage>> {
        self.backends
            .get(&scheme)
            .ok_or_else(|| anyhow!("No storage backend registered for {}://", scheme))
    }

    /// Upload a single local file to `destination`
    pub async fn upload_file(
        &self,
        source: &Path,
        destination: &str,
        cache: bool,
    ) -> Result<TransferOutcome> {
        let uri = StorageUri::parse(destination)?;
        info!("Uploading file {} to {}", source.display(), destination);
        self.backend(uri.scheme)?
            .upload(&uri.bucket, source, &uri.key, cache)
            .await
    }

    /// Upload every file under the local directory `source`, mirroring relative paths
    pub async fn upload_prefix(
        &self,
        source: &Path,
        destination: &str,
        cache: bool,
    ) -> Result<TransferStats> {
        if !source.is_dir() {
            anyhow::bail!("{} must be directory", source.display());
        }
        let root = StorageUri::parse(destination)?;
        info!("Uploading prefix {} to {}", source.display(), destination);

        let mut stats = TransferStats::new();
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .context("Walked path outside of upload root")?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let target = root.join(&relative).to_string();
            let outcome = self.upload_file(entry.path(), &target, cache).await?;
            stats.update(&outcome);
        }
        Ok(stats)
    }

    /// Download a single object to `destination`
    pub async fn download_file(
        &self,
        source: &str,
        destination: &Path,
        cache: bool,
    ) -> Result<TransferOutcome> {
        let uri = StorageUri::parse(source)?;
        info!("Downloading file {} to {}", source, destination.display());
        self.backend(uri.scheme)?
            .download(&uri.bucket, &uri.key, destination, cache)
            .await
    }

    /// Download every object under `source` into the directory `destination`
    pub async fn download_prefix(
        &self,
        source: &str,
        destination: &Path,
        cache: bool,
    ) -> Result<TransferStats> {
        info!("Downloading prefix {} to {}", source, destination.display());

        let mut stats = TransferStats::new();
        let mut listing = self.list_prefix(source)?;
        while let Some(object) = listing.next().await {
            let object = object?;
            let target = destination.join(&object.relative_path);
            let outcome = self.download_file(&object.uri, &target, cache).await?;
            stats.update(&outcome);
        }
        Ok(stats)
    }

    /// Stream the objects under `source`.
    ///
    /// A prefix with no objects under it is an error for every backend.
    pub fn list_prefix(&self, source: &str) -> Result<BoxStream<'static, Result<ListedObject>>> {
        let uri = StorageUri::parse(source)?;
        let backend = Arc::clone(self.backend(uri.scheme)?);
        info!("Listing files from {}", source);

        Ok(Box::pin(try_stream! {
            let mut listing = backend.list(&uri.bucket, &uri.key);
            let mut found = 0usize;
            while let Some(object) = listing.next().await {
                let object = object?;
                found += 1;
                yield object;
            }
            if found == 0 {
                Err::<(), _>(anyhow!("Could not find any contents under {}", uri))?;
            }
        }))
    }

    /// Whether a single object exists at `uri`
    pub async fn object_exists(&self, uri: &str) -> Result<bool> {
        let uri = StorageUri::parse(uri)?;
        self.backend(uri.scheme)?.exists(&uri.bucket, &uri.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::md5_file;
    use crate::storage::InMemoryStorage;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn registry() -> (StorageRegistry, InMemoryStorage, InMemoryStorage) {
        let s3 = InMemoryStorage::new(Scheme::S3);
        let gs = InMemoryStorage::new(Scheme::Gs);
        let registry = StorageRegistry::new()
            .with_backend(Arc::new(s3.clone()))
            .with_backend(Arc::new(gs.clone()));
        (registry, s3, gs)
    }

    #[tokio::test]
    async fn test_dispatch_by_scheme() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"a").unwrap();

        let (registry, s3, gs) = registry();
        registry.upload_file(&file, "s3://b/x/a.txt", true).await.unwrap();
        registry.upload_file(&file, "gs://b/y/a.txt", true).await.unwrap();

        assert_eq!(s3.keys("b").unwrap(), vec!["x/a.txt"]);
        assert_eq!(gs.keys("b").unwrap(), vec!["y/a.txt"]);
    }

    #[tokio::test]
    async fn test_unregistered_scheme() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"a").unwrap();

        let registry = StorageRegistry::new().with_backend(Arc::new(InMemoryStorage::new(Scheme::S3)));
        assert!(registry.upload_file(&file, "gs://b/a.txt", true).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_uri_rejected() {
        let (registry, _, _) = registry();
        assert!(registry.object_exists("bucket/key").await.is_err());
        assert!(registry.object_exists("ftp://bucket/key").await.is_err());
        assert!(registry.list_prefix("bucket/key").is_err());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("labels.npz");
        std::fs::write(&source, b"\x00\x01binary\xffdata").unwrap();

        let (registry, _, _) = registry();
        registry
            .upload_file(&source, "gs://bucket/data/labels.npz", true)
            .await
            .unwrap();

        let target = dir.path().join("download/labels.npz");
        registry
            .download_file("gs://bucket/data/labels.npz", &target, true)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&source).unwrap(), std::fs::read(&target).unwrap());
        assert_eq!(md5_file(&source).await.unwrap(), md5_file(&target).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"first").unwrap();

        let (registry, _, _) = registry();
        let first = registry.upload_file(&source, "s3://b/a.txt", true).await.unwrap();
        assert_eq!(first, TransferOutcome::Transferred { bytes: 5 });

        let second = registry.upload_file(&source, "s3://b/a.txt", true).await.unwrap();
        assert_eq!(second, TransferOutcome::Skipped);

        std::fs::write(&source, b"second!").unwrap();
        let third = registry.upload_file(&source, "s3://b/a.txt", true).await.unwrap();
        assert_eq!(third, TransferOutcome::Transferred { bytes: 7 });
    }

    #[tokio::test]
    async fn test_download_cache_skips_identical_local_file() {
        let dir = TempDir::new().unwrap();
        let (registry, s3, _) = registry();
        s3.insert("b", "a.txt", b"same").unwrap();

        let target = dir.path().join("a.txt");
        let first = registry.download_file("s3://b/a.txt", &target, true).await.unwrap();
        assert_eq!(first, TransferOutcome::Transferred { bytes: 4 });
        let second = registry.download_file("s3://b/a.txt", &target, true).await.unwrap();
        assert_eq!(second, TransferOutcome::Skipped);

        std::fs::write(&target, b"changed locally").unwrap();
        let third = registry.download_file("s3://b/a.txt", &target, true).await.unwrap();
        assert_eq!(third, TransferOutcome::Transferred { bytes: 4 });
        assert_eq!(std::fs::read(&target).unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_list_prefix_yields_relative_paths() {
        let (registry, s3, _) = registry();
        for name in ["imgs.npz", "labels.npz", "nested/meta.json"] {
            s3.insert("b", &format!("data/t10k/{name}"), name.as_bytes()).unwrap();
        }
        s3.insert("b", "data/train/imgs.npz", b"x").unwrap();

        let listed: Vec<ListedObject> = registry
            .list_prefix("s3://b/data/t10k/")
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(listed.len(), 3);
        let mut relative: Vec<String> = listed.into_iter().map(|o| o.relative_path).collect();
        relative.sort();
        assert_eq!(relative, vec!["imgs.npz", "labels.npz", "nested/meta.json"]);
    }

    #[tokio::test]
    async fn test_list_empty_prefix_fails() {
        let (registry, _, gs) = registry();
        gs.insert("b", "data/a.txt", b"a").unwrap();

        let result: Result<Vec<ListedObject>> = registry
            .list_prefix("gs://b/nothing-here")
            .unwrap()
            .try_collect()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_upload_and_download_prefix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("data");
        std::fs::create_dir_all(source.join("sub")).unwrap();
        std::fs::write(source.join("one.txt"), b"1").unwrap();
        std::fs::write(source.join("sub/two.txt"), b"22").unwrap();

        let (registry, s3, _) = registry();
        let stats = registry
            .upload_prefix(&source, "s3://b/runs/7", true)
            .await
            .unwrap();
        assert_eq!(stats.files_transferred, 2);
        assert_eq!(stats.bytes_transferred, 3);
        assert_eq!(s3.keys("b").unwrap(), vec!["runs/7/one.txt", "runs/7/sub/two.txt"]);

        let target = dir.path().join("mirror");
        let stats = registry
            .download_prefix("s3://b/runs/7", &target, true)
            .await
            .unwrap();
        assert_eq!(stats.files_transferred, 2);
        assert_eq!(std::fs::read(target.join("one.txt")).unwrap(), b"1");
        assert_eq!(std::fs::read(target.join("sub/two.txt")).unwrap(), b"22");
    }

    #[tokio::test]
    async fn test_download_prefix_ignores_sibling_keys() {
        let dir = TempDir::new().unwrap();
        let (registry, s3, _) = registry();
        s3.insert("b", "data/t10k/a.txt", b"inside").unwrap();
        s3.insert("b", "data/t10ka.txt", b"sibling").unwrap();
        s3.insert("b", "data/t10k-old/a.txt", b"old").unwrap();

        let target = dir.path().join("data");
        let stats = registry
            .download_prefix("s3://b/data/t10k", &target, true)
            .await
            .unwrap();

        assert_eq!(stats.files_transferred, 1);
        assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"inside");
        assert!(!target.join("t10ka.txt").exists());
    }

    #[tokio::test]
    async fn test_list_prefix_with_only_siblings_fails() {
        let (registry, _, gs) = registry();
        gs.insert("b", "data/t10ka.txt", b"sibling").unwrap();

        let result: Result<Vec<ListedObject>> = registry
            .list_prefix("gs://b/data/t10k")
            .unwrap()
            .try_collect()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_upload_prefix_requires_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"a").unwrap();

        let (registry, _, _) = registry();
        assert!(registry.upload_prefix(&file, "s3://b/x", true).await.is_err());
    }

    #[tokio::test]
    async fn test_object_exists() {
        let (registry, s3, _) = registry();
        s3.insert("b", "data/file.txt", b"x").unwrap();

        assert!(registry.object_exists("s3://b/data/file.txt").await.unwrap());
        assert!(!registry.object_exists("s3://b/data").await.unwrap());
        assert!(!registry.object_exists("s3://b/data/missing.txt").await.unwrap());
    }
}

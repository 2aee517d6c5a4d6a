//! Google Cloud Storage backend on top of `object_store`
//!
//! Credentials and endpoints come from `object_store`'s GCP configuration
//! (`GOOGLE_SERVICE_ACCOUNT`, `GOOGLE_APPLICATION_CREDENTIALS`, application default
//! credentials or the instance metadata server). One store is built per bucket and
//! reused for later calls.

use anyhow::{Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutOptions, PutPayload,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    ListedObject, ObjectStorage, Scheme, TransferOutcome, ensure_file, local_matches, write_local,
};
use crate::config::MD5_METADATA_KEY;
use crate::io::md5_bytes;

/// ObjectStorage implementation for Google Cloud Storage (`gs://`)
pub struct GcsStorage {
    builder: GoogleCloudStorageBuilder,
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl GcsStorage {
    /// Create a backend that configures bucket stores from `builder`
    pub fn new(builder: GoogleCloudStorageBuilder) -> Self {
        Self {
            builder,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Backend configured from the `GOOGLE_*` environment variables
    pub fn from_env() -> Self {
        Self::new(GoogleCloudStorageBuilder::from_env())
    }

    /// Serve `bucket` from an already configured store
    pub fn with_bucket_store(mut self, bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.get_mut().insert(bucket.to_string(), store);
        self
    }

    async fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.stores.read().await.get(bucket) {
            return Ok(Arc::clone(store));
        }

        let store: Arc<dyn ObjectStore> = Arc::new(
            self.builder
                .clone()
                .with_bucket_name(bucket)
                .build()
                .with_context(|| format!("Failed to configure GCS client for bucket {bucket}"))?,
        );
        let mut stores = self.stores.write().await;
        Ok(Arc::clone(stores.entry(bucket.to_string()).or_insert(store)))
    }

    /// Attributes (including custom metadata) of `key`, None when the object does not exist
    async fn attributes(&self, bucket: &str, key: &str) -> Result<Option<Attributes>> {
        let store = self.store(bucket).await?;
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = store.get_opts(&ObjectPath::from(key), options).await;
        Ok(found(result, bucket, key)?.map(|result| result.attributes))
    }
}

/// A not-found lookup is `None`; every other failure is an error
fn found<T>(result: object_store::Result<T>, bucket: &str, key: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(err) => Err(err)
            .with_context(|| format!("Failed to get GCS object metadata for gs://{bucket}/{key}")),
    }
}

fn md5_attribute() -> Attribute {
    Attribute::Metadata(MD5_METADATA_KEY.into())
}

/// md5 recorded on the object at upload time
fn stored_md5(attributes: &Attributes) -> Option<&str> {
    attributes.get(&md5_attribute()).map(|value| value.as_ref())
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    fn scheme(&self) -> Scheme {
        Scheme::Gs
    }

    async fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        cache: bool,
    ) -> Result<TransferOutcome> {
        ensure_file(local_path).await?;
        let body = fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;
        let local_md5 = md5_bytes(&body);

        if cache
            && let Some(attributes) = self.attributes(bucket, key).await?
            && stored_md5(&attributes) == Some(local_md5.as_str())
        {
            debug!(bucket, key, "Local and remote objects are the same, skipping upload");
            return Ok(TransferOutcome::Skipped);
        }

        let size = body.len() as u64;
        let mut attributes = Attributes::new();
        attributes.insert(md5_attribute(), AttributeValue::from(local_md5));
        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store(bucket)
            .await?
            .put_opts(&ObjectPath::from(key), PutPayload::from(body), options)
            .await
            .with_context(|| format!("Failed to upload to gs://{bucket}/{key}"))?;

        Ok(TransferOutcome::Transferred { bytes: size })
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        cache: bool,
    ) -> Result<TransferOutcome> {
        if cache
            && fs::try_exists(local_path)
                .await
                .with_context(|| format!("Failed to check {}", local_path.display()))?
        {
            let attributes = self.attributes(bucket, key).await?;
            if local_matches(local_path, attributes.as_ref().and_then(stored_md5)).await? {
                debug!(bucket, key, "Local and remote objects are the same, skipping download");
                return Ok(TransferOutcome::Skipped);
            }
        }

        let bytes = self
            .store(bucket)
            .await?
            .get(&ObjectPath::from(key))
            .await
            .with_context(|| format!("Failed to download gs://{bucket}/{key}"))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read gs://{bucket}/{key}"))?;

        write_local(local_path, &bytes).await?;
        Ok(TransferOutcome::Transferred {
            bytes: bytes.len() as u64,
        })
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<ListedObject>> {
        Box::pin(try_stream! {
            let store = self.store(bucket).await?;
            let trimmed = prefix.trim_matches('/');
            let prefix_path = (!trimmed.is_empty()).then(|| ObjectPath::from(trimmed));

            let mut listing = store.list(prefix_path.as_ref());
            while let Some(meta) = listing.next().await {
                let meta = meta.with_context(|| format!("Failed to list gs://{bucket}/{prefix}"))?;
                let key = meta.location.to_string();
                if let Some(listed) = ListedObject::from_key(Scheme::Gs, bucket, prefix, &key) {
                    yield listed;
                }
            }
        })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let store = self.store(bucket).await?;
        let head = store.head(&ObjectPath::from(key)).await;
        Ok(found(head, bucket, key)?.is_some())
    }
}

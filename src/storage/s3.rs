use anyhow::{Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use futures::stream::BoxStream;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use super::{
    ListedObject, ObjectStorage, Scheme, TransferOutcome, ensure_file, local_matches, write_local,
};
use crate::config::{MD5_METADATA_KEY, S3_LIST_PAGE_SIZE};
use crate::io::md5_bytes;

/// ObjectStorage implementation for Amazon S3 (`s3://`)
#[derive(Clone)]
pub struct S3Storage {
    s3_client: Arc<S3Client>,
}

impl S3Storage {
    /// Create a new S3Storage around an existing client
    pub fn new(s3_client: Arc<S3Client>) -> Self {
        Self { s3_client }
    }

    /// Create a client from the standard AWS provider chain
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let aws_config = loader.load().await;
        Self::new(Arc::new(S3Client::new(&aws_config)))
    }

    /// HeadObject for `key`, None when the object does not exist
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadObjectOutput>> {
        match self
            .s3_client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output)),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to get S3 object metadata for s3://{bucket}/{key}")),
        }
    }
}

/// md5 recorded on the object at upload time
fn stored_md5(head: &HeadObjectOutput) -> Option<&str> {
    head.metadata()
        .and_then(|metadata| metadata.get(MD5_METADATA_KEY))
        .map(String::as_str)
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn scheme(&self) -> Scheme {
        Scheme::S3
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
            && let Some(head) = self.head(bucket, key).await?
            && stored_md5(&head) == Some(local_md5.as_str())
        {
            debug!(bucket, key, "Local and remote objects are the same, skipping upload");
            return Ok(TransferOutcome::Skipped);
        }

        let size = body.len() as u64;
        self.s3_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .metadata(MD5_METADATA_KEY, local_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("Failed to upload to s3://{bucket}/{key}"))?;

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
            let head = self.head(bucket, key).await?;
            if local_matches(local_path, head.as_ref().and_then(stored_md5)).await? {
                debug!(bucket, key, "Local and remote objects are the same, skipping download");
                return Ok(TransferOutcome::Skipped);
            }
        }

        let response = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{bucket}/{key}"))?;

        let bytes = response
            .body
            .collect()
            .await
            .context("Failed to collect S3 response body")?
            .into_bytes();

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
            let response = self
                .s3_client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(S3_LIST_PAGE_SIZE)
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{bucket}/{prefix}"))?;

            if response.is_truncated().unwrap_or(false) {
                warn!(
                    bucket,
                    prefix,
                    "Listing truncated to {} objects; remaining objects are ignored",
                    S3_LIST_PAGE_SIZE
                );
            }

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if let Some(listed) = ListedObject::from_key(Scheme::S3, bucket, prefix, key) {
                    yield listed;
                }
            }
        })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.head(bucket, key).await?.is_some())
    }
}

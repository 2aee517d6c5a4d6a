//! In-memory object storage for local runs and tests

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;

use super::{
    ListedObject, ObjectStorage, Scheme, TransferOutcome, ensure_file, local_matches, write_local,
};
use crate::config::MD5_METADATA_KEY;
use crate::io::md5_bytes;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

type ObjectMap = BTreeMap<(String, String), StoredObject>;

/// Object storage held in process memory.
///
/// Clones share the same objects, so a test can keep a handle while the registry
/// owns another.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    scheme: Scheme,
    objects: Arc<RwLock<ObjectMap>>,
}

impl InMemoryStorage {
    /// Create an empty store answering for `scheme`
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            objects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Store `data` at `key` as if it had been uploaded
    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        let metadata = HashMap::from([(MD5_METADATA_KEY.to_string(), md5_bytes(data))]);
        self.write()?.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                metadata,
            },
        );
        Ok(())
    }

    /// Content of the object at `key`
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| object.data.clone()))
    }

    /// All keys stored in `bucket`, in order
    pub fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ObjectMap>> {
        self.objects
            .read()
            .map_err(|e| anyhow!("in-memory storage lock poisoned: {}", e))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ObjectMap>> {
        self.objects
            .write()
            .map_err(|e| anyhow!("in-memory storage lock poisoned: {}", e))
    }

    fn stored_md5(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .read()?
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|object| object.metadata.get(MD5_METADATA_KEY).cloned()))
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    async fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        cache: bool,
    ) -> Result<TransferOutcome> {
        ensure_file(local_path).await?;
        let data = fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;

        if cache && self.stored_md5(bucket, key)? == Some(md5_bytes(&data)) {
            return Ok(TransferOutcome::Skipped);
        }

        let bytes = data.len() as u64;
        self.insert(bucket, key, &data)?;
        Ok(TransferOutcome::Transferred { bytes })
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        cache: bool,
    ) -> Result<TransferOutcome> {
        if cache {
            let remote_md5 = self.stored_md5(bucket, key)?;
            if local_matches(local_path, remote_md5.as_deref()).await? {
                return Ok(TransferOutcome::Skipped);
            }
        }

        let data = self
            .get(bucket, key)?
            .ok_or_else(|| anyhow!("No such object: {}://{}/{}", self.scheme, bucket, key))?;
        write_local(local_path, &data).await?;
        Ok(TransferOutcome::Transferred {
            bytes: data.len() as u64,
        })
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<ListedObject>> {
        let listed: Result<Vec<ListedObject>> = self.keys(bucket).map(|keys| {
            keys.iter()
                .filter(|key| key.starts_with(prefix))
                .filter_map(|key| ListedObject::from_key(self.scheme, bucket, prefix, key))
                .collect()
        });

        match listed {
            Ok(listed) => stream::iter(listed.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .read()?
            .contains_key(&(bucket.to_string(), key.to_string())))
    }
}

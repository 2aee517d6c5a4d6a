use anyhow::{Result, anyhow};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Object storage providers addressable by URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    S3,
    Gs,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::S3 => "s3",
            Scheme::Gs => "gs",
        }
    }
}

impl FromStr for Scheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s3" => Ok(Scheme::S3),
            "gs" => Ok(Scheme::Gs),
            other => Err(anyhow!(
                "Unsupported URI scheme: {}. Only s3 and gs are supported",
                other
            )),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<scheme>://<bucket>/<key>` storage URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub scheme: Scheme,
    pub bucket: String,
    /// Path inside the bucket, without leading or trailing slashes
    pub key: String,
}

impl StorageUri {
    /// Parse a URI string into a StorageUri
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|_| anyhow!("URI must contain scheme and a bucket name: {}", uri))?;
        let scheme: Scheme = url.scheme().parse()?;

        let bucket = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("URI missing bucket name: {}", uri))?
            .to_string();

        // Take the key from the raw string so it is not percent-encoded
        let key = uri
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, key)| key.trim_matches('/'))
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            scheme,
            bucket,
            key,
        })
    }

    /// URI of `relative` underneath this one
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_matches('/');
        let key = match (self.key.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => self.key.clone(),
            (false, false) => format!("{}/{}", self.key, relative),
        };
        Self {
            scheme: self.scheme,
            bucket: self.bucket.clone(),
            key,
        }
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Local path a download destination refers to.
///
/// A destination written as a storage URI maps to its key, relative to the working
/// directory, so `s3://bucket/data/x` lands in `data/x`.
pub fn local_path_for(destination: &str) -> PathBuf {
    key_of(destination)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(destination))
}

/// Key part of a storage URI
pub fn key_of(uri: &str) -> Result<String> {
    Ok(StorageUri::parse(uri)?.key)
}

/// Path of `key` relative to the listing `prefix`.
///
/// The prefix only matches on a `/` boundary, so `data/t10k` does not
/// cover `data/t10ka.txt`. When the prefix names the object itself the
/// file name is used. Returns `None` for keys outside the prefix.
pub fn relative_key(key: &str, prefix: &str) -> Option<String> {
    let key = key.trim_matches('/');
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return Some(key.to_string());
    }
    if key == prefix {
        return key.rsplit('/').next().map(str::to_string);
    }

    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    Some(rest.trim_start_matches('/').to_string())
}

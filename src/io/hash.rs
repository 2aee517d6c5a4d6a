use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// Hex md5 of a file's contents
pub async fn md5_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
    Ok(md5_bytes(&bytes))
}

/// Hex md5 of a string's UTF-8 bytes
pub fn md5_string(value: &str) -> String {
    md5_bytes(value.as_bytes())
}

pub fn md5_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

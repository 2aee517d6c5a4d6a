//! Step configuration read from a mounted config map
//!
//! The scheduler projects every config map entry as a file whose name is the key and
//! whose content is the value. Nested directories (such as the `..data` symlink farm
//! Kubernetes maintains) are walked, and every file found overrides the default with
//! the same base name.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

pub use crate::config::DEFAULT_MOUNT_PATH;

/// Flat string-to-string step configuration
pub type ConfigValues = BTreeMap<String, String>;

pub struct ConfigMap;

impl ConfigMap {
    /// Read `mount_path` over `defaults`.
    ///
    /// A mount directory that does not exist contributes no overrides.
    pub fn read(defaults: &ConfigValues, mount_path: impl AsRef<Path>) -> Result<ConfigValues> {
        let mount_path = mount_path.as_ref();
        let mut config = defaults.clone();

        if !mount_path.is_dir() {
            debug!(
                "Config map directory {} not found, using defaults",
                mount_path.display()
            );
            return Ok(config);
        }

        for entry in WalkDir::new(mount_path).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("Failed to walk {}", mount_path.display()))?;
            // Mounted entries are usually symlinks, so follow them before checking the type
            if !entry.path().is_file() {
                continue;
            }
            let Some(key) = entry.file_name().to_str() else {
                continue;
            };

            let value = std::fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read config file {}", entry.path().display()))?;
            debug!(key, "Read config value from {}", entry.path().display());
            config.insert(key.to_string(), value);
        }

        Ok(config)
    }
}

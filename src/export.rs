//! Output export for the pipeline scheduler
//!
//! Each output becomes a file named after it. Names ending in `.json` hold the value
//! as JSON, any other name holds its plain text form.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Named step outputs
pub type Outputs = BTreeMap<String, Value>;

/// Writes outputs as files under a root directory
#[derive(Debug, Clone)]
pub struct OutputExporter {
    root: PathBuf,
}

impl OutputExporter {
    /// Exporter writing under `/` when `as_root`, else under the working directory
    pub fn new(as_root: bool) -> Self {
        let root = if as_root { "/" } else { "." };
        Self::in_dir(root)
    }

    /// Exporter writing under `root`
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File an output named `name` is written to
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    /// Write every output, replacing existing files.
    ///
    /// Parent directories must already exist.
    pub async fn export(&self, outputs: &Outputs) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(outputs.len());
        for (name, value) in outputs {
            let path = self.path_for(name);
            write_output(&path, name, value).await?;
            debug!(output = %name, "Exported output to {}", path.display());
            written.push(path);
        }
        info!("Exported {} outputs to {}", written.len(), self.root.display());
        Ok(written)
    }
}

/// Text written for an output named `name`
fn render(name: &str, value: &Value) -> Result<String> {
    if name.ends_with(".json") {
        return serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize output {name}"));
    }
    Ok(match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

async fn write_output(path: &Path, name: &str, value: &Value) -> Result<()> {
    let content = render(name, value)?;
    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write output {} to {}", name, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_export_json_and_text() {
        let dir = TempDir::new().unwrap();
        let exporter = OutputExporter::in_dir(dir.path());
        let outputs = Outputs::from([
            ("result.json".to_string(), json!({"a": 1})),
            ("count".to_string(), json!(42)),
        ]);

        let written = exporter.export(&outputs).await.unwrap();
        assert_eq!(written.len(), 2);

        let result = std::fs::read_to_string(dir.path().join("result.json")).unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed, json!({"a": 1}));

        let count = std::fs::read_to_string(dir.path().join("count")).unwrap();
        assert_eq!(count, "42");
    }

    #[tokio::test]
    async fn test_string_written_raw() {
        let dir = TempDir::new().unwrap();
        let exporter = OutputExporter::in_dir(dir.path());
        let outputs = Outputs::from([
            ("logs_path".to_string(), json!("s3://logs/run/x.log")),
            ("name.json".to_string(), json!("quoted")),
        ]);
        exporter.export(&outputs).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("logs_path")).unwrap(),
            "s3://logs/run/x.log"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("name.json")).unwrap(),
            "\"quoted\""
        );
    }

    #[tokio::test]
    async fn test_overwrites_existing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("count"), "old value").unwrap();

        let exporter = OutputExporter::in_dir(dir.path());
        exporter
            .export(&Outputs::from([("count".to_string(), json!(7))]))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("count")).unwrap(), "7");
    }

    #[tokio::test]
    async fn test_missing_parent_is_error() {
        let dir = TempDir::new().unwrap();
        let exporter = OutputExporter::in_dir(dir.path());
        let outputs = Outputs::from([("missing/dir/out.json".to_string(), json!([1, 2]))]);
        assert!(exporter.export(&outputs).await.is_err());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn test_path_for_root() {
        assert_eq!(OutputExporter::new(true).path_for("metrics.json"), PathBuf::from("/metrics.json"));
        assert_eq!(OutputExporter::new(true).path_for("/abs"), PathBuf::from("/abs"));
        assert_eq!(OutputExporter::new(false).path_for("count"), PathBuf::from("./count"));
    }
}

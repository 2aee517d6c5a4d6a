//! High-level orchestration API for a pipeline step.
//!
//! An [`Orchestrator`] is built from [`SessionArgs`] and a [`StorageRegistry`]. Entering
//! it downloads every declared input and yields a [`Session`] the step works in; exiting
//! the session uploads logs and outputs and reports them to the configured exporter and
//! tracker.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use futures::future::BoxFuture;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_EXPERIMENT, DEFAULT_LOGS_PATH, DEFAULT_MOUNT_PATH, LOGS_PATH_OUTPUT, TRACKING_URI_KEY,
};
use crate::config_map::{ConfigMap, ConfigValues};
use crate::export::{OutputExporter, Outputs};
use crate::io::{StorageUri, local_path_for};
use crate::storage::StorageRegistry;
use crate::telemetry::TransferStats;
use crate::tracking::{Metrics, MlflowTracker, Parameters, RunStatus, Tracker};

/// Arguments describing one orchestrated step
#[derive(Debug, Clone, Builder)]
pub struct SessionArgs {
    /// Experiment the step's parameters and metrics are tracked under
    #[builder(setter(into), default = "DEFAULT_EXPERIMENT.to_string()")]
    pub experiment: String,
    /// Config values used when the config map does not provide them
    #[builder(setter(into), default)]
    pub default_params: ConfigValues,
    #[builder(setter(into), default = "PathBuf::from(DEFAULT_MOUNT_PATH)")]
    pub mount_path: PathBuf,

    /// (source URI, local destination) pairs downloaded on enter
    #[builder(setter(into), default)]
    pub inputs: Vec<(String, String)>,
    /// (local source, destination URI) pairs uploaded on a successful exit
    #[builder(setter(into), default)]
    pub outputs: Vec<(PathBuf, String)>,

    /// Log file uploaded on exit; requires `logs_bucket`
    #[builder(setter(into, strip_option), default)]
    pub logs_file: Option<PathBuf>,
    /// Bucket URI the log file is uploaded under; requires `logs_file`
    #[builder(setter(into, strip_option), default)]
    pub logs_bucket: Option<String>,
    #[builder(setter(into), default = "DEFAULT_LOGS_PATH.to_string()")]
    pub logs_path: String,

    /// Development run: logs are not uploaded and outputs are exported relative to
    /// the working directory
    #[builder(default)]
    pub dry_run: bool,
    #[builder(default)]
    pub use_tracking: bool,
    #[builder(default = "true")]
    pub use_exporter: bool,
    /// Skip transfers whose content is unchanged (md5 comparison)
    #[builder(default = "true")]
    pub cache: bool,
}

/// What a closed session did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub downloaded: TransferStats,
    pub uploaded: TransferStats,
    /// Remote location the log file was uploaded to
    pub logs_path: Option<String>,
    /// Files written by the output exporter
    pub exported: Vec<PathBuf>,
}

/// Orchestrator for a single step, before its session is entered
pub struct Orchestrator {
    args: SessionArgs,
    config: ConfigValues,
    storage: StorageRegistry,
    tracker: Option<Box<dyn Tracker>>,
    exporter: Option<OutputExporter>,
}

impl Orchestrator {
    /// Read the step configuration and connect the tracker when tracking is enabled.
    ///
    /// The tracking server is taken from the `uri.mlflow` config value.
    pub async fn new(args: SessionArgs, storage: StorageRegistry) -> Result<Self> {
        let config = ConfigMap::read(&args.default_params, &args.mount_path)?;
        let exporter = args.use_exporter.then(|| OutputExporter::new(!args.dry_run));

        let orchestrator = Self {
            args,
            config,
            storage,
            tracker: None,
            exporter,
        };

        if !orchestrator.args.use_tracking {
            return Ok(orchestrator);
        }
        let endpoint = orchestrator
            .get_config(TRACKING_URI_KEY)
            .ok_or_else(|| anyhow!("Tracking is enabled but `{}` is not configured", TRACKING_URI_KEY))?;
        let tracker = MlflowTracker::new(endpoint)?;
        orchestrator.with_tracker(Box::new(tracker)).await
    }

    /// Report to `tracker` instead of the configured one
    pub async fn with_tracker(mut self, mut tracker: Box<dyn Tracker>) -> Result<Self> {
        tracker
            .set_experiment(&self.args.experiment)
            .await
            .with_context(|| format!("Failed to set experiment {}", self.args.experiment))?;
        self.tracker = Some(tracker);
        Ok(self)
    }

    /// Export outputs with `exporter` instead of the default one
    pub fn with_exporter(mut self, exporter: OutputExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &ConfigValues {
        &self.config
    }

    pub fn get_config(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    /// Validate the declared transfers and download every input.
    ///
    /// An input naming a single object is downloaded as a file, anything else is
    /// treated as a prefix and mirrored into the destination directory.
    pub async fn enter(self) -> Result<Session> {
        for (source, _) in &self.args.inputs {
            StorageUri::parse(source).with_context(|| format!("Invalid input {source}"))?;
        }
        for (_, destination) in &self.args.outputs {
            StorageUri::parse(destination)
                .with_context(|| format!("Invalid output destination {destination}"))?;
        }

        info!(
            experiment = %self.args.experiment,
            inputs = self.args.inputs.len(),
            outputs = self.args.outputs.len(),
            "Entering session"
        );

        let mut downloaded = TransferStats::new();
        for (source, destination) in &self.args.inputs {
            let target = local_path_for(destination);
            if self.storage.object_exists(source).await? {
                let outcome = self
                    .storage
                    .download_file(source, &target, self.args.cache)
                    .await?;
                downloaded.update(&outcome);
            } else {
                let stats = self
                    .storage
                    .download_prefix(source, &target, self.args.cache)
                    .await?;
                downloaded.merge(&stats);
            }
        }
        debug!(?downloaded, "Inputs ready");

        Ok(Session {
            args: self.args,
            config: self.config,
            storage: self.storage,
            tracker: self.tracker,
            exporter: self.exporter,
            outputs: Outputs::new(),
            parameters: Parameters::new(),
            metrics: Vec::new(),
            summary: SessionSummary {
                downloaded,
                ..SessionSummary::default()
            },
            closed: false,
        })
    }

    /// Enter a session, run `body` in it and exit.
    ///
    /// Exit logic runs whether or not `body` fails; a failure is returned after the
    /// log upload.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use workflow_orchestrator::runner::{Orchestrator, SessionArgsBuilder};
    /// use workflow_orchestrator::storage::StorageRegistry;
    /// use std::path::PathBuf;
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// let args = SessionArgsBuilder::default()
    ///     .inputs(vec![("s3://bucket/data/t10k".to_string(), "data".to_string())])
    ///     .outputs(vec![(PathBuf::from("model.bin"), "s3://bucket/models/model.bin".to_string())])
    ///     .build()?;
    /// let orchestrator = Orchestrator::new(args, StorageRegistry::from_env(None).await).await?;
    ///
    /// let (accuracy, summary) = orchestrator
    ///     .run(|session| {
    ///         Box::pin(async move {
    ///             session.add_output("accuracy", 0.93);
    ///             anyhow::Ok(0.93)
    ///         })
    ///     })
    ///     .await?;
    /// println!("accuracy {accuracy}, uploaded {} files", summary.uploaded.files_transferred);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<T, F>(self, body: F) -> Result<(T, SessionSummary)>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>>,
    {
        let mut session = self.enter().await?;
        let outcome = body(&mut session).await;
        session.exit(outcome).await
    }
}

/// An entered session: inputs are on disk and outputs are collected
pub struct Session {
    args: SessionArgs,
    config: ConfigValues,
    storage: StorageRegistry,
    tracker: Option<Box<dyn Tracker>>,
    exporter: Option<OutputExporter>,
    outputs: Outputs,
    parameters: Parameters,
    metrics: Vec<(Metrics, Option<i64>)>,
    summary: SessionSummary,
    closed: bool,
}

impl Session {
    pub fn config(&self) -> &ConfigValues {
        &self.config
    }

    pub fn get_config(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    /// Transfers performed so far
    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Record an output for the exporter
    pub fn add_output(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(name.into(), value.into());
    }

    pub fn add_outputs(&mut self, outputs: Outputs) {
        self.outputs.extend(outputs);
    }

    pub fn add_parameters(&mut self, parameters: Parameters) {
        self.parameters.extend(parameters);
    }

    /// Record metrics for the tracker, optionally at a training `step`
    pub fn add_metrics(&mut self, metrics: Metrics, step: Option<i64>) {
        self.metrics.push((metrics, step));
    }

    /// Close the session with the body's `outcome`.
    ///
    /// The log file is uploaded in every case. Outputs are uploaded, exported and
    /// tracked only when `outcome` is Ok; otherwise the body's error is returned.
    pub async fn exit<T>(mut self, outcome: Result<T>) -> Result<(T, SessionSummary)> {
        self.closed = true;

        let logs_result = self.upload_logs().await;
        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                if let Err(logs_err) = logs_result {
                    warn!("Failed to upload logs after step failure: {:#}", logs_err);
                }
                if let Some(tracker) = self.tracker.as_mut()
                    && let Err(finish_err) = tracker.finish(RunStatus::Failed).await
                {
                    warn!("Failed to close tracking run: {:#}", finish_err);
                }
                info!("Step failed, outputs not uploaded");
                return Err(err);
            }
        };
        logs_result?;

        self.upload_outputs().await?;

        if let Some(exporter) = &self.exporter
            && !self.outputs.is_empty()
        {
            self.summary.exported = exporter.export(&self.outputs).await?;
        }

        if let Some(tracker) = self.tracker.as_mut() {
            for (metrics, step) in &self.metrics {
                if !metrics.is_empty() {
                    tracker.log_metrics(metrics, *step).await?;
                }
            }
            if !self.parameters.is_empty() {
                tracker.log_parameters(&self.parameters).await?;
            }
            tracker.finish(RunStatus::Finished).await?;
        }

        info!(
            uploaded = self.summary.uploaded.files_transferred,
            skipped = self.summary.uploaded.files_skipped,
            "Session closed"
        );
        Ok((value, std::mem::take(&mut self.summary)))
    }

    /// Upload the log file and record where it went
    async fn upload_logs(&mut self) -> Result<()> {
        let (logs_file, logs_bucket) = match (&self.args.logs_file, &self.args.logs_bucket) {
            (None, None) => return Ok(()),
            (Some(file), Some(bucket)) => (file.clone(), bucket.clone()),
            (Some(_), None) => bail!("`logs_bucket` must be provided along with `logs_file`"),
            (None, Some(_)) => bail!("`logs_file` must be provided along with `logs_bucket`"),
        };
        if self.args.dry_run {
            debug!("Dry run, not uploading {}", logs_file.display());
            return Ok(());
        }

        let destination =
            log_destination(&logs_bucket, &self.args.logs_path, &logs_file, Utc::now())?;
        let outcome = self
            .storage
            .upload_file(&logs_file, &destination, false)
            .await?;
        self.summary.uploaded.update(&outcome);

        self.outputs
            .insert(LOGS_PATH_OUTPUT.to_string(), Value::String(destination.clone()));
        self.summary.logs_path = Some(destination);
        Ok(())
    }

    async fn upload_outputs(&mut self) -> Result<()> {
        for (source, destination) in &self.args.outputs {
            if source.is_dir() {
                let stats = self
                    .storage
                    .upload_prefix(source, destination, self.args.cache)
                    .await?;
                self.summary.uploaded.merge(&stats);
            } else {
                let outcome = self
                    .storage
                    .upload_file(source, destination, self.args.cache)
                    .await?;
                self.summary.uploaded.update(&outcome);
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Session dropped without exit; outputs and logs were not uploaded");
        }
    }
}

/// Remote log location: `<bucket>/<logs_path>/<file stem>/<UTC timestamp>.log`
pub fn log_destination(
    logs_bucket: &str,
    logs_path: &str,
    logs_file: &Path,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let stem = logs_file
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| anyhow!("Log file has no name: {}", logs_file.display()))?;
    let timestamp = timestamp.format("%Y-%m-%dT%H:%M:%S%.6f");

    let uri = StorageUri::parse(logs_bucket)
        .with_context(|| format!("Invalid logs bucket {logs_bucket}"))?
        .join(logs_path)
        .join(stem)
        .join(&format!("{timestamp}.log"));
    Ok(uri.to_string())
}

//! Experiment tracking - forwards parameters and metrics to a tracking server

pub mod mlflow;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

pub use mlflow::MlflowTracker;

/// Named run parameters
pub type Parameters = BTreeMap<String, String>;

/// Named numeric run metrics
pub type Metrics = BTreeMap<String, f64>;

/// Terminal state of a tracked run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracking backend receiving a session's parameters and metrics
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Make `name` the experiment that later submissions are recorded under
    async fn set_experiment(&mut self, name: &str) -> Result<()>;

    async fn log_parameters(&mut self, parameters: &Parameters) -> Result<()>;

    /// Record metrics, optionally at a training `step`
    async fn log_metrics(&mut self, metrics: &Metrics, step: Option<i64>) -> Result<()>;

    /// Close the current run, if one was started
    async fn finish(&mut self, status: RunStatus) -> Result<()>;
}

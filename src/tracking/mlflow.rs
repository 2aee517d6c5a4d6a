//! MLflow tracking over the REST API

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{Metrics, Parameters, RunStatus, Tracker};
use crate::config::{
    MLFLOW_API_PREFIX, MLFLOW_MAX_METRICS_PER_BATCH, MLFLOW_MAX_PARAMS_PER_BATCH,
    MLFLOW_TOKEN_ENV,
};

#[derive(Debug, Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: Experiment,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: Run,
}

#[derive(Debug, Serialize)]
struct CreateRun<'a> {
    experiment_id: &'a str,
    start_time: i64,
}

#[derive(Debug, Serialize, PartialEq)]
struct Param {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct Metric {
    key: String,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[derive(Debug, Serialize, PartialEq)]
struct LogBatch<'a> {
    run_id: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    params: Vec<Param>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    metrics: Vec<Metric>,
}

#[derive(Debug, Serialize)]
struct UpdateRun<'a> {
    run_id: &'a str,
    status: &'a str,
    end_time: i64,
}

/// Tracker backed by an MLflow tracking server.
///
/// The experiment is resolved (or created) by name, and a run is opened on the first
/// submission so sessions that report nothing leave no empty runs behind.
pub struct MlflowTracker {
    http: Client,
    api: Url,
    token: Option<String>,
    experiment_id: Option<String>,
    run_id: Option<String>,
}

impl MlflowTracker {
    /// Tracker reporting to the server at `endpoint`
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            api: api_base(endpoint)?,
            token: std::env::var(MLFLOW_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
            experiment_id: None,
            run_id: None,
        })
    }

    /// Run currently receiving submissions
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    fn url(&self, method: &str) -> Result<Url> {
        self.api
            .join(method)
            .with_context(|| format!("Invalid MLflow API method: {method}"))
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B, R>(&self, method: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(method)?;
        self.with_auth(self.http.post(url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to call MLflow {method}"))?
            .error_for_status()
            .with_context(|| format!("MLflow {method} request failed"))?
            .json()
            .await
            .with_context(|| format!("Failed to parse MLflow {method} response"))
    }

    async fn experiment_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut url = self.url("experiments/get-by-name")?;
        url.query_pairs_mut().append_pair("experiment_name", name);

        let response = self
            .with_auth(self.http.get(url))
            .send()
            .await
            .context("Failed to call MLflow experiments/get-by-name")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let found: GetExperimentResponse = response
            .error_for_status()
            .context("MLflow experiments/get-by-name request failed")?
            .json()
            .await
            .context("Failed to parse MLflow experiment")?;
        Ok(Some(found.experiment.experiment_id))
    }

    /// Run to submit to, creating it on first use
    async fn active_run(&mut self) -> Result<String> {
        if let Some(run_id) = &self.run_id {
            return Ok(run_id.clone());
        }
        let Some(experiment_id) = self.experiment_id.as_deref() else {
            bail!("No MLflow experiment set");
        };

        let created: CreateRunResponse = self
            .post(
                "runs/create",
                &CreateRun {
                    experiment_id,
                    start_time: now_millis(),
                },
            )
            .await?;
        info!(run_id = %created.run.info.run_id, "Started MLflow run");
        self.run_id = Some(created.run.info.run_id.clone());
        Ok(created.run.info.run_id)
    }

    async fn submit(&mut self, params: Vec<Param>, metrics: Vec<Metric>) -> Result<()> {
        if params.is_empty() && metrics.is_empty() {
            return Ok(());
        }
        let run_id = self.active_run().await?;
        for batch in log_batches(&run_id, params, metrics) {
            let _: serde_json::Value = self.post("runs/log-batch", &batch).await?;
        }
        Ok(())
    }
}

/// API root for a tracking `endpoint`; the endpoint may or may not end with `/`
fn api_base(endpoint: &str) -> Result<Url> {
    let endpoint = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{endpoint}/")
    };
    Url::parse(&endpoint)
        .and_then(|url| url.join(MLFLOW_API_PREFIX))
        .map_err(|e| anyhow!("Invalid MLflow tracking URI {}: {}", endpoint, e))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Split params and metrics into log-batch requests within the server's limits
fn log_batches(run_id: &str, params: Vec<Param>, metrics: Vec<Metric>) -> Vec<LogBatch<'_>> {
    let mut params = params.into_iter().peekable();
    let mut metrics = metrics.into_iter().peekable();
    let mut batches = Vec::new();

    while params.peek().is_some() || metrics.peek().is_some() {
        batches.push(LogBatch {
            run_id,
            params: params.by_ref().take(MLFLOW_MAX_PARAMS_PER_BATCH).collect(),
            metrics: metrics.by_ref().take(MLFLOW_MAX_METRICS_PER_BATCH).collect(),
        });
    }
    batches
}

/// Metric records for a log-batch; NaN and infinite values have no JSON form and
/// are dropped with a warning
fn metric_records(metrics: &Metrics, timestamp: i64, step: Option<i64>) -> Vec<Metric> {
    metrics
        .iter()
        .filter(|(key, value)| {
            if value.is_finite() {
                return true;
            }
            warn!(metric = %key, %value, "Skipping non-finite metric");
            false
        })
        .map(|(key, value)| Metric {
            key: key.clone(),
            value: *value,
            timestamp,
            step: step.unwrap_or(0),
        })
        .collect()
}

#[async_trait]
impl Tracker for MlflowTracker {
    async fn set_experiment(&mut self, name: &str) -> Result<()> {
        let experiment_id = match self.experiment_by_name(name).await? {
            Some(id) => id,
            None => {
                info!(experiment = name, "Creating MLflow experiment");
                let created: CreateExperimentResponse = self
                    .post("experiments/create", &serde_json::json!({ "name": name }))
                    .await?;
                created.experiment_id
            }
        };
        debug!(experiment = name, %experiment_id, "Using MLflow experiment");
        self.experiment_id = Some(experiment_id);
        self.run_id = None;
        Ok(())
    }

    async fn log_parameters(&mut self, parameters: &Parameters) -> Result<()> {
        let params = parameters
            .iter()
            .map(|(key, value)| Param {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        self.submit(params, Vec::new()).await
    }

    async fn log_metrics(&mut self, metrics: &Metrics, step: Option<i64>) -> Result<()> {
        let metrics = metric_records(metrics, now_millis(), step);
        self.submit(Vec::new(), metrics).await
    }

    async fn finish(&mut self, status: RunStatus) -> Result<()> {
        let Some(run_id) = self.run_id.take() else {
            return Ok(());
        };
        let _: serde_json::Value = self
            .post(
                "runs/update",
                &UpdateRun {
                    run_id: &run_id,
                    status: status.as_str(),
                    end_time: now_millis(),
                },
            )
            .await?;
        info!(%run_id, %status, "Finished MLflow run");
        Ok(())
    }
}

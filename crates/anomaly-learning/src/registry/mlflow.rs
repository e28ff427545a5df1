//! MLflow tracking server registry.
//!
//! Talks to the MLflow REST API (`/api/2.0/mlflow/...`) for experiments, runs
//! and metrics, and to the artifact proxy (`/api/2.0/mlflow-artifacts/...`)
//! for the pipeline artifact. The server must run with artifact serving
//! enabled (the default since MLflow 2.0).

use super::{Experiment, RunInfo, RunRegistry, RunSearch, RunStatus};
use crate::error::{AnomalyError, ResolutionError, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Default timeout for API requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const API_PREFIX: &str = "/api/2.0/mlflow";
const ARTIFACTS_PREFIX: &str = "/api/2.0/mlflow-artifacts/artifacts";
const PROXY_SCHEME: &str = "mlflow-artifacts:/";
const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";

#[derive(Debug, Deserialize)]
struct ApiError {
    error_code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: ApiExperiment,
}

#[derive(Debug, Deserialize)]
struct ApiExperiment {
    experiment_id: String,
    name: String,
    #[serde(default)]
    artifact_location: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: ApiRun,
}

#[derive(Debug, Default, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<ApiRun>,
}

#[derive(Debug, Deserialize)]
struct ApiRun {
    info: ApiRunInfo,
    #[serde(default)]
    data: ApiRunData,
}

#[derive(Debug, Deserialize)]
struct ApiRunInfo {
    run_id: String,
    experiment_id: String,
    status: String,
    start_time: Option<i64>,
    end_time: Option<i64>,
    #[serde(default)]
    artifact_uri: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiRunData {
    #[serde(default)]
    metrics: Vec<ApiMetric>,
    #[serde(default)]
    tags: Vec<ApiTag>,
}

#[derive(Debug, Deserialize)]
struct ApiMetric {
    key: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ApiTag {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Serialize)]
struct SearchRunsRequest<'a> {
    experiment_ids: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    max_results: usize,
    order_by: [&'static str; 1],
}

impl ApiRun {
    fn into_run_info(self) -> Result<RunInfo> {
        let info = self.info;
        Ok(RunInfo {
            status: info.status.parse()?,
            start_time: millis_to_datetime(info.start_time.unwrap_or(0)),
            end_time: info.end_time.map(millis_to_datetime),
            metrics: self
                .data
                .metrics
                .into_iter()
                .map(|m| (m.key, m.value))
                .collect::<BTreeMap<_, _>>(),
            tags: self
                .data
                .tags
                .into_iter()
                .map(|t| (t.key, t.value))
                .collect::<BTreeMap<_, _>>(),
            run_id: info.run_id,
            experiment_id: info.experiment_id,
            artifact_uri: info.artifact_uri,
        })
    }
}

/// Registry backed by an MLflow tracking server.
pub struct MlflowRegistry {
    base_url: String,
    client: Client,
}

impl std::fmt::Debug for MlflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlflowRegistry")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl MlflowRegistry {
    /// Connect to the tracking server at `base_url` (e.g. `http://mlflow:5000`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                AnomalyError::registry("connect", format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}{}/{}", self.base_url, API_PREFIX, endpoint)
    }

    fn post<T: DeserializeOwned>(
        &self,
        operation: &str,
        endpoint: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.api_url(endpoint))
            .json(body)
            .send()
            .map_err(|e| AnomalyError::registry(operation, e))?;
        decode(operation, response, None)
    }

    /// GET a lookup endpoint. `missing` is returned when the server reports
    /// `RESOURCE_DOES_NOT_EXIST`.
    fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        endpoint: &str,
        query: &[(&str, &str)],
        missing: ResolutionError,
    ) -> Result<T> {
        let response = self
            .client
            .get(self.api_url(endpoint))
            .query(query)
            .send()
            .map_err(|e| AnomalyError::registry(operation, e))?;
        decode(operation, response, Some(missing))
    }

    /// Proxy URL of `path` inside the artifact root of `run`.
    fn artifact_url(&self, run: &RunInfo, path: &str) -> String {
        let root = run
            .artifact_uri
            .strip_prefix(PROXY_SCHEME)
            .map(|r| r.trim_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/{}/artifacts", run.experiment_id, run.run_id));
        format!(
            "{}{}/{}/{}",
            self.base_url,
            ARTIFACTS_PREFIX,
            root,
            path.trim_start_matches('/')
        )
    }
}

impl RunRegistry for MlflowRegistry {
    fn backend_name(&self) -> &'static str {
        "mlflow"
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        let result: Result<ExperimentResponse> = self.get(
            "get_experiment_by_name",
            "experiments/get-by-name",
            &[("experiment_name", name)],
            ResolutionError::ExperimentNotFound(name.to_string()),
        );

        match result {
            Ok(resp) => Ok(Some(Experiment {
                experiment_id: resp.experiment.experiment_id,
                name: resp.experiment.name,
                artifact_location: resp.experiment.artifact_location,
            })),
            Err(AnomalyError::Resolution(ResolutionError::ExperimentNotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_experiment(&self, name: &str) -> Result<Experiment> {
        let resp: CreateExperimentResponse =
            self.post("create_experiment", "experiments/create", &json!({ "name": name }))?;
        Ok(Experiment {
            experiment_id: resp.experiment_id,
            name: name.to_string(),
            artifact_location: String::new(),
        })
    }

    fn create_run(&self, experiment_id: &str, start_time: DateTime<Utc>) -> Result<RunInfo> {
        let resp: RunResponse = self.post(
            "create_run",
            "runs/create",
            &json!({
                "experiment_id": experiment_id,
                "start_time": start_time.timestamp_millis(),
            }),
        )?;
        let run = resp.run.into_run_info()?;
        debug!("MLflow run {} created, artifacts at {}", run.run_id, run.artifact_uri);
        Ok(run)
    }

    fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let _: serde_json::Value = self.post(
            "log_metric",
            "runs/log-metric",
            &json!({
                "run_id": run_id,
                "key": key,
                "value": value,
                "timestamp": Utc::now().timestamp_millis(),
                "step": 0,
            }),
        )?;
        Ok(())
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: serde_json::Value = self.post(
            "set_tag",
            "runs/set-tag",
            &json!({ "run_id": run_id, "key": key, "value": value }),
        )?;
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let run = self.get_run(run_id)?;
        let response = self
            .client
            .put(self.artifact_url(&run, path))
            .body(bytes.to_vec())
            .send()
            .map_err(|e| AnomalyError::registry("log_artifact", e))?;
        let _: serde_json::Value = decode("log_artifact", response, None)?;
        Ok(())
    }

    fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>> {
        let run = self.get_run(run_id)?;
        let response = self
            .client
            .get(self.artifact_url(&run, path))
            .send()
            .map_err(|e| AnomalyError::registry("download_artifact", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ResolutionError::ArtifactNotFound {
                run_id: run_id.to_string(),
                path: path.to_string(),
            }
            .into());
        }
        if !response.status().is_success() {
            return Err(AnomalyError::registry(
                "download_artifact",
                format!("HTTP {}", response.status()),
            ));
        }
        let bytes = response
            .bytes()
            .map_err(|e| AnomalyError::registry("download_artifact", e))?;
        Ok(bytes.to_vec())
    }

    fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _: serde_json::Value = self.post(
            "set_terminated",
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": Utc::now().timestamp_millis(),
            }),
        )?;
        Ok(())
    }

    fn search_runs(&self, experiment_id: &str, search: &RunSearch) -> Result<Vec<RunInfo>> {
        let request = SearchRunsRequest {
            experiment_ids: [experiment_id],
            filter: search
                .status
                .map(|s| format!("attributes.status = '{}'", s.as_str())),
            max_results: search.max_results,
            order_by: ["attributes.start_time DESC"],
        };
        let resp: SearchRunsResponse = self.post("search_runs", "runs/search", &request)?;

        let runs = resp
            .runs
            .into_iter()
            .map(ApiRun::into_run_info)
            .collect::<Result<Vec<_>>>()?;
        // Reapply locally for the run_id tie-break
        Ok(search.apply(runs))
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let resp: RunResponse = self.get(
            "get_run",
            "runs/get",
            &[("run_id", run_id)],
            ResolutionError::RunNotFound(run_id.to_string()),
        )?;
        resp.run.into_run_info()
    }
}

/// Decode a JSON response.
fn decode<T: DeserializeOwned>(
    operation: &str,
    response: Response,
    missing: Option<ResolutionError>,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|e| AnomalyError::registry(operation, e))?;

    if !status.is_success() {
        return Err(classify_failure(operation, status, &body, missing));
    }

    // Some endpoints answer with an empty body
    let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
    serde_json::from_str(body).map_err(|e| {
        AnomalyError::registry(operation, format!("unexpected response: {e}"))
    })
}

/// Map a failed API call to an error.
///
/// Only a `RESOURCE_DOES_NOT_EXIST` answer to a lookup becomes `missing`.
/// Any other failure, including a bare 404 from a proxy or a wrong base URL,
/// is a registry error.
fn classify_failure(
    operation: &str,
    status: StatusCode,
    body: &str,
    missing: Option<ResolutionError>,
) -> AnomalyError {
    let api_error: Option<ApiError> = serde_json::from_str(body).ok();
    let code = api_error.as_ref().and_then(|e| e.error_code.clone());
    let message = api_error
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string());

    match missing {
        Some(missing) if code.as_deref() == Some(RESOURCE_DOES_NOT_EXIST) => missing.into(),
        _ => AnomalyError::registry(
            operation,
            format!(
                "HTTP {status} ({}): {message}",
                code.as_deref().unwrap_or("no error code")
            ),
        ),
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

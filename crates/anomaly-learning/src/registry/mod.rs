//! Run and artifact registry.
//!
//! This module provides the [`RunRegistry`] trait used by training (to log a
//! run) and scoring (to find and load one), and three back-ends:
//!
//! - [`LocalRegistry`] - directory store with an MLflow-like layout
//! - [`InMemoryRegistry`] - process-local store, used by tests
//! - [`MlflowRegistry`] - MLflow tracking server over its REST API
//!   (requires the `mlflow` feature)
//!
//! [`open_registry`] picks the back-end from a URI.
//!
//! # Implementing a back-end
//!
//! Only the primitive operations need implementing; [`start_run`],
//! [`log_model`] and [`load_model`] are provided on top of them.
//!
//! [`start_run`]: RunRegistry::start_run
//! [`log_model`]: RunRegistry::log_model
//! [`load_model`]: RunRegistry::load_model

mod local;
mod memory;
#[cfg(feature = "mlflow")]
mod mlflow;

pub use local::LocalRegistry;
pub use memory::InMemoryRegistry;
#[cfg(feature = "mlflow")]
pub use mlflow::MlflowRegistry;

use crate::error::{AnomalyError, ResolutionError, Result};
use crate::model::{FittedPipeline, MODEL_FILE_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Run tag recording where [`RunRegistry::log_model`] stored the pipeline.
pub const TAG_MODEL_PATH: &str = "anomaly.model_path";

/// A named group of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AnomalyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // MLflow reports queued runs as SCHEDULED
            "RUNNING" | "SCHEDULED" => Ok(RunStatus::Running),
            "FINISHED" => Ok(RunStatus::Finished),
            "FAILED" => Ok(RunStatus::Failed),
            "KILLED" => Ok(RunStatus::Killed),
            other => Err(AnomalyError::registry(
                "parse_run_status",
                format!("unknown run status '{other}'"),
            )),
        }
    }
}

/// Metadata of one training run. Runs are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub artifact_uri: String,
}

impl RunInfo {
    /// Artifact path of the pipeline logged by this run, if it was tagged.
    pub fn model_path(&self) -> Option<&str> {
        self.tags
            .get(TAG_MODEL_PATH)
            .map(String::as_str)
            .filter(|path| !path.is_empty())
    }
}

/// Filter and ordering for [`RunRegistry::search_runs`].
///
/// Results are always ordered by start time, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSearch {
    /// Only return runs in this state.
    pub status: Option<RunStatus>,
    /// Upper bound on returned runs.
    pub max_results: usize,
}

impl Default for RunSearch {
    fn default() -> Self {
        Self {
            status: None,
            max_results: 1000,
        }
    }
}

impl RunSearch {
    /// The newest finished run only.
    #[must_use]
    pub fn latest_finished() -> Self {
        Self {
            status: Some(RunStatus::Finished),
            max_results: 1,
        }
    }

    /// Apply this search to an unordered set of runs.
    pub(crate) fn apply(&self, runs: impl IntoIterator<Item = RunInfo>) -> Vec<RunInfo> {
        let mut matching: Vec<RunInfo> = runs
            .into_iter()
            .filter(|r| self.status.is_none_or(|s| r.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        matching.truncate(self.max_results);
        matching
    }
}

/// Explicit reference to a logged artifact: `runs:/<run_id>/<artifact_path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelUri {
    pub run_id: String,
    pub artifact_path: String,
}

impl ModelUri {
    pub const SCHEME: &'static str = "runs:/";

    pub fn new(run_id: impl Into<String>, artifact_path: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            artifact_path: artifact_path.into(),
        }
    }

    /// Path of the serialized pipeline within the run's artifacts.
    pub fn model_file(&self) -> String {
        format!("{}/{}", self.artifact_path, MODEL_FILE_NAME)
    }
}

impl fmt::Display for ModelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", Self::SCHEME, self.run_id, self.artifact_path)
    }
}

impl FromStr for ModelUri {
    type Err = ResolutionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || ResolutionError::MalformedUri(s.to_string());

        let rest = s.strip_prefix(Self::SCHEME).ok_or_else(malformed)?;
        let (run_id, artifact_path) = rest.split_once('/').ok_or_else(malformed)?;
        let artifact_path = artifact_path.trim_end_matches('/');

        if run_id.is_empty()
            || artifact_path.is_empty()
            || artifact_path.split('/').any(|seg| seg.is_empty() || seg == "..")
        {
            return Err(malformed());
        }

        Ok(Self::new(run_id, artifact_path))
    }
}

/// Store and look up runs, metrics and artifacts.
///
/// Implementations must be safe to share across threads. Writes are
/// append-only: a registry never overwrites or deletes a run.
pub trait RunRegistry: Send + Sync {
    /// Short name of the back-end for logs.
    fn backend_name(&self) -> &'static str;

    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>>;

    fn create_experiment(&self, name: &str) -> Result<Experiment>;

    /// Register a new `Running` run.
    fn create_run(&self, experiment_id: &str, start_time: DateTime<Utc>) -> Result<RunInfo>;

    fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()>;

    /// Set a string tag on a run, replacing any previous value.
    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Store raw bytes under `path` in the run's artifact area.
    fn log_artifact(&self, run_id: &str, path: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch raw bytes stored by [`log_artifact`](Self::log_artifact).
    fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Move a run to a terminal status and stamp its end time.
    fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Runs of one experiment, newest start time first.
    fn search_runs(&self, experiment_id: &str, search: &RunSearch) -> Result<Vec<RunInfo>>;

    fn get_run(&self, run_id: &str) -> Result<RunInfo>;

    /// Create a run under `experiment_name`, creating the experiment if absent.
    fn start_run(&self, experiment_name: &str) -> Result<RunInfo> {
        let experiment = match self.get_experiment_by_name(experiment_name)? {
            Some(experiment) => experiment,
            None => {
                info!("Creating experiment '{}'", experiment_name);
                self.create_experiment(experiment_name)?
            }
        };

        let run = self.create_run(&experiment.experiment_id, Utc::now())?;
        debug!(
            "Started run {} in experiment {} ({})",
            run.run_id,
            experiment.experiment_id,
            self.backend_name()
        );
        Ok(run)
    }

    /// Serialize a pipeline into the run's artifacts under `artifact_path`
    /// and tag the run with that path so it can be found again.
    fn log_model(
        &self,
        run_id: &str,
        artifact_path: &str,
        pipeline: &FittedPipeline,
    ) -> Result<ModelUri> {
        let uri = ModelUri::new(run_id, artifact_path);
        self.log_artifact(run_id, &uri.model_file(), &pipeline.to_bytes()?)?;
        self.set_tag(run_id, TAG_MODEL_PATH, &uri.artifact_path)?;
        Ok(uri)
    }

    /// Load a pipeline previously stored with [`log_model`](Self::log_model).
    fn load_model(&self, uri: &ModelUri) -> Result<FittedPipeline> {
        let bytes = self.download_artifact(&uri.run_id, &uri.model_file())?;
        FittedPipeline::from_bytes(&bytes)
    }
}

/// Open the registry named by `uri`.
///
/// - `memory:` - a fresh [`InMemoryRegistry`]
/// - `http://...`, `https://...` - [`MlflowRegistry`]
/// - `file:<dir>`, `file://<dir>` or a plain path - [`LocalRegistry`]
pub fn open_registry(uri: &str) -> Result<Box<dyn RunRegistry>> {
    let uri = uri.trim();

    if uri == "memory:" || uri == "memory://" {
        return Ok(Box::new(InMemoryRegistry::new()));
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        #[cfg(feature = "mlflow")]
        {
            return Ok(Box::new(MlflowRegistry::new(uri)?));
        }
        #[cfg(not(feature = "mlflow"))]
        {
            return Err(AnomalyError::InvalidConfig(format!(
                "registry URI '{uri}' needs the `mlflow` feature"
            )));
        }
    }

    let path = uri
        .strip_prefix("file://")
        .or_else(|| uri.strip_prefix("file:"))
        .unwrap_or(uri);
    if path.is_empty() {
        return Err(AnomalyError::InvalidConfig(
            "registry URI must not be empty".to_string(),
        ));
    }
    Ok(Box::new(LocalRegistry::open(path)?))
}

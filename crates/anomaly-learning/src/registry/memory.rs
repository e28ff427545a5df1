//! Process-local registry.

use super::{Experiment, RunInfo, RunRegistry, RunSearch, RunStatus};
use crate::error::{AnomalyError, ResolutionError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    experiments: Vec<Experiment>,
    runs: HashMap<String, RunInfo>,
    artifacts: HashMap<(String, String), Vec<u8>>,
}

/// Registry held entirely in memory. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: RwLock<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs across all experiments.
    pub fn run_count(&self) -> usize {
        self.state.read().runs.len()
    }
}

impl RunRegistry for InMemoryRegistry {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self
            .state
            .read()
            .experiments
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    fn create_experiment(&self, name: &str) -> Result<Experiment> {
        let mut state = self.state.write();
        if state.experiments.iter().any(|e| e.name == name) {
            return Err(AnomalyError::registry(
                "create_experiment",
                format!("experiment '{name}' already exists"),
            ));
        }

        let experiment_id = (state.experiments.len() + 1).to_string();
        let experiment = Experiment {
            artifact_location: format!("memory:/{experiment_id}"),
            experiment_id,
            name: name.to_string(),
        };
        state.experiments.push(experiment.clone());
        Ok(experiment)
    }

    fn create_run(&self, experiment_id: &str, start_time: DateTime<Utc>) -> Result<RunInfo> {
        let mut state = self.state.write();
        if !state.experiments.iter().any(|e| e.experiment_id == experiment_id) {
            return Err(ResolutionError::ExperimentNotFound(experiment_id.to_string()).into());
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let info = RunInfo {
            artifact_uri: format!("memory:/{experiment_id}/{run_id}/artifacts"),
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            start_time,
            end_time: None,
            status: RunStatus::Running,
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
        };
        state.runs.insert(run_id, info.clone());
        Ok(info)
    }

    fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ResolutionError::RunNotFound(run_id.to_string()))?;
        run.metrics.insert(key.to_string(), value);
        Ok(())
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ResolutionError::RunNotFound(run_id.to_string()))?;
        run.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if !state.runs.contains_key(run_id) {
            return Err(ResolutionError::RunNotFound(run_id.to_string()).into());
        }
        state
            .artifacts
            .insert((run_id.to_string(), path.to_string()), bytes.to_vec());
        Ok(())
    }

    fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.state.read();
        if !state.runs.contains_key(run_id) {
            return Err(ResolutionError::RunNotFound(run_id.to_string()).into());
        }
        state
            .artifacts
            .get(&(run_id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| {
                ResolutionError::ArtifactNotFound {
                    run_id: run_id.to_string(),
                    path: path.to_string(),
                }
                .into()
            })
    }

    fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ResolutionError::RunNotFound(run_id.to_string()))?;
        run.status = status;
        run.end_time = Some(Utc::now());
        Ok(())
    }

    fn search_runs(&self, experiment_id: &str, search: &RunSearch) -> Result<Vec<RunInfo>> {
        let state = self.state.read();
        if !state.experiments.iter().any(|e| e.experiment_id == experiment_id) {
            return Err(ResolutionError::ExperimentNotFound(experiment_id.to_string()).into());
        }
        let runs = state
            .runs
            .values()
            .filter(|r| r.experiment_id == experiment_id)
            .cloned();
        Ok(search.apply(runs))
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        self.state
            .read()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| ResolutionError::RunNotFound(run_id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_run_creates_experiment_once() {
        let registry = InMemoryRegistry::new();
        let a = registry.start_run("traffic").unwrap();
        let b = registry.start_run("traffic").unwrap();

        assert_eq!(a.experiment_id, b.experiment_id);
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(registry.run_count(), 2);
    }

    #[test]
    fn test_unknown_experiment() {
        let registry = InMemoryRegistry::new();
        let err = registry.search_runs("7", &RunSearch::default()).unwrap_err();
        assert_eq!(err.error_code(), "EXPERIMENT_NOT_FOUND");
    }

    #[test]
    fn test_metrics_and_status() {
        let registry = InMemoryRegistry::new();
        let run = registry.start_run("traffic").unwrap();
        registry.log_metric(&run.run_id, "n_rows", 24.0).unwrap();
        registry.set_terminated(&run.run_id, RunStatus::Failed).unwrap();

        let stored = registry.get_run(&run.run_id).unwrap();
        assert_eq!(stored.metrics.get("n_rows"), Some(&24.0));
        assert_eq!(stored.status, RunStatus::Failed);
    }
}

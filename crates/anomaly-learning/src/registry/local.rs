//! Directory-backed registry.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<experiment_id>/meta.json
//! <root>/<experiment_id>/<run_id>/meta.json
//! <root>/<experiment_id>/<run_id>/metrics/<key>        "<timestamp_ms> <value> <step>" per line
//! <root>/<experiment_id>/<run_id>/artifacts/<path>
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader never observes a half-written artifact.

use super::{Experiment, RunInfo, RunRegistry, RunSearch, RunStatus};
use crate::error::{AnomalyError, ResolutionError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const META_FILE: &str = "meta.json";
const METRICS_DIR: &str = "metrics";
const ARTIFACTS_DIR: &str = "artifacts";

/// Registry stored in a local directory.
#[derive(Debug)]
pub struct LocalRegistry {
    root: PathBuf,
    // Serialises id allocation and read-modify-write of run metadata.
    write_lock: Mutex<()>,
}

impl LocalRegistry {
    /// Open (and create if needed) a registry rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            AnomalyError::registry("open", format!("cannot create '{}': {e}", root.display()))
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiments(&self) -> Result<Vec<(PathBuf, Experiment)>> {
        let mut found = Vec::new();
        for dir in list_dirs(&self.root, "list_experiments")? {
            let meta = dir.join(META_FILE);
            if meta.is_file() {
                found.push((dir, read_json::<Experiment>(&meta, "read_experiment")?));
            }
        }
        Ok(found)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if !is_safe_segment(run_id) {
            return Err(ResolutionError::RunNotFound(run_id.to_string()).into());
        }
        for (exp_dir, _) in self.experiments()? {
            let candidate = exp_dir.join(run_id);
            if candidate.join(META_FILE).is_file() {
                return Ok(candidate);
            }
        }
        Err(ResolutionError::RunNotFound(run_id.to_string()).into())
    }

    fn read_run(&self, run_dir: &Path) -> Result<RunInfo> {
        let mut info: RunInfo = read_json(&run_dir.join(META_FILE), "read_run")?;
        info.metrics = read_metrics(&run_dir.join(METRICS_DIR))?;
        Ok(info)
    }
}

impl RunRegistry for LocalRegistry {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self
            .experiments()?
            .into_iter()
            .map(|(_, experiment)| experiment)
            .find(|e| e.name == name))
    }

    fn create_experiment(&self, name: &str) -> Result<Experiment> {
        let _guard = self.write_lock.lock();

        let existing = self.experiments()?;
        if existing.iter().any(|(_, e)| e.name == name) {
            return Err(AnomalyError::registry(
                "create_experiment",
                format!("experiment '{name}' already exists"),
            ));
        }

        let next_id = existing
            .iter()
            .filter_map(|(_, e)| e.experiment_id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let dir = self.root.join(next_id.to_string());

        let experiment = Experiment {
            experiment_id: next_id.to_string(),
            name: name.to_string(),
            artifact_location: dir.display().to_string(),
        };
        create_dir(&dir, "create_experiment")?;
        write_json(&dir.join(META_FILE), &experiment, "create_experiment")?;

        debug!("Created experiment {} at {}", experiment.experiment_id, dir.display());
        Ok(experiment)
    }

    fn create_run(&self, experiment_id: &str, start_time: DateTime<Utc>) -> Result<RunInfo> {
        let _guard = self.write_lock.lock();

        let exp_dir = self.root.join(experiment_id);
        if !is_safe_segment(experiment_id) || !exp_dir.join(META_FILE).is_file() {
            return Err(ResolutionError::ExperimentNotFound(experiment_id.to_string()).into());
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = exp_dir.join(&run_id);
        create_dir(&run_dir.join(ARTIFACTS_DIR), "create_run")?;
        create_dir(&run_dir.join(METRICS_DIR), "create_run")?;

        let info = RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            start_time,
            end_time: None,
            status: RunStatus::Running,
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
            artifact_uri: run_dir.join(ARTIFACTS_DIR).display().to_string(),
        };
        write_json(&run_dir.join(META_FILE), &info, "create_run")?;
        Ok(info)
    }

    fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        if !is_safe_segment(key) {
            return Err(AnomalyError::registry(
                "log_metric",
                format!("invalid metric key '{key}'"),
            ));
        }
        let run_dir = self.run_dir(run_id)?;
        let metrics_dir = run_dir.join(METRICS_DIR);
        create_dir(&metrics_dir, "log_metric")?;

        let _guard = self.write_lock.lock();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(metrics_dir.join(key))
            .map_err(|e| AnomalyError::registry("log_metric", e))?;
        writeln!(file, "{} {} 0", Utc::now().timestamp_millis(), value)
            .map_err(|e| AnomalyError::registry("log_metric", e))
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(AnomalyError::registry("set_tag", "tag key must not be empty"));
        }
        let run_dir = self.run_dir(run_id)?;
        let _guard = self.write_lock.lock();

        let meta = run_dir.join(META_FILE);
        let mut info: RunInfo = read_json(&meta, "set_tag")?;
        info.tags.insert(key.to_string(), value.to_string());
        write_json(&meta, &info, "set_tag")
    }

    fn log_artifact(&self, run_id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let relative = artifact_relative_path(path)?;
        let target = self.run_dir(run_id)?.join(ARTIFACTS_DIR).join(relative);
        if let Some(parent) = target.parent() {
            create_dir(parent, "log_artifact")?;
        }
        write_atomic(&target, bytes, "log_artifact")
    }

    fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>> {
        let relative = artifact_relative_path(path)?;
        let target = self.run_dir(run_id)?.join(ARTIFACTS_DIR).join(relative);
        if !target.is_file() {
            return Err(ResolutionError::ArtifactNotFound {
                run_id: run_id.to_string(),
                path: path.to_string(),
            }
            .into());
        }
        fs::read(&target).map_err(|e| AnomalyError::registry("download_artifact", e))
    }

    fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let run_dir = self.run_dir(run_id)?;
        let _guard = self.write_lock.lock();

        let meta = run_dir.join(META_FILE);
        let mut info: RunInfo = read_json(&meta, "set_terminated")?;
        info.status = status;
        info.end_time = Some(Utc::now());
        write_json(&meta, &info, "set_terminated")
    }

    fn search_runs(&self, experiment_id: &str, search: &RunSearch) -> Result<Vec<RunInfo>> {
        let exp_dir = self.root.join(experiment_id);
        if !is_safe_segment(experiment_id) || !exp_dir.join(META_FILE).is_file() {
            return Err(ResolutionError::ExperimentNotFound(experiment_id.to_string()).into());
        }

        let mut runs = Vec::new();
        for run_dir in list_dirs(&exp_dir, "search_runs")? {
            if run_dir.join(META_FILE).is_file() {
                runs.push(self.read_run(&run_dir)?);
            }
        }
        Ok(search.apply(runs))
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let run_dir = self.run_dir(run_id)?;
        self.read_run(&run_dir)
    }
}

/// Latest value of every metric file in `dir`.
fn read_metrics(dir: &Path) -> Result<BTreeMap<String, f64>> {
    let mut metrics = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(metrics);
    }

    let entries = fs::read_dir(dir).map_err(|e| AnomalyError::registry("read_metrics", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| AnomalyError::registry("read_metrics", e))?;
        let key = entry.file_name().to_string_lossy().into_owned();
        let content = fs::read_to_string(entry.path())
            .map_err(|e| AnomalyError::registry("read_metrics", e))?;

        let latest = content
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .filter_map(|v| v.parse::<f64>().ok())
            .next_back();
        if let Some(value) = latest {
            metrics.insert(key, value);
        }
    }
    Ok(metrics)
}

fn list_dirs(dir: &Path, operation: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| AnomalyError::registry(operation, e))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| AnomalyError::registry(operation, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn create_dir(dir: &Path, operation: &str) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        AnomalyError::registry(operation, format!("cannot create '{}': {e}", dir.display()))
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, operation: &str) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| AnomalyError::registry(operation, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        AnomalyError::registry(operation, format!("corrupt '{}': {e}", path.display()))
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, operation: &str) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes, operation)
}

fn write_atomic(path: &Path, bytes: &[u8], operation: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let written = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(AnomalyError::registry(
            operation,
            format!("cannot write '{}': {e}", path.display()),
        ));
    }
    Ok(())
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\'])
}

fn artifact_relative_path(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || !trimmed.split('/').all(is_safe_segment) {
        return Err(AnomalyError::registry(
            "artifact_path",
            format!("invalid artifact path '{path}'"),
        ));
    }
    Ok(trimmed.split('/').collect())
}

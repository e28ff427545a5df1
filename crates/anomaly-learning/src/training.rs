//! Training job.
//!
//! This module provides the [`Trainer`] struct and its builder. A training job
//! fits the preprocessing pipeline and the isolation forest on the full
//! dataset, re-scores the training data as a self-check, and publishes the
//! fitted pipeline with its metrics as a new registry run.
//!
//! # Overview
//!
//! The job executes these stages in order:
//!
//! 1. **Preprocessing** - Expand dates, freeze the schema, fit imputation, scaling and encoding
//! 2. **Fitting** - Grow the isolation trees
//! 3. **Self-check** - Replay the fitted pipeline on the training data
//! 4. **Publishing** - Create a run, log metrics and the pipeline artifact
//!
//! Nothing touches the registry before stage 4, so a failed fit leaves no run
//! behind.
//!
//! # Example
//!
//! ```rust,ignore
//! use anomaly_learning::{InMemoryRegistry, Trainer, TrainingConfig};
//!
//! let registry = InMemoryRegistry::new();
//! let trainer = Trainer::builder()
//!     .config(TrainingConfig::default())
//!     .on_progress(|update| println!("{:.0}% {}", update.progress * 100.0, update.message))
//!     .build();
//!
//! let outcome = trainer.train(&df, &registry)?;
//! println!("{} -> anomaly rate {:.4}", outcome.result.model_uri, outcome.result.anomaly_rate);
//! ```

use crate::config::TrainingConfig;
use crate::error::{Result, ResultExt};
use crate::forest::IsolationForest;
use crate::model::FittedPipeline;
use crate::progress::{ProgressCallback, ProgressUpdate, TrainingStage};
use crate::registry::{ModelUri, RunInfo, RunRegistry, RunStatus};
use crate::types::{Predictions, TrainingResult};
use anomaly_processing::{ProcessingError, Preprocessor};
use polars::prelude::DataFrame;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Metric logged with the self-check anomaly rate.
pub const METRIC_ANOMALY_RATE: &str = "anomaly_rate";
/// Metric logged with the number of training records.
pub const METRIC_N_ROWS: &str = "n_rows";
/// Metric logged with the feature matrix width.
pub const METRIC_N_FEATURES: &str = "n_features";

/// Everything a finished training job produced.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Summary of the published run.
    pub result: TrainingResult,
    /// The pipeline that was logged.
    pub pipeline: FittedPipeline,
    /// Self-check labels and scores on the training data.
    pub self_check: Predictions,
}

/// Runs training jobs.
///
/// Use [`Trainer::builder()`] to construct one.
pub struct Trainer {
    config: TrainingConfig,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Trainer {
    #[must_use]
    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Fit the pipeline and run the self-check without touching any registry.
    ///
    /// # Errors
    ///
    /// - [`InvalidConfig`](crate::AnomalyError::InvalidConfig) for an invalid configuration
    /// - [`Processing`](crate::AnomalyError::Processing) for an empty dataset or
    ///   no usable columns
    /// - [`InvalidData`](crate::AnomalyError::InvalidData) if the feature matrix
    ///   cannot be fitted
    pub fn fit(&self, df: &DataFrame) -> Result<(FittedPipeline, Predictions)> {
        let result = self.fit_inner(df);
        if let Err(e) = &result {
            self.report(ProgressUpdate::failed(e.to_string()));
        }
        result
    }

    fn fit_inner(&self, df: &DataFrame) -> Result<(FittedPipeline, Predictions)> {
        self.report(ProgressUpdate::new(
            TrainingStage::Initializing,
            0.0,
            format!("Validating {} rows x {} columns", df.height(), df.width()),
        ));
        self.config.validate()?;
        if df.height() == 0 {
            return Err(ProcessingError::EmptyDataset.into());
        }

        self.report(ProgressUpdate::new(
            TrainingStage::Preprocessing,
            0.1,
            "Fitting preprocessing pipeline",
        ));
        let preprocessor = Preprocessor::new(self.config.preprocessing.clone())
            .fit(df)
            .context("Fitting preprocessing pipeline")?;
        let features = preprocessor.transform(df)?;
        info!(
            "Preprocessing fitted: {} numeric, {} categorical columns -> {} features",
            preprocessor.schema().numeric().count(),
            preprocessor.schema().categorical().count(),
            features.n_cols()
        );

        self.report(ProgressUpdate::new(
            TrainingStage::Fitting,
            0.3,
            format!("Growing {} isolation trees", self.config.forest.n_estimators),
        ));
        let forest = IsolationForest::fit(&features, &self.config.forest)?;

        self.report(ProgressUpdate::new(
            TrainingStage::SelfCheck,
            0.7,
            "Scoring training data",
        ));
        let pipeline = FittedPipeline::new(preprocessor, forest, df.height());
        let self_check = pipeline.score(df).context("Self-check on training data")?;
        info!(
            "Self-check: {} of {} training records flagged ({:.2}%)",
            self_check.n_anomalies(),
            self_check.len(),
            self_check.anomaly_rate() * 100.0
        );

        Ok((pipeline, self_check))
    }

    /// Run the full training job and publish the result to `registry`.
    ///
    /// A run is created only after fitting succeeded. If publishing fails the
    /// run is marked [`RunStatus::Failed`] (best effort) and the error is
    /// returned.
    pub fn train(&self, df: &DataFrame, registry: &dyn RunRegistry) -> Result<TrainingOutcome> {
        let start = Instant::now();
        let (pipeline, self_check) = self.fit(df)?;

        self.report(ProgressUpdate::new(
            TrainingStage::Publishing,
            0.85,
            format!("Logging run to experiment '{}'", self.config.experiment_name),
        ));

        let run = registry
            .start_run(&self.config.experiment_name)
            .context("Creating training run")
            .inspect_err(|e| self.report(ProgressUpdate::failed(e.to_string())))?;

        let model_uri = match self.publish(registry, &run, &pipeline, &self_check) {
            Ok(uri) => uri,
            Err(e) => {
                if let Err(mark_err) = registry.set_terminated(&run.run_id, RunStatus::Failed) {
                    warn!("Could not mark run {} as failed: {}", run.run_id, mark_err);
                }
                self.report(ProgressUpdate::failed(e.to_string()));
                return Err(e);
            }
        };

        let result = TrainingResult {
            run_id: run.run_id,
            experiment_id: run.experiment_id,
            model_uri: model_uri.to_string(),
            anomaly_rate: self_check.anomaly_rate(),
            n_rows: df.height(),
            n_features: pipeline.forest().n_features(),
            training_time_seconds: start.elapsed().as_secs_f64(),
        };

        info!(
            "Training complete: {} (anomaly_rate={:.4}, {:.2}s)",
            result.model_uri, result.anomaly_rate, result.training_time_seconds
        );
        self.report(ProgressUpdate::complete(format!(
            "Model logged as {}",
            result.model_uri
        )));

        Ok(TrainingOutcome {
            result,
            pipeline,
            self_check,
        })
    }

    fn publish(
        &self,
        registry: &dyn RunRegistry,
        run: &RunInfo,
        pipeline: &FittedPipeline,
        self_check: &Predictions,
    ) -> Result<ModelUri> {
        registry.log_metric(&run.run_id, METRIC_ANOMALY_RATE, self_check.anomaly_rate())?;
        registry.log_metric(&run.run_id, METRIC_N_ROWS, pipeline.training_rows() as f64)?;
        registry.log_metric(
            &run.run_id,
            METRIC_N_FEATURES,
            pipeline.forest().n_features() as f64,
        )?;

        let uri = registry
            .log_model(&run.run_id, &self.config.artifact_path, pipeline)
            .context("Logging pipeline artifact")?;
        registry.set_terminated(&run.run_id, RunStatus::Finished)?;
        Ok(uri)
    }

    fn report(&self, update: ProgressUpdate) {
        if let Some(callback) = &self.progress_callback {
            callback(update);
        }
    }
}

/// Builder for [`Trainer`].
///
/// # Optional Configuration
///
/// - [`config()`](Self::config): Training configuration (default: [`TrainingConfig::default()`])
/// - [`on_progress()`](Self::on_progress): Progress callback for monitoring
///
/// The configuration is validated when training starts.
#[derive(Default)]
pub struct TrainerBuilder {
    config: Option<TrainingConfig>,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for TrainerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerBuilder")
            .field("config", &self.config)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl TrainerBuilder {
    #[must_use]
    pub fn config(mut self, config: TrainingConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the progress callback.
    ///
    /// The callback runs on the training thread and should return quickly.
    #[must_use]
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn build(self) -> Trainer {
        Trainer {
            config: self.config.unwrap_or_default(),
            progress_callback: self.progress_callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_EXPERIMENT_NAME, ForestConfig};
    use crate::error::{AnomalyError, ErrorCategory, ResolutionError};
    use crate::registry::{Experiment, InMemoryRegistry, RunSearch, TAG_MODEL_PATH};
    use crate::scoring::resolve_latest_run;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use polars::prelude::*;

    /// In-memory registry whose artifact store rejects every write.
    struct ReadOnlyArtifacts(InMemoryRegistry);

    impl RunRegistry for ReadOnlyArtifacts {
        fn backend_name(&self) -> &'static str {
            "read-only-artifacts"
        }

        fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
            self.0.get_experiment_by_name(name)
        }

        fn create_experiment(&self, name: &str) -> Result<Experiment> {
            self.0.create_experiment(name)
        }

        fn create_run(&self, experiment_id: &str, start_time: DateTime<Utc>) -> Result<RunInfo> {
            self.0.create_run(experiment_id, start_time)
        }

        fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
            self.0.log_metric(run_id, key, value)
        }

        fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
            self.0.set_tag(run_id, key, value)
        }

        fn log_artifact(&self, _run_id: &str, _path: &str, _bytes: &[u8]) -> Result<()> {
            Err(AnomalyError::registry("log_artifact", "artifact store is read-only"))
        }

        fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>> {
            self.0.download_artifact(run_id, path)
        }

        fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
            self.0.set_terminated(run_id, status)
        }

        fn search_runs(&self, experiment_id: &str, search: &RunSearch) -> Result<Vec<RunInfo>> {
            self.0.search_runs(experiment_id, search)
        }

        fn get_run(&self, run_id: &str) -> Result<RunInfo> {
            self.0.get_run(run_id)
        }
    }

    fn small_frame() -> DataFrame {
        let n = 60;
        let speed: Vec<f64> = (0..n).map(|i| 30.0 + (i % 7) as f64).collect();
        let units: Vec<i64> = (0..n).map(|i| 1 + (i % 3) as i64).collect();
        let weather: Vec<&str> = (0..n)
            .map(|i| if i % 4 == 0 { "RAIN" } else { "CLEAR" })
            .collect();
        df!(
            "speed_limit" => speed,
            "num_units" => units,
            "weather_condition" => weather,
        )
        .unwrap()
    }

    fn trainer() -> Trainer {
        let config = TrainingConfig::builder()
            .forest(ForestConfig::builder().n_estimators(25).build().unwrap())
            .build()
            .unwrap();
        Trainer::builder().config(config).build()
    }

    #[test]
    fn test_train_publishes_finished_run() {
        let registry = InMemoryRegistry::new();
        let outcome = trainer().train(&small_frame(), &registry).unwrap();

        let run = registry.get_run(&outcome.result.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.metrics[METRIC_ANOMALY_RATE], outcome.result.anomaly_rate);
        assert_eq!(run.metrics[METRIC_N_ROWS], 60.0);
        assert_eq!(
            outcome.result.model_uri,
            format!("runs:/{}/model", outcome.result.run_id)
        );
        assert_eq!(run.tags[TAG_MODEL_PATH], "model");
    }

    #[test]
    fn test_artifact_write_failure_marks_run_failed() {
        let registry = ReadOnlyArtifacts(InMemoryRegistry::new());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let trainer = Trainer::builder()
            .config(trainer().config().clone())
            .on_progress(move |u| sink.lock().push(u))
            .build();

        let err = trainer.train(&small_frame(), &registry).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Registry);
        assert_eq!(err.exit_code(), 5);

        let experiment = registry
            .get_experiment_by_name(DEFAULT_EXPERIMENT_NAME)
            .unwrap()
            .unwrap();
        let runs = registry
            .search_runs(&experiment.experiment_id, &RunSearch::default())
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].end_time.is_some());

        let err = resolve_latest_run(&registry, DEFAULT_EXPERIMENT_NAME).unwrap_err();
        assert!(matches!(
            err,
            AnomalyError::Resolution(ResolutionError::NoRuns { .. })
        ));

        let updates = updates.lock();
        assert_eq!(updates.last().unwrap().stage, TrainingStage::Failed);
    }

    #[test]
    fn test_failed_fit_creates_no_run() {
        let registry = InMemoryRegistry::new();
        let empty = small_frame().head(Some(0));
        let err = trainer().train(&empty, &registry).unwrap_err();

        assert_eq!(err.error_code(), "EMPTY_DATASET");
        assert_eq!(registry.run_count(), 0);
    }

    #[test]
    fn test_progress_is_monotonic_and_terminal() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let trainer = Trainer::builder()
            .config(trainer().config().clone())
            .on_progress(move |u| sink.lock().push(u))
            .build();

        trainer.train(&small_frame(), &InMemoryRegistry::new()).unwrap();

        let updates = updates.lock();
        assert_eq!(updates.first().unwrap().stage, TrainingStage::Initializing);
        assert_eq!(updates.last().unwrap().stage, TrainingStage::Complete);
        assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));
    }

    #[test]
    fn test_runs_accumulate() {
        let registry = InMemoryRegistry::new();
        let trainer = trainer();
        trainer.train(&small_frame(), &registry).unwrap();
        let second = trainer.train(&small_frame(), &registry).unwrap();

        let runs = registry
            .search_runs(&second.result.experiment_id, &RunSearch::default())
            .unwrap();
        assert_eq!(runs.len(), 2);
    }
}

//! anomaly-learning: isolation-forest training and scoring with a run registry.
//!
//! This crate turns traffic accident records into anomaly labels and scores.
//! It trains an isolation forest behind the frozen preprocessing of
//! [`anomaly_processing`], publishes the fitted pipeline as a registry run, and
//! later resolves that run to score new data exactly as it was trained.
//!
//! # Features
//!
//! - **Isolation Forest**: Seeded, parallel tree growth with identical results for any thread count
//! - **Frozen Pipeline**: One serialisable artifact holding preprocessing and model
//! - **Run Registry**: Local directory, in-memory and MLflow back-ends behind one trait
//! - **Model Resolution**: `latest` or explicit `runs:/<run_id>/<path>` references
//! - **Reporting**: Summary statistics and a JSON report over scored data
//! - **Workflow**: Sequential `train >> score` runner with retries
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use anomaly_learning::{
//!     FileReporter, ModelReference, ScoringConfig, Scorer, Trainer, TrainingConfig,
//!     open_registry,
//! };
//! use anomaly_processing::load_csv_with_fallbacks;
//!
//! let registry = open_registry("file:./mlruns")?;
//!
//! // Train and publish
//! let train = load_csv_with_fallbacks("traffic_accidents.csv")?;
//! let trainer = Trainer::builder().config(TrainingConfig::default()).build();
//! let outcome = trainer.train(&train, registry.as_ref())?;
//! println!("Logged {}", outcome.result.model_uri);
//!
//! // Score with the newest finished run
//! let new_data = load_csv_with_fallbacks("new_accidents.csv")?;
//! let scorer = Scorer::new(ScoringConfig::default()).with_reporter(FileReporter);
//! let mut scored = scorer.score(&new_data, registry.as_ref(), &ModelReference::Latest)?;
//! scorer.write(&mut scored, "scored.csv".as_ref(), Some("viz".as_ref()))?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │           Trainer            │          │            Scorer            │
//! │                              │          │                              │
//! │  Preprocessor::fit           │          │  resolve_latest_run          │
//! │  IsolationForest::fit        │          │  artifact_reference          │
//! │  self-check                  │          │  FittedPipeline::score       │
//! └──────────────┬───────────────┘          └──────────────┬───────────────┘
//!                │ log_metric / log_model                  │ search_runs / load_model
//!                ▼                                         ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          dyn RunRegistry                                 │
//! │          LocalRegistry  ·  InMemoryRegistry  ·  MlflowRegistry           │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! All fallible operations return [`Result<T, AnomalyError>`]. Every error maps
//! to an [`ErrorCategory`] with a distinct process exit code:
//!
//! - [`ErrorCategory::Input`] - missing or empty dataset, invalid configuration
//! - [`ErrorCategory::Resolution`] - unknown experiment, no runs, bad reference
//! - [`ErrorCategory::SchemaDrift`] - scoring data no longer fits the frozen schema
//! - [`ErrorCategory::Registry`] - registry read or write failure
//!
//! # Determinism
//!
//! Given the same data and [`ForestConfig::random_seed`], training produces the
//! same pipeline, and a pipeline reloaded from its artifact produces
//! bit-identical scores.

pub mod config;
pub mod error;
pub mod forest;
pub mod model;
pub mod orchestration;
pub mod progress;
pub mod registry;
pub mod reporting;
pub mod scoring;
pub mod training;
pub mod types;

// Re-exports for convenient access
pub use config::{
    Contamination, DEFAULT_ARTIFACT_PATH, DEFAULT_EXPERIMENT_NAME, DEFAULT_REGISTRY_URI,
    ForestConfig, ForestConfigBuilder, LabelFormat, MaxSamples, RuntimeConfig, ScoringConfig,
    ScoringConfigBuilder, TrainingConfig, TrainingConfigBuilder,
};
pub use error::{AnomalyError, ErrorCategory, ResolutionError, Result, ResultExt};
pub use forest::{AUTO_OFFSET, IsolationForest, IsolationTree, average_path_length};
pub use model::{FORMAT_VERSION, FittedPipeline, MODEL_FILE_NAME};
pub use orchestration::{RetryPolicy, TaskRun, Workflow, WorkflowReport};
pub use progress::{ProgressCallback, ProgressUpdate, TrainingStage};
pub use registry::{
    Experiment, InMemoryRegistry, LocalRegistry, ModelUri, RunInfo, RunRegistry, RunSearch,
    RunStatus, TAG_MODEL_PATH, open_registry,
};
#[cfg(feature = "mlflow")]
pub use registry::MlflowRegistry;
pub use reporting::{AnomalyReport, FileReporter, Reporter, SummaryStatistics};
pub use scoring::{
    LABEL_COLUMN, ModelReference, SCORE_COLUMN, ScoredDataset, Scorer, append_predictions,
    artifact_reference, resolve_latest_run,
};
pub use training::{Trainer, TrainerBuilder, TrainingOutcome};
pub use types::{AnomalyLabel, Predictions, ScoringResult, TrainingResult};

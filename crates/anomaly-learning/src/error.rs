//! Error types for the anomaly-learning crate.
//!
//! This module defines [`AnomalyError`], the main error type used throughout
//! the crate. All public API functions return `Result<T, AnomalyError>`.
//!
//! # Error Handling
//!
//! Every error maps to an [`ErrorCategory`] via [`AnomalyError::category()`].
//! The CLI turns the category into a process exit code so a scheduler can
//! tell bad input apart from a missing model or a schema change:
//!
//! | Category     | Exit code |
//! |--------------|-----------|
//! | `Internal`   | 1         |
//! | `Input`      | 2         |
//! | `Resolution` | 3         |
//! | `SchemaDrift`| 4         |
//! | `Registry`   | 5         |

use anomaly_processing::ProcessingError;
use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// Broad class of a failure, used for exit codes and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing or empty dataset, unreadable file, invalid configuration.
    Input,
    /// No experiment, no runs, malformed reference, artifact not found.
    Resolution,
    /// Scoring data no longer matches the fitted feature schema.
    SchemaDrift,
    /// Read or write failure against the run registry.
    Registry,
    /// Anything else.
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::SchemaDrift => "schema_drift",
            ErrorCategory::Registry => "registry",
            ErrorCategory::Internal => "internal",
        }
    }

    /// Process exit code for this category. `0` is reserved for success.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::Internal => 1,
            ErrorCategory::Input => 2,
            ErrorCategory::Resolution => 3,
            ErrorCategory::SchemaDrift => 4,
            ErrorCategory::Registry => 5,
        }
    }
}

/// Failure to turn a model reference into a loadable artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolutionError {
    /// The experiment name is unknown to the registry.
    #[error("Experiment '{0}' not found")]
    ExperimentNotFound(String),

    /// The experiment exists but holds no finished run.
    #[error("No finished runs found in experiment '{experiment}'")]
    NoRuns {
        /// Name of the experiment that was searched.
        experiment: String,
    },

    /// The run identifier is unknown to the registry.
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// The reference does not follow `runs:/<run_id>/<artifact_path>`.
    #[error("Malformed model reference '{0}', expected runs:/<run_id>/<artifact_path>")]
    MalformedUri(String),

    /// The run exists but the artifact does not.
    #[error("Artifact '{path}' not found in run '{run_id}'")]
    ArtifactNotFound {
        /// Run that was searched.
        run_id: String,
        /// Artifact path within the run.
        path: String,
    },
}

/// The main error type for anomaly-learning operations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AnomalyError {
    /// Invalid configuration provided to the trainer or scorer.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid data provided for training or scoring.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Preprocessing failed, including schema drift at score time.
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// A model reference could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The registry rejected or failed a request.
    #[error("Registry error during {operation}: {message}")]
    Registry {
        /// Registry operation that failed (e.g. `create_run`).
        operation: String,
        /// Details reported by the back-end.
        message: String,
    },

    /// A stored artifact could not be decoded as a fitted pipeline.
    #[error("Unreadable model artifact: {0}")]
    ModelFormat(String),

    /// Fitting the isolation forest failed.
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<AnomalyError>,
    },
}

impl AnomalyError {
    /// Shorthand for a [`Registry`](Self::Registry) error.
    pub fn registry(operation: impl Into<String>, message: impl ToString) -> Self {
        AnomalyError::Registry {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        AnomalyError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig(_) | Self::InvalidData(_) | Self::Polars(_) => {
                ErrorCategory::Input
            }
            Self::Processing(e) if e.is_schema_drift() => ErrorCategory::SchemaDrift,
            Self::Processing(e) if e.is_input_error() => ErrorCategory::Input,
            Self::Processing(ProcessingError::InvalidConfig(_)) => ErrorCategory::Input,
            Self::Processing(_) => ErrorCategory::Internal,
            Self::Resolution(_) | Self::ModelFormat(_) => ErrorCategory::Resolution,
            Self::Registry { .. } => ErrorCategory::Registry,
            Self::TrainingFailed(_) | Self::Io(_) | Self::Json(_) => ErrorCategory::Internal,
            Self::WithContext { source, .. } => source.category(),
        }
    }

    /// Get a stable error code for machine consumption.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidData(_) => "INVALID_DATA",
            Self::Processing(e) => e.error_code(),
            Self::Resolution(e) => match e {
                ResolutionError::ExperimentNotFound(_) => "EXPERIMENT_NOT_FOUND",
                ResolutionError::NoRuns { .. } => "NO_RUNS",
                ResolutionError::RunNotFound(_) => "RUN_NOT_FOUND",
                ResolutionError::MalformedUri(_) => "MALFORMED_URI",
                ResolutionError::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            },
            Self::Registry { .. } => "REGISTRY_ERROR",
            Self::ModelFormat(_) => "MODEL_FORMAT",
            Self::TrainingFailed(_) => "TRAINING_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }
}

impl Serialize for AnomalyError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("AnomalyError", 3)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("category", &self.category())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for anomaly-learning operations.
pub type Result<T> = std::result::Result<T, AnomalyError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<AnomalyError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

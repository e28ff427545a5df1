//! Custom error types for the feature preprocessing pipeline.
//!
//! This module provides the error hierarchy using `thiserror` so that every
//! failure carries enough context to tell bad input apart from schema drift.
//!
//! Errors are serializable as `{code, message}` pairs so the CLI can emit
//! machine-readable failures for the scheduler.

use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// The main error type for preprocessing.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The dataset has no rows.
    #[error("Dataset is empty")]
    EmptyDataset,

    /// No column survived date handling and schema partitioning.
    #[error("No usable feature columns remain after date handling")]
    NoUsableColumns,

    /// The scoring dataset lacks columns that the fitted schema requires.
    #[error("Dataset is missing columns required by the fitted schema: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// A column arrived with a dtype incompatible with its fitted kind.
    #[error("Column '{column}' was fitted as {expected} but has dtype {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    /// No valid values found in a column for computation.
    #[error("No valid values found in column '{0}'")]
    NoValidValues(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The input file could not be read as CSV.
    #[error("Failed to read dataset '{path}': {reason}")]
    UnreadableDataset { path: String, reason: String },

    /// IO error wrapper.
    #[error("IO error: {0}")]
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
        source: Box<ProcessingError>,
    },
}

impl ProcessingError {
    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ProcessingError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Get a stable error code for machine consumption.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyDataset => "EMPTY_DATASET",
            Self::NoUsableColumns => "NO_USABLE_COLUMNS",
            Self::MissingColumns(_) => "MISSING_COLUMNS",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::NoValidValues(_) => "NO_VALID_VALUES",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::UnreadableDataset { .. } => "UNREADABLE_DATASET",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Check if this error means the data no longer matches the fitted schema.
    ///
    /// Unseen categorical values never produce an error, so only missing
    /// columns and dtype changes land here.
    pub fn is_schema_drift(&self) -> bool {
        match self {
            Self::MissingColumns(_) | Self::TypeMismatch { .. } => true,
            Self::WithContext { source, .. } => source.is_schema_drift(),
            _ => false,
        }
    }

    /// Check if this error was caused by the input dataset itself.
    pub fn is_input_error(&self) -> bool {
        match self {
            Self::EmptyDataset
            | Self::NoUsableColumns
            | Self::NoValidValues(_)
            | Self::UnreadableDataset { .. }
            | Self::Io(_)
            | Self::Polars(_) => true,
            Self::WithContext { source, .. } => source.is_input_error(),
            _ => false,
        }
    }
}

impl Serialize for ProcessingError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("ProcessingError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for preprocessing operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ProcessingError::Polars(e).with_context(context))
    }
}

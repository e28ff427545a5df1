//! Configuration types for the preprocessing pipeline.
//!
//! This module provides configuration options using the builder pattern
//! for flexible and ergonomic pipeline setup.

use serde::{Deserialize, Serialize};

/// Name of the timestamp column in the traffic accident exports.
pub const DEFAULT_DATE_COLUMN: &str = "crash_date";

/// Fill value used by [`CategoricalImputation::Constant`].
pub const DEFAULT_CATEGORICAL_FILL: &str = "Unknown";

/// Strategy for imputing missing numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NumericImputation {
    /// Use the mean of non-null values
    Mean,
    /// Use the median of non-null values
    #[default]
    Median,
}

/// Strategy for imputing missing categorical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CategoricalImputation {
    /// Use the most frequent value (mode)
    #[default]
    Mode,
    /// Use a constant value ("Unknown")
    Constant,
}

/// Configuration for the preprocessing pipeline.
///
/// Use [`PreprocessingConfig::builder()`] to create a new configuration
/// with fluent API.
///
/// # Example
///
/// ```rust,ignore
/// use anomaly_processing::config::PreprocessingConfig;
///
/// let config = PreprocessingConfig::builder()
///     .use_date_features(true)
///     .date_column("crash_date")
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Whether to expand the timestamp column into year/month/day features.
    /// Default: false
    pub use_date_features: bool,

    /// Name of the timestamp column to expand.
    /// Default: "crash_date"
    pub date_column: String,

    /// Additional chrono format strings tried after the built-in ones.
    /// Default: empty
    pub extra_date_formats: Vec<String>,

    /// Strategy for imputing missing numeric values.
    /// Default: Median
    pub numeric_imputation: NumericImputation,

    /// Strategy for imputing missing categorical values.
    /// Default: Mode
    pub categorical_imputation: CategoricalImputation,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            use_date_features: false,
            date_column: DEFAULT_DATE_COLUMN.to_string(),
            extra_date_formats: Vec::new(),
            numeric_imputation: NumericImputation::default(),
            categorical_imputation: CategoricalImputation::default(),
        }
    }
}

impl PreprocessingConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PreprocessingConfigBuilder {
        PreprocessingConfigBuilder::default()
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.date_column.trim().is_empty() {
            return Err(ConfigValidationError::EmptyDateColumn);
        }

        if let Some(format) = self
            .extra_date_formats
            .iter()
            .find(|f| f.trim().is_empty())
        {
            return Err(ConfigValidationError::InvalidDateFormat(format.clone()));
        }

        Ok(())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Date column name must not be empty")]
    EmptyDateColumn,

    #[error("Invalid date format: '{0}'")]
    InvalidDateFormat(String),
}

/// Builder for [`PreprocessingConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct PreprocessingConfigBuilder {
    use_date_features: Option<bool>,
    date_column: Option<String>,
    extra_date_formats: Vec<String>,
    numeric_imputation: Option<NumericImputation>,
    categorical_imputation: Option<CategoricalImputation>,
}

impl PreprocessingConfigBuilder {
    /// Enable or disable year/month/day derivation from the date column.
    pub fn use_date_features(mut self, enable: bool) -> Self {
        self.use_date_features = Some(enable);
        self
    }

    /// Set the name of the timestamp column.
    pub fn date_column(mut self, column: impl Into<String>) -> Self {
        self.date_column = Some(column.into());
        self
    }

    /// Add a chrono format string to try when parsing dates.
    pub fn date_format(mut self, format: impl Into<String>) -> Self {
        self.extra_date_formats.push(format.into());
        self
    }

    /// Set the numeric imputation strategy.
    pub fn numeric_imputation(mut self, strategy: NumericImputation) -> Self {
        self.numeric_imputation = Some(strategy);
        self
    }

    /// Set the categorical imputation strategy.
    pub fn categorical_imputation(mut self, strategy: CategoricalImputation) -> Self {
        self.categorical_imputation = Some(strategy);
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `PreprocessingConfig` or an error if validation fails.
    pub fn build(self) -> Result<PreprocessingConfig, ConfigValidationError> {
        let config = PreprocessingConfig {
            use_date_features: self.use_date_features.unwrap_or(false),
            date_column: self
                .date_column
                .unwrap_or_else(|| DEFAULT_DATE_COLUMN.to_string()),
            extra_date_formats: self.extra_date_formats,
            numeric_imputation: self.numeric_imputation.unwrap_or_default(),
            categorical_imputation: self.categorical_imputation.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

//! Configuration types for training, scoring and the runtime environment.
//!
//! This module provides [`ForestConfig`], [`TrainingConfig`] and
//! [`ScoringConfig`] with their builders, plus [`RuntimeConfig`] which is read
//! once from the environment in `main` and passed down explicitly.
//!
//! # Example
//!
//! ```
//! use anomaly_learning::{Contamination, ForestConfig, MaxSamples, TrainingConfig};
//!
//! let forest = ForestConfig::builder()
//!     .n_estimators(100)
//!     .max_samples(MaxSamples::Count(128))
//!     .contamination(Contamination::Fixed(0.05))
//!     .random_seed(7)
//!     .build()
//!     .expect("valid config");
//!
//! let config = TrainingConfig::builder()
//!     .forest(forest)
//!     .experiment_name("traffic_anomaly_detection")
//!     .build()
//!     .expect("valid config");
//! ```

use crate::error::AnomalyError;
use anomaly_processing::PreprocessingConfig;
use serde::{Deserialize, Serialize};

/// Experiment used when none is configured.
pub const DEFAULT_EXPERIMENT_NAME: &str = "traffic_anomaly_detection";

/// Registry used when the environment names none.
pub const DEFAULT_REGISTRY_URI: &str = "file:./mlruns";

/// Artifact path the fitted pipeline is logged under.
pub const DEFAULT_ARTIFACT_PATH: &str = "model";

/// Environment variable naming the registry endpoint.
pub const ENV_REGISTRY_URI: &str = "ANOMALY_REGISTRY_URI";

/// Fallback environment variable, kept for MLflow deployments.
pub const ENV_MLFLOW_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";

/// Environment variable naming the experiment.
pub const ENV_EXPERIMENT_NAME: &str = "ANOMALY_EXPERIMENT_NAME";

/// Number of records drawn to build each isolation tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaxSamples {
    /// `min(256, n_rows)`.
    #[default]
    Auto,
    /// An absolute count, capped at `n_rows`.
    Count(usize),
    /// A fraction of `n_rows` in `(0, 1]`.
    Fraction(f64),
}

impl MaxSamples {
    /// Resolve to a concrete sample size for a dataset of `n_rows` records.
    #[must_use]
    pub fn resolve(&self, n_rows: usize) -> usize {
        let size = match *self {
            MaxSamples::Auto => n_rows.min(256),
            MaxSamples::Count(k) => k.min(n_rows),
            MaxSamples::Fraction(f) => (f * n_rows as f64) as usize,
        };
        size.max(1)
    }
}

/// How the decision threshold is placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Contamination {
    /// Fixed offset of `-0.5` on the raw score.
    #[default]
    Auto,
    /// Expected anomaly fraction in `(0, 0.5]`; the offset becomes that
    /// percentile of the training scores.
    Fixed(f64),
}

/// Hyperparameters of the isolation forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    /// Number of isolation trees (default: 200).
    pub n_estimators: usize,

    /// Records drawn per tree (default: [`MaxSamples::Auto`]).
    pub max_samples: MaxSamples,

    /// Threshold placement (default: [`Contamination::Auto`]).
    pub contamination: Contamination,

    /// Draw records with replacement (default: false).
    pub bootstrap: bool,

    /// Random seed for reproducibility (default: 42).
    pub random_seed: u64,

    /// Number of parallel jobs (default: -1 for all cores).
    ///
    /// - `-1`: Use all available CPU cores
    /// - `1`: Single-threaded (useful for debugging)
    /// - `n > 1`: Use exactly `n` cores
    ///
    /// Results are identical for every value.
    pub n_jobs: i32,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_samples: MaxSamples::Auto,
            contamination: Contamination::Auto,
            bootstrap: false,
            random_seed: 42,
            n_jobs: -1,
        }
    }
}

impl ForestConfig {
    #[must_use]
    pub fn builder() -> ForestConfigBuilder {
        ForestConfigBuilder::default()
    }

    /// Validate the forest settings.
    pub fn validate(&self) -> Result<(), AnomalyError> {
        if self.n_estimators == 0 {
            return Err(AnomalyError::InvalidConfig(
                "n_estimators must be at least 1".to_string(),
            ));
        }

        match self.max_samples {
            MaxSamples::Count(0) => {
                return Err(AnomalyError::InvalidConfig(
                    "max_samples must be at least 1".to_string(),
                ));
            }
            MaxSamples::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(AnomalyError::InvalidConfig(
                    "max_samples fraction must be in (0.0, 1.0]".to_string(),
                ));
            }
            _ => {}
        }

        if let Contamination::Fixed(p) = self.contamination {
            if !(p > 0.0 && p <= 0.5) {
                return Err(AnomalyError::InvalidConfig(
                    "contamination must be in (0.0, 0.5]".to_string(),
                ));
            }
        }

        if self.n_jobs == 0 || self.n_jobs < -1 {
            return Err(AnomalyError::InvalidConfig(
                "n_jobs must be -1 or a positive number".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`ForestConfig`].
#[derive(Debug, Clone, Default)]
pub struct ForestConfigBuilder {
    config: ForestConfig,
}

impl ForestConfigBuilder {
    #[must_use]
    pub fn n_estimators(mut self, n: usize) -> Self {
        self.config.n_estimators = n;
        self
    }

    #[must_use]
    pub fn max_samples(mut self, max_samples: MaxSamples) -> Self {
        self.config.max_samples = max_samples;
        self
    }

    #[must_use]
    pub fn contamination(mut self, contamination: Contamination) -> Self {
        self.config.contamination = contamination;
        self
    }

    #[must_use]
    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    #[must_use]
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.config.random_seed = seed;
        self
    }

    #[must_use]
    pub fn n_jobs(mut self, jobs: i32) -> Self {
        self.config.n_jobs = jobs;
        self
    }

    /// Build the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::InvalidConfig`] if:
    /// - `n_estimators` is 0
    /// - `max_samples` is `Count(0)` or a fraction outside `(0.0, 1.0]`
    /// - `contamination` is `Fixed(p)` with `p` outside `(0.0, 0.5]`
    /// - `n_jobs` is 0 or below -1
    pub fn build(self) -> Result<ForestConfig, AnomalyError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Preprocessing settings (date features, imputation strategies).
    pub preprocessing: PreprocessingConfig,

    /// Isolation forest hyperparameters.
    pub forest: ForestConfig,

    /// Experiment the run is registered under.
    pub experiment_name: String,

    /// Artifact path of the logged pipeline (default: `model`).
    pub artifact_path: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            preprocessing: PreprocessingConfig::default(),
            forest: ForestConfig::default(),
            experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
            artifact_path: DEFAULT_ARTIFACT_PATH.to_string(),
        }
    }
}

impl TrainingConfig {
    #[must_use]
    pub fn builder() -> TrainingConfigBuilder {
        TrainingConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), AnomalyError> {
        self.preprocessing
            .validate()
            .map_err(|e| AnomalyError::InvalidConfig(e.to_string()))?;
        self.forest.validate()?;

        if self.experiment_name.trim().is_empty() {
            return Err(AnomalyError::InvalidConfig(
                "experiment_name must not be empty".to_string(),
            ));
        }
        validate_artifact_path(&self.artifact_path)
    }
}

/// Builder for [`TrainingConfig`].
#[derive(Debug, Clone, Default)]
pub struct TrainingConfigBuilder {
    config: TrainingConfig,
}

impl TrainingConfigBuilder {
    #[must_use]
    pub fn preprocessing(mut self, preprocessing: PreprocessingConfig) -> Self {
        self.config.preprocessing = preprocessing;
        self
    }

    #[must_use]
    pub fn forest(mut self, forest: ForestConfig) -> Self {
        self.config.forest = forest;
        self
    }

    #[must_use]
    pub fn experiment_name(mut self, name: impl Into<String>) -> Self {
        self.config.experiment_name = name.into();
        self
    }

    #[must_use]
    pub fn artifact_path(mut self, path: impl Into<String>) -> Self {
        self.config.artifact_path = path.into();
        self
    }

    pub fn build(self) -> Result<TrainingConfig, AnomalyError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// How `anomaly_label` is written to the scored dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelFormat {
    /// `-1` for anomalies, `1` for normal records.
    #[default]
    Numeric,
    /// `anomaly` / `normal`.
    Text,
}

/// Configuration of a scoring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Experiment searched when resolving `latest`.
    pub experiment_name: String,

    /// Encoding of the `anomaly_label` column (default: numeric).
    pub label_format: LabelFormat,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
            label_format: LabelFormat::default(),
        }
    }
}

impl ScoringConfig {
    #[must_use]
    pub fn builder() -> ScoringConfigBuilder {
        ScoringConfigBuilder::default()
    }
}

/// Builder for [`ScoringConfig`].
#[derive(Debug, Clone, Default)]
pub struct ScoringConfigBuilder {
    config: ScoringConfig,
}

impl ScoringConfigBuilder {
    #[must_use]
    pub fn experiment_name(mut self, name: impl Into<String>) -> Self {
        self.config.experiment_name = name.into();
        self
    }

    #[must_use]
    pub fn label_format(mut self, format: LabelFormat) -> Self {
        self.config.label_format = format;
        self
    }

    pub fn build(self) -> Result<ScoringConfig, AnomalyError> {
        if self.config.experiment_name.trim().is_empty() {
            return Err(AnomalyError::InvalidConfig(
                "experiment_name must not be empty".to_string(),
            ));
        }
        Ok(self.config)
    }
}

/// Process-wide settings taken from the environment.
///
/// Built once at startup and handed to every component that needs it;
/// nothing in the library reads the environment on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Registry endpoint: `file:<dir>`, a plain path, `memory:` or `http(s)://...`.
    pub registry_uri: String,

    /// Default experiment name.
    pub experiment_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            registry_uri: DEFAULT_REGISTRY_URI.to_string(),
            experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            registry_uri: non_empty(ENV_REGISTRY_URI)
                .or_else(|| non_empty(ENV_MLFLOW_TRACKING_URI))
                .unwrap_or_else(|| DEFAULT_REGISTRY_URI.to_string()),
            experiment_name: non_empty(ENV_EXPERIMENT_NAME)
                .unwrap_or_else(|| DEFAULT_EXPERIMENT_NAME.to_string()),
        }
    }
}

fn validate_artifact_path(path: &str) -> Result<(), AnomalyError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(AnomalyError::InvalidConfig(format!(
            "artifact_path '{path}' must be a relative path without '..' segments"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_forest_config() {
        let config = ForestConfig::default();
        assert_eq!(config.n_estimators, 200);
        assert_eq!(config.max_samples, MaxSamples::Auto);
        assert_eq!(config.contamination, Contamination::Auto);
        assert_eq!(config.random_seed, 42);
        assert!(!config.bootstrap);
    }

    #[test]
    fn test_max_samples_resolve() {
        assert_eq!(MaxSamples::Auto.resolve(1000), 256);
        assert_eq!(MaxSamples::Auto.resolve(100), 100);
        assert_eq!(MaxSamples::Count(500).resolve(100), 100);
        assert_eq!(MaxSamples::Count(64).resolve(100), 64);
        assert_eq!(MaxSamples::Fraction(0.5).resolve(100), 50);
        assert_eq!(MaxSamples::Fraction(0.001).resolve(100), 1);
    }

    #[test]
    fn test_invalid_forest_settings() {
        let result = ForestConfig::builder().n_estimators(0).build();
        assert!(result.unwrap_err().to_string().contains("n_estimators"));

        let result = ForestConfig::builder()
            .contamination(Contamination::Fixed(0.7))
            .build();
        assert!(result.unwrap_err().to_string().contains("contamination"));

        let result = ForestConfig::builder()
            .max_samples(MaxSamples::Fraction(1.5))
            .build();
        assert!(result.unwrap_err().to_string().contains("max_samples"));

        let result = ForestConfig::builder().n_jobs(0).build();
        assert!(result.unwrap_err().to_string().contains("n_jobs"));
    }

    #[test]
    fn test_training_config_rejects_bad_artifact_path() {
        assert!(TrainingConfig::builder().artifact_path("../escape").build().is_err());
        assert!(TrainingConfig::builder().artifact_path("").build().is_err());
        assert!(TrainingConfig::builder().artifact_path("models/iforest").build().is_ok());
    }

    #[test]
    fn test_runtime_config_lookup_order() {
        let env: HashMap<&str, &str> = [
            (ENV_MLFLOW_TRACKING_URI, "http://mlflow:5000"),
            (ENV_EXPERIMENT_NAME, "nightly"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.registry_uri, "http://mlflow:5000");
        assert_eq!(config.experiment_name, "nightly");

        let env: HashMap<&str, &str> = [
            (ENV_REGISTRY_URI, "memory:"),
            (ENV_MLFLOW_TRACKING_URI, "http://mlflow:5000"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.registry_uri, "memory:");
        assert_eq!(config.experiment_name, DEFAULT_EXPERIMENT_NAME);
    }

    #[test]
    fn test_runtime_config_defaults() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_forest_config_json() {
        let config = ForestConfig::builder()
            .max_samples(MaxSamples::Fraction(0.25))
            .contamination(Contamination::Fixed(0.1))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""max_samples":{"fraction":0.25}"#));
        let parsed: ForestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}

//! Fitted pipeline: frozen preprocessing plus the trained forest.
//!
//! This module provides [`FittedPipeline`], the single artifact produced by a
//! training job and consumed by scoring:
//!
//! - **Scoring** via [`score()`](FittedPipeline::score)
//! - **Serialization** via [`save()`](FittedPipeline::save), [`load()`](FittedPipeline::load),
//!   [`to_bytes()`](FittedPipeline::to_bytes) and [`from_bytes()`](FittedPipeline::from_bytes)
//!
//! # Serialization Format
//!
//! The artifact is a JSON document. Floats are written with enough digits to
//! round-trip exactly, so a reloaded pipeline produces bit-identical scores.
//!
//! ```rust,ignore
//! let bytes = pipeline.to_bytes()?;
//! let restored = FittedPipeline::from_bytes(&bytes)?;
//! assert_eq!(pipeline.score(&df)?, restored.score(&df)?);
//! ```

use crate::error::{AnomalyError, Result, ResultExt};
use crate::forest::IsolationForest;
use crate::types::Predictions;
use anomaly_processing::{FeatureSchema, FittedPreprocessor};
use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Version written into every artifact; bumped on incompatible layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// File name of the pipeline inside its artifact directory.
pub const MODEL_FILE_NAME: &str = "pipeline.json";

/// The trained preprocessing pipeline and isolation forest.
///
/// Immutable once built; cheap to share behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPipeline {
    format_version: u32,
    preprocessor: FittedPreprocessor,
    forest: IsolationForest,
    trained_at: DateTime<Utc>,
    training_rows: usize,
}

static_assertions::assert_impl_all!(FittedPipeline: Send, Sync);

impl FittedPipeline {
    pub fn new(
        preprocessor: FittedPreprocessor,
        forest: IsolationForest,
        training_rows: usize,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            preprocessor,
            forest,
            trained_at: Utc::now(),
            training_rows,
        }
    }

    pub fn preprocessor(&self) -> &FittedPreprocessor {
        &self.preprocessor
    }

    pub fn forest(&self) -> &IsolationForest {
        &self.forest
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.preprocessor.schema()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.preprocessor.feature_names()
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn training_rows(&self) -> usize {
        self.training_rows
    }

    /// Label and score every record of `df` with the frozen pipeline.
    ///
    /// # Errors
    ///
    /// Schema drift (missing columns, numeric column arriving as text) is
    /// reported as [`AnomalyError::Processing`] with a schema-drift category.
    pub fn score(&self, df: &DataFrame) -> Result<Predictions> {
        let features = self.preprocessor.transform(df)?;
        self.forest.predictions(&features)
    }

    /// Serialize to the artifact byte format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from the artifact byte format.
    ///
    /// # Errors
    ///
    /// [`AnomalyError::ModelFormat`] when the bytes are not a pipeline or were
    /// written by an incompatible version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let pipeline: Self = serde_json::from_slice(bytes)
            .map_err(|e| AnomalyError::ModelFormat(e.to_string()))?;

        if pipeline.format_version != FORMAT_VERSION {
            return Err(AnomalyError::ModelFormat(format!(
                "artifact format version {} is not supported (expected {})",
                pipeline.format_version, FORMAT_VERSION
            )));
        }
        if pipeline.forest.n_features() != pipeline.preprocessor.n_features() {
            return Err(AnomalyError::ModelFormat(format!(
                "forest expects {} features but preprocessing produces {}",
                pipeline.forest.n_features(),
                pipeline.preprocessor.n_features()
            )));
        }
        Ok(pipeline)
    }

    /// Write the artifact to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_bytes()?)
            .context(format!("Failed to write pipeline to '{}'", path.display()))
    }

    /// Read an artifact from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).context(format!("Failed to read pipeline from '{}'", path.display()))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForestConfig, TrainingConfig};
    use crate::training::Trainer;
    use polars::prelude::*;

    fn fitted() -> (FittedPipeline, DataFrame) {
        let df = df!(
            "num_units" => (0..40).map(|i| 1 + i % 3).collect::<Vec<i64>>(),
            "injuries_total" => (0..40).map(|i| (i % 5) as f64).collect::<Vec<f64>>(),
            "lighting_condition" => (0..40)
                .map(|i| if i % 2 == 0 { "DAYLIGHT" } else { "DARKNESS" })
                .collect::<Vec<&str>>(),
        )
        .unwrap();
        let config = TrainingConfig::builder()
            .forest(ForestConfig::builder().n_estimators(10).build().unwrap())
            .build()
            .unwrap();
        let (pipeline, _) = Trainer::builder().config(config).build().fit(&df).unwrap();
        (pipeline, df)
    }

    #[test]
    fn test_save_and_load_scores_identically() {
        let (pipeline, df) = fitted();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MODEL_FILE_NAME);

        pipeline.save(&path).unwrap();
        let restored = FittedPipeline::load(&path).unwrap();

        assert_eq!(restored, pipeline);
        assert_eq!(restored.score(&df).unwrap(), pipeline.score(&df).unwrap());
    }

    #[test]
    fn test_rejects_unknown_format_version() {
        let (pipeline, _) = fitted();
        let mut value: serde_json::Value =
            serde_json::from_slice(&pipeline.to_bytes().unwrap()).unwrap();
        value["format_version"] = serde_json::json!(FORMAT_VERSION + 1);

        let err = FittedPipeline::from_bytes(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert_eq!(err.error_code(), "MODEL_FORMAT");
    }

    #[test]
    fn test_rejects_garbage() {
        let err = FittedPipeline::from_bytes(b"not a pipeline").unwrap_err();
        assert!(matches!(err, AnomalyError::ModelFormat(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FittedPipeline::load(dir.path().join("missing.json")).is_err());
    }
}

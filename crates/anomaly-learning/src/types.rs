//! Common types used throughout the anomaly-learning crate.
//!
//! - [`AnomalyLabel`]: Per-record verdict
//! - [`Predictions`]: Labels and scores for a batch of records
//! - [`TrainingResult`]: Outcome of [`Trainer::train()`](crate::Trainer::train)
//! - [`ScoringResult`]: Outcome of [`Scorer::score()`](crate::Scorer::score)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyLabel {
    Normal,
    Anomaly,
}

impl AnomalyLabel {
    /// Label implied by a decision score: anomalous exactly when negative.
    #[must_use]
    pub fn from_decision(score: f64) -> Self {
        if score < 0.0 {
            AnomalyLabel::Anomaly
        } else {
            AnomalyLabel::Normal
        }
    }

    /// Numeric encoding: `-1` anomaly, `1` normal.
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        match self {
            AnomalyLabel::Normal => 1,
            AnomalyLabel::Anomaly => -1,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyLabel::Normal => "normal",
            AnomalyLabel::Anomaly => "anomaly",
        }
    }

    #[must_use]
    pub fn is_anomaly(&self) -> bool {
        matches!(self, AnomalyLabel::Anomaly)
    }
}

impl fmt::Display for AnomalyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels and decision scores for a batch, in input row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    /// Per-record verdicts.
    pub labels: Vec<AnomalyLabel>,

    /// Per-record decision scores; lower is more anomalous, negative is anomalous.
    pub scores: Vec<f64>,
}

impl Predictions {
    /// Derive labels from decision scores.
    #[must_use]
    pub fn from_scores(scores: Vec<f64>) -> Self {
        let labels = scores.iter().map(|s| AnomalyLabel::from_decision(*s)).collect();
        Self { labels, scores }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn n_anomalies(&self) -> usize {
        self.labels.iter().filter(|l| l.is_anomaly()).count()
    }

    /// Fraction of records labelled anomalous, `0.0` for an empty batch.
    pub fn anomaly_rate(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.n_anomalies() as f64 / self.len() as f64
    }
}

/// Result of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TrainingResult {
    /// Registry run the pipeline was logged to.
    pub run_id: String,

    /// Experiment holding the run.
    pub experiment_id: String,

    /// Reference to the logged pipeline, `runs:/<run_id>/<artifact_path>`.
    pub model_uri: String,

    /// Fraction of training records labelled anomalous by the self-check.
    pub anomaly_rate: f64,

    /// Training records.
    pub n_rows: usize,

    /// Width of the feature matrix.
    pub n_features: usize,

    /// Wall-clock time from start to finish.
    pub training_time_seconds: f64,
}

/// Result of a scoring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ScoringResult {
    /// Reference of the pipeline that produced the scores.
    pub model_uri: String,

    /// Scored records.
    pub n_rows: usize,

    /// Records labelled anomalous.
    pub n_anomalies: usize,

    /// `n_anomalies / n_rows`.
    pub anomaly_rate: f64,

    /// Lowest decision score of the batch.
    pub min_score: f64,

    /// Highest decision score of the batch.
    pub max_score: f64,
}

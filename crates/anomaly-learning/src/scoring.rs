//! Scoring job.
//!
//! Resolves a fitted pipeline from the registry, applies it unchanged to a new
//! dataset and emits the dataset with two extra columns:
//!
//! - `anomaly_label` - `-1` anomaly / `1` normal (or text, see [`LabelFormat`])
//! - `anomaly_score` - decision score, lower is more anomalous, negative is anomalous
//!
//! # Model references
//!
//! A [`ModelReference`] is either `latest` or an explicit
//! `runs:/<run_id>/<artifact_path>`. `latest` resolves in two steps, both pure
//! functions of registry state: [`resolve_latest_run`] picks the finished run
//! with the newest start time, [`artifact_reference`] names its pipeline.

use crate::config::{DEFAULT_ARTIFACT_PATH, LabelFormat, ScoringConfig};
use crate::error::{AnomalyError, ResolutionError, Result, ResultExt};
use crate::model::FittedPipeline;
use crate::registry::{ModelUri, RunInfo, RunRegistry, RunSearch};
use crate::reporting::Reporter;
use crate::types::{Predictions, ScoringResult};
use anomaly_processing::{ProcessingError, write_csv};
use polars::prelude::*;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output column holding the per-record verdict.
pub const LABEL_COLUMN: &str = "anomaly_label";

/// Output column holding the decision score.
pub const SCORE_COLUMN: &str = "anomaly_score";

/// Which trained pipeline to score with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModelReference {
    /// The newest finished run of the configured experiment.
    #[default]
    Latest,
    /// A specific run artifact.
    Explicit(ModelUri),
}

impl FromStr for ModelReference {
    type Err = ResolutionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            Ok(ModelReference::Latest)
        } else {
            s.parse().map(ModelReference::Explicit)
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelReference::Latest => f.write_str("latest"),
            ModelReference::Explicit(uri) => write!(f, "{uri}"),
        }
    }
}

/// The finished run with the newest start time in `experiment_name`.
///
/// # Errors
///
/// [`ResolutionError::ExperimentNotFound`] or [`ResolutionError::NoRuns`].
pub fn resolve_latest_run(registry: &dyn RunRegistry, experiment_name: &str) -> Result<RunInfo> {
    let experiment = registry
        .get_experiment_by_name(experiment_name)?
        .ok_or_else(|| ResolutionError::ExperimentNotFound(experiment_name.to_string()))?;

    let run = registry
        .search_runs(&experiment.experiment_id, &RunSearch::latest_finished())?
        .into_iter()
        .next()
        .ok_or_else(|| ResolutionError::NoRuns {
            experiment: experiment_name.to_string(),
        })?;

    debug!(
        "Latest run of '{}' is {} (started {})",
        experiment_name, run.run_id, run.start_time
    );
    Ok(run)
}

/// Reference to the pipeline a training run logged.
///
/// Uses the artifact path the run was tagged with, falling back to
/// [`DEFAULT_ARTIFACT_PATH`] for runs that carry no tag.
#[must_use]
pub fn artifact_reference(run: &RunInfo) -> ModelUri {
    let path = run.model_path().unwrap_or(DEFAULT_ARTIFACT_PATH);
    ModelUri::new(run.run_id.clone(), path)
}

/// A scored dataset with its predictions.
#[derive(Debug, Clone)]
pub struct ScoredDataset {
    /// Input columns followed by `anomaly_label` and `anomaly_score`.
    pub frame: DataFrame,
    pub predictions: Predictions,
    pub result: ScoringResult,
}

/// Runs scoring jobs.
pub struct Scorer {
    config: ScoringConfig,
    reporter: Option<Arc<dyn Reporter>>,
}

impl fmt::Debug for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scorer")
            .field("config", &self.config)
            .field("reporter", &self.reporter.as_ref().map(|_| "<reporter>"))
            .finish()
    }
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            reporter: None,
        }
    }

    /// Run `reporter` after every written dataset.
    #[must_use]
    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Turn a reference into an explicit artifact URI.
    pub fn resolve(
        &self,
        registry: &dyn RunRegistry,
        reference: &ModelReference,
    ) -> Result<ModelUri> {
        match reference {
            ModelReference::Explicit(uri) => Ok(uri.clone()),
            ModelReference::Latest => {
                let run = resolve_latest_run(registry, &self.config.experiment_name)?;
                let uri = artifact_reference(&run);
                info!("Using latest run: {}", run.run_id);
                Ok(uri)
            }
        }
    }

    /// Resolve and load a pipeline.
    pub fn load(
        &self,
        registry: &dyn RunRegistry,
        reference: &ModelReference,
    ) -> Result<(ModelUri, FittedPipeline)> {
        let uri = self.resolve(registry, reference)?;
        let pipeline = registry
            .load_model(&uri)
            .context(format!("Loading pipeline {uri}"))?;
        debug!(
            "Loaded pipeline trained at {} on {} rows",
            pipeline.trained_at(),
            pipeline.training_rows()
        );
        Ok((uri, pipeline))
    }

    /// Resolve a pipeline from `registry` and score `df` with it.
    pub fn score(
        &self,
        df: &DataFrame,
        registry: &dyn RunRegistry,
        reference: &ModelReference,
    ) -> Result<ScoredDataset> {
        let (uri, pipeline) = self.load(registry, reference)?;
        self.score_with(&pipeline, &uri.to_string(), df)
    }

    /// Score `df` with an already loaded pipeline.
    pub fn score_with(
        &self,
        pipeline: &FittedPipeline,
        model_uri: &str,
        df: &DataFrame,
    ) -> Result<ScoredDataset> {
        if df.height() == 0 {
            return Err(ProcessingError::EmptyDataset.into());
        }

        let predictions = pipeline.score(df)?;
        let frame = append_predictions(df, &predictions, self.config.label_format)?;

        let min_score = predictions.scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max_score = predictions
            .scores
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let result = ScoringResult {
            model_uri: model_uri.to_string(),
            n_rows: predictions.len(),
            n_anomalies: predictions.n_anomalies(),
            anomaly_rate: predictions.anomaly_rate(),
            min_score,
            max_score,
        };

        info!(
            "Scored {} records with {}: {} anomalies ({:.2}%)",
            result.n_rows,
            result.model_uri,
            result.n_anomalies,
            result.anomaly_rate * 100.0
        );

        Ok(ScoredDataset {
            frame,
            predictions,
            result,
        })
    }

    /// Write the scored dataset to `out`, then report into `report_dir`.
    ///
    /// The CSV is replaced atomically. Reporter failures are logged and do not
    /// fail the call.
    pub fn write(
        &self,
        scored: &mut ScoredDataset,
        out: &Path,
        report_dir: Option<&Path>,
    ) -> Result<()> {
        write_csv(&mut scored.frame, out)
            .context(format!("Writing scored dataset to '{}'", out.display()))?;
        info!("Wrote scored file to {}", out.display());

        if let (Some(reporter), Some(dir)) = (&self.reporter, report_dir) {
            if let Err(e) = reporter.report(&scored.frame, dir) {
                warn!("Reporting failed, scored output is unaffected: {}", e);
            }
        }
        Ok(())
    }
}

/// Copy `df` and append the label and score columns.
///
/// Existing columns with the same names are replaced.
pub fn append_predictions(
    df: &DataFrame,
    predictions: &Predictions,
    format: LabelFormat,
) -> Result<DataFrame> {
    if predictions.len() != df.height() {
        return Err(AnomalyError::InvalidData(format!(
            "{} predictions for {} rows",
            predictions.len(),
            df.height()
        )));
    }

    let labels = match format {
        LabelFormat::Numeric => Series::new(
            LABEL_COLUMN.into(),
            predictions.labels.iter().map(|l| l.as_i32()).collect::<Vec<i32>>(),
        ),
        LabelFormat::Text => Series::new(
            LABEL_COLUMN.into(),
            predictions.labels.iter().map(|l| l.as_str()).collect::<Vec<&str>>(),
        ),
    };
    let scores = Series::new(SCORE_COLUMN.into(), predictions.scores.clone());

    let mut out = df.clone();
    out.with_column(labels)?;
    out.with_column(scores)?;
    Ok(out)
}

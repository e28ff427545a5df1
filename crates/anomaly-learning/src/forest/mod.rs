//! Isolation forest.
//!
//! An ensemble of randomised trees that isolate records by recursive random
//! splits. Records that isolate after few splits are anomalous.
//!
//! Scores follow the usual conventions:
//!
//! - `score_samples(x) = -2^(-E[h(x)] / c(max_samples))`, in `[-1, 0)`
//! - `decision_function(x) = score_samples(x) - offset`, negative means anomaly
//!
//! Fitting is deterministic for a given seed regardless of the number of
//! threads: every tree gets its own seed drawn in order from one master RNG.

mod tree;

pub use tree::{IsolationTree, average_path_length};

use crate::config::{Contamination, ForestConfig};
use crate::error::{AnomalyError, Result};
use crate::types::{AnomalyLabel, Predictions};
use anomaly_processing::{FeatureMatrix, percentile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Offset used with [`Contamination::Auto`].
pub const AUTO_OFFSET: f64 = -0.5;

/// A fitted isolation forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    max_samples: usize,
    n_features: usize,
    offset: f64,
}

static_assertions::assert_impl_all!(IsolationForest: Send, Sync);

impl IsolationForest {
    /// Fit a forest on a feature matrix.
    ///
    /// # Errors
    ///
    /// [`AnomalyError::InvalidConfig`] for an invalid configuration and
    /// [`AnomalyError::InvalidData`] for an empty or non-finite matrix.
    pub fn fit(data: &FeatureMatrix, config: &ForestConfig) -> Result<Self> {
        config.validate()?;

        if data.is_empty() || data.n_cols() == 0 {
            return Err(AnomalyError::InvalidData(
                "cannot fit an isolation forest on an empty feature matrix".to_string(),
            ));
        }
        if data.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(AnomalyError::InvalidData(
                "feature matrix contains non-finite values".to_string(),
            ));
        }

        let n_rows = data.n_rows();
        let max_samples = config.max_samples.resolve(n_rows);
        let max_depth = (max_samples.max(2) as f64).log2().ceil() as usize;

        let mut master = StdRng::seed_from_u64(config.random_seed);
        let tree_seeds: Vec<u64> = (0..config.n_estimators).map(|_| master.r#gen()).collect();

        debug!(
            "Growing {} trees: max_samples={}, max_depth={}, bootstrap={}",
            config.n_estimators, max_samples, max_depth, config.bootstrap
        );

        let bootstrap = config.bootstrap;
        let trees = with_thread_pool(config.n_jobs, || {
            tree_seeds
                .par_iter()
                .map(|seed| {
                    let mut rng = StdRng::seed_from_u64(*seed);
                    let sample = draw_sample(n_rows, max_samples, bootstrap, &mut rng);
                    IsolationTree::fit(data, &sample, max_depth, &mut rng)
                })
                .collect::<Vec<_>>()
        })?;

        let mut forest = Self {
            trees,
            max_samples,
            n_features: data.n_cols(),
            offset: AUTO_OFFSET,
        };

        if let Contamination::Fixed(p) = config.contamination {
            let scores = with_thread_pool(config.n_jobs, || forest.raw_scores(data))?;
            forest.offset = percentile(&scores, 100.0 * p).ok_or_else(|| {
                AnomalyError::TrainingFailed("no training scores to place the offset".to_string())
            })?;
        }

        debug!("Forest fitted, offset={}", forest.offset);
        Ok(forest)
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    /// Resolved per-tree sample size.
    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Width of the feature matrix the forest was fitted on.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Threshold subtracted from raw scores.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Raw anomaly scores in `[-1, 0)`; lower is more anomalous.
    pub fn score_samples(&self, data: &FeatureMatrix) -> Result<Vec<f64>> {
        self.check_width(data)?;
        Ok(self.raw_scores(data))
    }

    /// Raw scores shifted by the offset; negative means anomalous.
    pub fn decision_function(&self, data: &FeatureMatrix) -> Result<Vec<f64>> {
        let offset = self.offset;
        Ok(self
            .score_samples(data)?
            .into_iter()
            .map(|s| s - offset)
            .collect())
    }

    /// Per-record labels.
    pub fn predict(&self, data: &FeatureMatrix) -> Result<Vec<AnomalyLabel>> {
        Ok(self.predictions(data)?.labels)
    }

    /// Labels and decision scores in one pass.
    pub fn predictions(&self, data: &FeatureMatrix) -> Result<Predictions> {
        Ok(Predictions::from_scores(self.decision_function(data)?))
    }

    fn raw_scores(&self, data: &FeatureMatrix) -> Vec<f64> {
        let normaliser = average_path_length(self.max_samples);
        let n_trees = self.trees.len() as f64;

        (0..data.n_rows())
            .into_par_iter()
            .map(|i| {
                let row = data.row(i);
                // Summed in tree order so the result does not depend on scheduling
                let total: f64 = self.trees.iter().map(|t| t.path_length(row)).sum();
                let mean_depth = total / n_trees;
                if normaliser > 0.0 {
                    -(2f64.powf(-mean_depth / normaliser))
                } else {
                    // max_samples == 1: every record isolates immediately
                    -1.0
                }
            })
            .collect()
    }

    fn check_width(&self, data: &FeatureMatrix) -> Result<()> {
        if data.n_cols() != self.n_features {
            return Err(AnomalyError::InvalidData(format!(
                "feature matrix has {} columns, forest was fitted on {}",
                data.n_cols(),
                self.n_features
            )));
        }
        Ok(())
    }
}

/// Row indices used to grow one tree.
fn draw_sample(n_rows: usize, size: usize, bootstrap: bool, rng: &mut StdRng) -> Vec<usize> {
    if bootstrap {
        (0..size).map(|_| rng.gen_range(0..n_rows)).collect()
    } else if size >= n_rows {
        (0..n_rows).collect()
    } else {
        rand::seq::index::sample(rng, n_rows, size).into_vec()
    }
}

/// Run `op` on a dedicated pool when `n_jobs` is positive, else on the global pool.
fn with_thread_pool<T: Send>(n_jobs: i32, op: impl FnOnce() -> T + Send) -> Result<T> {
    if n_jobs <= 0 {
        return Ok(op());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_jobs as usize)
        .build()
        .map_err(|e| AnomalyError::TrainingFailed(format!("failed to build thread pool: {e}")))?;
    Ok(pool.install(op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaxSamples;

    /// Tight cluster around the origin plus a few far outliers at the end.
    fn clustered(n_inliers: usize) -> FeatureMatrix {
        let mut rng = StdRng::seed_from_u64(0);
        let mut rows: Vec<Vec<f64>> = (0..n_inliers)
            .map(|_| vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
            .collect();
        rows.push(vec![12.0, 12.0]);
        rows.push(vec![-15.0, 9.0]);
        rows.push(vec![10.0, -14.0]);
        FeatureMatrix::from_rows(rows).unwrap()
    }

    fn small_config() -> ForestConfig {
        ForestConfig::builder().n_estimators(100).build().unwrap()
    }

    #[test]
    fn test_outliers_score_lowest() {
        let data = clustered(200);
        let forest = IsolationForest::fit(&data, &small_config()).unwrap();
        let scores = forest.decision_function(&data).unwrap();

        let inlier_min = scores[..200].iter().cloned().fold(f64::INFINITY, f64::min);
        for outlier in &scores[200..] {
            assert!(*outlier < inlier_min);
            assert!(*outlier < 0.0);
        }
    }

    #[test]
    fn test_raw_scores_in_range() {
        let data = clustered(100);
        let forest = IsolationForest::fit(&data, &small_config()).unwrap();
        for s in forest.score_samples(&data).unwrap() {
            assert!((-1.0..0.0).contains(&s), "score {s} out of range");
        }
    }

    #[test]
    fn test_deterministic_across_thread_counts() {
        let data = clustered(150);
        let single = ForestConfig::builder().n_estimators(50).n_jobs(1).build().unwrap();
        let multi = ForestConfig::builder().n_estimators(50).n_jobs(4).build().unwrap();

        let a = IsolationForest::fit(&data, &single).unwrap();
        let b = IsolationForest::fit(&data, &multi).unwrap();

        assert_eq!(a, b);
        assert_eq!(
            a.decision_function(&data).unwrap(),
            b.decision_function(&data).unwrap()
        );
    }

    #[test]
    fn test_different_seed_different_forest() {
        let data = clustered(100);
        let a = IsolationForest::fit(&data, &small_config()).unwrap();
        let b = IsolationForest::fit(
            &data,
            &ForestConfig::builder().n_estimators(100).random_seed(7).build().unwrap(),
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fixed_contamination_sets_rate() {
        let data = clustered(197);
        let config = ForestConfig::builder()
            .contamination(Contamination::Fixed(0.1))
            .build()
            .unwrap();
        let forest = IsolationForest::fit(&data, &config).unwrap();
        let predictions = forest.predictions(&data).unwrap();

        // interpolated percentile: strictly fewer than 10% fall below it, ties aside
        let rate = predictions.anomaly_rate();
        assert!(rate > 0.05 && rate <= 0.1, "rate {rate}");
    }

    #[test]
    fn test_max_samples_and_depth() {
        let data = clustered(500);
        let forest = IsolationForest::fit(&data, &small_config()).unwrap();
        assert_eq!(forest.max_samples(), 256);
        assert_eq!(forest.n_estimators(), 100);

        let config = ForestConfig::builder()
            .n_estimators(10)
            .max_samples(MaxSamples::Count(16))
            .build()
            .unwrap();
        let forest = IsolationForest::fit(&data, &config).unwrap();
        assert_eq!(forest.max_samples(), 16);
        assert!(forest.trees.iter().all(|t| t.depth() <= 4));
    }

    #[test]
    fn test_bootstrap_sampling() {
        let mut rng = StdRng::seed_from_u64(5);
        let sample = draw_sample(10, 30, true, &mut rng);
        assert_eq!(sample.len(), 30);
        assert!(sample.iter().all(|i| *i < 10));

        let sample = draw_sample(10, 4, false, &mut rng);
        let mut unique = sample.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let data = clustered(50);
        let forest = IsolationForest::fit(&data, &small_config()).unwrap();
        let narrow = FeatureMatrix::from_rows(vec![vec![0.0]]).unwrap();
        assert!(forest.decision_function(&narrow).is_err());
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let data = FeatureMatrix::zeros(0, 3);
        let err = IsolationForest::fit(&data, &small_config()).unwrap_err();
        assert!(matches!(err, AnomalyError::InvalidData(_)));
    }
}

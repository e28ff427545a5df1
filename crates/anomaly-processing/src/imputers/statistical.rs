//! Statistical imputation methods.
//!
//! Provides mean, median, mode and constant fill strategies. Fitting produces a
//! single fill value per column; applying it never looks at the data again.

use crate::config::{CategoricalImputation, DEFAULT_CATEGORICAL_FILL, NumericImputation};
use crate::utils::{mean, median, string_mode};

/// Statistical imputation methods for filling missing values.
pub struct StatisticalImputer;

impl StatisticalImputer {
    /// Fit the fill value of a numeric column.
    ///
    /// Returns `None` when the column has no observed value.
    pub fn fit_numeric(values: &[Option<f64>], strategy: NumericImputation) -> Option<f64> {
        let observed: Vec<f64> = values.iter().flatten().copied().collect();
        match strategy {
            NumericImputation::Median => median(&observed),
            NumericImputation::Mean => mean(&observed),
        }
    }

    /// Fit the fill value of a categorical column.
    ///
    /// Mode ties resolve to the lexicographically smallest category.
    pub fn fit_categorical(
        values: &[Option<String>],
        strategy: CategoricalImputation,
    ) -> Option<String> {
        match strategy {
            CategoricalImputation::Mode => string_mode(values.iter().flatten().map(String::as_str)),
            CategoricalImputation::Constant => {
                if values.iter().any(Option::is_some) {
                    Some(DEFAULT_CATEGORICAL_FILL.to_string())
                } else {
                    None
                }
            }
        }
    }

    /// Replace missing numeric values with the fitted fill value.
    pub fn apply_numeric(values: &[Option<f64>], fill_value: f64) -> Vec<f64> {
        values.iter().map(|v| v.unwrap_or(fill_value)).collect()
    }

    /// Replace missing categorical values with the fitted fill value.
    pub fn apply_categorical(values: Vec<Option<String>>, fill_value: &str) -> Vec<String> {
        values
            .into_iter()
            .map(|v| v.unwrap_or_else(|| fill_value.to_string()))
            .collect()
    }
}

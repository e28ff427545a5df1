//! Fitted preprocessing state and its replay.

use crate::dates::DateFeatureExpander;
use crate::encoders::{OneHotEncoder, StandardScaler};
use crate::error::{ProcessingError, Result, ResultExt};
use crate::imputers::StatisticalImputer;
use crate::pipeline::FeatureMatrix;
use crate::schema::{ColumnKind, FeatureSchema};
use crate::utils::{DtypeCategory, get_dtype_category, numeric_values, string_values};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::debug;

/// Date expansion recorded at fit time, replayed verbatim at transform time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateExpansion {
    pub column: String,
    pub extra_formats: Vec<String>,
}

/// Fitted statistics of one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericTransform {
    pub column: String,
    pub fill_value: f64,
    pub scaler: StandardScaler,
}

/// Fitted statistics of one categorical column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalTransform {
    pub column: String,
    pub fill_value: String,
    pub encoder: OneHotEncoder,
}

/// Immutable result of [`Preprocessor::fit`](crate::Preprocessor::fit).
///
/// Holds everything needed to turn a dataset into a [`FeatureMatrix`]
/// without looking at any statistic of the dataset being transformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPreprocessor {
    pub(crate) date_expansion: Option<DateExpansion>,
    pub(crate) schema: FeatureSchema,
    pub(crate) numeric: Vec<NumericTransform>,
    pub(crate) categorical: Vec<CategoricalTransform>,
}

static_assertions::assert_impl_all!(FittedPreprocessor: Send, Sync);

impl FittedPreprocessor {
    /// The frozen feature schema.
    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Date expansion applied before the schema, if any.
    pub fn date_expansion(&self) -> Option<&DateExpansion> {
        self.date_expansion.as_ref()
    }

    pub fn numeric_transforms(&self) -> &[NumericTransform] {
        &self.numeric
    }

    pub fn categorical_transforms(&self) -> &[CategoricalTransform] {
        &self.categorical
    }

    /// Width of the produced feature matrix.
    pub fn n_features(&self) -> usize {
        self.numeric.len()
            + self
                .categorical
                .iter()
                .map(|c| c.encoder.width())
                .sum::<usize>()
    }

    /// Output feature names: numeric columns, then `<column>_<category>` blocks.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.numeric.iter().map(|n| n.column.clone()).collect();
        for cat in &self.categorical {
            names.extend(cat.encoder.feature_names(&cat.column));
        }
        names
    }

    /// Apply the frozen pipeline to a dataset.
    ///
    /// The input frame is never mutated. Unseen categories encode as all-zero
    /// blocks; missing schema columns and numeric dtype changes are errors.
    pub fn transform(&self, df: &DataFrame) -> Result<FeatureMatrix> {
        let frame = self.expand_dates(df)?;
        self.schema
            .validate_against(&frame)
            .context("Dataset does not match the fitted feature schema")?;

        let n_rows = frame.height();
        let mut matrix = FeatureMatrix::zeros(n_rows, self.n_features());

        for (col_idx, transform) in self.numeric.iter().enumerate() {
            let values = numeric_column(&frame, &transform.column)?;
            let scaled: Vec<f64> = StatisticalImputer::apply_numeric(&values, transform.fill_value)
                .into_iter()
                .map(|v| transform.scaler.transform(v))
                .collect();
            matrix.set_column(col_idx, &scaled);
        }

        let mut offset = self.numeric.len();
        for transform in &self.categorical {
            let series = frame.column(&transform.column)?.as_materialized_series();
            let values =
                StatisticalImputer::apply_categorical(string_values(series)?, &transform.fill_value);
            let width = transform.encoder.width();

            let mut unseen = 0usize;
            for (row, value) in values.iter().enumerate() {
                let block = &mut matrix.row_mut(row)[offset..offset + width];
                if transform.encoder.index_of(value).is_none() {
                    unseen += 1;
                }
                transform.encoder.encode_into(value, block);
            }
            if unseen > 0 {
                debug!(
                    "{} rows of '{}' hold categories unseen at fit time",
                    unseen, transform.column
                );
            }

            offset += width;
        }

        Ok(matrix)
    }

    fn expand_dates<'a>(&self, df: &'a DataFrame) -> Result<Cow<'a, DataFrame>> {
        let Some(expansion) = &self.date_expansion else {
            return Ok(Cow::Borrowed(df));
        };

        let expander = DateFeatureExpander::new(&expansion.column, &expansion.extra_formats);
        Ok(match expander.expand(df)? {
            Some(expanded) => Cow::Owned(expanded),
            // The derived columns are then reported missing by schema validation
            None => Cow::Borrowed(df),
        })
    }
}

/// Numeric values of a validated schema column. An all-missing column of a
/// non-numeric dtype yields all `None`.
fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = df.column(name)?.as_materialized_series();
    if get_dtype_category(series.dtype()) == DtypeCategory::Numeric {
        return Ok(numeric_values(series)?);
    }
    if series.null_count() == series.len() {
        return Ok(vec![None; series.len()]);
    }
    Err(ProcessingError::TypeMismatch {
        column: name.to_string(),
        expected: ColumnKind::Numeric.to_string(),
        actual: series.dtype().to_string(),
    })
}

//! Feature schema: the frozen column partition of a fitted pipeline.
//!
//! The schema is derived once from the fit dataset and carried inside the
//! fitted state. At transform time it is only ever *checked* against incoming
//! data, never re-derived.

use crate::error::{ProcessingError, Result};
use crate::utils::{DtypeCategory, get_dtype_category, numeric_values};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// How a column is turned into features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Imputed, then standardised into one feature.
    Numeric,
    /// Imputed, then one-hot encoded into one feature per category.
    Categorical,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric => write!(f, "numeric"),
            Self::Categorical => write!(f, "categorical"),
        }
    }
}

/// A named input column and its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: ColumnKind,
}

impl FeatureColumn {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered list of feature columns: all numeric columns, then all categorical
/// columns, each group in dataset order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    /// Build a schema from explicit columns, normalising to numeric-then-categorical order.
    pub fn new(columns: Vec<FeatureColumn>) -> Self {
        let (mut numeric, categorical): (Vec<_>, Vec<_>) = columns
            .into_iter()
            .partition(|c| c.kind == ColumnKind::Numeric);
        numeric.extend(categorical);
        Self { columns: numeric }
    }

    /// Partition the columns of a fit dataset by dtype.
    ///
    /// Temporal and nested dtypes are skipped. Columns without a single
    /// non-missing value are skipped too, since no statistic can be fitted on them.
    pub fn infer(df: &DataFrame) -> Result<Self> {
        let mut columns = Vec::new();

        for column in df.get_columns() {
            let series = column.as_materialized_series();
            let name = series.name().to_string();

            let kind = match get_dtype_category(series.dtype()) {
                DtypeCategory::Numeric => ColumnKind::Numeric,
                DtypeCategory::String | DtypeCategory::Boolean => ColumnKind::Categorical,
                DtypeCategory::Datetime | DtypeCategory::Other => {
                    debug!(
                        "Skipping column '{}' with unsupported dtype {}",
                        name,
                        series.dtype()
                    );
                    continue;
                }
            };

            let has_values = match kind {
                ColumnKind::Numeric => numeric_values(series)?.iter().any(Option::is_some),
                ColumnKind::Categorical => series.null_count() < series.len(),
            };
            if !has_values {
                warn!("Skipping column '{}': no non-missing values to fit", name);
                continue;
            }

            columns.push(FeatureColumn::new(name, kind));
        }

        let schema = Self::new(columns);
        debug!(
            "Inferred schema: {} numeric, {} categorical",
            schema.numeric().count(),
            schema.categorical().count()
        );
        Ok(schema)
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    /// Numeric columns in output order.
    pub fn numeric(&self) -> impl Iterator<Item = &FeatureColumn> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Numeric)
    }

    /// Categorical columns in output order.
    pub fn categorical(&self) -> impl Iterator<Item = &FeatureColumn> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Categorical)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Look up the kind of a column by name.
    pub fn kind_of(&self, name: &str) -> Option<ColumnKind> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.kind)
    }

    /// Check that a dataset can be transformed under this schema.
    ///
    /// Every schema column must be present. A numeric column must still have a
    /// numeric dtype unless it holds only missing values. Categorical columns
    /// accept any dtype since their values are stringified for lookup.
    pub fn validate_against(&self, df: &DataFrame) -> Result<()> {
        let missing: Vec<String> = self
            .columns
            .iter()
            .filter(|c| df.column(&c.name).is_err())
            .map(|c| c.name.clone())
            .collect();

        if !missing.is_empty() {
            return Err(ProcessingError::MissingColumns(missing));
        }

        for column in self.numeric() {
            let series = df.column(&column.name)?.as_materialized_series();
            let dtype = series.dtype();
            let all_missing = series.null_count() == series.len();

            if get_dtype_category(dtype) != DtypeCategory::Numeric && !all_missing {
                return Err(ProcessingError::TypeMismatch {
                    column: column.name.clone(),
                    expected: ColumnKind::Numeric.to_string(),
                    actual: dtype.to_string(),
                });
            }
        }

        Ok(())
    }
}

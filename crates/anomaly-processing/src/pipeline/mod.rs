//! Pipeline module.
//!
//! [`Preprocessor`] fits date expansion, imputation, scaling and one-hot
//! encoding on a dataset and returns a [`FittedPreprocessor`] that replays
//! them on any later dataset.

mod fitted;
mod matrix;

pub use fitted::{CategoricalTransform, DateExpansion, FittedPreprocessor, NumericTransform};
pub use matrix::FeatureMatrix;

use crate::config::PreprocessingConfig;
use crate::dates::DateFeatureExpander;
use crate::encoders::{OneHotEncoder, StandardScaler};
use crate::error::{ProcessingError, Result, ResultExt};
use crate::imputers::StatisticalImputer;
use crate::schema::FeatureSchema;
use crate::utils::{numeric_values, string_values};
use polars::prelude::*;
use std::borrow::Cow;
use std::time::Instant;
use tracing::{debug, info};

/// Fits the preprocessing pipeline.
///
/// # Example
///
/// ```rust,ignore
/// use anomaly_processing::{PreprocessingConfig, Preprocessor};
///
/// let config = PreprocessingConfig::builder().use_date_features(true).build()?;
/// let fitted = Preprocessor::new(config).fit(&train_df)?;
/// let features = fitted.transform(&score_df)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessingConfig,
}

static_assertions::assert_impl_all!(Preprocessor: Send, Sync);

impl Preprocessor {
    pub fn new(config: PreprocessingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessingConfig {
        &self.config
    }

    /// Fit every transform on `df`. The frame itself is left untouched.
    ///
    /// # Errors
    ///
    /// `EmptyDataset` for a frame without rows, `NoUsableColumns` when no
    /// numeric or categorical column with values remains after date handling.
    pub fn fit(&self, df: &DataFrame) -> Result<FittedPreprocessor> {
        let start_time = Instant::now();

        self.config
            .validate()
            .map_err(|e| ProcessingError::InvalidConfig(e.to_string()))?;

        if df.height() == 0 {
            return Err(ProcessingError::EmptyDataset);
        }

        info!(
            "Fitting preprocessing on {} rows x {} columns",
            df.height(),
            df.width()
        );

        let (frame, date_expansion) = self.expand_dates(df)?;

        let schema = FeatureSchema::infer(&frame).context("Failed to infer feature schema")?;
        if schema.is_empty() {
            return Err(ProcessingError::NoUsableColumns);
        }

        let mut numeric = Vec::new();
        for column in schema.numeric() {
            let series = frame.column(&column.name)?.as_materialized_series();
            let values = numeric_values(series)?;
            let fill_value =
                StatisticalImputer::fit_numeric(&values, self.config.numeric_imputation)
                    .ok_or_else(|| ProcessingError::NoValidValues(column.name.clone()))?;
            let imputed = StatisticalImputer::apply_numeric(&values, fill_value);
            let scaler = StandardScaler::fit(&imputed);

            debug!(
                "'{}': fill={}, mean={}, scale={}",
                column.name, fill_value, scaler.mean, scaler.scale
            );
            numeric.push(NumericTransform {
                column: column.name.clone(),
                fill_value,
                scaler,
            });
        }

        let mut categorical = Vec::new();
        for column in schema.categorical() {
            let series = frame.column(&column.name)?.as_materialized_series();
            let values = string_values(series)?;
            let fill_value =
                StatisticalImputer::fit_categorical(&values, self.config.categorical_imputation)
                    .ok_or_else(|| ProcessingError::NoValidValues(column.name.clone()))?;
            let imputed = StatisticalImputer::apply_categorical(values, &fill_value);
            let encoder = OneHotEncoder::fit(&imputed);

            debug!(
                "'{}': fill='{}', {} categories",
                column.name,
                fill_value,
                encoder.width()
            );
            categorical.push(CategoricalTransform {
                column: column.name.clone(),
                fill_value,
                encoder,
            });
        }

        let fitted = FittedPreprocessor {
            date_expansion,
            schema,
            numeric,
            categorical,
        };

        info!(
            "Preprocessing fitted in {:.2}s: {} numeric, {} categorical, {} features",
            start_time.elapsed().as_secs_f64(),
            fitted.numeric.len(),
            fitted.categorical.len(),
            fitted.n_features()
        );

        Ok(fitted)
    }

    /// Expand the date column when enabled and present, recording the decision.
    fn expand_dates<'a>(
        &self,
        df: &'a DataFrame,
    ) -> Result<(Cow<'a, DataFrame>, Option<DateExpansion>)> {
        if !self.config.use_date_features {
            return Ok((Cow::Borrowed(df), None));
        }

        let expander =
            DateFeatureExpander::new(&self.config.date_column, &self.config.extra_date_formats);
        match expander.expand(df)? {
            Some(expanded) => Ok((
                Cow::Owned(expanded),
                Some(DateExpansion {
                    column: self.config.date_column.clone(),
                    extra_formats: self.config.extra_date_formats.clone(),
                }),
            )),
            None => {
                info!(
                    "Date features enabled but '{}' is absent, continuing without them",
                    self.config.date_column
                );
                Ok((Cow::Borrowed(df), None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;
    use pretty_assertions::assert_eq;

    fn accidents() -> DataFrame {
        DataFrame::new(vec![
            Series::new(
                "crash_date".into(),
                &["2023-01-05", "2023-02-10", "2023-02-11", "2023-03-20"],
            )
            .into(),
            Series::new("num_units".into(), &[Some(2i64), Some(3), None, Some(2)]).into(),
            Series::new(
                "weather".into(),
                &[Some("CLEAR"), Some("RAIN"), Some("CLEAR"), None],
            )
            .into(),
        ])
        .unwrap()
    }

    fn fit_with_dates() -> FittedPreprocessor {
        let config = PreprocessingConfig::builder()
            .use_date_features(true)
            .build()
            .unwrap();
        Preprocessor::new(config).fit(&accidents()).unwrap()
    }

    #[test]
    fn test_fit_with_date_features() {
        let fitted = fit_with_dates();
        let kinds: Vec<(&str, ColumnKind)> = fitted
            .schema()
            .columns()
            .iter()
            .map(|c| (c.name.as_str(), c.kind))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("num_units", ColumnKind::Numeric),
                ("year", ColumnKind::Numeric),
                ("month", ColumnKind::Numeric),
                ("day", ColumnKind::Numeric),
                ("weather", ColumnKind::Categorical),
            ]
        );
        assert_eq!(
            fitted.feature_names(),
            vec!["num_units", "year", "month", "day", "weather_CLEAR", "weather_RAIN"]
        );
        assert!(fitted.date_expansion().is_some());
    }

    #[test]
    fn test_fit_without_date_features_drops_string_date_into_categorical() {
        let fitted = Preprocessor::default().fit(&accidents()).unwrap();
        assert_eq!(
            fitted.schema().kind_of("crash_date"),
            Some(ColumnKind::Categorical)
        );
        assert!(fitted.date_expansion().is_none());
    }

    #[test]
    fn test_imputation_statistics() {
        let fitted = fit_with_dates();
        let units = &fitted.numeric_transforms()[0];
        assert_eq!(units.column, "num_units");
        assert_eq!(units.fill_value, 2.0);

        let weather = &fitted.categorical_transforms()[0];
        assert_eq!(weather.fill_value, "CLEAR");
        assert_eq!(weather.encoder.categories(), &["CLEAR", "RAIN"]);
    }

    #[test]
    fn test_transform_encodes_rows() {
        let fitted = fit_with_dates();
        let matrix = fitted.transform(&accidents()).unwrap();

        assert_eq!(matrix.n_rows(), 4);
        assert_eq!(matrix.n_cols(), 6);
        // row 3 has missing weather, imputed with the mode
        assert_eq!(&matrix.row(3)[4..], &[1.0, 0.0]);
        assert_eq!(&matrix.row(1)[4..], &[0.0, 1.0]);
    }

    #[test]
    fn test_empty_dataset() {
        let df = DataFrame::new(vec![Series::new_empty("a".into(), &DataType::Float64).into()])
            .unwrap();
        let err = Preprocessor::default().fit(&df).unwrap_err();
        assert!(matches!(err, ProcessingError::EmptyDataset));
    }

    #[test]
    fn test_no_usable_columns() {
        let df = DataFrame::new(vec![
            Series::new("crash_date".into(), &["2023-01-01", "2023-01-02"]).into(),
            Series::new("blank".into(), &[None::<f64>, None]).into(),
        ])
        .unwrap();
        let config = PreprocessingConfig::builder()
            .use_date_features(true)
            .build()
            .unwrap();

        // year/month/day survive, so only a frame of empty columns fails
        assert!(Preprocessor::new(config).fit(&df).is_ok());

        let blank = df.select(["blank"]).unwrap();
        let err = Preprocessor::default().fit(&blank).unwrap_err();
        assert!(matches!(err, ProcessingError::NoUsableColumns));
    }
}

//! Feature Preprocessing Library
//!
//! Fit-once, replay-anywhere preprocessing for tabular anomaly detection,
//! built on Polars.
//!
//! # Overview
//!
//! - **Date Features**: Expand a timestamp column into `year`, `month` and `day`
//! - **Frozen Schema**: Partition columns into numeric and categorical once, at fit time
//! - **Imputation**: Median (or mean) for numeric columns, mode (or constant) for categorical ones
//! - **Encoding**: Standard scaling and one-hot encoding against a fixed vocabulary
//! - **CSV I/O**: Tolerant loading and atomic writing
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use anomaly_processing::{PreprocessingConfig, Preprocessor, load_csv_with_fallbacks};
//!
//! let train = load_csv_with_fallbacks("traffic_accidents.csv")?;
//!
//! let config = PreprocessingConfig::builder()
//!     .use_date_features(true)
//!     .date_column("crash_date")
//!     .build()?;
//!
//! let fitted = Preprocessor::new(config).fit(&train)?;
//! println!("{} features: {:?}", fitted.n_features(), fitted.feature_names());
//!
//! // Later, possibly in another process after deserializing `fitted`
//! let features = fitted.transform(&new_data)?;
//! ```
//!
//! # Replay
//!
//! [`FittedPreprocessor`] is `Serialize + Deserialize`. Every statistic it holds
//! was computed on the fit dataset; `transform` never looks at statistics of the
//! data it is transforming. Categories unseen at fit time encode as all-zero
//! indicator blocks, while missing schema columns and numeric columns arriving
//! with a non-numeric dtype fail with a schema-drift error
//! (see [`ProcessingError::is_schema_drift`]).

pub mod config;
pub mod dates;
pub mod encoders;
pub mod error;
pub mod imputers;
pub mod io;
pub mod pipeline;
pub mod schema;
pub mod utils;

// Re-exports for convenient access
pub use config::{
    CategoricalImputation, ConfigValidationError, DEFAULT_DATE_COLUMN, NumericImputation,
    PreprocessingConfig, PreprocessingConfigBuilder,
};
pub use dates::{DATE_FEATURE_COLUMNS, DateFeatureExpander};
pub use encoders::{OneHotEncoder, StandardScaler};
pub use error::{ProcessingError, Result as ProcessingResult, ResultExt};
pub use imputers::StatisticalImputer;
pub use io::{clean_csv_content, load_csv_with_fallbacks, write_csv};
pub use pipeline::{
    CategoricalTransform, DateExpansion, FeatureMatrix, FittedPreprocessor, NumericTransform,
    Preprocessor,
};
pub use schema::{ColumnKind, FeatureColumn, FeatureSchema};
pub use utils::{DtypeCategory, get_dtype_category, is_numeric_dtype, percentile};

//! Feature encoders applied after imputation.
//!
//! - Standard scaling for numeric columns
//! - One-hot encoding for categorical columns

mod onehot;
mod scaler;

pub use onehot::OneHotEncoder;
pub use scaler::StandardScaler;

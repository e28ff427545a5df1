//! Imputation module for handling missing values.
//!
//! Fill values are fitted once on the training data and reused verbatim
//! whenever the pipeline is replayed.

mod statistical;

pub use statistical::StatisticalImputer;

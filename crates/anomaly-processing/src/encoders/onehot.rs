//! One-hot encoding against a frozen vocabulary.

use serde::{Deserialize, Serialize};

/// Maps a categorical value to a block of 0/1 indicators.
///
/// The vocabulary is the sorted set of categories observed at fit time.
/// Values outside it encode as an all-zero block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    categories: Vec<String>,
}

impl OneHotEncoder {
    /// Fit the vocabulary on already-imputed values.
    pub fn fit<S: AsRef<str>>(values: &[S]) -> Self {
        let mut categories: Vec<String> = values.iter().map(|v| v.as_ref().to_string()).collect();
        categories.sort_unstable();
        categories.dedup();
        Self { categories }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Number of indicator columns this encoder produces.
    pub fn width(&self) -> usize {
        self.categories.len()
    }

    /// Position of a category in the vocabulary, if known.
    pub fn index_of(&self, value: &str) -> Option<usize> {
        self.categories
            .binary_search_by(|c| c.as_str().cmp(value))
            .ok()
    }

    /// Write the indicator block for `value` into `out` (length == `width()`).
    pub fn encode_into(&self, value: &str, out: &mut [f64]) {
        out.fill(0.0);
        if let Some(idx) = self.index_of(value) {
            out[idx] = 1.0;
        }
    }

    /// Output feature names, `<column>_<category>`.
    pub fn feature_names(&self, column: &str) -> Vec<String> {
        self.categories
            .iter()
            .map(|c| format!("{column}_{c}"))
            .collect()
    }
}

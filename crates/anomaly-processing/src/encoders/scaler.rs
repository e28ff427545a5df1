use crate::utils::{mean, population_std};
use serde::{Deserialize, Serialize};

/// Standardises a numeric column to zero mean and unit variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: f64,
    pub scale: f64,
}

impl StandardScaler {
    /// Fit on already-imputed values. A constant column gets `scale = 1`.
    pub fn fit(values: &[f64]) -> Self {
        let mean = mean(values).unwrap_or(0.0);
        let std = population_std(values, mean);
        let scale = if std == 0.0 || !std.is_finite() {
            1.0
        } else {
            std
        };
        Self { mean, scale }
    }

    #[inline]
    pub fn transform(&self, value: f64) -> f64 {
        (value - self.mean) / self.scale
    }
}

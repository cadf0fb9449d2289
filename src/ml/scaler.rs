//! Feature standardization
//!
//! Z-score scaling fitted once on training data and then applied unchanged.

use serde::{Deserialize, Serialize};

/// Per-column mean and scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl StandardScaler {
    /// Fit on a row-major matrix. Uses population standard deviation.
    pub fn fit(data: &[Vec<f64>]) -> Self {
        let n_features = data.first().map(|r| r.len()).unwrap_or(0);
        let n = data.len().max(1) as f64;

        let mut means = vec![0.0; n_features];
        for row in data {
            for (i, &v) in row.iter().enumerate().take(n_features) {
                means[i] += v;
            }
        }
        for mean in &mut means {
            *mean /= n;
        }

        let mut scales = vec![0.0; n_features];
        for row in data {
            for (i, &v) in row.iter().enumerate().take(n_features) {
                scales[i] += (v - means[i]).powi(2);
            }
        }
        for scale in &mut scales {
            *scale = (*scale / n).sqrt();
        }

        Self { means, scales }
    }

    pub fn n_features(&self) -> usize {
        self.means.len()
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    /// Standardize one row; zero-variance columns map to 0
    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(&v, (&mean, &scale))| {
                if scale > f64::EPSILON {
                    (v - mean) / scale
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub fn transform(&self, data: &[Vec<f64>]) -> Vec<Vec<f64>> {
        data.iter().map(|row| self.transform_row(row)).collect()
    }
}

//! Learned models for outlier scoring

pub mod isolation_forest;

pub use isolation_forest::IsolationForest;

use serde::{Deserialize, Serialize};

use super::features::FeatureColumn;
use crate::error::Result;

/// Trait for unsupervised outlier models over dense, scaled vectors
pub trait AnomalyModel: Send + Sync {
    /// Train the model
    fn fit(&mut self, data: &[Vec<f64>]) -> Result<()>;

    /// Decision score (negative = outlier, more negative = more anomalous)
    fn decision_function(&self, sample: &[f64]) -> f64;

    /// Predict if a sample is an outlier
    fn predict(&self, sample: &[f64]) -> bool;

    /// Get model name
    fn name(&self) -> &str;

    /// Check if model is trained
    fn is_trained(&self) -> bool;
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of trees in the ensemble
    pub num_trees: usize,
    /// Upper bound on rows sampled per tree
    pub max_samples: usize,
    /// Expected fraction of outliers in training data
    pub contamination: f64,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Minimum rows required to fit
    pub min_training_rows: usize,
    /// Feature columns fed to the model
    pub features: Vec<FeatureColumn>,
    /// Fit on the first batch passed to `detect` when untrained
    pub auto_train: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_trees: 100,
            max_samples: 256,
            contamination: 0.1,
            seed: 42,
            min_training_rows: 10,
            features: FeatureColumn::ALL.to_vec(),
            auto_train: false,
        }
    }
}

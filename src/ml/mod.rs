//! Learned outlier detection
//!
//! Scales engineered features and scores readings with an isolation forest.
//!
//! # Features
//! - Feature engineering per device (calendar + rolling power statistics)
//! - Z-score scaling fitted on training data only
//! - Seeded isolation forest with a contamination-based outlier cut
//! - Snapshot persistence so training can happen out of band
//!
//! # Example
//! ```ignore
//! use powerwatch::ml::{build_features, LearnedOutlierModel, ModelConfig};
//!
//! let model = LearnedOutlierModel::new(ModelConfig::default());
//! model.fit(&build_features(&history))?;
//!
//! for anomaly in model.detect(&todays_readings)? {
//!     println!("{}: {}", anomaly.device_id, anomaly.description);
//! }
//! ```

pub mod features;
pub mod models;
pub mod scaler;
pub mod training;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DetectError, Result};
use crate::models::{Anomaly, AnomalyDetails, AnomalyType, Reading, Severity, Unit};

pub use features::{build_features, device_groups, FeatureBuilder, FeatureColumn, FeatureRow};
pub use models::{AnomalyModel, IsolationForest, ModelConfig};
pub use scaler::StandardScaler;
pub use training::{ModelSnapshot, ModelTrainer};

/// Score for one feature row
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutlierScore {
    /// Decision score, more negative = more anomalous
    pub anomaly_score: f64,
    pub is_outlier: bool,
}

/// Summary of the model's current state
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub trained: bool,
    pub feature_columns: Vec<FeatureColumn>,
    pub contamination: Option<f64>,
    pub n_estimators: Option<usize>,
    pub trained_at: Option<DateTime<Utc>>,
    pub sample_count: Option<u64>,
}

/// Learned outlier model
///
/// Holds at most one fitted snapshot. `fit` swaps in a new snapshot under a
/// write lock; scoring clones the current `Arc` under a read lock, so one
/// instance can be shared across threads.
pub struct LearnedOutlierModel {
    config: ModelConfig,
    builder: FeatureBuilder,
    snapshot: RwLock<Option<Arc<ModelSnapshot>>>,
}

impl Default for LearnedOutlierModel {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl LearnedOutlierModel {
    /// Create an untrained model
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            builder: FeatureBuilder::default(),
            snapshot: RwLock::new(None),
        }
    }

    /// Create a trained model from a previously fitted snapshot
    pub fn from_snapshot(config: ModelConfig, snapshot: ModelSnapshot) -> Self {
        Self {
            config,
            builder: FeatureBuilder::default(),
            snapshot: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Current snapshot, if trained
    pub fn snapshot(&self) -> Option<Arc<ModelSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Fit on feature rows, replacing any previous snapshot
    pub fn fit(&self, rows: &[FeatureRow]) -> Result<()> {
        let snapshot = ModelTrainer::new(self.config.clone()).train(rows)?;
        *self.snapshot.write() = Some(Arc::new(snapshot));
        Ok(())
    }

    /// Score rows with the fitted snapshot
    pub fn score(&self, rows: &[FeatureRow]) -> Result<Vec<OutlierScore>> {
        let snapshot = self.snapshot().ok_or(DetectError::NotTrained)?;

        rows.iter()
            .map(|row| {
                let (anomaly_score, is_outlier) = snapshot.score_row(row);
                if !anomaly_score.is_finite() {
                    return Err(DetectError::Computation(format!(
                        "non-finite outlier score for device {}",
                        row.reading.device_id
                    )));
                }
                Ok(OutlierScore {
                    anomaly_score,
                    is_outlier,
                })
            })
            .collect()
    }

    /// Build features for a batch and report outlier readings
    pub fn detect(&self, readings: &[Reading]) -> Result<Vec<Anomaly>> {
        let rows = self.builder.build(readings);

        if !self.is_trained() {
            if !self.config.auto_train {
                return Err(DetectError::NotTrained);
            }
            info!(rows = rows.len(), "Outlier model untrained, fitting on incoming batch");
            self.fit(&rows)?;
        }

        let scores = self.score(&rows)?;
        let anomalies: Vec<Anomaly> = rows
            .iter()
            .zip(scores)
            .filter(|(_, s)| s.is_outlier)
            .map(|(row, s)| outlier_anomaly(row, s.anomaly_score))
            .collect();

        debug!(
            rows = rows.len(),
            outliers = anomalies.len(),
            "learned outlier pass complete"
        );
        Ok(anomalies)
    }

    /// Describe the current model
    pub fn info(&self) -> ModelInfo {
        match self.snapshot() {
            Some(s) => ModelInfo {
                trained: true,
                feature_columns: s.columns.clone(),
                contamination: Some(s.forest.contamination()),
                n_estimators: Some(s.forest.num_trees()),
                trained_at: Some(s.trained_at),
                sample_count: Some(s.sample_count),
            },
            None => ModelInfo {
                trained: false,
                feature_columns: self.config.features.clone(),
                contamination: None,
                n_estimators: None,
                trained_at: None,
                sample_count: None,
            },
        }
    }
}

fn outlier_anomaly(row: &FeatureRow, score: f64) -> Anomaly {
    let reading = &row.reading;
    Anomaly::new(
        AnomalyType::LearnedOutlier,
        reading,
        reading.power,
        Severity::from_outlier_score(score),
        format!(
            "Unusual behavior detected in {} ({:.1}W, {:.1}V, {:.2}A)",
            reading.device_id, reading.power, reading.voltage, reading.current
        ),
    )
    .with_details(AnomalyDetails {
        anomaly_score: Some(score),
        unit: Some(Unit::Watt),
        ..Default::default()
    })
}

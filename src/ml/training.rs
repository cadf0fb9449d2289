//! Model training and persistence
//!
//! A fit produces an immutable [`ModelSnapshot`]; re-fitting builds a new
//! snapshot rather than mutating the old one.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::features::{FeatureColumn, FeatureRow};
use super::models::{AnomalyModel, IsolationForest, ModelConfig};
use super::scaler::StandardScaler;
use crate::error::{DetectError, Result};

/// Fitted scaler and forest, read-only once built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Columns the model was fitted on, in order
    pub columns: Vec<FeatureColumn>,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
    pub trained_at: DateTime<Utc>,
    pub sample_count: u64,
    pub version: String,
}

impl ModelSnapshot {
    /// Scaled input vector for one row
    pub fn prepare(&self, row: &FeatureRow) -> Vec<f64> {
        self.scaler.transform_row(&row.vector(&self.columns))
    }

    /// Decision score and outlier label for one row
    pub fn score_row(&self, row: &FeatureRow) -> (f64, bool) {
        let x = self.prepare(row);
        let score = self.forest.decision_function(&x);
        (score, score < 0.0)
    }

    /// Save snapshot to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create model file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
        Ok(())
    }

    /// Load snapshot from disk
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open model file: {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let snapshot: Self =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .with_context(|| format!("Failed to decode model file: {}", path.display()))?;
        Ok(snapshot)
    }
}

/// Model trainer
pub struct ModelTrainer {
    config: ModelConfig,
}

impl Default for ModelTrainer {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl ModelTrainer {
    /// Create a new trainer
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Fit scaler and forest on feature rows
    pub fn train(&self, rows: &[FeatureRow]) -> Result<ModelSnapshot> {
        let required = self.config.min_training_rows.max(1);
        if rows.len() < required {
            return Err(DetectError::InsufficientData {
                required,
                actual: rows.len(),
            });
        }

        let mut columns: Vec<FeatureColumn> = Vec::with_capacity(self.config.features.len());
        for column in &self.config.features {
            if !columns.contains(column) {
                columns.push(*column);
            }
        }
        if columns.is_empty() {
            return Err(DetectError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let raw: Vec<Vec<f64>> = rows.iter().map(|r| r.vector(&columns)).collect();
        let scaler = StandardScaler::fit(&raw);
        let scaled = scaler.transform(&raw);
        debug!(rows = rows.len(), features = columns.len(), "scaled training matrix");

        let mut forest = IsolationForest::new(&self.config);
        forest.fit(&scaled)?;

        info!(
            "Outlier model trained with {} samples and {} features",
            rows.len(),
            columns.len()
        );

        Ok(ModelSnapshot {
            columns,
            scaler,
            forest,
            trained_at: Utc::now(),
            sample_count: rows.len() as u64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::build_features;
    use crate::models::Reading;
    use chrono::{Duration, TimeZone};

    fn make_rows(n: usize) -> Vec<FeatureRow> {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let readings: Vec<Reading> = (0..n)
            .map(|i| {
                let power = 100.0 + (i % 7) as f64 * 3.0;
                Reading::new(
                    "fridge",
                    start + Duration::minutes(15 * i as i64),
                    power,
                    230.0 + (i % 5) as f64,
                    power / 230.0,
                    i as f64 * 0.025,
                    true,
                )
            })
            .collect();
        build_features(&readings)
    }

    #[test]
    fn test_train_requires_min_rows() {
        let trainer = ModelTrainer::default();
        let err = trainer.train(&make_rows(9)).unwrap_err();
        assert!(matches!(
            err,
            DetectError::InsufficientData { required: 10, actual: 9 }
        ));
    }

    #[test]
    fn test_train_requires_features() {
        let config = ModelConfig {
            features: Vec::new(),
            ..Default::default()
        };
        let err = ModelTrainer::new(config).train(&make_rows(20)).unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_train_dedups_columns() {
        let config = ModelConfig {
            features: vec![FeatureColumn::Power, FeatureColumn::Power, FeatureColumn::Hour],
            ..Default::default()
        };
        let snapshot = ModelTrainer::new(config).train(&make_rows(20)).unwrap();
        assert_eq!(snapshot.columns, vec![FeatureColumn::Power, FeatureColumn::Hour]);
        assert_eq!(snapshot.scaler.n_features(), 2);
        assert_eq!(snapshot.sample_count, 20);
    }

    #[test]
    fn test_snapshot_roundtrip_on_disk() {
        let rows = make_rows(40);
        let snapshot = ModelTrainer::default().train(&rows).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        snapshot.save(&path).unwrap();
        let loaded = ModelSnapshot::load(&path).unwrap();

        assert_eq!(loaded.columns, snapshot.columns);
        for row in &rows {
            assert_eq!(loaded.score_row(row), snapshot.score_row(row));
        }
    }
}

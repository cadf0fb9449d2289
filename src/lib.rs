pub mod config;
pub mod detect;
pub mod error;
pub mod ml;
pub mod models;
pub mod notify;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use config::Config;
use detect::{AnomalyAggregator, DetectionReport, StatisticalDetector, ThresholdDetector};
use ml::{build_features, LearnedOutlierModel, ModelInfo, ModelSnapshot};
use models::Reading;

pub use error::DetectError;

/// Core powerwatch instance
pub struct PowerWatch {
    config: Config,
    model: Arc<LearnedOutlierModel>,
    use_thresholds: bool,
    use_recent: bool,
}

impl PowerWatch {
    /// Create an instance with an untrained model
    pub fn new(config: Config) -> Self {
        let model = Arc::new(LearnedOutlierModel::new(config.model.clone()));
        Self {
            config,
            model,
            use_thresholds: true,
            use_recent: false,
        }
    }

    /// Create an instance around a previously trained snapshot
    pub fn with_snapshot(config: Config, snapshot: ModelSnapshot) -> Self {
        let model = Arc::new(LearnedOutlierModel::from_snapshot(config.model.clone(), snapshot));
        Self {
            config,
            model,
            use_thresholds: true,
            use_recent: false,
        }
    }

    /// Toggle configured threshold checks (on by default)
    pub fn thresholds(mut self, enabled: bool) -> Self {
        self.use_thresholds = enabled;
        self
    }

    /// Toggle flat recent-window checks (off by default)
    pub fn recent_window(mut self, enabled: bool) -> Self {
        self.use_recent = enabled;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> &Arc<LearnedOutlierModel> {
        &self.model
    }

    /// Fit the learned model on historical readings
    pub fn train(&self, readings: &[Reading]) -> Result<ModelInfo> {
        self.model.fit(&build_features(readings))?;
        let info = self.model.info();
        info!(samples = ?info.sample_count, "Model trained");
        Ok(info)
    }

    /// Run every enabled detector over a batch
    pub fn detect(&self, readings: &[Reading]) -> DetectionReport {
        let mut aggregator =
            AnomalyAggregator::new(StatisticalDetector::new(self.config.detection.clone()));

        if self.model.is_trained() || self.config.model.auto_train {
            aggregator = aggregator.with_model(Arc::clone(&self.model));
        }
        if self.use_thresholds {
            aggregator =
                aggregator.with_thresholds(ThresholdDetector::new(self.config.thresholds.clone()));
        }
        if self.use_recent {
            aggregator = aggregator.with_recent(self.config.recent.clone());
        }

        aggregator.summarize(readings)
    }
}

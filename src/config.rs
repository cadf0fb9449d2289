use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::detect::{DetectionConfig, RecentWindowConfig, ThresholdConfig};
use crate::ml::ModelConfig;
use crate::notify::AlertConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub recent: RecentWindowConfig,

    #[serde(default)]
    pub alerting: AlertConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/powerwatch/config.toml"),
            PathBuf::from("powerwatch.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Reject settings the detectors cannot run with
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.num_trees == 0 {
            bail!("model.num_trees must be at least 1");
        }
        if model.max_samples == 0 {
            bail!("model.max_samples must be at least 1");
        }
        if !(model.contamination > 0.0 && model.contamination <= 0.5) {
            bail!(
                "model.contamination must be in (0, 0.5], got {}",
                model.contamination
            );
        }
        if !(self.detection.sensitivity.is_finite() && self.detection.sensitivity > 0.0) {
            bail!(
                "detection.sensitivity must be positive, got {}",
                self.detection.sensitivity
            );
        }
        if self.detection.spike_window % 2 == 0 {
            bail!(
                "detection.spike_window must be odd, got {}",
                self.detection.spike_window
            );
        }
        if self.alerting.cooldown_minutes < 0 {
            bail!(
                "alerting.cooldown_minutes must not be negative, got {}",
                self.alerting.cooldown_minutes
            );
        }
        Ok(())
    }
}

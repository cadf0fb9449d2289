//! Report aggregation
//!
//! Runs every configured detector over one batch, isolating failures so a
//! broken detector degrades the report instead of blanking it.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::statistical::StatisticalDetector;
use super::threshold::{detect_recent_peaks, detect_recent_spikes, RecentWindowConfig, ThresholdDetector};
use crate::error::{DetectError, Result};
use crate::ml::LearnedOutlierModel;
use crate::models::{Anomaly, AnomalyType, Reading, Severity};

/// Spike ratio above which a consumption spike is alert-worthy
pub const ALERT_SPIKE_RATIO: f64 = 2.5;

/// A detector that failed or could not run for this batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedDetector {
    pub detector: String,
    pub reason: String,
}

/// Merged output of one detection pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub anomalies: Vec<Anomaly>,
    pub total_anomalies: usize,
    pub counts_by_device: BTreeMap<String, usize>,
    pub counts_by_type: BTreeMap<AnomalyType, usize>,
    pub counts_by_severity: BTreeMap<Severity, usize>,
    /// Batch was below the minimum size for the rule detectors
    pub insufficient_data: bool,
    pub degraded: Vec<DegradedDetector>,
    pub generated_at: DateTime<Utc>,
}

impl DetectionReport {
    fn new() -> Self {
        Self {
            anomalies: Vec::new(),
            total_anomalies: 0,
            counts_by_device: BTreeMap::new(),
            counts_by_type: BTreeMap::new(),
            counts_by_severity: BTreeMap::new(),
            insufficient_data: false,
            degraded: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    /// Append anomalies produced outside the aggregator, keeping counts in step
    pub fn extend(&mut self, anomalies: impl IntoIterator<Item = Anomaly>) {
        self.anomalies.extend(anomalies);
        self.recount();
    }

    fn recount(&mut self) {
        self.counts_by_device.clear();
        self.counts_by_type.clear();
        self.counts_by_severity.clear();

        for anomaly in &self.anomalies {
            *self
                .counts_by_device
                .entry(anomaly.device_id.clone())
                .or_insert(0) += 1;
            *self.counts_by_type.entry(anomaly.kind).or_insert(0) += 1;
            *self.counts_by_severity.entry(anomaly.severity).or_insert(0) += 1;
        }
        self.total_anomalies = self.anomalies.len();
    }

    /// Last `n` anomalies in report order
    pub fn recent(&self, n: usize) -> &[Anomaly] {
        let start = self.anomalies.len().saturating_sub(n);
        &self.anomalies[start..]
    }

    /// Anomalies that should trigger an alert
    pub fn alerts(&self) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter().filter(|a| should_alert(a))
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Whether an anomaly warrants a notification
pub fn should_alert(anomaly: &Anomaly) -> bool {
    if matches!(anomaly.severity, Severity::High | Severity::Critical) {
        return true;
    }

    match anomaly.kind {
        AnomalyType::DeviceFailure | AnomalyType::DeviceMalfunction => true,
        AnomalyType::ConsumptionSpike => anomaly
            .details
            .spike_ratio
            .is_some_and(|r| r > ALERT_SPIKE_RATIO),
        _ => false,
    }
}

/// Runs all detectors and merges their output
#[derive(Default)]
pub struct AnomalyAggregator {
    statistical: StatisticalDetector,
    model: Option<Arc<LearnedOutlierModel>>,
    thresholds: Option<ThresholdDetector>,
    recent: Option<RecentWindowConfig>,
}

impl AnomalyAggregator {
    pub fn new(statistical: StatisticalDetector) -> Self {
        Self {
            statistical,
            ..Default::default()
        }
    }

    /// Include learned outliers from a shared model
    pub fn with_model(mut self, model: Arc<LearnedOutlierModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Include configured threshold checks
    pub fn with_thresholds(mut self, thresholds: ThresholdDetector) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Include flat recent-window peak and spike checks
    pub fn with_recent(mut self, recent: RecentWindowConfig) -> Self {
        self.recent = Some(recent);
        self
    }

    /// Run every detector over the batch. Never fails.
    pub fn summarize(&self, readings: &[Reading]) -> DetectionReport {
        let mut report = DetectionReport::new();
        let stat = &self.statistical;

        self.run(&mut report, "power_deviation", || stat.detect_power_deviation(readings));
        self.run(&mut report, "pattern_deviation", || stat.detect_pattern_deviation(readings));
        self.run(&mut report, "device_failure", || stat.detect_failures(readings));
        self.run(&mut report, "consumption_spike", || stat.detect_spikes(readings));

        if let Some(model) = &self.model {
            self.run(&mut report, "learned_outlier", || model.detect(readings));
        }

        if let Some(thresholds) = &self.thresholds {
            self.run(&mut report, "threshold", || Ok(thresholds.detect(readings)));
        }

        if let Some(recent) = &self.recent {
            self.run(&mut report, "recent_window", || {
                let mut found = detect_recent_peaks(readings, recent.peak_power);
                found.extend(detect_recent_spikes(readings, recent.spike_percent));
                Ok(found)
            });
        }

        report.recount();

        info!(
            readings = readings.len(),
            anomalies = report.total_anomalies,
            degraded = report.degraded.len(),
            "Detection report generated"
        );
        report
    }

    /// Run one detector, folding its outcome into the report
    fn run<F>(&self, report: &mut DetectionReport, name: &str, detector: F)
    where
        F: FnOnce() -> Result<Vec<Anomaly>>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(detector)).unwrap_or_else(|_| {
            Err(DetectError::Computation(format!("{} panicked", name)))
        });

        match outcome {
            Ok(anomalies) => {
                debug!(detector = name, count = anomalies.len(), "detector finished");
                report.anomalies.extend(anomalies);
            }
            Err(e) if e.is_insufficient_data() => {
                debug!(detector = name, "{}", e);
                report.insufficient_data = true;
            }
            Err(e) => {
                warn!(detector = name, "Detector degraded: {}", e);
                report.degraded.push(DegradedDetector {
                    detector: name.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Whether an anomaly warrants a notification
    pub fn should_alert(&self, anomaly: &Anomaly) -> bool {
        should_alert(anomaly)
    }
}

/// Summarize a batch with default statistical detectors only
pub fn summarize(readings: &[Reading]) -> DetectionReport {
    AnomalyAggregator::default().summarize(readings)
}

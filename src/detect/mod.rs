//! Rule and threshold detectors plus report aggregation

pub mod aggregator;
pub mod statistical;
pub mod threshold;

pub use aggregator::{
    should_alert, summarize, AnomalyAggregator, DegradedDetector, DetectionReport, ALERT_SPIKE_RATIO,
};
pub use statistical::{DetectionConfig, StatisticalDetector};
pub use threshold::{
    detect_recent_peaks, detect_recent_spikes, detect_threshold_anomalies, CategoryLimits,
    DeviceCategory, Limit, LimitSet, RecentWindowConfig, ThresholdConfig, ThresholdDetector,
    ThresholdSetting,
};

//! Rule-based statistical detectors
//!
//! Four independent per-device passes over time-ordered readings: power
//! deviation (z-score), hour-of-day pattern deviation, device failure or
//! malfunction, and consumption spikes against a centered rolling mean.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DetectError, Result};
use crate::ml::features::device_groups;
use crate::models::{Anomaly, AnomalyDetails, AnomalyType, Expected, Reading, Severity, Unit};

/// Statistical detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Standard deviations from the mean before a reading is flagged
    pub sensitivity: f64,
    /// Minimum readings across the whole batch
    pub min_batch_readings: usize,
    /// Minimum readings per device for deviation and pattern checks
    pub min_device_readings: usize,
    /// Minimum distinct hours for pattern analysis
    pub pattern_min_hours: usize,
    /// Minimum readings per device for failure checks
    pub failure_min_readings: usize,
    /// Previous power (W) above which a drop to zero counts as failure
    pub failure_drop_power: f64,
    /// Power (W) drawn while switched off that counts as malfunction
    pub malfunction_power: f64,
    /// Centered rolling window for spike detection, odd
    pub spike_window: usize,
    /// Spike when power exceeds this multiple of the rolling mean
    pub spike_factor: f64,
    /// Spike is high severity above this multiple
    pub spike_high_factor: f64,
    /// Absolute floor (W) for a spike
    pub spike_floor: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sensitivity: 2.0,
            min_batch_readings: 10,
            min_device_readings: 10,
            pattern_min_hours: 3,
            failure_min_readings: 5,
            failure_drop_power: 10.0,
            malfunction_power: 5.0,
            spike_window: 3,
            spike_factor: 2.0,
            spike_high_factor: 3.0,
            spike_floor: 50.0,
        }
    }
}

/// Mean and population standard deviation
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Mean and sample standard deviation (n - 1)
fn mean_sample_std(values: &[f64]) -> (f64, f64) {
    let (mean, _) = mean_std(values);
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (mean, (ss / (values.len() - 1) as f64).sqrt())
}

fn ensure_finite(detector: &str, device: &str, values: &[f64]) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DetectError::Computation(format!(
            "{}: non-finite statistics for device {}",
            detector, device
        )))
    }
}

/// Runs the statistical rule detectors
#[derive(Debug, Clone, Default)]
pub struct StatisticalDetector {
    config: DetectionConfig,
}

impl StatisticalDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Every rule detector needs a minimum batch size
    fn require_batch(&self, readings: &[Reading]) -> Result<()> {
        if readings.len() < self.config.min_batch_readings {
            return Err(DetectError::InsufficientData {
                required: self.config.min_batch_readings,
                actual: readings.len(),
            });
        }
        Ok(())
    }

    /// Readings outside mean ± sensitivity·std for their device
    pub fn detect_power_deviation(&self, readings: &[Reading]) -> Result<Vec<Anomaly>> {
        self.require_batch(readings)?;
        let mut anomalies = Vec::new();

        for (device, group) in device_groups(readings) {
            if group.len() < self.config.min_device_readings {
                continue;
            }

            let powers: Vec<f64> = group.iter().map(|r| r.power).collect();
            let (mean, std) = mean_std(&powers);
            ensure_finite("power_deviation", device, &[mean, std])?;

            // No variation, nothing to flag
            if std == 0.0 {
                continue;
            }

            let upper = mean + self.config.sensitivity * std;
            let lower = (mean - self.config.sensitivity * std).max(0.0);
            let range = Expected::Range {
                low: lower,
                high: upper,
            };

            for reading in group {
                let power = reading.power;
                if power > upper || power < lower {
                    let z = (power - mean) / std;
                    anomalies.push(
                        Anomaly::new(
                            AnomalyType::PowerDeviation,
                            reading,
                            power,
                            Severity::from_zscore(z),
                            format!(
                                "Power consumption of {:.1}W is outside normal range ({}W) for {}",
                                power, range, device
                            ),
                        )
                        .with_expected(range.clone())
                        .with_details(AnomalyDetails {
                            z_score: Some(z.abs()),
                            unit: Some(Unit::Watt),
                            ..Default::default()
                        }),
                    );
                }
            }
        }

        debug!(count = anomalies.len(), "power deviation pass complete");
        Ok(anomalies)
    }

    /// Readings in hours whose average usage is unusually high for the device
    pub fn detect_pattern_deviation(&self, readings: &[Reading]) -> Result<Vec<Anomaly>> {
        use chrono::Timelike;

        self.require_batch(readings)?;
        let mut anomalies = Vec::new();

        for (device, group) in device_groups(readings) {
            if group.len() < self.config.min_device_readings {
                continue;
            }

            let mut hourly: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
            for reading in &group {
                let slot = hourly.entry(reading.timestamp.hour()).or_insert((0.0, 0));
                slot.0 += reading.power;
                slot.1 += 1;
            }

            if hourly.len() < self.config.pattern_min_hours {
                continue;
            }

            let hourly_means: Vec<(u32, f64)> = hourly
                .iter()
                .map(|(&hour, &(sum, count))| (hour, sum / count as f64))
                .collect();
            let values: Vec<f64> = hourly_means.iter().map(|(_, m)| *m).collect();
            let (usage_mean, usage_std) = mean_sample_std(&values);
            ensure_finite("pattern_deviation", device, &[usage_mean, usage_std])?;

            if usage_std == 0.0 {
                continue;
            }

            let bound = usage_mean + self.config.sensitivity * usage_std;

            for (hour, avg_power) in hourly_means {
                if avg_power <= bound {
                    continue;
                }

                for reading in group.iter().filter(|r| r.timestamp.hour() == hour) {
                    if reading.power > bound {
                        anomalies.push(
                            Anomaly::new(
                                AnomalyType::PatternDeviation,
                                reading,
                                reading.power,
                                Severity::Medium,
                                format!(
                                    "Unusual usage pattern: {} consuming {:.1}W at {}:00",
                                    device, reading.power, hour
                                ),
                            )
                            .with_expected(Expected::Value(usage_mean))
                            .with_details(AnomalyDetails {
                                hour: Some(hour),
                                unit: Some(Unit::Watt),
                                ..Default::default()
                            }),
                        );
                    }
                }
            }
        }

        debug!(count = anomalies.len(), "pattern deviation pass complete");
        Ok(anomalies)
    }

    /// Sudden drops to zero while switched on, and draw while switched off
    pub fn detect_failures(&self, readings: &[Reading]) -> Result<Vec<Anomaly>> {
        self.require_batch(readings)?;
        let mut anomalies = Vec::new();

        for (device, group) in device_groups(readings) {
            if group.len() < self.config.failure_min_readings {
                continue;
            }

            for (i, current) in group.iter().enumerate() {
                let previous = if i > 0 { Some(group[i - 1]) } else { None };

                let failed = previous.is_some_and(|prev| {
                    prev.power > self.config.failure_drop_power
                        && current.power == 0.0
                        && current.switch_on
                });

                if failed {
                    let prev_power = previous.map(|p| p.power).unwrap_or_default();
                    anomalies.push(
                        Anomaly::new(
                            AnomalyType::DeviceFailure,
                            current,
                            current.power,
                            Severity::High,
                            format!(
                                "Potential device failure: {} suddenly stopped consuming power while switched on",
                                device
                            ),
                        )
                        .with_expected(Expected::Value(prev_power))
                        .with_details(AnomalyDetails {
                            previous_value: Some(prev_power),
                            unit: Some(Unit::Watt),
                            ..Default::default()
                        }),
                    );
                } else if current.power > self.config.malfunction_power && !current.switch_on {
                    anomalies.push(
                        Anomaly::new(
                            AnomalyType::DeviceMalfunction,
                            current,
                            current.power,
                            Severity::Medium,
                            format!(
                                "Device malfunction: {} consuming {:.1}W while switched off",
                                device, current.power
                            ),
                        )
                        .with_expected(Expected::Value(0.0))
                        .with_details(AnomalyDetails {
                            unit: Some(Unit::Watt),
                            ..Default::default()
                        }),
                    );
                }
            }
        }

        debug!(count = anomalies.len(), "failure pass complete");
        Ok(anomalies)
    }

    /// Readings well above their centered rolling mean
    pub fn detect_spikes(&self, readings: &[Reading]) -> Result<Vec<Anomaly>> {
        self.require_batch(readings)?;
        let window = self.config.spike_window.max(1);
        let half = window / 2;
        let mut anomalies = Vec::new();

        for (device, group) in device_groups(readings) {
            if group.len() < window || group.len() < 3 {
                continue;
            }

            let powers: Vec<f64> = group.iter().map(|r| r.power).collect();

            // Edges have no full centered window
            for i in half.max(1)..powers.len() - half.max(1) {
                let slice = &powers[i - half..=i + half];
                let rolling = slice.iter().sum::<f64>() / slice.len() as f64;
                if !rolling.is_finite() || rolling <= 0.0 {
                    continue;
                }

                let power = powers[i];
                if power > rolling * self.config.spike_factor && power > self.config.spike_floor {
                    let severity = if power > rolling * self.config.spike_high_factor {
                        Severity::High
                    } else {
                        Severity::Medium
                    };
                    let ratio = power / rolling;

                    anomalies.push(
                        Anomaly::new(
                            AnomalyType::ConsumptionSpike,
                            group[i],
                            power,
                            severity,
                            format!(
                                "Consumption spike: {} power jumped to {:.1}W (expected ~{:.1}W)",
                                device, power, rolling
                            ),
                        )
                        .with_expected(Expected::Value(rolling))
                        .with_details(AnomalyDetails {
                            spike_ratio: Some(ratio),
                            unit: Some(Unit::Watt),
                            ..Default::default()
                        }),
                    );
                }
            }
        }

        debug!(count = anomalies.len(), "spike pass complete");
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    fn make_reading(device: &str, minute: i64, power: f64, switch_on: bool) -> Reading {
        Reading::new(
            device,
            base() + Duration::minutes(minute),
            power,
            230.0,
            power / 230.0,
            0.0,
            switch_on,
        )
    }

    fn series(device: &str, powers: &[f64]) -> Vec<Reading> {
        powers
            .iter()
            .enumerate()
            .map(|(i, &p)| make_reading(device, i as i64 * 10, p, true))
            .collect()
    }

    fn detector() -> StatisticalDetector {
        StatisticalDetector::default()
    }

    #[test]
    fn test_insufficient_batch() {
        let readings = series("tv", &[100.0; 9]);
        let d = detector();
        assert!(d.detect_power_deviation(&readings).unwrap_err().is_insufficient_data());
        assert!(d.detect_pattern_deviation(&readings).unwrap_err().is_insufficient_data());
        assert!(d.detect_failures(&readings).unwrap_err().is_insufficient_data());
        assert!(d.detect_spikes(&readings).unwrap_err().is_insufficient_data());
    }

    #[test]
    fn test_constant_power_has_no_deviation() {
        let readings = series("fridge", &[150.0; 12]);
        assert!(detector().detect_power_deviation(&readings).unwrap().is_empty());
    }

    #[test]
    fn test_power_deviation_flags_outlier() {
        let mut powers = vec![100.0; 19];
        powers.push(1000.0);
        let readings = series("heater", &powers);

        let anomalies = detector().detect_power_deviation(&readings).unwrap();
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.kind, AnomalyType::PowerDeviation);
        assert_eq!(a.actual_value, 1000.0);
        // mean 145, std ≈ 196.2, z ≈ 4.36
        assert!(a.details.z_score.unwrap() > 4.0);
        assert_eq!(a.severity, Severity::Critical);
        assert!(matches!(a.expected, Some(Expected::Range { low, .. }) if low == 0.0));
    }

    #[test]
    fn test_power_deviation_skips_small_devices() {
        let mut readings = series("big", &[100.0; 10]);
        readings.extend(series("small", &[1.0, 1.0, 1.0, 1.0, 900.0]));
        assert!(detector().detect_power_deviation(&readings).unwrap().is_empty());
    }

    #[test]
    fn test_power_deviation_nan_is_error() {
        let mut powers = vec![100.0; 11];
        powers[3] = f64::NAN;
        let readings = series("kettle", &powers);
        assert!(matches!(
            detector().detect_power_deviation(&readings),
            Err(DetectError::Computation(_))
        ));
    }

    #[test]
    fn test_pattern_deviation() {
        // one reading per hour for 8 hours, hour 5 much busier
        let mut readings = Vec::new();
        for hour in 0..8i64 {
            let power = if hour == 5 { 900.0 } else { 100.0 };
            readings.push(make_reading("oven", hour * 60, power, true));
            readings.push(make_reading("oven", hour * 60 + 30, power, true));
        }

        let anomalies = detector().detect_pattern_deviation(&readings).unwrap();
        assert_eq!(anomalies.len(), 2);
        for a in &anomalies {
            assert_eq!(a.kind, AnomalyType::PatternDeviation);
            assert_eq!(a.severity, Severity::Medium);
            assert_eq!(a.details.hour, Some(5));
            assert_eq!(a.expected_value(), Some(200.0));
        }
    }

    #[test]
    fn test_pattern_needs_three_hours() {
        let mut readings = Vec::new();
        for i in 0..12i64 {
            readings.push(make_reading("lamp", (i % 2) * 60, 40.0 + i as f64, true));
        }
        assert!(detector().detect_pattern_deviation(&readings).unwrap().is_empty());
    }

    #[test]
    fn test_device_failure() {
        let mut readings = series("pump", &[120.0, 118.0, 121.0, 119.0, 0.0, 0.0]);
        readings.extend(series("other", &[5.0; 4]));

        let anomalies = detector().detect_failures(&readings).unwrap();
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.kind, AnomalyType::DeviceFailure);
        assert_eq!(a.severity, Severity::High);
        assert_eq!(a.actual_value, 0.0);
        assert_eq!(a.details.previous_value, Some(119.0));
    }

    #[test]
    fn test_device_malfunction() {
        let mut readings: Vec<Reading> = (0..10)
            .map(|i| make_reading("dryer", i * 10, 0.0, false))
            .collect();
        readings[0].power = 40.0;
        readings[6].power = 12.5;
        readings[7].power = 4.0;

        let anomalies = detector().detect_failures(&readings).unwrap();
        assert_eq!(anomalies.len(), 2);
        for a in &anomalies {
            assert_eq!(a.kind, AnomalyType::DeviceMalfunction);
            assert_eq!(a.severity, Severity::Medium);
            assert_eq!(a.expected_value(), Some(0.0));
        }
    }

    #[test]
    fn test_failures_need_five_readings() {
        let mut readings = series("pump", &[120.0, 0.0, 0.0, 0.0]);
        readings.extend(series("other", &[5.0; 6]));
        assert!(detector().detect_failures(&readings).unwrap().is_empty());
    }

    #[test]
    fn test_consumption_spike() {
        let mut readings = series("kettle", &[100.0, 100.0, 100.0, 500.0, 100.0]);
        readings.extend(series("lamp", &[40.0; 5]));

        let anomalies = detector().detect_spikes(&readings).unwrap();
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.kind, AnomalyType::ConsumptionSpike);
        assert_eq!(a.actual_value, 500.0);
        assert_eq!(a.timestamp, readings[3].timestamp);
        // rolling mean (100 + 500 + 100) / 3, ratio ≈ 2.14
        let ratio = a.details.spike_ratio.unwrap();
        assert!((ratio - 500.0 / (700.0 / 3.0)).abs() < 1e-9);
        assert_eq!(a.severity, Severity::Medium);
    }

    #[test]
    fn test_consumption_spike_high() {
        // a centered window includes the spike itself, so the ratio stays
        // below 3 and high severity needs a lower cut
        let d = StatisticalDetector::new(DetectionConfig {
            spike_high_factor: 2.5,
            ..Default::default()
        });
        let mut readings = series("kettle", &[10.0, 10.0, 10.0, 900.0, 10.0]);
        readings.extend(series("lamp", &[40.0; 5]));

        let anomalies = d.detect_spikes(&readings).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::High);
    }

    #[test]
    fn test_small_spikes_ignored() {
        let mut readings = series("charger", &[5.0, 5.0, 40.0, 5.0, 5.0]);
        readings.extend(series("lamp", &[40.0; 5]));
        assert!(detector().detect_spikes(&readings).unwrap().is_empty());
    }
}

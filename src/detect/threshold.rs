//! Threshold detectors over raw readings
//!
//! Limits are looked up per device, then per device category, then from
//! the system defaults. A missing, disabled or malformed entry means "no
//! threshold" at that level.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DetectError;
use crate::ml::features::device_groups;
use crate::models::{Anomaly, AnomalyDetails, AnomalyType, Expected, Reading, Severity, Unit};

/// Closed set of device categories used for threshold fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Lighting,
    Heating,
    Cooling,
    Kitchen,
    Laundry,
    Entertainment,
    Computing,
    Other,
}

/// A single configured limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSetting {
    pub value: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ThresholdSetting {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            enabled: true,
        }
    }

    /// Usable limit value, or why it is not usable
    fn resolve(&self) -> Result<Option<f64>, DetectError> {
        if !self.enabled {
            return Ok(None);
        }
        if !self.value.is_finite() || self.value <= 0.0 {
            return Err(DetectError::InvalidConfig(format!(
                "threshold value {} must be positive",
                self.value
            )));
        }
        Ok(Some(self.value))
    }
}

/// Limits for one device, category or the whole system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSet {
    /// Watts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_power: Option<ThresholdSetting>,
    /// Volts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_limit: Option<ThresholdSetting>,
    /// Amperes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_limit: Option<ThresholdSetting>,
    /// kWh per reading
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_limit: Option<ThresholdSetting>,
    /// kWh increase between consecutive readings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_spike: Option<ThresholdSetting>,
}

/// Which limit of a [`LimitSet`] to consult
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    PeakPower,
    Voltage,
    Current,
    Energy,
    EnergySpike,
}

impl Limit {
    const PER_READING: [Limit; 4] = [Limit::PeakPower, Limit::Voltage, Limit::Current, Limit::Energy];

    fn setting<'a>(&self, set: &'a LimitSet) -> Option<&'a ThresholdSetting> {
        match self {
            Limit::PeakPower => set.peak_power.as_ref(),
            Limit::Voltage => set.voltage_limit.as_ref(),
            Limit::Current => set.current_limit.as_ref(),
            Limit::Energy => set.energy_limit.as_ref(),
            Limit::EnergySpike => set.energy_spike.as_ref(),
        }
    }

    fn anomaly_type(&self) -> AnomalyType {
        match self {
            Limit::PeakPower => AnomalyType::PeakPower,
            Limit::Voltage => AnomalyType::VoltageLimit,
            Limit::Current => AnomalyType::CurrentLimit,
            Limit::Energy => AnomalyType::EnergyLimit,
            Limit::EnergySpike => AnomalyType::EnergySpike,
        }
    }

    fn unit(&self) -> Unit {
        match self {
            Limit::PeakPower => Unit::Watt,
            Limit::Voltage => Unit::Volt,
            Limit::Current => Unit::Ampere,
            Limit::Energy | Limit::EnergySpike => Unit::KilowattHour,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Limit::PeakPower => "Peak power",
            Limit::Voltage => "Voltage",
            Limit::Current => "Current",
            Limit::Energy => "Energy consumption",
            Limit::EnergySpike => "Energy spike",
        }
    }

    fn value(&self, reading: &Reading) -> f64 {
        match self {
            Limit::PeakPower => reading.power,
            Limit::Voltage => reading.voltage,
            Limit::Current => reading.current,
            Limit::Energy | Limit::EnergySpike => reading.energy,
        }
    }
}

/// Limits for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryLimits {
    pub category: DeviceCategory,
    #[serde(flatten)]
    pub limits: LimitSet,
}

/// Per-device, per-category and system-wide limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// System-wide fallback
    pub system: LimitSet,
    /// Device id to category
    pub device_categories: HashMap<String, DeviceCategory>,
    /// Category fallbacks
    pub categories: Vec<CategoryLimits>,
    /// Device-specific limits, keyed by device id
    pub devices: HashMap<String, LimitSet>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            system: LimitSet {
                peak_power: Some(ThresholdSetting::new(2000.0)),
                ..Default::default()
            },
            device_categories: HashMap::new(),
            categories: Vec::new(),
            devices: HashMap::new(),
        }
    }
}

impl ThresholdConfig {
    /// Resolve a limit for a device: device entry, then category, then system
    pub fn lookup(&self, device: &str, limit: Limit) -> Option<f64> {
        let device_entry = self.devices.get(device);
        let category_entry = self.device_categories.get(device).and_then(|cat| {
            self.categories
                .iter()
                .find(|c| c.category == *cat)
                .map(|c| &c.limits)
        });

        [device_entry, category_entry, Some(&self.system)]
            .into_iter()
            .flatten()
            .filter_map(|set| limit.setting(set))
            .find_map(|setting| match setting.resolve() {
                Ok(value) => value,
                Err(e) => {
                    warn!(device, "{}; ignoring entry", e);
                    None
                }
            })
    }
}

/// Per-reading anomaly for a breached limit
fn limit_anomaly(
    reading: &Reading,
    limit: Limit,
    actual: f64,
    threshold: f64,
    severity: Severity,
    description: String,
) -> Anomaly {
    let exceeded_by = actual - threshold;
    Anomaly::new(limit.anomaly_type(), reading, actual, severity, description)
        .with_expected(Expected::Threshold(threshold))
        .with_details(AnomalyDetails {
            exceeded_by: Some(exceeded_by),
            percentage_exceeded: Some(exceeded_by / threshold * 100.0),
            unit: Some(limit.unit()),
            ..Default::default()
        })
}

/// Checks readings against configured limits
#[derive(Debug, Clone, Default)]
pub struct ThresholdDetector {
    config: ThresholdConfig,
}

impl ThresholdDetector {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// All limit breaches followed by all configured energy spikes
    pub fn detect(&self, readings: &[Reading]) -> Vec<Anomaly> {
        let mut anomalies = self.detect_limits(readings);
        anomalies.extend(self.detect_energy_spikes(readings));
        anomalies
    }

    /// Peak power, voltage, current and energy limits, per reading
    pub fn detect_limits(&self, readings: &[Reading]) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for reading in readings {
            for limit in Limit::PER_READING {
                let Some(threshold) = self.config.lookup(&reading.device_id, limit) else {
                    continue;
                };
                let actual = limit.value(reading);
                if actual > threshold {
                    let pct = (actual - threshold) / threshold * 100.0;
                    anomalies.push(limit_anomaly(
                        reading,
                        limit,
                        actual,
                        threshold,
                        Severity::from_percentage_exceeded(pct),
                        format!(
                            "{} threshold ({:.1}{}) exceeded for {}",
                            limit.label(),
                            threshold,
                            limit.unit().as_str(),
                            reading.device_id
                        ),
                    ));
                }
            }
        }

        debug!(count = anomalies.len(), "threshold limit pass complete");
        anomalies
    }

    /// Energy increase between consecutive readings of a device
    pub fn detect_energy_spikes(&self, readings: &[Reading]) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for (device, group) in device_groups(readings) {
            if group.len() < 2 {
                continue;
            }
            let Some(threshold) = self.config.lookup(device, Limit::EnergySpike) else {
                continue;
            };

            for pair in group.windows(2) {
                let (previous, current) = (pair[0], pair[1]);
                let increase = current.energy - previous.energy;
                if increase > threshold {
                    let pct = (increase - threshold) / threshold * 100.0;
                    let mut anomaly = limit_anomaly(
                        current,
                        Limit::EnergySpike,
                        increase,
                        threshold,
                        Severity::from_spike_percentage(pct),
                        format!("Energy consumption spike detected for {}", device),
                    );
                    anomaly.details.previous_value = Some(previous.energy);
                    anomalies.push(anomaly);
                }
            }
        }

        debug!(count = anomalies.len(), "energy spike pass complete");
        anomalies
    }
}

/// Detect all threshold anomalies for a batch
pub fn detect_threshold_anomalies(readings: &[Reading], config: &ThresholdConfig) -> Vec<Anomaly> {
    ThresholdDetector::new(config.clone()).detect(readings)
}

/// Flat thresholds for checks over a recent window of readings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentWindowConfig {
    /// Peak power threshold in watts
    pub peak_power: f64,
    /// Percent increase between consecutive readings
    pub spike_percent: f64,
}

impl Default for RecentWindowConfig {
    fn default() -> Self {
        Self {
            peak_power: 1000.0,
            spike_percent: 50.0,
        }
    }
}

/// Readings above a flat peak-power threshold, severity by actual/threshold
pub fn detect_recent_peaks(readings: &[Reading], threshold: f64) -> Vec<Anomaly> {
    if !threshold.is_finite() || threshold <= 0.0 {
        warn!(threshold, "invalid peak power threshold; skipping");
        return Vec::new();
    }

    readings
        .iter()
        .filter(|r| r.power > threshold)
        .map(|r| {
            limit_anomaly(
                r,
                Limit::PeakPower,
                r.power,
                threshold,
                Severity::from_ratio(r.power / threshold),
                format!(
                    "Peak power of {:.1}W exceeded threshold of {:.1}W",
                    r.power, threshold
                ),
            )
        })
        .collect()
}

/// Consecutive readings of a device whose power rose by more than `percent`
pub fn detect_recent_spikes(readings: &[Reading], percent: f64) -> Vec<Anomaly> {
    if !percent.is_finite() || percent < 0.0 {
        warn!(percent, "invalid spike percentage; skipping");
        return Vec::new();
    }

    let mut anomalies = Vec::new();
    for (_, group) in device_groups(readings) {
        for pair in group.windows(2) {
            let (previous, current) = (pair[0], pair[1]);
            if previous.power <= 0.0 {
                continue;
            }

            let increase = (current.power - previous.power) / previous.power * 100.0;
            if increase > percent {
                anomalies.push(
                    Anomaly::new(
                        AnomalyType::EnergySpike,
                        current,
                        current.power,
                        Severity::from_spike_percentage(increase),
                        format!("Energy spike of {:.1}% detected", increase),
                    )
                    .with_expected(Expected::Threshold(previous.power * (1.0 + percent / 100.0)))
                    .with_details(AnomalyDetails {
                        exceeded_by: Some(current.power - previous.power),
                        percentage_exceeded: Some(increase),
                        previous_value: Some(previous.power),
                        unit: Some(Unit::Watt),
                        ..Default::default()
                    }),
                );
            }
        }
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_reading(device: &str, minute: i64, power: f64, voltage: f64, energy: f64) -> Reading {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap() + Duration::minutes(minute);
        Reading::new(device, ts, power, voltage, power / voltage, energy, true)
    }

    fn empty_config() -> ThresholdConfig {
        ThresholdConfig {
            system: LimitSet::default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_peak_power_exceeded() {
        let mut config = empty_config();
        config.system.peak_power = Some(ThresholdSetting::new(1000.0));

        let readings = vec![
            make_reading("heater", 0, 1500.0, 230.0, 0.0),
            make_reading("heater", 1, 900.0, 230.0, 0.0),
        ];
        let anomalies = ThresholdDetector::new(config).detect_limits(&readings);
        assert_eq!(anomalies.len(), 1);

        let a = &anomalies[0];
        assert_eq!(a.kind, AnomalyType::PeakPower);
        assert_eq!(a.details.exceeded_by, Some(500.0));
        assert_eq!(a.details.percentage_exceeded, Some(50.0));
        assert_eq!(a.details.unit, Some(Unit::Watt));
        // exactly 50% is not above the 50% cut
        assert_eq!(a.severity, Severity::Medium);
    }

    #[test]
    fn test_recent_peak_severity_by_ratio() {
        let readings = vec![make_reading("heater", 0, 1500.0, 230.0, 0.0)];
        let anomalies = detect_recent_peaks(&readings, 1000.0);
        assert_eq!(anomalies.len(), 1);

        let a = &anomalies[0];
        assert_eq!(a.details.exceeded_by, Some(500.0));
        assert_eq!(a.details.percentage_exceeded, Some(50.0));
        assert_eq!(a.severity, Severity::High);
    }

    #[test]
    fn test_lookup_order() {
        let mut config = empty_config();
        config.system.peak_power = Some(ThresholdSetting::new(3000.0));
        config
            .device_categories
            .insert("kettle".to_string(), DeviceCategory::Kitchen);
        config.categories.push(CategoryLimits {
            category: DeviceCategory::Kitchen,
            limits: LimitSet {
                peak_power: Some(ThresholdSetting::new(2200.0)),
                ..Default::default()
            },
        });
        config.devices.insert(
            "lamp".to_string(),
            LimitSet {
                peak_power: Some(ThresholdSetting::new(100.0)),
                ..Default::default()
            },
        );

        assert_eq!(config.lookup("lamp", Limit::PeakPower), Some(100.0));
        assert_eq!(config.lookup("kettle", Limit::PeakPower), Some(2200.0));
        assert_eq!(config.lookup("tv", Limit::PeakPower), Some(3000.0));
        assert_eq!(config.lookup("tv", Limit::Voltage), None);
    }

    #[test]
    fn test_disabled_and_invalid_entries_fall_through() {
        let mut config = empty_config();
        config.system.voltage_limit = Some(ThresholdSetting::new(250.0));
        config.devices.insert(
            "fan".to_string(),
            LimitSet {
                voltage_limit: Some(ThresholdSetting {
                    value: 240.0,
                    enabled: false,
                }),
                ..Default::default()
            },
        );
        config.devices.insert(
            "pump".to_string(),
            LimitSet {
                voltage_limit: Some(ThresholdSetting::new(-5.0)),
                ..Default::default()
            },
        );

        assert_eq!(config.lookup("fan", Limit::Voltage), Some(250.0));
        assert_eq!(config.lookup("pump", Limit::Voltage), Some(250.0));
    }

    #[test]
    fn test_voltage_current_energy_limits() {
        let mut config = empty_config();
        config.system = LimitSet {
            voltage_limit: Some(ThresholdSetting::new(240.0)),
            current_limit: Some(ThresholdSetting::new(5.0)),
            energy_limit: Some(ThresholdSetting::new(10.0)),
            ..Default::default()
        };

        // 2500 W / 250 V = 10 A
        let readings = vec![make_reading("oven", 0, 2500.0, 250.0, 25.0)];
        let anomalies = detect_threshold_anomalies(&readings, &config);

        let kinds: Vec<AnomalyType> = anomalies.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AnomalyType::VoltageLimit,
                AnomalyType::CurrentLimit,
                AnomalyType::EnergyLimit
            ]
        );
        assert_eq!(anomalies[0].severity, Severity::Low);
        assert_eq!(anomalies[1].severity, Severity::High);
        assert_eq!(anomalies[1].details.unit, Some(Unit::Ampere));
        assert_eq!(anomalies[2].severity, Severity::Critical);
        assert_eq!(anomalies[2].details.unit, Some(Unit::KilowattHour));
    }

    #[test]
    fn test_energy_spike_by_threshold() {
        let mut config = empty_config();
        config.system.energy_spike = Some(ThresholdSetting::new(0.5));

        let readings = vec![
            make_reading("dryer", 2, 100.0, 230.0, 3.0),
            make_reading("dryer", 0, 100.0, 230.0, 1.0),
            make_reading("dryer", 1, 100.0, 230.0, 1.2),
        ];
        let anomalies = ThresholdDetector::new(config).detect_energy_spikes(&readings);
        assert_eq!(anomalies.len(), 1);

        let a = &anomalies[0];
        assert_eq!(a.kind, AnomalyType::EnergySpike);
        assert!((a.actual_value - 1.8).abs() < 1e-9);
        // (1.8 - 0.5) / 0.5 = 260%
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.details.previous_value, Some(1.2));
    }

    #[test]
    fn test_no_threshold_no_anomaly() {
        let readings = vec![make_reading("tv", 0, 99_999.0, 400.0, 500.0)];
        assert!(detect_threshold_anomalies(&readings, &empty_config()).is_empty());
    }

    #[test]
    fn test_recent_spikes_per_device() {
        let readings = vec![
            make_reading("tv", 0, 100.0, 230.0, 0.0),
            make_reading("lamp", 1, 400.0, 230.0, 0.0),
            make_reading("tv", 2, 180.0, 230.0, 0.0),
            make_reading("tv", 3, 190.0, 230.0, 0.0),
        ];
        let anomalies = detect_recent_spikes(&readings, 50.0);
        assert_eq!(anomalies.len(), 1);

        let a = &anomalies[0];
        assert_eq!(a.device_id, "tv");
        assert_eq!(a.details.percentage_exceeded, Some(80.0));
        assert_eq!(a.severity, Severity::Medium);
        assert_eq!(a.expected_value(), Some(150.0));
    }

    #[test]
    fn test_recent_invalid_thresholds() {
        let readings = vec![make_reading("tv", 0, 100.0, 230.0, 0.0)];
        assert!(detect_recent_peaks(&readings, 0.0).is_empty());
        assert!(detect_recent_spikes(&readings, f64::NAN).is_empty());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = ThresholdConfig::default();
        config
            .device_categories
            .insert("kettle".to_string(), DeviceCategory::Kitchen);
        config.categories.push(CategoryLimits {
            category: DeviceCategory::Kitchen,
            limits: LimitSet {
                peak_power: Some(ThresholdSetting::new(2200.0)),
                ..Default::default()
            },
        });

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ThresholdConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}

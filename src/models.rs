use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single power-meter reading for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "device", alias = "device_name")]
    pub device_id: String,
    /// Watts
    #[serde(default)]
    pub power: f64,
    /// Volts
    #[serde(default)]
    pub voltage: f64,
    /// Amperes
    #[serde(default)]
    pub current: f64,
    /// Cumulative kWh
    #[serde(default, alias = "energy_kwh")]
    pub energy: f64,
    #[serde(default, alias = "switch_status")]
    pub switch_on: bool,
}

impl Reading {
    pub fn new(
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        power: f64,
        voltage: f64,
        current: f64,
        energy: f64,
        switch_on: bool,
    ) -> Self {
        Self {
            timestamp,
            device_id: device_id.into(),
            power,
            voltage,
            current,
            energy,
            switch_on,
        }
    }
}

/// Ordinal severity attached to every anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Severity from an absolute z-score
    pub fn from_zscore(z: f64) -> Self {
        let z = z.abs();
        if z > 4.0 {
            Severity::Critical
        } else if z > 3.0 {
            Severity::High
        } else if z > 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Severity for limit breaches (peak power, voltage, current, energy)
    pub fn from_percentage_exceeded(pct: f64) -> Self {
        if pct > 100.0 {
            Severity::Critical
        } else if pct > 50.0 {
            Severity::High
        } else if pct > 25.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Severity for spikes measured as a percentage
    pub fn from_spike_percentage(pct: f64) -> Self {
        if pct > 200.0 {
            Severity::Critical
        } else if pct > 100.0 {
            Severity::High
        } else if pct > 50.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Severity from actual / threshold
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 1.2 {
            Severity::Low
        } else if ratio < 1.5 {
            Severity::Medium
        } else if ratio < 2.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    /// Severity from an outlier decision score (more negative = worse)
    pub fn from_outlier_score(score: f64) -> Self {
        if score < -0.5 {
            Severity::Critical
        } else if score < -0.3 {
            Severity::High
        } else if score < -0.1 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of detected anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    PowerDeviation,
    PatternDeviation,
    DeviceFailure,
    DeviceMalfunction,
    ConsumptionSpike,
    PeakPower,
    VoltageLimit,
    CurrentLimit,
    EnergyLimit,
    EnergySpike,
    LearnedOutlier,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::PowerDeviation => "power_deviation",
            AnomalyType::PatternDeviation => "pattern_deviation",
            AnomalyType::DeviceFailure => "device_failure",
            AnomalyType::DeviceMalfunction => "device_malfunction",
            AnomalyType::ConsumptionSpike => "consumption_spike",
            AnomalyType::PeakPower => "peak_power",
            AnomalyType::VoltageLimit => "voltage_limit",
            AnomalyType::CurrentLimit => "current_limit",
            AnomalyType::EnergyLimit => "energy_limit",
            AnomalyType::EnergySpike => "energy_spike",
            AnomalyType::LearnedOutlier => "learned_outlier",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurement unit of an anomaly's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "A")]
    Ampere,
    #[serde(rename = "kWh")]
    KilowattHour,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Watt => "W",
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::KilowattHour => "kWh",
        }
    }
}

/// What the detector expected instead of the actual value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expected {
    Value(f64),
    Range { low: f64, high: f64 },
    Threshold(f64),
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Value(v) => write!(f, "{:.1}", v),
            Expected::Range { low, high } => write!(f, "{:.1} - {:.1}", low, high),
            Expected::Threshold(t) => write!(f, "<= {:.1}", t),
        }
    }
}

/// Detector-specific measurements carried alongside an anomaly
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spike_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceeded_by: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_exceeded: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

/// A flagged reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub actual_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Expected>,
    pub severity: Severity,
    pub description: String,
    #[serde(flatten)]
    pub details: AnomalyDetails,
}

impl Anomaly {
    pub fn new(
        kind: AnomalyType,
        reading: &Reading,
        actual_value: f64,
        severity: Severity,
        description: String,
    ) -> Self {
        Self {
            kind,
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            actual_value,
            expected: None,
            severity,
            description,
            details: AnomalyDetails::default(),
        }
    }

    pub fn with_expected(mut self, expected: Expected) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn with_details(mut self, details: AnomalyDetails) -> Self {
        self.details = details;
        self
    }

    /// Expected value when the detector reported a single number
    pub fn expected_value(&self) -> Option<f64> {
        match self.expected {
            Some(Expected::Value(v)) | Some(Expected::Threshold(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_severity_mappings() {
        assert_eq!(Severity::from_zscore(-4.5), Severity::Critical);
        assert_eq!(Severity::from_zscore(3.5), Severity::High);
        assert_eq!(Severity::from_zscore(2.1), Severity::Medium);
        assert_eq!(Severity::from_zscore(1.0), Severity::Low);

        assert_eq!(Severity::from_percentage_exceeded(50.0), Severity::Medium);
        assert_eq!(Severity::from_percentage_exceeded(50.1), Severity::High);
        assert_eq!(Severity::from_percentage_exceeded(101.0), Severity::Critical);

        assert_eq!(Severity::from_spike_percentage(60.0), Severity::Medium);
        assert_eq!(Severity::from_spike_percentage(250.0), Severity::Critical);

        assert_eq!(Severity::from_ratio(1.1), Severity::Low);
        assert_eq!(Severity::from_ratio(1.2), Severity::Medium);
        assert_eq!(Severity::from_ratio(1.5), Severity::High);
        assert_eq!(Severity::from_ratio(2.0), Severity::Critical);

        assert_eq!(Severity::from_outlier_score(-0.6), Severity::Critical);
        assert_eq!(Severity::from_outlier_score(-0.4), Severity::High);
        assert_eq!(Severity::from_outlier_score(-0.2), Severity::Medium);
        assert_eq!(Severity::from_outlier_score(0.0), Severity::Low);
    }

    #[test]
    fn test_reading_aliases() {
        let json = r#"{
            "timestamp": "2024-03-01T10:00:00Z",
            "device_name": "fridge",
            "power": 120.5,
            "voltage": 230.0,
            "current": 0.52,
            "energy_kwh": 1.25,
            "switch_status": true
        }"#;
        let reading: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(reading.device_id, "fridge");
        assert_eq!(reading.energy, 1.25);
        assert!(reading.switch_on);
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_anomaly_serializes_flat_details() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let reading = Reading::new("heater", ts, 1500.0, 230.0, 6.5, 2.0, true);
        let anomaly = Anomaly::new(
            AnomalyType::PeakPower,
            &reading,
            1500.0,
            Severity::High,
            "too much".to_string(),
        )
        .with_expected(Expected::Threshold(1000.0))
        .with_details(AnomalyDetails {
            exceeded_by: Some(500.0),
            unit: Some(Unit::Watt),
            ..Default::default()
        });

        let value = serde_json::to_value(&anomaly).unwrap();
        assert_eq!(value["type"], "peak_power");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["exceeded_by"], 500.0);
        assert_eq!(value["unit"], "W");
        assert!(value.get("z_score").is_none());
        assert_eq!(anomaly.expected_value(), Some(1000.0));
    }
}

//! Feature engineering over raw readings
//!
//! Turns a batch of readings into per-device, time-ordered rows carrying
//! calendar features and trailing rolling statistics of power.

use std::collections::HashMap;

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use crate::models::Reading;

/// Default trailing window for rolling statistics
pub const DEFAULT_ROLLING_WINDOW: usize = 10;

/// Candidate model inputs, in the order they are fed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureColumn {
    Power,
    Voltage,
    Current,
    Energy,
    Hour,
    DayOfWeek,
    RollingMean,
    RollingStd,
    PowerChangeRate,
}

impl FeatureColumn {
    pub const ALL: [FeatureColumn; 9] = [
        FeatureColumn::Power,
        FeatureColumn::Voltage,
        FeatureColumn::Current,
        FeatureColumn::Energy,
        FeatureColumn::Hour,
        FeatureColumn::DayOfWeek,
        FeatureColumn::RollingMean,
        FeatureColumn::RollingStd,
        FeatureColumn::PowerChangeRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureColumn::Power => "power",
            FeatureColumn::Voltage => "voltage",
            FeatureColumn::Current => "current",
            FeatureColumn::Energy => "energy",
            FeatureColumn::Hour => "hour",
            FeatureColumn::DayOfWeek => "day_of_week",
            FeatureColumn::RollingMean => "rolling_mean",
            FeatureColumn::RollingStd => "rolling_std",
            FeatureColumn::PowerChangeRate => "power_change_rate",
        }
    }

    /// Extract this column from a row
    #[inline]
    pub fn value(&self, row: &FeatureRow) -> f64 {
        match self {
            FeatureColumn::Power => row.reading.power,
            FeatureColumn::Voltage => row.reading.voltage,
            FeatureColumn::Current => row.reading.current,
            FeatureColumn::Energy => row.reading.energy,
            FeatureColumn::Hour => row.hour as f64,
            FeatureColumn::DayOfWeek => row.day_of_week as f64,
            FeatureColumn::RollingMean => row.rolling_mean,
            FeatureColumn::RollingStd => row.rolling_std,
            FeatureColumn::PowerChangeRate => row.power_change_rate,
        }
    }
}

/// A reading enriched with derived features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub reading: Reading,
    /// Hour of day (0-23)
    pub hour: u32,
    /// Monday = 0 .. Sunday = 6
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub rolling_mean: f64,
    pub rolling_std: f64,
    pub rolling_max: f64,
    pub rolling_min: f64,
    pub power_change: f64,
    pub power_change_rate: f64,
}

impl FeatureRow {
    /// Project the selected columns into a dense vector
    pub fn vector(&self, columns: &[FeatureColumn]) -> Vec<f64> {
        columns.iter().map(|c| c.value(self)).collect()
    }
}

/// Group readings by device in first-seen order, each group stably sorted
/// by timestamp.
pub fn device_groups(readings: &[Reading]) -> Vec<(&str, Vec<&Reading>)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<(&str, Vec<&Reading>)> = Vec::new();

    for reading in readings {
        let device = reading.device_id.as_str();
        let slot = *index.entry(device).or_insert_with(|| {
            groups.push((device, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(reading);
    }

    for (_, group) in &mut groups {
        group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    groups
}

/// Builds feature rows from a batch of readings
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    window: usize,
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureBuilder {
    pub fn new() -> Self {
        Self {
            window: DEFAULT_ROLLING_WINDOW,
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    /// Build rows for every device in the batch
    pub fn build(&self, readings: &[Reading]) -> Vec<FeatureRow> {
        let mut rows = Vec::with_capacity(readings.len());

        for (_, group) in device_groups(readings) {
            let window = self.window.min(group.len()).max(1);
            let group: Vec<Reading> = group.into_iter().map(sanitized).collect();
            let powers: Vec<f64> = group.iter().map(|r| r.power).collect();

            for (i, reading) in group.into_iter().enumerate() {
                let start = (i + 1).saturating_sub(window);
                let stats = RollingStats::compute(&powers[start..=i]);

                let power_change = if i == 0 {
                    0.0
                } else {
                    powers[i] - powers[i - 1]
                };
                let power_change_rate = if stats.mean == 0.0 {
                    0.0
                } else {
                    power_change / stats.mean
                };

                let weekday = reading.timestamp.weekday().num_days_from_monday();

                let hour = reading.timestamp.hour();
                rows.push(FeatureRow {
                    reading,
                    hour,
                    day_of_week: weekday,
                    is_weekend: weekday >= 5,
                    rolling_mean: finite_or_zero(stats.mean),
                    rolling_std: finite_or_zero(stats.std),
                    rolling_max: finite_or_zero(stats.max),
                    rolling_min: finite_or_zero(stats.min),
                    power_change: finite_or_zero(power_change),
                    power_change_rate: finite_or_zero(power_change_rate),
                });
            }
        }

        rows
    }
}

/// Build feature rows with the default rolling window
pub fn build_features(readings: &[Reading]) -> Vec<FeatureRow> {
    FeatureBuilder::default().build(readings)
}

struct RollingStats {
    mean: f64,
    std: f64,
    max: f64,
    min: f64,
}

impl RollingStats {
    /// Sample statistics over a non-empty window; std is 0 for a single value
    fn compute(values: &[f64]) -> Self {
        let n = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = if values.len() < 2 {
            0.0
        } else {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1.0)).sqrt()
        };
        let max = values.iter().copied().fold(f64::MIN, f64::max);
        let min = values.iter().copied().fold(f64::MAX, f64::min);

        Self { mean, std, max, min }
    }
}

/// Copy of a reading with non-finite measurements replaced by 0
fn sanitized(reading: &Reading) -> Reading {
    let mut reading = reading.clone();
    reading.power = finite_or_zero(reading.power);
    reading.voltage = finite_or_zero(reading.voltage);
    reading.current = finite_or_zero(reading.current);
    reading.energy = finite_or_zero(reading.energy);
    reading
}

#[inline]
fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_reading(device: &str, minute: i64, power: f64) -> Reading {
        // 2024-03-02 is a Saturday
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 14, 0, 0).unwrap() + Duration::minutes(minute);
        Reading::new(device, ts, power, 230.0, power / 230.0, 0.1 * minute as f64, true)
    }

    #[test]
    fn test_single_reading_device() {
        let rows = build_features(&[make_reading("lamp", 0, 60.0)]);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.rolling_mean, 60.0);
        assert_eq!(row.rolling_std, 0.0);
        assert_eq!(row.rolling_max, 60.0);
        assert_eq!(row.rolling_min, 60.0);
        assert_eq!(row.power_change, 0.0);
        assert_eq!(row.power_change_rate, 0.0);
    }

    #[test]
    fn test_calendar_features() {
        let rows = build_features(&[make_reading("lamp", 30, 60.0)]);
        assert_eq!(rows[0].hour, 14);
        assert_eq!(rows[0].day_of_week, 5);
        assert!(rows[0].is_weekend);
    }

    #[test]
    fn test_groups_sorted_and_isolated() {
        let readings = vec![
            make_reading("tv", 2, 300.0),
            make_reading("lamp", 1, 40.0),
            make_reading("tv", 0, 100.0),
            make_reading("tv", 1, 200.0),
            make_reading("lamp", 0, 20.0),
        ];
        let rows = build_features(&readings);

        let devices: Vec<&str> = rows.iter().map(|r| r.reading.device_id.as_str()).collect();
        assert_eq!(devices, vec!["tv", "tv", "tv", "lamp", "lamp"]);

        let tv_powers: Vec<f64> = rows[..3].iter().map(|r| r.reading.power).collect();
        assert_eq!(tv_powers, vec![100.0, 200.0, 300.0]);
        assert_eq!(rows[1].power_change, 100.0);
        assert_eq!(rows[2].rolling_mean, 200.0);
        assert!((rows[2].rolling_std - 100.0).abs() < 1e-9);
        assert!((rows[1].power_change_rate - 100.0 / 150.0).abs() < 1e-9);

        // lamp statistics never see tv readings
        assert_eq!(rows[3].rolling_mean, 20.0);
        assert_eq!(rows[4].rolling_mean, 30.0);
        assert_eq!(rows[4].rolling_max, 40.0);
    }

    #[test]
    fn test_rolling_window_caps_at_ten() {
        let readings: Vec<Reading> = (0..15).map(|i| make_reading("fan", i, i as f64)).collect();
        let rows = build_features(&readings);
        // last row averages powers 5..=14
        assert_eq!(rows[14].rolling_mean, 9.5);
        assert_eq!(rows[14].rolling_min, 5.0);
    }

    #[test]
    fn test_zero_rolling_mean_gives_zero_rate() {
        let readings = vec![make_reading("plug", 0, 0.0), make_reading("plug", 1, 0.0)];
        let rows = build_features(&readings);
        assert_eq!(rows[1].power_change_rate, 0.0);
    }

    #[test]
    fn test_stable_order_for_equal_timestamps() {
        let a = make_reading("plug", 0, 1.0);
        let b = make_reading("plug", 0, 2.0);
        let batch = [a, b];
        let groups = device_groups(&batch);
        assert_eq!(groups[0].1[0].power, 1.0);
        assert_eq!(groups[0].1[1].power, 2.0);
    }

    #[test]
    fn test_feature_vector_projection() {
        let rows = build_features(&[make_reading("lamp", 0, 60.0)]);
        let v = rows[0].vector(&[FeatureColumn::Power, FeatureColumn::Hour]);
        assert_eq!(v, vec![60.0, 14.0]);
    }

    #[test]
    fn test_non_finite_measurements_filled() {
        let mut readings: Vec<Reading> = (0..30).map(|i| make_reading("oven", i, 100.0 + i as f64)).collect();
        readings[5].power = f64::NAN;
        readings[8].voltage = f64::INFINITY;
        let rows = build_features(&readings);

        for row in &rows {
            assert!(row.vector(&FeatureColumn::ALL).iter().all(|v| v.is_finite()));
        }
        assert_eq!(rows[5].reading.power, 0.0);
        assert_eq!(rows[8].reading.voltage, 0.0);
        // rows after the bad reading keep real rolling statistics
        assert!(rows[6].rolling_mean > 0.0);
        assert!(rows[6].rolling_std > 0.0);

        let matrix: Vec<Vec<f64>> = rows.iter().map(|r| r.vector(&FeatureColumn::ALL)).collect();
        let scaler = crate::ml::StandardScaler::fit(&matrix);
        assert!(scaler.means().iter().chain(scaler.scales()).all(|v| v.is_finite()));
    }
}

//! Alert dispatch
//!
//! Runs after a report is built: picks alert-worthy anomalies, applies a
//! per-(device, type) cooldown, and hands them to a delivery sink.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detect::{should_alert, DetectionReport};
use crate::models::{Anomaly, AnomalyType};

/// Something to deliver
#[derive(Debug, Clone, Copy)]
pub enum Notification<'a> {
    Anomaly(&'a Anomaly),
    Report(&'a DetectionReport),
}

/// Delivery channel (email, chat, pager, ...)
pub trait NotificationSink {
    fn deliver(&mut self, notification: Notification<'_>) -> anyhow::Result<()>;
}

/// Sink that writes alerts to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&mut self, notification: Notification<'_>) -> anyhow::Result<()> {
        match notification {
            Notification::Anomaly(a) => warn!(
                device = %a.device_id,
                kind = %a.kind,
                severity = %a.severity,
                "{}",
                a.description
            ),
            Notification::Report(r) => info!(
                anomalies = r.total_anomalies,
                degraded = r.degraded.len(),
                "Detection report"
            ),
        }
        Ok(())
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum minutes between alerts for the same device and type
    pub cooldown_minutes: i64,
    /// Dispatch records kept in history
    pub max_history: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 15,
            max_history: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// One dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub at: DateTime<Utc>,
    pub device_id: String,
    pub kind: AnomalyType,
    pub message: String,
    pub status: DeliveryStatus,
}

/// Outcome counts for one dispatch call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// Filters, rate-limits and delivers alerts
pub struct AlertDispatcher<S: NotificationSink> {
    sink: S,
    cooldown: Duration,
    max_history: usize,
    last_sent: HashMap<(String, AnomalyType), DateTime<Utc>>,
    history: VecDeque<AlertRecord>,
}

impl<S: NotificationSink> AlertDispatcher<S> {
    pub fn new(sink: S, config: &AlertConfig) -> Self {
        Self {
            sink,
            cooldown: Duration::try_minutes(config.cooldown_minutes.max(0)).unwrap_or(Duration::MAX),
            max_history: config.max_history.max(1),
            last_sent: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Dispatch alert-worthy anomalies of a report as of now
    pub fn dispatch(&mut self, report: &DetectionReport) -> DispatchSummary {
        self.dispatch_at(report, Utc::now())
    }

    /// Dispatch alert-worthy anomalies, measuring cooldowns from `now`
    pub fn dispatch_at(&mut self, report: &DetectionReport, now: DateTime<Utc>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for anomaly in report.anomalies.iter().filter(|a| should_alert(a)) {
            let key = (anomaly.device_id.clone(), anomaly.kind);
            if let Some(last) = self.last_sent.get(&key) {
                if now - *last <= self.cooldown {
                    summary.suppressed += 1;
                    continue;
                }
            }

            let status = match self.sink.deliver(Notification::Anomaly(anomaly)) {
                Ok(()) => {
                    self.last_sent.insert(key, now);
                    summary.sent += 1;
                    DeliveryStatus::Sent
                }
                Err(e) => {
                    warn!(device = %anomaly.device_id, "Alert delivery failed: {:#}", e);
                    summary.failed += 1;
                    DeliveryStatus::Failed
                }
            };

            self.record(AlertRecord {
                at: now,
                device_id: anomaly.device_id.clone(),
                kind: anomaly.kind,
                message: anomaly.description.clone(),
                status,
            });
        }

        summary
    }

    /// Deliver the whole report as one notification
    pub fn send_summary(&mut self, report: &DetectionReport) -> anyhow::Result<()> {
        self.sink.deliver(Notification::Report(report))
    }

    fn record(&mut self, record: AlertRecord) {
        self.history.push_back(record);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// Most recent `limit` dispatch records, oldest first
    pub fn history(&self, limit: usize) -> Vec<&AlertRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).collect()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::ComponentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlaViolation,
    PersistentDowntime,
    Recovery,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::SlaViolation => "sla_violation",
            AlertKind::PersistentDowntime => "persistent_downtime",
            AlertKind::Recovery => "recovery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sla_violation" => Some(AlertKind::SlaViolation),
            "persistent_downtime" => Some(AlertKind::PersistentDowntime),
            "recovery" => Some(AlertKind::Recovery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(AlertSeverity::Info),
            "warning" => Some(AlertSeverity::Warning),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

/// An operator-facing alert derived from SLA analysis. At most one open
/// alert of a given kind exists per (vessel, component) at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub alert_kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        vessel_id: impl Into<String>,
        kind: ComponentKind,
        alert_kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: None,
            vessel_id: vessel_id.into(),
            kind,
            alert_kind,
            severity,
            message: message.into(),
            metadata,
            resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Downtime hours recorded in metadata when the alert was opened.
    pub fn downtime_hours(&self) -> f64 {
        self.metadata
            .get("downtime_aging_hours")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    pub fn historical_context(&self) -> String {
        self.metadata
            .get("historical_context")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

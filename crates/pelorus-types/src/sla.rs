use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::ComponentKind;

/// SLA compliance verdict for one component on one vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaStatus {
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub is_compliant: bool,
    pub uptime_percentage: f64,
    /// How long the component has been in violation, when non-compliant.
    pub violation_duration_seconds: Option<i64>,
}

impl SlaStatus {
    pub fn compliant(vessel_id: impl Into<String>, kind: ComponentKind, uptime: f64) -> Self {
        Self {
            vessel_id: vessel_id.into(),
            kind,
            is_compliant: true,
            uptime_percentage: uptime,
            violation_duration_seconds: None,
        }
    }
}

/// A tracked SLA violation, opened on the first non-compliant observation
/// and closed on the first compliant one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub id: Option<i64>,
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub violation_start: DateTime<Utc>,
    pub violation_end: Option<DateTime<Utc>>,
    pub uptime_percentage: f64,
    pub duration_seconds: Option<i64>,
    pub resolved: bool,
}

impl ViolationRecord {
    pub fn open(
        vessel_id: impl Into<String>,
        kind: ComponentKind,
        violation_start: DateTime<Utc>,
        uptime_percentage: f64,
        duration_seconds: Option<i64>,
    ) -> Self {
        Self {
            id: None,
            vessel_id: vessel_id.into(),
            kind,
            violation_start,
            violation_end: None,
            uptime_percentage,
            duration_seconds,
            resolved: false,
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::ComponentKind;

/// Severity assigned to an issue when it is escalated into the tracker.
/// Ordered so that severity escalation can be compared directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IssueSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueSeverity::Low => "low",
            IssueSeverity::Medium => "medium",
            IssueSeverity::High => "high",
            IssueSeverity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(IssueSeverity::Low),
            "medium" => Some(IssueSeverity::Medium),
            "high" => Some(IssueSeverity::High),
            "critical" => Some(IssueSeverity::Critical),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            IssueSeverity::Low => "Low",
            IssueSeverity::Medium => "Medium",
            IssueSeverity::High => "High",
            IssueSeverity::Critical => "Critical",
        }
    }
}

/// Lifecycle of the internal ticket record, mirroring tracker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketLifecycle {
    Created,
    LinkedToAlert,
    InProgress,
    Resolved,
    Closed,
    Reopened,
}

impl TicketLifecycle {
    pub const OPEN_STATES: [TicketLifecycle; 4] = [
        TicketLifecycle::Created,
        TicketLifecycle::LinkedToAlert,
        TicketLifecycle::InProgress,
        TicketLifecycle::Reopened,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketLifecycle::Created => "created",
            TicketLifecycle::LinkedToAlert => "linked_to_alert",
            TicketLifecycle::InProgress => "in_progress",
            TicketLifecycle::Resolved => "resolved",
            TicketLifecycle::Closed => "closed",
            TicketLifecycle::Reopened => "reopened",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(TicketLifecycle::Created),
            "linked_to_alert" => Some(TicketLifecycle::LinkedToAlert),
            "in_progress" => Some(TicketLifecycle::InProgress),
            "resolved" => Some(TicketLifecycle::Resolved),
            "closed" => Some(TicketLifecycle::Closed),
            "reopened" => Some(TicketLifecycle::Reopened),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        Self::OPEN_STATES.contains(&self)
    }
}

/// Status names used by the external tracker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
    Reopened,
}

impl TrackerStatus {
    /// The display name the tracker's REST API uses for this status.
    pub fn display_name(self) -> &'static str {
        match self {
            TrackerStatus::Open => "Open",
            TrackerStatus::InProgress => "In Progress",
            TrackerStatus::Resolved => "Resolved",
            TrackerStatus::Closed => "Closed",
            TrackerStatus::Reopened => "Reopened",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Open" => Some(TrackerStatus::Open),
            "In Progress" => Some(TrackerStatus::InProgress),
            "Resolved" => Some(TrackerStatus::Resolved),
            "Closed" => Some(TrackerStatus::Closed),
            "Reopened" => Some(TrackerStatus::Reopened),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            TrackerStatus::Open | TrackerStatus::InProgress | TrackerStatus::Reopened
        )
    }

    pub fn lifecycle(self) -> TicketLifecycle {
        match self {
            TrackerStatus::Open => TicketLifecycle::Created,
            TrackerStatus::InProgress => TicketLifecycle::InProgress,
            TrackerStatus::Resolved => TicketLifecycle::Resolved,
            TrackerStatus::Closed => TicketLifecycle::Closed,
            TrackerStatus::Reopened => TicketLifecycle::Reopened,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
            ApprovalState::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// Render a duration in seconds as "2 days, 3 hours, 4 minutes".
pub fn format_duration(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{} day{}", days, if days == 1 { "" } else { "s" }));
    }
    if hours > 0 {
        parts.push(format!(
            "{} hour{}",
            hours,
            if hours == 1 { "" } else { "s" }
        ));
    }
    if minutes > 0 {
        parts.push(format!(
            "{} minute{}",
            minutes,
            if minutes == 1 { "" } else { "s" }
        ));
    }

    if parts.is_empty() {
        "less than 1 minute".to_string()
    } else {
        parts.join(", ")
    }
}

/// Everything needed to raise a tracker issue for one component outage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub downtime_seconds: i64,
    pub historical_context: String,
    pub severity: IssueSeverity,
}

impl IssueSummary {
    pub fn title(&self) -> String {
        format!(
            "Vessel {} - {} Down for {}",
            self.vessel_id,
            self.kind.display_name(),
            format_duration(self.downtime_seconds)
        )
    }

    pub fn description(&self) -> String {
        format!(
            "Infrastructure Issue Report\n\n\
             Vessel ID: {}\n\
             Component: {}\n\
             Downtime Duration: {}\n\
             Severity: {}\n\n\
             Historical Context:\n{}",
            self.vessel_id,
            self.kind.display_name(),
            format_duration(self.downtime_seconds),
            self.severity.display_name(),
            self.historical_context
        )
    }
}

/// A pending human decision over ticket creation. Transitions exactly once
/// out of Pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub issue: IssueSummary,
    pub state: ApprovalState,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub approver: Option<String>,
    pub comments: Option<String>,
}

impl ApprovalRequest {
    pub fn pending(request_id: impl Into<String>, issue: IssueSummary) -> Self {
        Self {
            request_id: request_id.into(),
            issue,
            state: ApprovalState::Pending,
            requested_at: Utc::now(),
            responded_at: None,
            approver: None,
            comments: None,
        }
    }
}

/// A ticket as the external tracker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerTicket {
    pub key: String,
    pub id: String,
    pub summary: String,
    pub description: String,
    pub status: TrackerStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub vessel_id: String,
    pub kind: ComponentKind,
}

/// Internal lifecycle record for a created ticket, including alert links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: Option<i64>,
    pub tracker_key: String,
    pub tracker_id: String,
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub severity: IssueSeverity,
    pub lifecycle: TicketLifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub alert_ids: Vec<i64>,
    pub downtime_seconds: i64,
    pub historical_context: String,
    pub resolution_notes: Option<String>,
}

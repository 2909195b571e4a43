use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{ComponentKind, OperationalStatus};

/// Status of a single pinged IP endpoint over the monitoring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub ip_address: String,
    pub uptime_percentage: f64,
    pub current_status: OperationalStatus,
    /// Seconds since the last successful ping. 0 when currently up.
    pub downtime_aging_seconds: i64,
    pub last_ping_time: Option<DateTime<Utc>>,
    pub has_data: bool,
    pub ping_count: u64,
    pub successful_pings: u64,
}

impl DeviceStatus {
    /// An endpoint with no samples in the window.
    pub fn no_data(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            uptime_percentage: 0.0,
            current_status: OperationalStatus::Unknown,
            downtime_aging_seconds: 0,
            last_ping_time: None,
            has_data: false,
            ping_count: 0,
            successful_pings: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=100.0).contains(&self.uptime_percentage)
            && self.downtime_aging_seconds >= 0
            && self.successful_pings <= self.ping_count
    }
}

/// Aggregate status of one component class on one vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub kind: ComponentKind,
    pub uptime_percentage: f64,
    pub current_status: OperationalStatus,
    /// Maximum downtime aging across member devices, in seconds.
    pub downtime_aging_seconds: i64,
    pub last_ping_time: Option<DateTime<Utc>>,
    pub devices: Vec<DeviceStatus>,
    pub has_data: bool,
}

impl ComponentStatus {
    /// A component with no devices or no data.
    pub fn unknown(kind: ComponentKind) -> Self {
        Self {
            kind,
            uptime_percentage: 0.0,
            current_status: OperationalStatus::Unknown,
            downtime_aging_seconds: 0,
            last_ping_time: None,
            devices: Vec::new(),
            has_data: false,
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices_up(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.current_status == OperationalStatus::Up)
            .count()
    }
}

/// Complete derived metrics for one vessel at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselMetrics {
    pub vessel_id: String,
    pub access_points: ComponentStatus,
    pub dashboards: ComponentStatus,
    pub servers: ComponentStatus,
    pub timestamp: DateTime<Utc>,
}

impl VesselMetrics {
    pub fn component(&self, kind: ComponentKind) -> &ComponentStatus {
        match kind {
            ComponentKind::AccessPoint => &self.access_points,
            ComponentKind::Dashboard => &self.dashboards,
            ComponentKind::Server => &self.servers,
        }
    }

    pub fn components(&self) -> impl Iterator<Item = (ComponentKind, &ComponentStatus)> {
        ComponentKind::ALL
            .into_iter()
            .map(move |kind| (kind, self.component(kind)))
    }
}

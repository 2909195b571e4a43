mod client;
mod error;
mod wire;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pelorus_types::ComponentKind;

pub use client::{ProbeClient, RetryPolicy};
pub use error::ProbeError;
pub use wire::QueryResponse;

/// Connection parameters for one vessel's time-series endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselConnection {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

/// Which IPs belong to which component class on a vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ComponentMapping {
    #[serde(default)]
    pub access_points: Vec<String>,
    #[serde(default)]
    pub dashboards: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
}

impl ComponentMapping {
    pub fn ips_for(&self, kind: ComponentKind) -> &[String] {
        match kind {
            ComponentKind::AccessPoint => &self.access_points,
            ComponentKind::Dashboard => &self.dashboards,
            ComponentKind::Server => &self.servers,
        }
    }

    /// The shipboard default: one external connectivity IP standing in for
    /// the server class, three dashboard hosts, the rest access points.
    pub fn shipboard_default() -> Self {
        Self {
            servers: vec!["8.8.8.8".to_string()],
            dashboards: vec![
                "192.168.1.43".to_string(),
                "192.168.1.44".to_string(),
                "192.168.1.45".to_string(),
            ],
            access_points: (1..=13)
                .chain(22..=24)
                .map(|n| format!("192.168.1.{n}"))
                .collect(),
        }
    }
}

/// One ping sample as parsed from the provider result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSample {
    pub ip_address: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Raw ping samples for one component class on one vessel, ordered by time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingData {
    pub vessel_id: String,
    pub kind: ComponentKind,
    /// Every IP configured for the component, including those with no
    /// samples in the window.
    pub configured_ips: Vec<String>,
    pub samples: Vec<PingSample>,
}

impl PingData {
    pub fn empty(vessel_id: impl Into<String>, kind: ComponentKind, ips: Vec<String>) -> Self {
        Self {
            vessel_id: vessel_id.into(),
            kind,
            configured_ips: ips,
            samples: Vec::new(),
        }
    }

    /// Samples grouped per device, preserving time order within each group.
    pub fn by_device(&self) -> HashMap<&str, Vec<&PingSample>> {
        let mut grouped: HashMap<&str, Vec<&PingSample>> = HashMap::new();
        for ip in &self.configured_ips {
            grouped.entry(ip.as_str()).or_default();
        }
        for sample in &self.samples {
            grouped
                .entry(sample.ip_address.as_str())
                .or_default()
                .push(sample);
        }
        grouped
    }
}

/// Seam between the collector and the concrete HTTP probe so the fan-out
/// machinery can be exercised against fakes.
#[async_trait]
pub trait PingSource: Send + Sync {
    fn vessel_id(&self) -> &str;

    async fn query_pings(
        &self,
        kind: ComponentKind,
        window_hours: u32,
    ) -> Result<PingData, ProbeError>;

    async fn test_connection(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipboard_default_partitions_roles() {
        let mapping = ComponentMapping::shipboard_default();
        assert_eq!(mapping.servers, vec!["8.8.8.8"]);
        assert_eq!(mapping.dashboards.len(), 3);
        assert_eq!(mapping.access_points.len(), 16);

        // A device belongs to exactly one role.
        for ip in &mapping.dashboards {
            assert!(!mapping.access_points.contains(ip));
            assert!(!mapping.servers.contains(ip));
        }
    }

    #[test]
    fn by_device_represents_ips_without_samples() {
        let data = PingData {
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Dashboard,
            configured_ips: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            samples: vec![PingSample {
                ip_address: "10.0.0.1".into(),
                timestamp: Utc::now(),
                success: true,
            }],
        };
        let grouped = data.by_device();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["10.0.0.1"].len(), 1);
        assert!(grouped["10.0.0.2"].is_empty());
    }
}

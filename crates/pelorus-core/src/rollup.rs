use chrono::{DateTime, Utc};
use serde::Serialize;

use pelorus_probe::{PingData, PingSample};
use pelorus_types::{ComponentStatus, DeviceStatus, OperationalStatus, VesselMetrics};

/// Derive one device's status from its samples (assumed time-ascending).
///
/// Downtime aging is measured from the last successful sample; a device that
/// has never succeeded ages from its first sample.
pub fn device_status(ip: &str, samples: &[&PingSample], now: DateTime<Utc>) -> DeviceStatus {
    if samples.is_empty() {
        return DeviceStatus::no_data(ip);
    }

    let total = samples.len() as u64;
    let successful = samples.iter().filter(|s| s.success).count() as u64;
    let uptime_percentage = successful as f64 / total as f64 * 100.0;

    let last = samples[samples.len() - 1];
    let current_status = if last.success {
        OperationalStatus::Up
    } else {
        OperationalStatus::Down
    };

    let downtime_aging_seconds = if last.success {
        0
    } else {
        let last_success = samples.iter().rev().find(|s| s.success);
        let aging_from = match last_success {
            Some(sample) => sample.timestamp,
            None => samples[0].timestamp,
        };
        (now - aging_from).num_seconds().max(0)
    };

    DeviceStatus {
        ip_address: ip.to_string(),
        uptime_percentage,
        current_status,
        downtime_aging_seconds,
        last_ping_time: Some(last.timestamp),
        has_data: true,
        ping_count: total,
        successful_pings: successful,
    }
}

/// Roll devices up into one component verdict.
///
/// Component uptime is the arithmetic mean of device uptimes; the component
/// is Up when at least half its devices are Up (a tie at exactly 50% counts
/// as Up); downtime aging is the worst device's.
pub fn component_status(data: &PingData, now: DateTime<Utc>) -> ComponentStatus {
    let grouped = data.by_device();

    let mut devices: Vec<DeviceStatus> = data
        .configured_ips
        .iter()
        .map(|ip| {
            let samples = grouped.get(ip.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            device_status(ip, samples, now)
        })
        .collect();
    devices.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));

    if devices.is_empty() {
        return ComponentStatus::unknown(data.kind);
    }

    let has_data = devices.iter().any(|d| d.has_data);
    let uptime_percentage =
        devices.iter().map(|d| d.uptime_percentage).sum::<f64>() / devices.len() as f64;

    let up_devices = devices
        .iter()
        .filter(|d| d.current_status == OperationalStatus::Up)
        .count();

    let current_status = if !has_data {
        OperationalStatus::Unknown
    } else if up_devices * 2 >= devices.len() {
        OperationalStatus::Up
    } else {
        OperationalStatus::Down
    };

    let downtime_aging_seconds = devices
        .iter()
        .map(|d| d.downtime_aging_seconds)
        .max()
        .unwrap_or(0);

    let last_ping_time = devices.iter().filter_map(|d| d.last_ping_time).max();

    ComponentStatus {
        kind: data.kind,
        uptime_percentage,
        current_status,
        downtime_aging_seconds,
        last_ping_time,
        devices,
        has_data,
    }
}

/// Fleet-wide counters for the dashboard overview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSummary {
    pub total_vessels: usize,
    pub vessels_online: usize,
    pub average_uptime: f64,
    pub components_below_sla: usize,
    pub total_components: usize,
    pub sla_compliance_rate: f64,
}

pub fn fleet_summary(metrics: &[&VesselMetrics], sla_threshold: f64) -> FleetSummary {
    if metrics.is_empty() {
        return FleetSummary {
            total_vessels: 0,
            vessels_online: 0,
            average_uptime: 0.0,
            components_below_sla: 0,
            total_components: 0,
            sla_compliance_rate: 0.0,
        };
    }

    let mut vessels_online = 0;
    let mut total_uptime = 0.0;
    let mut components_below_sla = 0;
    let mut total_components = 0;

    for vessel in metrics {
        let mut vessel_uptime = 0.0;
        let mut vessel_online = true;
        let mut vessel_components = 0;

        for (_, component) in vessel.components() {
            vessel_uptime += component.uptime_percentage;
            vessel_components += 1;
            total_components += 1;
            if component.uptime_percentage < sla_threshold {
                components_below_sla += 1;
            }
            if component.current_status != OperationalStatus::Up {
                vessel_online = false;
            }
        }

        if vessel_online {
            vessels_online += 1;
        }
        total_uptime += vessel_uptime / vessel_components as f64;
    }

    let sla_compliance_rate = if total_components > 0 {
        (total_components - components_below_sla) as f64 / total_components as f64 * 100.0
    } else {
        0.0
    };

    FleetSummary {
        total_vessels: metrics.len(),
        vessels_online,
        average_uptime: total_uptime / metrics.len() as f64,
        components_below_sla,
        total_components,
        sla_compliance_rate,
    }
}

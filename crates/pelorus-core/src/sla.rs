use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use pelorus_store::MonitorStore;
use pelorus_types::{
    ComponentKind, ComponentStatus, OperationalStatus, SlaStatus, VesselMetrics, ViolationRecord,
};

use crate::config::SlaParameters;

/// Analyzes component status against the SLA and tracks violation
/// lifecycles. The open-violation cache is only an index into the store;
/// it is rebuilt from open `ViolationRecord`s at startup.
pub struct SlaAnalyzer {
    params: SlaParameters,
    store: Arc<MonitorStore>,
    active_violations: Mutex<HashMap<(String, ComponentKind), i64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSlaSummary {
    pub total_vessels: usize,
    pub total_components: usize,
    pub compliant_components: usize,
    pub violation_components: usize,
    pub fleet_compliance_rate: f64,
    pub average_uptime: f64,
    pub vessels_with_violations: usize,
    pub vessels_fully_compliant: usize,
}

impl SlaAnalyzer {
    pub fn new(params: SlaParameters, store: Arc<MonitorStore>) -> Self {
        info!(
            threshold = params.uptime_threshold_percentage,
            alert_days = params.downtime_alert_threshold_days,
            window_hours = params.monitoring_window_hours,
            "initialized sla analyzer"
        );
        Self {
            params,
            store,
            active_violations: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &SlaParameters {
        &self.params
    }

    /// Rebuild the open-violation cache from the store. Called once at
    /// startup so that restarts keep the at-most-one-open invariant.
    pub async fn restore_violation_cache(&self) -> anyhow::Result<usize> {
        let open = self.store.open_violations(None, None).await?;
        let mut cache = self.active_violations.lock().await;
        cache.clear();
        for record in &open {
            if let Some(id) = record.id {
                cache.insert((record.vessel_id.clone(), record.kind), id);
            }
        }
        info!(restored = cache.len(), "restored open violation cache");
        Ok(cache.len())
    }

    fn is_compliant(&self, uptime_percentage: f64) -> bool {
        uptime_percentage >= self.params.uptime_threshold_percentage
    }

    /// Violation duration: actual downtime aging when the component is not
    /// up; otherwise the estimated downtime share of the window.
    fn violation_duration_seconds(&self, component: &ComponentStatus) -> i64 {
        if component.current_status != OperationalStatus::Up {
            component.downtime_aging_seconds
        } else {
            let window_seconds = i64::from(self.params.monitoring_window_hours) * 3600;
            let downtime_share = (100.0 - component.uptime_percentage) / 100.0;
            (window_seconds as f64 * downtime_share) as i64
        }
    }

    pub fn analyze_component(&self, vessel_id: &str, component: &ComponentStatus) -> SlaStatus {
        let is_compliant = self.is_compliant(component.uptime_percentage);
        let violation_duration_seconds =
            (!is_compliant).then(|| self.violation_duration_seconds(component));

        debug!(
            vessel = vessel_id,
            kind = component.kind.as_str(),
            compliant = is_compliant,
            uptime = component.uptime_percentage,
            "analyzed component sla"
        );

        SlaStatus {
            vessel_id: vessel_id.to_string(),
            kind: component.kind,
            is_compliant,
            uptime_percentage: component.uptime_percentage,
            violation_duration_seconds,
        }
    }

    /// Analyze all components of one vessel without touching the store.
    pub fn analyze_vessel(&self, metrics: &VesselMetrics) -> HashMap<ComponentKind, SlaStatus> {
        let mut statuses = HashMap::new();
        for (kind, component) in metrics.components() {
            let status = self.analyze_component(&metrics.vessel_id, component);
            if !status.is_compliant {
                warn!(
                    vessel = %metrics.vessel_id,
                    kind = kind.as_str(),
                    uptime = format!("{:.2}", status.uptime_percentage),
                    threshold = self.params.uptime_threshold_percentage,
                    "sla violation detected"
                );
            }
            statuses.insert(kind, status);
        }
        statuses
    }

    /// Analyze one vessel and persist: component history rows first, then
    /// violation lifecycle transitions.
    pub async fn analyze_vessel_with_tracking(
        &self,
        metrics: &VesselMetrics,
    ) -> anyhow::Result<HashMap<ComponentKind, SlaStatus>> {
        let statuses = self.analyze_vessel(metrics);

        for (_, component) in metrics.components() {
            self.store
                .record_component_status(&metrics.vessel_id, component, metrics.timestamp)
                .await?;
        }

        for status in statuses.values() {
            self.track_violation_lifecycle(&metrics.vessel_id, status, metrics.timestamp)
                .await?;
        }

        Ok(statuses)
    }

    /// Open on first non-compliant observation, close on first compliant
    /// one. Re-processing an unchanged verdict is a no-op.
    async fn track_violation_lifecycle(
        &self,
        vessel_id: &str,
        status: &SlaStatus,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let key = (vessel_id.to_string(), status.kind);
        let mut cache = self.active_violations.lock().await;

        if !status.is_compliant {
            if cache.contains_key(&key) {
                return Ok(());
            }
            let duration = status.violation_duration_seconds.unwrap_or(0);
            let record = ViolationRecord::open(
                vessel_id,
                status.kind,
                observed_at - Duration::seconds(duration),
                status.uptime_percentage,
                status.violation_duration_seconds,
            );
            let id = self.store.record_sla_violation(&record).await?;
            cache.insert(key, id);
            info!(
                vessel = vessel_id,
                kind = status.kind.as_str(),
                violation_id = id,
                "started tracking sla violation"
            );
        } else if let Some(id) = cache.remove(&key) {
            self.store
                .resolve_sla_violation(id, observed_at, status.uptime_percentage)
                .await?;
            info!(
                vessel = vessel_id,
                kind = status.kind.as_str(),
                violation_id = id,
                "resolved sla violation"
            );
        }

        Ok(())
    }

    /// Fleet batch analysis with tracking. Per-vessel failures are isolated:
    /// one vessel's error never aborts the rest.
    pub async fn analyze_fleet_with_tracking(
        &self,
        fleet: &HashMap<String, VesselMetrics>,
    ) -> HashMap<String, HashMap<ComponentKind, SlaStatus>> {
        let mut results = HashMap::new();
        let mut total_violations = 0;

        let mut vessel_ids: Vec<&String> = fleet.keys().collect();
        vessel_ids.sort();

        for vessel_id in vessel_ids {
            let metrics = &fleet[vessel_id];
            match self.analyze_vessel_with_tracking(metrics).await {
                Ok(statuses) => {
                    total_violations += statuses.values().filter(|s| !s.is_compliant).count();
                    results.insert(vessel_id.clone(), statuses);
                }
                Err(err) => {
                    error!(vessel = %vessel_id, error = %err, "sla analysis failed for vessel");
                }
            }
        }

        info!(
            vessels = results.len(),
            violations = total_violations,
            "fleet sla analysis completed"
        );
        results
    }

    /// Non-compliant statuses whose violation has persisted at least the
    /// downtime alert threshold. These are the ticket candidates.
    pub fn persistent_violations<'a>(
        &self,
        fleet_statuses: &'a HashMap<String, HashMap<ComponentKind, SlaStatus>>,
    ) -> Vec<&'a SlaStatus> {
        let threshold_seconds = i64::from(self.params.downtime_alert_threshold_days) * 86_400;
        let mut out: Vec<&SlaStatus> = fleet_statuses
            .values()
            .flat_map(|statuses| statuses.values())
            .filter(|s| !s.is_compliant)
            .filter(|s| s.violation_duration_seconds.unwrap_or(0) >= threshold_seconds)
            .collect();
        out.sort_by(|a, b| (&a.vessel_id, a.kind.as_str()).cmp(&(&b.vessel_id, b.kind.as_str())));
        out
    }

    pub fn fleet_summary(
        &self,
        fleet_statuses: &HashMap<String, HashMap<ComponentKind, SlaStatus>>,
    ) -> FleetSlaSummary {
        let total_vessels = fleet_statuses.len();
        let mut total_components = 0;
        let mut compliant = 0;
        let mut total_uptime = 0.0;
        let mut vessels_with_violations = 0;

        for statuses in fleet_statuses.values() {
            let mut vessel_has_violation = false;
            for status in statuses.values() {
                total_components += 1;
                total_uptime += status.uptime_percentage;
                if status.is_compliant {
                    compliant += 1;
                } else {
                    vessel_has_violation = true;
                }
            }
            if vessel_has_violation {
                vessels_with_violations += 1;
            }
        }

        FleetSlaSummary {
            total_vessels,
            total_components,
            compliant_components: compliant,
            violation_components: total_components - compliant,
            fleet_compliance_rate: if total_components > 0 {
                compliant as f64 / total_components as f64 * 100.0
            } else {
                0.0
            },
            average_uptime: if total_components > 0 {
                total_uptime / total_components as f64
            } else {
                0.0
            },
            vessels_with_violations,
            vessels_fully_compliant: total_vessels - vessels_with_violations,
        }
    }

    /// Per-component-kind compliance breakdown across the fleet.
    pub fn component_breakdown(
        &self,
        fleet_statuses: &HashMap<String, HashMap<ComponentKind, SlaStatus>>,
    ) -> HashMap<ComponentKind, (usize, usize, f64)> {
        let mut breakdown = HashMap::new();
        for kind in ComponentKind::ALL {
            let mut total = 0;
            let mut compliant = 0;
            let mut uptime_sum = 0.0;
            for statuses in fleet_statuses.values() {
                if let Some(status) = statuses.get(&kind) {
                    total += 1;
                    uptime_sum += status.uptime_percentage;
                    if status.is_compliant {
                        compliant += 1;
                    }
                }
            }
            let average = if total > 0 {
                uptime_sum / total as f64
            } else {
                0.0
            };
            breakdown.insert(kind, (total, compliant, average));
        }
        breakdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn analyzer() -> (tempfile::TempDir, SlaAnalyzer, Arc<MonitorStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        (
            dir,
            SlaAnalyzer::new(SlaParameters::default(), store.clone()),
            store,
        )
    }

    fn component(kind: ComponentKind, uptime: f64, status: OperationalStatus, aging_hours: i64) -> ComponentStatus {
        ComponentStatus {
            kind,
            uptime_percentage: uptime,
            current_status: status,
            downtime_aging_seconds: aging_hours * 3600,
            last_ping_time: Some(Utc::now()),
            devices: vec![],
            has_data: true,
        }
    }

    fn metrics(vessel: &str, uptime: f64, status: OperationalStatus, aging_hours: i64) -> VesselMetrics {
        VesselMetrics {
            vessel_id: vessel.into(),
            access_points: component(ComponentKind::AccessPoint, uptime, status, aging_hours),
            dashboards: component(ComponentKind::Dashboard, 99.0, OperationalStatus::Up, 0),
            servers: component(ComponentKind::Server, 99.0, OperationalStatus::Up, 0),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn uptime_exactly_at_threshold_is_compliant() {
        let (_dir, analyzer, _store) = analyzer().await;
        let status = analyzer.analyze_component(
            "mv-aurora",
            &component(ComponentKind::Server, 95.0, OperationalStatus::Up, 0),
        );
        assert!(status.is_compliant);
        assert!(status.violation_duration_seconds.is_none());
    }

    #[tokio::test]
    async fn down_component_uses_downtime_aging() {
        let (_dir, analyzer, _store) = analyzer().await;
        let status = analyzer.analyze_component(
            "mv-aurora",
            &component(ComponentKind::Server, 60.0, OperationalStatus::Down, 12),
        );
        assert!(!status.is_compliant);
        assert_eq!(status.violation_duration_seconds, Some(12 * 3600));
    }

    #[tokio::test]
    async fn up_but_below_threshold_estimates_from_window() {
        let (_dir, analyzer, _store) = analyzer().await;
        let status = analyzer.analyze_component(
            "mv-aurora",
            &component(ComponentKind::Server, 90.0, OperationalStatus::Up, 0),
        );
        // 10% of a 24h window.
        assert_eq!(
            status.violation_duration_seconds,
            Some((24 * 3600) / 10)
        );
    }

    #[tokio::test]
    async fn violation_opens_once_and_closes_on_recovery() {
        let (_dir, analyzer, store) = analyzer().await;

        let bad = metrics("mv-aurora", 60.0, OperationalStatus::Down, 10);
        analyzer.analyze_vessel_with_tracking(&bad).await.unwrap();
        assert_eq!(store.open_violations(None, None).await.unwrap().len(), 1);

        // Same verdict again: still exactly one open record.
        analyzer.analyze_vessel_with_tracking(&bad).await.unwrap();
        assert_eq!(store.open_violations(None, None).await.unwrap().len(), 1);

        // Recovery closes it.
        let good = metrics("mv-aurora", 99.5, OperationalStatus::Up, 0);
        analyzer.analyze_vessel_with_tracking(&good).await.unwrap();
        assert!(store.open_violations(None, None).await.unwrap().is_empty());

        let history = store.violation_history(None, None, 7).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
    }

    #[tokio::test]
    async fn cache_restores_from_open_records() {
        let (_dir, analyzer, store) = analyzer().await;
        let bad = metrics("mv-aurora", 60.0, OperationalStatus::Down, 10);
        analyzer.analyze_vessel_with_tracking(&bad).await.unwrap();

        // A fresh analyzer over the same store picks the violation back up
        // instead of opening a duplicate.
        let analyzer2 = SlaAnalyzer::new(SlaParameters::default(), store.clone());
        assert_eq!(analyzer2.restore_violation_cache().await.unwrap(), 1);
        analyzer2.analyze_vessel_with_tracking(&bad).await.unwrap();
        assert_eq!(store.open_violations(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_violations_respect_the_day_threshold() {
        let (_dir, analyzer, _store) = analyzer().await;
        let mut fleet = HashMap::new();
        fleet.insert(
            "mv-aurora".to_string(),
            metrics("mv-aurora", 40.0, OperationalStatus::Down, 4 * 24),
        );
        fleet.insert(
            "mv-borealis".to_string(),
            metrics("mv-borealis", 40.0, OperationalStatus::Down, 12),
        );

        let statuses = analyzer.analyze_fleet_with_tracking(&fleet).await;
        let persistent = analyzer.persistent_violations(&statuses);
        assert_eq!(persistent.len(), 1);
        assert_eq!(persistent[0].vessel_id, "mv-aurora");
    }

    #[tokio::test]
    async fn fleet_summary_counts_match() {
        let (_dir, analyzer, _store) = analyzer().await;
        let mut fleet = HashMap::new();
        fleet.insert(
            "mv-aurora".to_string(),
            metrics("mv-aurora", 40.0, OperationalStatus::Down, 24),
        );
        fleet.insert(
            "mv-borealis".to_string(),
            metrics("mv-borealis", 99.0, OperationalStatus::Up, 0),
        );

        let statuses = analyzer.analyze_fleet_with_tracking(&fleet).await;
        let summary = analyzer.fleet_summary(&statuses);
        assert_eq!(summary.total_vessels, 2);
        assert_eq!(summary.total_components, 6);
        assert_eq!(summary.violation_components, 1);
        assert_eq!(summary.vessels_with_violations, 1);
        assert_eq!(summary.vessels_fully_compliant, 1);

        let breakdown = analyzer.component_breakdown(&statuses);
        let (total, compliant, _avg) = breakdown[&ComponentKind::AccessPoint];
        assert_eq!(total, 2);
        assert_eq!(compliant, 1);
    }
}

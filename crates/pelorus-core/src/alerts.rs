use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info};

use pelorus_store::MonitorStore;
use pelorus_types::{
    format_duration, Alert, AlertKind, AlertSeverity, ComponentKind, SlaStatus, VesselMetrics,
};

use crate::config::{AlertLadder, SlaParameters};

/// Alert severity on open, from downtime and uptime. The ladder is distinct
/// from the tracker priority mapping.
pub fn alert_severity_for(ladder: &AlertLadder, downtime_hours: f64, uptime: f64) -> AlertSeverity {
    if downtime_hours >= ladder.critical_downtime_hours || uptime < ladder.critical_uptime_below {
        AlertSeverity::Critical
    } else if downtime_hours >= ladder.warning_high_downtime_hours
        || uptime < ladder.warning_high_uptime_below
    {
        AlertSeverity::Warning
    } else if downtime_hours >= ladder.warning_medium_downtime_hours
        || uptime < ladder.warning_medium_uptime_below
    {
        AlertSeverity::Warning
    } else {
        AlertSeverity::Info
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceStats {
    pub resolved: usize,
    pub recoveries: usize,
    pub still_open: usize,
}

/// Maintains the open-alert ledger: at most one open alert of a given kind
/// per (vessel, component). The ledger indexes the store and is rebuilt
/// from open alerts at startup.
pub struct AlertManager {
    params: SlaParameters,
    store: Arc<MonitorStore>,
    open: Mutex<HashMap<(String, ComponentKind, AlertKind), i64>>,
}

impl AlertManager {
    pub fn new(params: SlaParameters, store: Arc<MonitorStore>) -> Self {
        Self {
            params,
            store,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub async fn restore_open_alerts(&self) -> anyhow::Result<usize> {
        let alerts = self.store.open_alerts().await?;
        let mut open = self.open.lock().await;
        open.clear();
        for alert in &alerts {
            if let Some(id) = alert.id {
                open.insert((alert.vessel_id.clone(), alert.kind, alert.alert_kind), id);
            }
        }
        info!(restored = open.len(), "restored open alert ledger");
        Ok(open.len())
    }

    /// Raise SLA_VIOLATION alerts for non-compliant statuses that do not
    /// already have one open. Returns the alerts created this pass.
    pub async fn process_sla_statuses(
        &self,
        statuses: &HashMap<String, HashMap<ComponentKind, SlaStatus>>,
    ) -> anyhow::Result<Vec<Alert>> {
        let mut created = Vec::new();

        for vessel_statuses in statuses.values() {
            for status in vessel_statuses.values() {
                if status.is_compliant {
                    continue;
                }
                let key = (status.vessel_id.clone(), status.kind, AlertKind::SlaViolation);
                {
                    let open = self.open.lock().await;
                    if open.contains_key(&key) {
                        continue;
                    }
                }

                let downtime_hours =
                    status.violation_duration_seconds.unwrap_or(0) as f64 / 3600.0;
                let severity = alert_severity_for(
                    &self.params.alert_ladder,
                    downtime_hours,
                    status.uptime_percentage,
                );
                let mut alert = Alert::new(
                    status.vessel_id.clone(),
                    status.kind,
                    AlertKind::SlaViolation,
                    severity,
                    format!(
                        "{} on vessel {} at {:.2}% uptime (threshold {}%)",
                        status.kind.display_name(),
                        status.vessel_id,
                        status.uptime_percentage,
                        self.params.uptime_threshold_percentage
                    ),
                    json!({
                        "uptime_percentage": status.uptime_percentage,
                        "violation_duration_seconds": status.violation_duration_seconds,
                    }),
                );
                let id = self.store.record_alert(&alert).await?;
                alert.id = Some(id);
                self.open.lock().await.insert(key, id);
                created.push(alert);
            }
        }

        if !created.is_empty() {
            info!(count = created.len(), "raised sla violation alerts");
        }
        Ok(created)
    }

    /// Raise PERSISTENT_DOWNTIME alerts for components whose downtime aging
    /// has crossed the alert threshold, then return every open such alert
    /// that still lacks a ticket. Re-offering open alerts lets the ticket
    /// workflow link them to an existing ticket or escalate severity.
    pub async fn monitor_persistent_downtime(
        &self,
        fleet: &[&VesselMetrics],
    ) -> anyhow::Result<Vec<Alert>> {
        let threshold_seconds =
            i64::from(self.params.downtime_alert_threshold_days) * 86_400;
        let mut persisting: HashMap<(String, ComponentKind), f64> = HashMap::new();
        let mut created = 0usize;

        for metrics in fleet {
            for (kind, component) in metrics.components() {
                if component.downtime_aging_seconds < threshold_seconds {
                    continue;
                }
                let downtime_hours = component.downtime_aging_seconds as f64 / 3600.0;
                persisting.insert((metrics.vessel_id.clone(), kind), downtime_hours);

                let key = (
                    metrics.vessel_id.clone(),
                    kind,
                    AlertKind::PersistentDowntime,
                );
                let already_open = {
                    let open = self.open.lock().await;
                    open.contains_key(&key)
                };
                if already_open {
                    continue;
                }

                let historical_context = self
                    .historical_context(&metrics.vessel_id, kind)
                    .await
                    .unwrap_or_else(|_| "no violation history available".to_string());

                let alert = Alert::new(
                    metrics.vessel_id.clone(),
                    kind,
                    AlertKind::PersistentDowntime,
                    alert_severity_for(
                        &self.params.alert_ladder,
                        downtime_hours,
                        component.uptime_percentage,
                    ),
                    format!(
                        "{} on vessel {} down for {}",
                        kind.display_name(),
                        metrics.vessel_id,
                        format_duration(component.downtime_aging_seconds)
                    ),
                    json!({
                        "downtime_aging_hours": downtime_hours,
                        "uptime_percentage": component.uptime_percentage,
                        "historical_context": historical_context,
                    }),
                );
                let id = self.store.record_alert(&alert).await?;
                self.open.lock().await.insert(key, id);
                created += 1;
            }
        }

        // Collect the open, unticketed persistent-downtime alerts for the
        // components that are still persisting, with metadata refreshed to
        // the current downtime.
        let mut requiring_tickets = Vec::new();
        for mut alert in self.store.open_alerts().await? {
            if alert.alert_kind != AlertKind::PersistentDowntime {
                continue;
            }
            let Some(hours) = persisting.get(&(alert.vessel_id.clone(), alert.kind)) else {
                continue;
            };
            if alert.metadata.get("ticket_created") == Some(&json!(true)) {
                continue;
            }
            alert.metadata["downtime_aging_hours"] = json!(hours);
            requiring_tickets.push(alert);
        }

        info!(
            created,
            requiring_tickets = requiring_tickets.len(),
            "persistent downtime monitoring pass complete"
        );
        Ok(requiring_tickets)
    }

    /// Resolve open alerts whose component has recovered, emitting a
    /// RECOVERY record (stored already-resolved) for the audit trail.
    pub async fn maintain_alert_status(
        &self,
        statuses: &HashMap<String, HashMap<ComponentKind, SlaStatus>>,
    ) -> anyhow::Result<MaintenanceStats> {
        let mut stats = MaintenanceStats::default();
        let open_snapshot: Vec<((String, ComponentKind, AlertKind), i64)> = {
            let open = self.open.lock().await;
            open.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };

        for ((vessel_id, kind, alert_kind), alert_id) in open_snapshot {
            let Some(status) = statuses.get(&vessel_id).and_then(|s| s.get(&kind)) else {
                stats.still_open += 1;
                continue;
            };
            if !status.is_compliant {
                stats.still_open += 1;
                continue;
            }

            if let Err(err) = self.store.resolve_alert(alert_id).await {
                error!(alert_id, error = %err, "failed to resolve alert");
                continue;
            }
            self.open
                .lock()
                .await
                .remove(&(vessel_id.clone(), kind, alert_kind));
            stats.resolved += 1;

            let mut recovery = Alert::new(
                vessel_id.clone(),
                kind,
                AlertKind::Recovery,
                AlertSeverity::Info,
                format!(
                    "{} on vessel {} recovered at {:.2}% uptime",
                    kind.display_name(),
                    vessel_id,
                    status.uptime_percentage
                ),
                json!({"uptime_percentage": status.uptime_percentage}),
            );
            recovery.resolved = true;
            recovery.resolved_at = Some(recovery.created_at);
            self.store.record_alert(&recovery).await?;
            stats.recoveries += 1;
        }

        info!(
            resolved = stats.resolved,
            recoveries = stats.recoveries,
            still_open = stats.still_open,
            "alert maintenance pass complete"
        );
        Ok(stats)
    }

    /// Annotate an alert's metadata once a tracker ticket exists for it.
    pub async fn mark_ticket_created(
        &self,
        alert: &Alert,
        ticket_key: &str,
    ) -> anyhow::Result<()> {
        let Some(alert_id) = alert.id else {
            anyhow::bail!("alert has no id");
        };
        let mut metadata = alert.metadata.clone();
        if !metadata.is_object() {
            metadata = json!({});
        }
        metadata["ticket_created"] = json!(true);
        metadata["ticket_key"] = json!(ticket_key);
        self.store.update_alert_metadata(alert_id, metadata).await?;
        info!(alert_id, ticket_key, "marked alert as ticketed");
        Ok(())
    }

    /// A short violation-history digest used as ticket context.
    async fn historical_context(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
    ) -> anyhow::Result<String> {
        let history = self
            .store
            .violation_history(Some(vessel_id), Some(kind), 30)
            .await?;
        if history.is_empty() {
            return Ok(format!(
                "No prior violations for {} on vessel {vessel_id} in the last 30 days.",
                kind.display_name()
            ));
        }
        let resolved = history.iter().filter(|v| v.resolved).count();
        let total_downtime: i64 = history.iter().filter_map(|v| v.duration_seconds).sum();
        Ok(format!(
            "{} violation(s) for {} on vessel {vessel_id} in the last 30 days ({} resolved, {} total downtime).",
            history.len(),
            kind.display_name(),
            resolved,
            format_duration(total_downtime)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pelorus_types::{ComponentStatus, OperationalStatus};

    async fn manager() -> (tempfile::TempDir, AlertManager, Arc<MonitorStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        (
            dir,
            AlertManager::new(SlaParameters::default(), store.clone()),
            store,
        )
    }

    fn status(vessel: &str, kind: ComponentKind, compliant: bool, duration_hours: i64) -> SlaStatus {
        SlaStatus {
            vessel_id: vessel.into(),
            kind,
            is_compliant: compliant,
            uptime_percentage: if compliant { 99.0 } else { 82.0 },
            violation_duration_seconds: (!compliant).then_some(duration_hours * 3600),
        }
    }

    fn fleet_statuses(
        entries: &[(&str, ComponentKind, bool, i64)],
    ) -> HashMap<String, HashMap<ComponentKind, SlaStatus>> {
        let mut out: HashMap<String, HashMap<ComponentKind, SlaStatus>> = HashMap::new();
        for (vessel, kind, compliant, hours) in entries {
            out.entry(vessel.to_string())
                .or_default()
                .insert(*kind, status(vessel, *kind, *compliant, *hours));
        }
        out
    }

    fn down_metrics(vessel: &str, aging_days: i64) -> VesselMetrics {
        let down = ComponentStatus {
            kind: ComponentKind::Server,
            uptime_percentage: 10.0,
            current_status: OperationalStatus::Down,
            downtime_aging_seconds: aging_days * 86_400,
            last_ping_time: Some(Utc::now()),
            devices: vec![],
            has_data: true,
        };
        VesselMetrics {
            vessel_id: vessel.into(),
            access_points: ComponentStatus::unknown(ComponentKind::AccessPoint),
            dashboards: ComponentStatus::unknown(ComponentKind::Dashboard),
            servers: down,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn severity_ladder_matches_the_table() {
        let ladder = AlertLadder::default();
        assert_eq!(alert_severity_for(&ladder, 80.0, 99.0), AlertSeverity::Critical);
        assert_eq!(alert_severity_for(&ladder, 0.0, 45.0), AlertSeverity::Critical);
        assert_eq!(alert_severity_for(&ladder, 30.0, 99.0), AlertSeverity::Warning);
        assert_eq!(alert_severity_for(&ladder, 0.0, 75.0), AlertSeverity::Warning);
        assert_eq!(alert_severity_for(&ladder, 5.0, 99.0), AlertSeverity::Warning);
        assert_eq!(alert_severity_for(&ladder, 0.0, 85.0), AlertSeverity::Warning);
        assert_eq!(alert_severity_for(&ladder, 1.0, 93.0), AlertSeverity::Info);
    }

    #[tokio::test]
    async fn sla_alert_dedupes_per_vessel_component() {
        let (_dir, manager, store) = manager().await;
        let statuses = fleet_statuses(&[("mv-aurora", ComponentKind::Server, false, 6)]);

        let first = manager.process_sla_statuses(&statuses).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = manager.process_sla_statuses(&statuses).await.unwrap();
        assert!(second.is_empty(), "no duplicate open alert");
        assert_eq!(store.open_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_downtime_requires_threshold_days() {
        let (_dir, manager, _store) = manager().await;

        let below = down_metrics("mv-aurora", 2);
        let above = down_metrics("mv-borealis", 4);
        let alerts = manager
            .monitor_persistent_downtime(&[&below, &above])
            .await
            .unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].vessel_id, "mv-borealis");
        assert_eq!(alerts[0].alert_kind, AlertKind::PersistentDowntime);
        assert!(alerts[0].downtime_hours() >= 96.0);
    }

    #[tokio::test]
    async fn recovery_resolves_and_audits() {
        let (_dir, manager, store) = manager().await;
        let bad = fleet_statuses(&[("mv-aurora", ComponentKind::Server, false, 6)]);
        manager.process_sla_statuses(&bad).await.unwrap();

        let good = fleet_statuses(&[("mv-aurora", ComponentKind::Server, true, 0)]);
        let stats = manager.maintain_alert_status(&good).await.unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.recoveries, 1);

        assert!(store.open_alerts().await.unwrap().is_empty());
        let all = store
            .alerts_for("mv-aurora", ComponentKind::Server, true)
            .await
            .unwrap();
        // One resolved violation alert plus one recovery record.
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|a| a.alert_kind == AlertKind::Recovery));
    }

    #[tokio::test]
    async fn ledger_restores_from_store() {
        let (_dir, manager, store) = manager().await;
        let bad = fleet_statuses(&[("mv-aurora", ComponentKind::Server, false, 6)]);
        manager.process_sla_statuses(&bad).await.unwrap();

        let manager2 = AlertManager::new(SlaParameters::default(), store.clone());
        assert_eq!(manager2.restore_open_alerts().await.unwrap(), 1);
        let none = manager2.process_sla_statuses(&bad).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn mark_ticket_created_updates_metadata() {
        let (_dir, manager, store) = manager().await;
        let metrics = down_metrics("mv-aurora", 5);
        let alerts = manager
            .monitor_persistent_downtime(&[&metrics])
            .await
            .unwrap();

        manager
            .mark_ticket_created(&alerts[0], "INFRA-42")
            .await
            .unwrap();

        let stored = store
            .alerts_for("mv-aurora", ComponentKind::Server, true)
            .await
            .unwrap();
        assert_eq!(stored[0].metadata["ticket_key"], "INFRA-42");
        assert_eq!(stored[0].metadata["ticket_created"], true);
    }
}

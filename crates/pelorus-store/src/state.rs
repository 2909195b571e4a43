use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::db::{ts, MonitorStore};
use crate::error::StoreResult;

/// Keys that survive retention cleanup regardless of age.
const PROTECTED_STATE_KEYS: [&str; 2] = ["system_version", "installation_date"];

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub component_status_history: usize,
    pub sla_violation_history: usize,
    pub alert_history: usize,
    pub tickets: usize,
    pub system_state: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.component_status_history
            + self.sla_violation_history
            + self.alert_history
            + self.tickets
            + self.system_state
    }
}

/// Snapshot used when the agent restarts after a crash.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    pub last_monitoring_run: Option<Value>,
    pub active_violations: usize,
    pub pending_tickets: usize,
    pub system_health: Option<Value>,
}

impl MonitorStore {
    /// Upsert a typed key/value checkpoint.
    pub async fn set_system_state(&self, key: &str, value: &Value, state_type: &str) -> StoreResult<()> {
        let key = key.to_string();
        let serialized = value.to_string();
        let state_type = state_type.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO system_state (state_key, state_value, state_type, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, serialized, state_type, ts(&Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_system_state(&self, key: &str) -> StoreResult<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT state_value FROM system_state WHERE state_key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
        })
        .await
    }

    pub async fn recovery_info(&self) -> StoreResult<RecoveryInfo> {
        let last_monitoring_run = self.get_system_state("last_monitoring_run").await?;
        let system_health = self.get_system_state("system_health").await?;
        let active_violations = self.open_violations(None, None).await?.len();
        let pending_tickets = self.pending_tickets().await?.len();
        Ok(RecoveryInfo {
            last_monitoring_run,
            active_violations,
            pending_tickets,
            system_health,
        })
    }

    /// Retention sweep. Deletes history older than `days_to_keep`; resolved
    /// violations/alerts/tickets by their resolution timestamps; stale
    /// system state except the protected keys.
    pub async fn cleanup_old_records(&self, days_to_keep: i64) -> StoreResult<CleanupReport> {
        let cutoff = ts(&(Utc::now() - chrono::Duration::days(days_to_keep)));
        let report = self
            .with_conn(move |conn| {
                let mut report = CleanupReport::default();

                report.component_status_history = conn.execute(
                    "DELETE FROM component_status_history WHERE recorded_at < ?1",
                    [&cutoff],
                )?;

                report.sla_violation_history = conn.execute(
                    "DELETE FROM sla_violation_history
                     WHERE is_resolved = 1 AND updated_at < ?1",
                    [&cutoff],
                )?;

                report.alert_history = conn.execute(
                    "DELETE FROM alert_history
                     WHERE is_resolved = 1 AND resolved_at IS NOT NULL AND resolved_at < ?1",
                    [&cutoff],
                )?;

                report.tickets = conn.execute(
                    "DELETE FROM tickets
                     WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
                    [&cutoff],
                )?;

                report.system_state = conn.execute(
                    "DELETE FROM system_state
                     WHERE updated_at < ?1 AND state_key NOT IN (?2, ?3)",
                    params![cutoff, PROTECTED_STATE_KEYS[0], PROTECTED_STATE_KEYS[1]],
                )?;

                Ok(report)
            })
            .await?;

        info!(
            total = report.total(),
            days_to_keep, "cleaned up old records"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pelorus_types::{ComponentKind, ComponentStatus, OperationalStatus, ViolationRecord};
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, MonitorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStore::open(&dir.path().join("pelorus.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn system_state_round_trips() {
        let (_dir, store) = store().await;
        store
            .set_system_state("last_monitoring_run", &json!({"run_id": "abc"}), "json")
            .await
            .unwrap();
        let value = store
            .get_system_state("last_monitoring_run")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["run_id"], "abc");

        // Upsert replaces.
        store
            .set_system_state("last_monitoring_run", &json!({"run_id": "def"}), "json")
            .await
            .unwrap();
        let value = store
            .get_system_state("last_monitoring_run")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["run_id"], "def");
    }

    #[tokio::test]
    async fn missing_state_is_none() {
        let (_dir, store) = store().await;
        assert!(store.get_system_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_deletes_old_history_and_keeps_fresh_rows() {
        let (_dir, store) = store().await;

        // Old component status (recorded in the past, beyond retention).
        let old = Utc::now() - chrono::Duration::days(120);
        let status = ComponentStatus {
            kind: ComponentKind::Server,
            uptime_percentage: 99.0,
            current_status: OperationalStatus::Up,
            downtime_aging_seconds: 0,
            last_ping_time: None,
            devices: vec![],
            has_data: true,
        };
        store
            .record_component_status("mv-aurora", &status, old)
            .await
            .unwrap();
        store
            .record_component_status("mv-aurora", &status, Utc::now())
            .await
            .unwrap();

        // An unresolved violation must survive cleanup.
        store
            .record_sla_violation(&ViolationRecord::open(
                "mv-aurora",
                ComponentKind::Server,
                old,
                70.0,
                None,
            ))
            .await
            .unwrap();

        let report = store.cleanup_old_records(90).await.unwrap();
        assert_eq!(report.component_status_history, 1);
        assert_eq!(report.sla_violation_history, 0);

        let trends = store
            .component_status_trends("mv-aurora", ComponentKind::Server, 365)
            .await
            .unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(store.open_violations(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovery_info_reflects_store_contents() {
        let (_dir, store) = store().await;
        store
            .set_system_state("system_health", &json!("nominal"), "json")
            .await
            .unwrap();
        store
            .record_sla_violation(&ViolationRecord::open(
                "mv-aurora",
                ComponentKind::Dashboard,
                Utc::now(),
                80.0,
                None,
            ))
            .await
            .unwrap();

        let info = store.recovery_info().await.unwrap();
        assert_eq!(info.active_violations, 1);
        assert_eq!(info.pending_tickets, 0);
        assert_eq!(info.system_health, Some(json!("nominal")));
    }
}

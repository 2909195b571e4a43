use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pelorus_types::{
    Alert, AlertKind, AlertSeverity, ComponentKind, ComponentStatus, OperationalStatus,
    ViolationRecord,
};

use crate::error::{StoreError, StoreResult};
use crate::migrations;

/// One point of component status history, used for trend queries.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentTrendPoint {
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub uptime_percentage: f64,
    pub current_status: OperationalStatus,
    pub downtime_aging_seconds: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationDurationStats {
    pub count: u64,
    pub average_duration_hours: f64,
    pub min_duration_hours: f64,
    pub max_duration_hours: f64,
    pub total_downtime_hours: f64,
}

/// The durable store. All monitoring state of record lives here; in-memory
/// caches elsewhere must be reconstructable from these tables.
pub struct MonitorStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp `{raw}`: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(&r)).transpose()
}

pub(crate) fn parse_component_kind(raw: &str) -> StoreResult<ComponentKind> {
    ComponentKind::parse(raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown component type `{raw}`")))
}

impl MonitorStore {
    /// Open (or create) the database at `db_path`, run pending migrations
    /// with a pre-migration backup, and validate the resulting schema.
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // WAL for durable concurrent reads. PRAGMA journal_mode returns a
        // row, so query_row is used to discard it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        migrations::migrate_to_latest(&mut conn, db_path)?;

        info!(path = %db_path.display(), "opened monitoring store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run one store operation, retrying transient (locked/busy) failures
    /// up to 3 times with a short backoff. Fatal errors surface at once.
    pub(crate) async fn with_conn<T>(
        &self,
        op: impl Fn(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut delay = Duration::from_millis(50);
        for attempt in 0..3 {
            let result = {
                let conn = self.conn.lock().await;
                op(&conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < 2 => {
                    warn!(attempt = attempt + 1, error = %err, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Corrupt("store retry loop exhausted".into()))
    }

    // ------------------------------------------------------------------
    // Component status history
    // ------------------------------------------------------------------

    pub async fn record_component_status(
        &self,
        vessel_id: &str,
        status: &ComponentStatus,
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let vessel_id = vessel_id.to_string();
        let status = status.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO component_status_history
                 (vessel_id, component_type, uptime_percentage, current_status,
                  downtime_aging_seconds, last_ping_time, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    vessel_id,
                    status.kind.as_str(),
                    status.uptime_percentage,
                    status.current_status.as_str(),
                    status.downtime_aging_seconds,
                    status.last_ping_time.as_ref().map(ts),
                    ts(&recorded_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn component_status_trends(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
        days_back: i64,
    ) -> StoreResult<Vec<ComponentTrendPoint>> {
        let vessel_id = vessel_id.to_string();
        let cutoff = ts(&(Utc::now() - chrono::Duration::days(days_back)));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT vessel_id, component_type, uptime_percentage, current_status,
                        downtime_aging_seconds, recorded_at
                 FROM component_status_history
                 WHERE vessel_id = ?1 AND component_type = ?2 AND recorded_at >= ?3
                 ORDER BY recorded_at ASC",
            )?;
            let rows = stmt.query_map(params![vessel_id, kind.as_str(), cutoff], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (vessel, kind_raw, uptime, status_raw, aging, recorded) = row?;
                out.push(ComponentTrendPoint {
                    vessel_id: vessel,
                    kind: parse_component_kind(&kind_raw)?,
                    uptime_percentage: uptime,
                    current_status: OperationalStatus::parse(&status_raw).ok_or_else(|| {
                        StoreError::Corrupt(format!("unknown status `{status_raw}`"))
                    })?,
                    downtime_aging_seconds: aging,
                    recorded_at: parse_ts(&recorded)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // ------------------------------------------------------------------
    // SLA violations
    // ------------------------------------------------------------------

    pub async fn record_sla_violation(&self, record: &ViolationRecord) -> StoreResult<i64> {
        let record = record.clone();
        let vessel_id = record.vessel_id.clone();
        let kind = record.kind;
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sla_violation_history
                     (vessel_id, component_type, violation_start, uptime_percentage,
                      violation_duration_seconds, is_resolved, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
                    params![
                        record.vessel_id,
                        record.kind.as_str(),
                        ts(&record.violation_start),
                        record.uptime_percentage,
                        record.duration_seconds,
                        ts(&Utc::now()),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        info!(
            vessel = %vessel_id,
            kind = kind.as_str(),
            violation_id = id,
            "recorded sla violation"
        );
        Ok(id)
    }

    /// Close a violation: total duration is measured from its recorded start.
    pub async fn resolve_sla_violation(
        &self,
        violation_id: i64,
        violation_end: DateTime<Utc>,
        final_uptime_percentage: f64,
    ) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let start: Option<String> = conn
                .query_row(
                    "SELECT violation_start FROM sla_violation_history WHERE id = ?1",
                    [violation_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(start) = start else {
                return Err(StoreError::NotFound(format!("violation {violation_id}")));
            };
            let duration = (violation_end - parse_ts(&start)?).num_seconds().max(0);
            conn.execute(
                "UPDATE sla_violation_history
                 SET violation_end = ?1,
                     violation_duration_seconds = ?2,
                     uptime_percentage = ?3,
                     is_resolved = 1,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    ts(&violation_end),
                    duration,
                    final_uptime_percentage,
                    ts(&Utc::now()),
                    violation_id
                ],
            )?;
            debug!(violation_id, duration_seconds = duration, "resolved sla violation");
            Ok(())
        })
        .await
    }

    pub async fn open_violations(
        &self,
        vessel_id: Option<&str>,
        kind: Option<ComponentKind>,
    ) -> StoreResult<Vec<ViolationRecord>> {
        let vessel_id = vessel_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, vessel_id, component_type, violation_start, violation_end,
                        uptime_percentage, violation_duration_seconds, is_resolved
                 FROM sla_violation_history WHERE is_resolved = 0",
            );
            let mut binds: Vec<String> = Vec::new();
            if let Some(vessel) = &vessel_id {
                sql.push_str(" AND vessel_id = ?");
                binds.push(vessel.clone());
            }
            if let Some(kind) = kind {
                sql.push_str(" AND component_type = ?");
                binds.push(kind.as_str().to_string());
            }
            sql.push_str(" ORDER BY violation_start DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), map_violation)?;
            collect_violations(rows)
        })
        .await
    }

    pub async fn violation_history(
        &self,
        vessel_id: Option<&str>,
        kind: Option<ComponentKind>,
        days_back: i64,
    ) -> StoreResult<Vec<ViolationRecord>> {
        let vessel_id = vessel_id.map(str::to_string);
        let cutoff = ts(&(Utc::now() - chrono::Duration::days(days_back)));
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, vessel_id, component_type, violation_start, violation_end,
                        uptime_percentage, violation_duration_seconds, is_resolved
                 FROM sla_violation_history WHERE violation_start >= ?",
            );
            let mut binds: Vec<String> = vec![cutoff.clone()];
            if let Some(vessel) = &vessel_id {
                sql.push_str(" AND vessel_id = ?");
                binds.push(vessel.clone());
            }
            if let Some(kind) = kind {
                sql.push_str(" AND component_type = ?");
                binds.push(kind.as_str().to_string());
            }
            sql.push_str(" ORDER BY violation_start DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), map_violation)?;
            collect_violations(rows)
        })
        .await
    }

    pub async fn violation_duration_stats(
        &self,
        vessel_id: Option<&str>,
        days_back: i64,
    ) -> StoreResult<ViolationDurationStats> {
        let vessel_id = vessel_id.map(str::to_string);
        let cutoff = ts(&(Utc::now() - chrono::Duration::days(days_back)));
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT violation_duration_seconds FROM sla_violation_history
                 WHERE violation_start >= ? AND violation_duration_seconds IS NOT NULL",
            );
            let mut binds: Vec<String> = vec![cutoff.clone()];
            if let Some(vessel) = &vessel_id {
                sql.push_str(" AND vessel_id = ?");
                binds.push(vessel.clone());
            }
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), |row| {
                row.get::<_, i64>(0)
            })?;

            let mut durations_hours = Vec::new();
            for row in rows {
                durations_hours.push(row? as f64 / 3600.0);
            }

            if durations_hours.is_empty() {
                return Ok(ViolationDurationStats {
                    count: 0,
                    average_duration_hours: 0.0,
                    min_duration_hours: 0.0,
                    max_duration_hours: 0.0,
                    total_downtime_hours: 0.0,
                });
            }

            let total: f64 = durations_hours.iter().sum();
            Ok(ViolationDurationStats {
                count: durations_hours.len() as u64,
                average_duration_hours: total / durations_hours.len() as f64,
                min_duration_hours: durations_hours.iter().cloned().fold(f64::MAX, f64::min),
                max_duration_hours: durations_hours.iter().cloned().fold(0.0, f64::max),
                total_downtime_hours: total,
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub async fn record_alert(&self, alert: &Alert) -> StoreResult<i64> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alert_history
                 (vessel_id, component_type, alert_type, severity, message, metadata,
                  is_resolved, created_at, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    alert.vessel_id,
                    alert.kind.as_str(),
                    alert.alert_kind.as_str(),
                    alert.severity.as_str(),
                    alert.message,
                    alert.metadata.to_string(),
                    alert.resolved as i64,
                    ts(&alert.created_at),
                    alert.resolved_at.as_ref().map(ts),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn resolve_alert(&self, alert_id: i64) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE alert_history SET is_resolved = 1, resolved_at = ?1 WHERE id = ?2",
                params![ts(&Utc::now()), alert_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("alert {alert_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn update_alert_metadata(
        &self,
        alert_id: i64,
        metadata: serde_json::Value,
    ) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE alert_history SET metadata = ?1 WHERE id = ?2",
                params![metadata.to_string(), alert_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("alert {alert_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn open_alerts(&self) -> StoreResult<Vec<Alert>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, vessel_id, component_type, alert_type, severity, message,
                        metadata, is_resolved, created_at, resolved_at
                 FROM alert_history WHERE is_resolved = 0 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], map_alert)?;
            collect_alerts(rows)
        })
        .await
    }

    pub async fn alerts_for(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
        include_resolved: bool,
    ) -> StoreResult<Vec<Alert>> {
        let vessel_id = vessel_id.to_string();
        self.with_conn(move |conn| {
            let sql = if include_resolved {
                "SELECT id, vessel_id, component_type, alert_type, severity, message,
                        metadata, is_resolved, created_at, resolved_at
                 FROM alert_history WHERE vessel_id = ?1 AND component_type = ?2
                 ORDER BY created_at DESC"
            } else {
                "SELECT id, vessel_id, component_type, alert_type, severity, message,
                        metadata, is_resolved, created_at, resolved_at
                 FROM alert_history
                 WHERE vessel_id = ?1 AND component_type = ?2 AND is_resolved = 0
                 ORDER BY created_at DESC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![vessel_id, kind.as_str()], map_alert)?;
            collect_alerts(rows)
        })
        .await
    }
}

type ViolationRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    f64,
    Option<i64>,
    i64,
);

fn map_violation(row: &Row<'_>) -> rusqlite::Result<ViolationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn collect_violations(
    rows: impl Iterator<Item = rusqlite::Result<ViolationRow>>,
) -> StoreResult<Vec<ViolationRecord>> {
    let mut out = Vec::new();
    for row in rows {
        let (id, vessel_id, kind_raw, start, end, uptime, duration, resolved) = row?;
        out.push(ViolationRecord {
            id: Some(id),
            vessel_id,
            kind: parse_component_kind(&kind_raw)?,
            violation_start: parse_ts(&start)?,
            violation_end: parse_opt_ts(end)?,
            uptime_percentage: uptime,
            duration_seconds: duration,
            resolved: resolved != 0,
        });
    }
    Ok(out)
}

type AlertRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    String,
    Option<String>,
);

fn map_alert(row: &Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn collect_alerts(
    rows: impl Iterator<Item = rusqlite::Result<AlertRow>>,
) -> StoreResult<Vec<Alert>> {
    let mut out = Vec::new();
    for row in rows {
        let (id, vessel_id, kind_raw, alert_kind_raw, severity_raw, message, metadata, resolved, created, resolved_at) =
            row?;
        out.push(Alert {
            id: Some(id),
            vessel_id,
            kind: parse_component_kind(&kind_raw)?,
            alert_kind: AlertKind::parse(&alert_kind_raw).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown alert type `{alert_kind_raw}`"))
            })?,
            severity: AlertSeverity::parse(&severity_raw).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown severity `{severity_raw}`"))
            })?,
            message,
            metadata: metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| StoreError::Corrupt(format!("bad alert metadata: {e}")))?
                .unwrap_or(serde_json::Value::Null),
            resolved: resolved != 0,
            created_at: parse_ts(&created)?,
            resolved_at: parse_opt_ts(resolved_at)?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, MonitorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStore::open(&dir.path().join("pelorus.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn component(kind: ComponentKind) -> ComponentStatus {
        ComponentStatus {
            kind,
            uptime_percentage: 91.5,
            current_status: OperationalStatus::Down,
            downtime_aging_seconds: 7_200,
            last_ping_time: Some(Utc::now()),
            devices: vec![],
            has_data: true,
        }
    }

    #[tokio::test]
    async fn component_status_round_trips_through_trends() {
        let (_dir, store) = store().await;
        store
            .record_component_status("mv-aurora", &component(ComponentKind::Server), Utc::now())
            .await
            .unwrap();

        let trends = store
            .component_status_trends("mv-aurora", ComponentKind::Server, 7)
            .await
            .unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].uptime_percentage, 91.5);
        assert_eq!(trends[0].current_status, OperationalStatus::Down);
    }

    #[tokio::test]
    async fn violation_open_and_resolve_lifecycle() {
        let (_dir, store) = store().await;
        let start = Utc::now() - chrono::Duration::hours(5);
        let record = ViolationRecord::open("mv-aurora", ComponentKind::Dashboard, start, 82.0, Some(18_000));
        let id = store.record_sla_violation(&record).await.unwrap();

        let open = store.open_violations(None, None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, Some(id));

        store
            .resolve_sla_violation(id, Utc::now(), 96.0)
            .await
            .unwrap();
        assert!(store.open_violations(None, None).await.unwrap().is_empty());

        let history = store.violation_history(None, None, 30).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
        let duration = history[0].duration_seconds.unwrap();
        assert!((17_900..=18_100).contains(&duration), "duration {duration}");
    }

    #[tokio::test]
    async fn resolving_missing_violation_is_not_found() {
        let (_dir, store) = store().await;
        let err = store
            .resolve_sla_violation(999, Utc::now(), 95.0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn alerts_round_trip_and_resolve() {
        let (_dir, store) = store().await;
        let alert = Alert::new(
            "mv-aurora",
            ComponentKind::AccessPoint,
            AlertKind::SlaViolation,
            AlertSeverity::Warning,
            "uptime 88% below threshold 95%",
            json!({"uptime": 88.0}),
        );
        let id = store.record_alert(&alert).await.unwrap();

        let open = store.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, Some(id));
        assert_eq!(open[0].severity, AlertSeverity::Warning);
        assert_eq!(open[0].metadata["uptime"], json!(88.0));

        store.resolve_alert(id).await.unwrap();
        assert!(store.open_alerts().await.unwrap().is_empty());

        let all = store
            .alerts_for("mv-aurora", ComponentKind::AccessPoint, true)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].resolved);
    }

    #[tokio::test]
    async fn duration_stats_summarize_resolved_violations() {
        let (_dir, store) = store().await;
        for hours in [2, 4] {
            let start = Utc::now() - chrono::Duration::hours(hours);
            let record =
                ViolationRecord::open("mv-aurora", ComponentKind::Server, start, 80.0, None);
            let id = store.record_sla_violation(&record).await.unwrap();
            store
                .resolve_sla_violation(id, Utc::now(), 95.0)
                .await
                .unwrap();
        }

        let stats = store.violation_duration_stats(None, 30).await.unwrap();
        assert_eq!(stats.count, 2);
        assert!(stats.average_duration_hours > 2.9 && stats.average_duration_hours < 3.1);
        assert!(stats.total_downtime_hours > 5.9 && stats.total_downtime_hours < 6.1);
    }
}

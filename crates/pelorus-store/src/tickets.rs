use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use pelorus_types::{ComponentKind, IssueSeverity, TicketLifecycle, TicketRecord};

use crate::db::{parse_component_kind, parse_opt_ts, parse_ts, ts, MonitorStore};
use crate::error::{StoreError, StoreResult};

/// A row in the `tickets` table, mirroring the tracker's view of an issue.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTicket {
    pub id: i64,
    pub tracker_key: String,
    pub vessel_id: String,
    pub kind: ComponentKind,
    pub issue_summary: String,
    pub tracker_status: String,
    pub downtime_seconds: i64,
    pub alert_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatistics {
    pub total_tickets: u64,
    pub status_counts: HashMap<String, u64>,
    pub component_counts: HashMap<String, u64>,
    pub top_vessels: Vec<(String, u64)>,
    pub average_resolution_minutes: f64,
}

impl MonitorStore {
    // ------------------------------------------------------------------
    // Tracker ticket mirror (`tickets`)
    // ------------------------------------------------------------------

    pub async fn record_ticket(
        &self,
        tracker_key: &str,
        vessel_id: &str,
        kind: ComponentKind,
        issue_summary: &str,
        tracker_status: &str,
        downtime_seconds: i64,
        alert_id: Option<i64>,
    ) -> StoreResult<i64> {
        let tracker_key = tracker_key.to_string();
        let vessel_id = vessel_id.to_string();
        let issue_summary = issue_summary.to_string();
        let tracker_status = tracker_status.to_string();
        let id = self
            .with_conn(move |conn| {
                let now = ts(&Utc::now());
                conn.execute(
                    "INSERT INTO tickets
                     (tracker_key, vessel_id, component_type, issue_summary, tracker_status,
                      downtime_seconds, alert_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        tracker_key,
                        vessel_id,
                        kind.as_str(),
                        issue_summary,
                        tracker_status,
                        downtime_seconds,
                        alert_id,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        info!(ticket_id = id, "recorded tracker ticket");
        Ok(id)
    }

    pub async fn update_ticket_status(
        &self,
        tracker_key: &str,
        new_status: &str,
        resolved_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let tracker_key = tracker_key.to_string();
        let new_status = new_status.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tickets
                 SET tracker_status = ?1, updated_at = ?2,
                     resolved_at = COALESCE(?3, resolved_at)
                 WHERE tracker_key = ?4",
                params![
                    new_status,
                    ts(&Utc::now()),
                    resolved_at.as_ref().map(ts),
                    tracker_key
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("ticket {tracker_key}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn open_tickets_for(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
    ) -> StoreResult<Vec<StoredTicket>> {
        let vessel_id = vessel_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tracker_key, vessel_id, component_type, issue_summary,
                        tracker_status, downtime_seconds, alert_id, created_at,
                        updated_at, resolved_at
                 FROM tickets
                 WHERE vessel_id = ?1 AND component_type = ?2 AND resolved_at IS NULL
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![vessel_id, kind.as_str()], map_stored_ticket)?;
            collect_stored_tickets(rows)
        })
        .await
    }

    pub async fn pending_tickets(&self) -> StoreResult<Vec<StoredTicket>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tracker_key, vessel_id, component_type, issue_summary,
                        tracker_status, downtime_seconds, alert_id, created_at,
                        updated_at, resolved_at
                 FROM tickets WHERE resolved_at IS NULL ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], map_stored_ticket)?;
            collect_stored_tickets(rows)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Ticket lifecycle records (`ticket_records` + `alert_ticket_links`)
    // ------------------------------------------------------------------

    pub async fn insert_ticket_record(&self, record: &TicketRecord) -> StoreResult<i64> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ticket_records
                 (tracker_key, tracker_id, vessel_id, component_type, issue_severity,
                  lifecycle_status, created_at, updated_at, alert_ids, downtime_seconds,
                  historical_context, resolution_notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.tracker_key,
                    record.tracker_id,
                    record.vessel_id,
                    record.kind.as_str(),
                    record.severity.as_str(),
                    record.lifecycle.as_str(),
                    ts(&record.created_at),
                    ts(&record.updated_at),
                    serde_json::to_string(&record.alert_ids).unwrap_or_else(|_| "[]".into()),
                    record.downtime_seconds,
                    record.historical_context,
                    record.resolution_notes,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Open lifecycle records for (vessel, component) created after `cutoff`,
    /// newest first. This is the working set of the duplicate-prevention rule.
    pub async fn open_ticket_records_since(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<TicketRecord>> {
        let vessel_id = vessel_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tracker_key, tracker_id, vessel_id, component_type,
                        issue_severity, lifecycle_status, created_at, updated_at,
                        alert_ids, downtime_seconds, historical_context, resolution_notes
                 FROM ticket_records
                 WHERE vessel_id = ?1 AND component_type = ?2
                   AND lifecycle_status IN ('created', 'linked_to_alert', 'in_progress', 'reopened')
                   AND created_at > ?3
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(
                params![vessel_id, kind.as_str(), ts(&cutoff)],
                map_ticket_record,
            )?;
            collect_ticket_records(rows)
        })
        .await
    }

    pub async fn ticket_record_by_key(&self, tracker_key: &str) -> StoreResult<Option<TicketRecord>> {
        let tracker_key = tracker_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tracker_key, tracker_id, vessel_id, component_type,
                        issue_severity, lifecycle_status, created_at, updated_at,
                        alert_ids, downtime_seconds, historical_context, resolution_notes
                 FROM ticket_records WHERE tracker_key = ?1",
            )?;
            let record = stmt
                .query_row([&tracker_key], map_ticket_record)
                .optional()?;
            record.map(ticket_record_from_row).transpose()
        })
        .await
    }

    pub async fn update_ticket_lifecycle(
        &self,
        tracker_key: &str,
        lifecycle: TicketLifecycle,
        resolution_notes: Option<&str>,
    ) -> StoreResult<bool> {
        let tracker_key = tracker_key.to_string();
        let resolution_notes = resolution_notes.map(str::to_string);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE ticket_records
                 SET lifecycle_status = ?1, updated_at = ?2,
                     resolution_notes = COALESCE(?3, resolution_notes)
                 WHERE tracker_key = ?4",
                params![
                    lifecycle.as_str(),
                    ts(&Utc::now()),
                    resolution_notes,
                    tracker_key
                ],
            )?;
            if changed == 0 {
                warn!(tracker_key = %tracker_key, "ticket record not found for lifecycle update");
            }
            Ok(changed > 0)
        })
        .await
    }

    /// Attach an alert to a ticket record. Idempotent: linking an already
    /// linked alert changes nothing.
    pub async fn link_alert_to_ticket(
        &self,
        tracker_key: &str,
        alert_id: i64,
    ) -> StoreResult<bool> {
        let tracker_key = tracker_key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(i64, Option<String>)> = conn
                .query_row(
                    "SELECT id, alert_ids FROM ticket_records WHERE tracker_key = ?1",
                    [&tracker_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((ticket_id, alert_ids_json)) = row else {
                warn!(tracker_key = %tracker_key, "ticket record not found for alert link");
                return Ok(false);
            };

            let mut alert_ids: Vec<i64> = alert_ids_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| StoreError::Corrupt(format!("bad alert_ids json: {e}")))?
                .unwrap_or_default();

            if !alert_ids.contains(&alert_id) {
                alert_ids.push(alert_id);
                conn.execute(
                    "UPDATE ticket_records
                     SET alert_ids = ?1, lifecycle_status = ?2, updated_at = ?3
                     WHERE tracker_key = ?4",
                    params![
                        serde_json::to_string(&alert_ids).unwrap_or_else(|_| "[]".into()),
                        TicketLifecycle::LinkedToAlert.as_str(),
                        ts(&Utc::now()),
                        tracker_key
                    ],
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO alert_ticket_links (alert_id, ticket_id, linked_at)
                     VALUES (?1, ?2, ?3)",
                    params![alert_id, ticket_id, ts(&Utc::now())],
                )?;
                info!(tracker_key = %tracker_key, alert_id, "linked alert to ticket");
            }
            Ok(true)
        })
        .await
    }

    pub async fn ticket_records_for_alert(&self, alert_id: i64) -> StoreResult<Vec<TicketRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tr.id, tr.tracker_key, tr.tracker_id, tr.vessel_id, tr.component_type,
                        tr.issue_severity, tr.lifecycle_status, tr.created_at, tr.updated_at,
                        tr.alert_ids, tr.downtime_seconds, tr.historical_context, tr.resolution_notes
                 FROM ticket_records tr
                 JOIN alert_ticket_links atl ON tr.id = atl.ticket_id
                 WHERE atl.alert_id = ?1
                 ORDER BY tr.created_at DESC",
            )?;
            let rows = stmt.query_map([alert_id], map_ticket_record)?;
            collect_ticket_records(rows)
        })
        .await
    }

    pub async fn lifecycle_statistics(&self) -> StoreResult<LifecycleStatistics> {
        self.with_conn(|conn| {
            let mut status_counts = HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT lifecycle_status, COUNT(*) FROM ticket_records GROUP BY lifecycle_status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                status_counts.insert(status, count as u64);
            }

            let mut component_counts = HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT component_type, COUNT(*) FROM ticket_records GROUP BY component_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (kind, count) = row?;
                component_counts.insert(kind, count as u64);
            }

            let mut top_vessels = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT vessel_id, COUNT(*) AS c FROM ticket_records
                 GROUP BY vessel_id ORDER BY c DESC LIMIT 10",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (vessel, count) = row?;
                top_vessels.push((vessel, count as u64));
            }

            let average_resolution_minutes: f64 = conn
                .query_row(
                    "SELECT AVG((julianday(updated_at) - julianday(created_at)) * 24 * 60)
                     FROM ticket_records
                     WHERE lifecycle_status IN ('resolved', 'closed')",
                    [],
                    |row| row.get::<_, Option<f64>>(0),
                )?
                .unwrap_or(0.0);

            Ok(LifecycleStatistics {
                total_tickets: status_counts.values().sum(),
                status_counts,
                component_counts,
                top_vessels,
                average_resolution_minutes,
            })
        })
        .await
    }
}

type TicketRecordRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
);

fn map_ticket_record(row: &Row<'_>) -> rusqlite::Result<TicketRecordRow> {
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
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn ticket_record_from_row(row: TicketRecordRow) -> StoreResult<TicketRecord> {
    let (
        id,
        tracker_key,
        tracker_id,
        vessel_id,
        kind_raw,
        severity_raw,
        lifecycle_raw,
        created,
        updated,
        alert_ids_json,
        downtime_seconds,
        historical_context,
        resolution_notes,
    ) = row;

    Ok(TicketRecord {
        id: Some(id),
        tracker_key,
        tracker_id,
        vessel_id,
        kind: parse_component_kind(&kind_raw)?,
        severity: IssueSeverity::parse(&severity_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown severity `{severity_raw}`")))?,
        lifecycle: TicketLifecycle::parse(&lifecycle_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown lifecycle `{lifecycle_raw}`")))?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
        alert_ids: alert_ids_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("bad alert_ids json: {e}")))?
            .unwrap_or_default(),
        downtime_seconds,
        historical_context: historical_context.unwrap_or_default(),
        resolution_notes,
    })
}

fn collect_ticket_records(
    rows: impl Iterator<Item = rusqlite::Result<TicketRecordRow>>,
) -> StoreResult<Vec<TicketRecord>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(ticket_record_from_row(row?)?);
    }
    Ok(out)
}

type StoredTicketRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    String,
    String,
    Option<String>,
);

fn map_stored_ticket(row: &Row<'_>) -> rusqlite::Result<StoredTicketRow> {
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
        row.get(10)?,
    ))
}

fn collect_stored_tickets(
    rows: impl Iterator<Item = rusqlite::Result<StoredTicketRow>>,
) -> StoreResult<Vec<StoredTicket>> {
    let mut out = Vec::new();
    for row in rows {
        let (
            id,
            tracker_key,
            vessel_id,
            kind_raw,
            issue_summary,
            tracker_status,
            downtime_seconds,
            alert_id,
            created,
            updated,
            resolved,
        ) = row?;
        out.push(StoredTicket {
            id,
            tracker_key,
            vessel_id,
            kind: parse_component_kind(&kind_raw)?,
            issue_summary,
            tracker_status,
            downtime_seconds,
            alert_id,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
            resolved_at: parse_opt_ts(resolved)?,
        });
    }
    Ok(out)
}

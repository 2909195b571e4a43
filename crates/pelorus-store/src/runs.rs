use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use pelorus_types::{
    RunStatus, SchedulerRun, SchedulerRunDetails, VesselQueryResult,
};

use crate::db::{parse_opt_ts, parse_ts, ts, MonitorStore};
use crate::error::{StoreError, StoreResult};

impl MonitorStore {
    /// Insert the opening row for a run. Counts are zero until completion.
    pub async fn insert_run(&self, run: &SchedulerRun) -> StoreResult<()> {
        let run = run.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduler_runs
                 (id, start_time, end_time, total_vessels, successful_vessels,
                  failed_vessels, retry_attempts, status, duration_seconds, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.run_id,
                    ts(&run.start_time),
                    run.end_time.as_ref().map(ts),
                    run.total_vessels,
                    run.successful_vessels,
                    run.failed_vessels,
                    run.retry_attempts,
                    run.status.as_str(),
                    run.duration_seconds,
                    run.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_run(&self, run: &SchedulerRun) -> StoreResult<()> {
        let run = run.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE scheduler_runs
                 SET end_time = ?1, successful_vessels = ?2, failed_vessels = ?3,
                     retry_attempts = ?4, status = ?5, duration_seconds = ?6,
                     error_message = ?7
                 WHERE id = ?8",
                params![
                    run.end_time.as_ref().map(ts),
                    run.successful_vessels,
                    run.failed_vessels,
                    run.retry_attempts,
                    run.status.as_str(),
                    run.duration_seconds,
                    run.error_message,
                    run.run_id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("run {}", run.run_id)));
            }
            Ok(())
        })
        .await
    }

    pub async fn insert_vessel_result(
        &self,
        run_id: &str,
        result: &VesselQueryResult,
    ) -> StoreResult<()> {
        let run_id = run_id.to_string();
        let result = result.clone();
        let vessel_id = result.vessel_id.clone();
        let attempt_number = result.attempt_number;
        let success = result.success;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduler_vessel_results
                 (run_id, vessel_id, attempt_number, success, query_duration_seconds,
                  error_message, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    result.vessel_id,
                    result.attempt_number,
                    result.success as i64,
                    result.duration_seconds,
                    result.error_message,
                    ts(&result.timestamp),
                ],
            )?;
            Ok(())
        })
        .await?;
        debug!(
            vessel = %vessel_id,
            attempt = attempt_number,
            success = success,
            "logged vessel query result"
        );
        Ok(())
    }

    pub async fn recent_runs(&self, limit: u32) -> StoreResult<Vec<SchedulerRun>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, start_time, end_time, total_vessels, successful_vessels,
                        failed_vessels, retry_attempts, status, duration_seconds, error_message
                 FROM scheduler_runs ORDER BY start_time DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], map_run)?;
            collect_runs(rows)
        })
        .await
    }

    pub async fn run_by_id(&self, run_id: &str) -> StoreResult<Option<SchedulerRun>> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, start_time, end_time, total_vessels, successful_vessels,
                        failed_vessels, retry_attempts, status, duration_seconds, error_message
                 FROM scheduler_runs WHERE id = ?1",
            )?;
            let row = stmt.query_row([&run_id], map_run).optional()?;
            row.map(run_from_row).transpose()
        })
        .await
    }

    /// The currently running execution, if any.
    pub async fn active_run(&self) -> StoreResult<Option<SchedulerRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, start_time, end_time, total_vessels, successful_vessels,
                        failed_vessels, retry_attempts, status, duration_seconds, error_message
                 FROM scheduler_runs WHERE status = 'running'
                 ORDER BY start_time DESC LIMIT 1",
            )?;
            let row = stmt.query_row([], map_run).optional()?;
            row.map(run_from_row).transpose()
        })
        .await
    }

    /// A run with its complete per-vessel attempt log and retry summary.
    pub async fn run_details(&self, run_id: &str) -> StoreResult<Option<SchedulerRunDetails>> {
        let Some(run) = self.run_by_id(run_id).await? else {
            return Ok(None);
        };

        let run_id = run_id.to_string();
        let vessel_results = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT vessel_id, attempt_number, success, query_duration_seconds,
                            error_message, timestamp
                     FROM scheduler_vessel_results
                     WHERE run_id = ?1
                     ORDER BY vessel_id ASC, attempt_number ASC",
                )?;
                let rows = stmt.query_map([&run_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (vessel_id, attempt, success, duration, error, timestamp) = row?;
                    out.push(VesselQueryResult {
                        vessel_id,
                        attempt_number: attempt,
                        success: success != 0,
                        duration_seconds: duration,
                        error_message: error,
                        timestamp: parse_ts(&timestamp)?,
                    });
                }
                Ok(out)
            })
            .await?;

        let mut retry_summary: HashMap<String, u32> = HashMap::new();
        for result in &vessel_results {
            if result.attempt_number > 1 {
                *retry_summary.entry(result.vessel_id.clone()).or_insert(0) += 1;
            } else {
                retry_summary.entry(result.vessel_id.clone()).or_insert(0);
            }
        }

        Ok(Some(SchedulerRunDetails {
            run,
            vessel_results,
            retry_summary,
        }))
    }
}

type RunRow = (
    String,
    String,
    Option<String>,
    u32,
    u32,
    u32,
    u32,
    String,
    Option<i64>,
    Option<String>,
);

fn map_run(row: &Row<'_>) -> rusqlite::Result<RunRow> {
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

fn run_from_row(row: RunRow) -> StoreResult<SchedulerRun> {
    let (
        run_id,
        start,
        end,
        total_vessels,
        successful,
        failed,
        retry_attempts,
        status_raw,
        duration_seconds,
        error_message,
    ) = row;
    Ok(SchedulerRun {
        run_id,
        start_time: parse_ts(&start)?,
        end_time: parse_opt_ts(end)?,
        total_vessels,
        successful_vessels: successful,
        failed_vessels: failed,
        retry_attempts,
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown run status `{status_raw}`")))?,
        duration_seconds,
        error_message,
    })
}

fn collect_runs(
    rows: impl Iterator<Item = rusqlite::Result<RunRow>>,
) -> StoreResult<Vec<SchedulerRun>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(run_from_row(row?)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn store() -> (tempfile::TempDir, MonitorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStore::open(&dir.path().join("pelorus.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn result(vessel: &str, attempt: u32, success: bool) -> VesselQueryResult {
        VesselQueryResult {
            vessel_id: vessel.into(),
            attempt_number: attempt,
            success,
            duration_seconds: 0.35,
            error_message: (!success).then(|| "timeout".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn run_lifecycle_round_trip() {
        let (_dir, store) = store().await;
        let mut run = SchedulerRun::begin(3);
        store.insert_run(&run).await.unwrap();

        let active = store.active_run().await.unwrap().unwrap();
        assert_eq!(active.run_id, run.run_id);
        assert_eq!(active.status, RunStatus::Running);

        run.complete(2, 1, 2);
        store.update_run(&run).await.unwrap();

        assert!(store.active_run().await.unwrap().is_none());
        let stored = store.run_by_id(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored, run);
    }

    #[tokio::test]
    async fn details_compute_retry_summary() {
        let (_dir, store) = store().await;
        let run = SchedulerRun::begin(2);
        store.insert_run(&run).await.unwrap();

        for r in [
            result("mv-aurora", 1, true),
            result("mv-borealis", 1, false),
            result("mv-borealis", 2, false),
            result("mv-borealis", 3, true),
        ] {
            store.insert_vessel_result(&run.run_id, &r).await.unwrap();
        }

        let details = store.run_details(&run.run_id).await.unwrap().unwrap();
        assert_eq!(details.vessel_results.len(), 4);
        assert_eq!(details.retry_summary["mv-borealis"], 2);
        assert_eq!(details.retry_summary["mv-aurora"], 0);
        assert_eq!(details.results_for("mv-borealis").len(), 3);
        assert!(details.failed_vessels().is_empty());
    }

    #[tokio::test]
    async fn per_vessel_results_are_ordered_by_attempt() {
        let (_dir, store) = store().await;
        let run = SchedulerRun::begin(1);
        store.insert_run(&run).await.unwrap();
        for attempt in [2, 1, 3] {
            store
                .insert_vessel_result(&run.run_id, &result("mv-aurora", attempt, false))
                .await
                .unwrap();
        }

        let details = store.run_details(&run.run_id).await.unwrap().unwrap();
        let attempts: Vec<u32> = details
            .vessel_results
            .iter()
            .map(|r| r.attempt_number)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unknown_run_has_no_details() {
        let (_dir, store) = store().await;
        assert!(store.run_details("no-such-run").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_runs_newest_first() {
        let (_dir, store) = store().await;
        let mut first = SchedulerRun::begin(1);
        first.start_time = Utc::now() - chrono::Duration::hours(2);
        store.insert_run(&first).await.unwrap();
        let second = SchedulerRun::begin(1);
        store.insert_run(&second).await.unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second.run_id);
    }
}

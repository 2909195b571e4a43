use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pelorus_core::SchedulingConfig;

use crate::pipeline::{MonitorPipeline, PipelineError, PipelineReport};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),

    #[error("a monitoring run is already in progress")]
    Busy,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub daily_time: String,
    pub timezone: String,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub misfire_grace_seconds: u64,
}

/// Decide what to do with a trigger observed `now` that was scheduled for
/// `scheduled`: fire when within the grace window, drop otherwise. Multiple
/// missed triggers coalesce because the caller always schedules the next
/// fire from `now`.
pub(crate) fn misfire_decision(
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    let lateness = now - scheduled;
    lateness <= ChronoDuration::from_std(grace).unwrap_or(ChronoDuration::zero())
}

/// Fires the monitoring pipeline once a day at the configured wall-clock
/// time in the configured IANA zone. A single-instance guard covers both
/// scheduled triggers and manual "run now" requests.
pub struct DailyScheduler {
    config: SchedulingConfig,
    tz: Tz,
    pipeline: Arc<MonitorPipeline>,
    run_guard: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl DailyScheduler {
    pub fn new(
        config: SchedulingConfig,
        pipeline: Arc<MonitorPipeline>,
    ) -> Result<Self, SchedulerError> {
        let tz = Tz::from_str(&config.timezone)
            .map_err(|_| SchedulerError::UnknownTimezone(config.timezone.clone()))?;
        info!(
            hour = config.daily_monitoring_hour,
            minute = config.daily_monitoring_minute,
            timezone = %config.timezone,
            "initialized daily scheduler"
        );
        Ok(Self {
            config,
            tz,
            pipeline,
            run_guard: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pipeline(&self) -> &Arc<MonitorPipeline> {
        &self.pipeline
    }

    /// The next wall-clock fire strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local_after = after.with_timezone(&self.tz);
        let mut date = local_after.date_naive();

        loop {
            let candidate_naive = date
                .and_hms_opt(
                    self.config.daily_monitoring_hour,
                    self.config.daily_monitoring_minute,
                    0,
                )
                .expect("validated schedule time");
            // DST gaps/overlaps: take the earliest valid interpretation.
            let candidate = match self.tz.from_local_datetime(&candidate_naive) {
                chrono::LocalResult::Single(dt) => Some(dt),
                chrono::LocalResult::Ambiguous(first, _) => Some(first),
                chrono::LocalResult::None => None,
            };
            if let Some(candidate) = candidate {
                let candidate_utc = candidate.with_timezone(&Utc);
                if candidate_utc > after {
                    return candidate_utc;
                }
            }
            date = date.succ_opt().expect("date overflow");
        }
    }

    pub fn status(&self, running: bool) -> SchedulerStatus {
        SchedulerStatus {
            running,
            daily_time: format!(
                "{:02}:{:02}",
                self.config.daily_monitoring_hour, self.config.daily_monitoring_minute
            ),
            timezone: self.config.timezone.clone(),
            next_fire_time: Some(self.next_fire_after(Utc::now())),
            misfire_grace_seconds: self.config.misfire_grace_seconds,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    /// Run the pipeline under the single-instance guard. A trigger that
    /// arrives while a run is in flight is rejected, never queued.
    pub async fn execute_guarded(&self) -> Result<PipelineReport, SchedulerError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            return Err(SchedulerError::Busy);
        };
        let report = self.pipeline.execute(self.cancel.child_token()).await?;
        Ok(report)
    }

    /// The scheduler loop. Sleeps until the next fire time, applies the
    /// misfire grace on wake, and coalesces missed triggers by always
    /// scheduling from the current instant.
    pub async fn run_loop(self: Arc<Self>) {
        loop {
            let scheduled = self.next_fire_after(Utc::now());
            let wait = (scheduled - Utc::now())
                .to_std()
                .unwrap_or_else(|_| Duration::from_secs(0));
            info!(
                next_fire = %scheduled,
                wait_seconds = wait.as_secs(),
                "scheduler sleeping until next daily run"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("scheduler loop stopped");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }

            let now = Utc::now();
            if !misfire_decision(
                scheduled,
                now,
                Duration::from_secs(self.config.misfire_grace_seconds),
            ) {
                warn!(
                    scheduled = %scheduled,
                    observed = %now,
                    "dropping misfired trigger outside grace window"
                );
                continue;
            }

            match self.execute_guarded().await {
                Ok(report) => info!(run_id = %report.run_id, "scheduled monitoring run finished"),
                Err(SchedulerError::Busy) => {
                    warn!("scheduled trigger skipped: run already in progress")
                }
                Err(err) => error!(error = %err, "scheduled monitoring run failed"),
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorConfig, FanOutCollector};
    use crate::run_log::RunLogger;
    use pelorus_core::{AlertManager, SlaAnalyzer, SlaParameters};
    use pelorus_store::MonitorStore;

    async fn scheduler(hour: u32, minute: u32, tz: &str) -> (tempfile::TempDir, DailyScheduler) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        let pipeline = Arc::new(MonitorPipeline::new(
            FanOutCollector::new(vec![], CollectorConfig::default()),
            SlaAnalyzer::new(SlaParameters::default(), store.clone()),
            AlertManager::new(SlaParameters::default(), store.clone()),
            RunLogger::new(store.clone()),
            None,
        ));
        let config = SchedulingConfig {
            daily_monitoring_hour: hour,
            daily_monitoring_minute: minute,
            timezone: tz.to_string(),
            misfire_grace_seconds: 3600,
        };
        (dir, DailyScheduler::new(config, pipeline).unwrap())
    }

    #[tokio::test]
    async fn unknown_timezone_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        let pipeline = Arc::new(MonitorPipeline::new(
            FanOutCollector::new(vec![], CollectorConfig::default()),
            SlaAnalyzer::new(SlaParameters::default(), store.clone()),
            AlertManager::new(SlaParameters::default(), store.clone()),
            RunLogger::new(store.clone()),
            None,
        ));
        let config = SchedulingConfig {
            timezone: "Atlantis/Lemuria".to_string(),
            ..SchedulingConfig::default()
        };
        assert!(matches!(
            DailyScheduler::new(config, pipeline),
            Err(SchedulerError::UnknownTimezone(_))
        ));
    }

    #[tokio::test]
    async fn next_fire_is_today_when_still_ahead() {
        let (_dir, scheduler) = scheduler(6, 30, "UTC").await;
        let after = Utc.with_ymd_and_hms(2026, 7, 1, 5, 0, 0).unwrap();
        let next = scheduler.next_fire_after(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 1, 6, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn next_fire_rolls_to_tomorrow_when_passed() {
        let (_dir, scheduler) = scheduler(6, 30, "UTC").await;
        let after = Utc.with_ymd_and_hms(2026, 7, 1, 6, 30, 0).unwrap();
        let next = scheduler.next_fire_after(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 2, 6, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn next_fire_respects_the_zone_offset() {
        let (_dir, scheduler) = scheduler(6, 0, "Europe/Oslo").await;
        // July: Oslo is UTC+2, so 06:00 local is 04:00Z.
        let after = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let next = scheduler.next_fire_after(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 1, 4, 0, 0).unwrap());
    }

    #[test]
    fn misfire_within_grace_fires() {
        let scheduled = Utc.with_ymd_and_hms(2026, 7, 1, 6, 0, 0).unwrap();
        let now = scheduled + ChronoDuration::minutes(30);
        assert!(misfire_decision(scheduled, now, Duration::from_secs(3600)));
    }

    #[test]
    fn misfire_older_than_grace_is_dropped() {
        let scheduled = Utc.with_ymd_and_hms(2026, 7, 1, 6, 0, 0).unwrap();
        let now = scheduled + ChronoDuration::hours(2);
        assert!(!misfire_decision(scheduled, now, Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn manual_trigger_respects_single_instance_guard() {
        let (_dir, scheduler) = scheduler(6, 0, "UTC").await;
        let _held = scheduler.run_guard.clone().try_lock_owned().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.execute_guarded().await,
            Err(SchedulerError::Busy)
        ));
    }

    #[tokio::test]
    async fn empty_fleet_trigger_surfaces_pipeline_error() {
        let (_dir, scheduler) = scheduler(6, 0, "UTC").await;
        assert!(matches!(
            scheduler.execute_guarded().await,
            Err(SchedulerError::Pipeline(PipelineError::NoDataCollected))
        ));
        assert!(!scheduler.is_running());
    }
}

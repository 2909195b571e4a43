use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pelorus_core::rollup;
use pelorus_probe::{PingSource, ProbeError};
use pelorus_types::{ComponentKind, VesselMetrics, VesselQueryResult};

use crate::run_log::RunLogger;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Parallelism cap P: at most this many vessels are queried at once.
    pub parallelism: usize,
    /// Attempt rounds N, including the first.
    pub max_attempts: u32,
    /// Base backoff B between attempt rounds; round k sleeps B·2^(k-1).
    pub base_backoff: Duration,
    pub window_hours: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            window_hours: 24,
        }
    }
}

/// Final result of one fan-out pass over the fleet.
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    pub metrics: HashMap<String, VesselMetrics>,
    /// Vessels that never produced data (exhausted retries or failed
    /// permanently).
    pub failed: Vec<String>,
    /// Sum of vessels carried into attempts 2..N.
    pub retry_attempts: u32,
    pub cancelled: bool,
}

enum VesselOutcome {
    Collected(Box<VesselMetrics>),
    Failed { error: ProbeError },
    Cancelled,
}

/// Concurrent fan-out over the fleet with per-attempt retry rounds.
///
/// Tasks share nothing but the admission semaphore and the run logger's
/// append-only sink. The semaphore admits per attempt, so retries in round
/// k+1 are never starved by round k.
pub struct FanOutCollector {
    probes: HashMap<String, Arc<dyn PingSource>>,
    config: CollectorConfig,
}

impl FanOutCollector {
    pub fn new(probes: Vec<Arc<dyn PingSource>>, config: CollectorConfig) -> Self {
        let probes = probes
            .into_iter()
            .map(|p| (p.vessel_id().to_string(), p))
            .collect();
        Self { probes, config }
    }

    pub fn vessel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.probes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn vessel_count(&self) -> usize {
        self.probes.len()
    }

    /// Query one vessel: all three components, rolled up into metrics.
    async fn collect_vessel(
        probe: &Arc<dyn PingSource>,
        window_hours: u32,
    ) -> Result<VesselMetrics, ProbeError> {
        let vessel_id = probe.vessel_id().to_string();
        let now = Utc::now();

        let roll_up = |kind| async move {
            let data = probe.query_pings(kind, window_hours).await?;
            Ok::<_, ProbeError>(rollup::component_status(&data, now))
        };

        Ok(VesselMetrics {
            access_points: roll_up(ComponentKind::AccessPoint).await?,
            dashboards: roll_up(ComponentKind::Dashboard).await?,
            servers: roll_up(ComponentKind::Server).await?,
            vessel_id,
            timestamp: now,
        })
    }

    /// Run the fan-out. Per-vessel results are recorded at most once per
    /// attempt; a vessel's final success is recorded exactly once.
    pub async fn collect(
        &self,
        run_id: &str,
        run_logger: &RunLogger,
        cancel: CancellationToken,
    ) -> CollectionOutcome {
        let mut outcome = CollectionOutcome::default();
        let mut working: Vec<String> = self.vessel_ids();
        let total_vessels = working.len();

        'attempts: for attempt in 1..=self.config.max_attempts {
            if working.is_empty() {
                break;
            }
            info!(
                attempt,
                max_attempts = self.config.max_attempts,
                vessels = working.len(),
                "querying vessels"
            );

            let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
            let mut tasks = Vec::with_capacity(working.len());

            for vessel_id in &working {
                let Some(probe) = self.probes.get(vessel_id).cloned() else {
                    continue;
                };
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let window_hours = self.config.window_hours;
                let vessel_id = vessel_id.clone();

                tasks.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return (vessel_id, VesselOutcome::Cancelled, 0.0);
                    };
                    let started = std::time::Instant::now();
                    let result = tokio::select! {
                        () = cancel.cancelled() => VesselOutcome::Cancelled,
                        collected = Self::collect_vessel(&probe, window_hours) => {
                            match collected {
                                Ok(metrics) => VesselOutcome::Collected(Box::new(metrics)),
                                Err(error) => VesselOutcome::Failed { error },
                            }
                        }
                    };
                    (vessel_id, result, started.elapsed().as_secs_f64())
                }));
            }

            let mut retry_next = Vec::new();

            for task in tasks {
                let Ok((vessel_id, vessel_outcome, duration)) = task.await else {
                    warn!("vessel collection task panicked");
                    continue;
                };

                match vessel_outcome {
                    VesselOutcome::Collected(metrics) => {
                        run_logger
                            .log_vessel_result(
                                run_id,
                                &VesselQueryResult {
                                    vessel_id: vessel_id.clone(),
                                    attempt_number: attempt,
                                    success: true,
                                    duration_seconds: duration,
                                    error_message: None,
                                    timestamp: Utc::now(),
                                },
                                total_vessels,
                            )
                            .await;
                        debug!(vessel = %vessel_id, attempt, "vessel collected");
                        outcome.metrics.insert(vessel_id, *metrics);
                    }
                    VesselOutcome::Failed { error } => {
                        run_logger
                            .log_vessel_result(
                                run_id,
                                &VesselQueryResult {
                                    vessel_id: vessel_id.clone(),
                                    attempt_number: attempt,
                                    success: false,
                                    duration_seconds: duration,
                                    error_message: Some(error.to_string()),
                                    timestamp: Utc::now(),
                                },
                                total_vessels,
                            )
                            .await;

                        if error.is_retryable() && attempt < self.config.max_attempts {
                            warn!(vessel = %vessel_id, attempt, error = %error, "vessel query failed, will retry");
                            retry_next.push(vessel_id);
                        } else {
                            if error.is_retryable() {
                                warn!(vessel = %vessel_id, attempt, error = %error, "retries exhausted");
                            } else {
                                warn!(vessel = %vessel_id, attempt, error = %error, "permanent failure, not retrying");
                            }
                            outcome.failed.push(vessel_id);
                        }
                    }
                    VesselOutcome::Cancelled => {
                        outcome.cancelled = true;
                        outcome.failed.push(vessel_id);
                    }
                }
            }

            if outcome.cancelled {
                // Partial results already written are retained.
                working.clear();
                break 'attempts;
            }

            working = retry_next;

            if !working.is_empty() && attempt < self.config.max_attempts {
                outcome.retry_attempts += working.len() as u32;
                let backoff = self.config.base_backoff * 2u32.pow(attempt - 1);
                info!(
                    delay_ms = backoff.as_millis() as u64,
                    vessels = working.len(),
                    next_attempt = attempt + 1,
                    "backing off before retry round"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        outcome.failed.sort();
        outcome.failed.dedup();

        info!(
            successful = outcome.metrics.len(),
            failed = outcome.failed.len(),
            retry_attempts = outcome.retry_attempts,
            cancelled = outcome.cancelled,
            "fan-out collection finished"
        );
        outcome
    }

    /// Fan out connection tests under the same admission cap.
    pub async fn test_connections(&self) -> HashMap<String, bool> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut tasks = Vec::new();

        for probe in self.probes.values().cloned() {
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (probe.vessel_id().to_string(), false);
                };
                let ok = probe.test_connection().await;
                (probe.vessel_id().to_string(), ok)
            }));
        }

        let mut results = HashMap::new();
        for task in tasks {
            if let Ok((vessel_id, ok)) = task.await {
                results.insert(vessel_id, ok);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pelorus_probe::PingData;
    use pelorus_store::MonitorStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted probe: each query consumes the next outcome in its list.
    struct FakeProbe {
        vessel_id: String,
        // One entry per attempt; when exhausted, succeed.
        failures: Vec<Option<ProbeError>>,
        calls: AtomicU32,
    }

    impl FakeProbe {
        fn always_ok(vessel_id: &str) -> Self {
            Self {
                vessel_id: vessel_id.into(),
                failures: vec![],
                calls: AtomicU32::new(0),
            }
        }

        fn failing(vessel_id: &str, failures: Vec<Option<ProbeError>>) -> Self {
            Self {
                vessel_id: vessel_id.into(),
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PingSource for FakeProbe {
        fn vessel_id(&self) -> &str {
            &self.vessel_id
        }

        async fn query_pings(
            &self,
            kind: ComponentKind,
            _window_hours: u32,
        ) -> Result<PingData, ProbeError> {
            // Count one "attempt" per access-point query (first component).
            let call = if kind == ComponentKind::AccessPoint {
                self.calls.fetch_add(1, Ordering::SeqCst) as usize
            } else {
                self.calls.load(Ordering::SeqCst).saturating_sub(1) as usize
            };
            match self.failures.get(call) {
                Some(Some(err)) => Err(clone_error(err)),
                _ => Ok(PingData::empty(self.vessel_id.clone(), kind, vec![])),
            }
        }

        async fn test_connection(&self) -> bool {
            true
        }
    }

    fn clone_error(err: &ProbeError) -> ProbeError {
        match err {
            ProbeError::Timeout {
                timeout_seconds,
                detail,
            } => ProbeError::Timeout {
                timeout_seconds: *timeout_seconds,
                detail: detail.clone(),
            },
            ProbeError::Connection(msg) => ProbeError::Connection(msg.clone()),
            ProbeError::Auth(msg) => ProbeError::Auth(msg.clone()),
            ProbeError::Config(msg) => ProbeError::Config(msg.clone()),
            ProbeError::Http { status, body } => ProbeError::Http {
                status: *status,
                body: body.clone(),
            },
        }
    }

    fn timeout() -> Option<ProbeError> {
        Some(ProbeError::Timeout {
            timeout_seconds: 30,
            detail: "deadline elapsed".into(),
        })
    }

    async fn harness() -> (tempfile::TempDir, Arc<MonitorStore>, RunLogger) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        let logger = RunLogger::new(store.clone());
        (dir, store, logger)
    }

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            parallelism: 10,
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            window_hours: 24,
        }
    }

    #[tokio::test]
    async fn all_vessels_succeed_on_first_attempt() {
        let (_dir, _store, logger) = harness().await;
        let collector = FanOutCollector::new(
            vec![
                Arc::new(FakeProbe::always_ok("mv-aurora")),
                Arc::new(FakeProbe::always_ok("mv-borealis")),
            ],
            fast_config(),
        );

        let run = pelorus_types::SchedulerRun::begin(2);
        logger.log_run_start(&run).await.unwrap();
        let outcome = collector
            .collect(&run.run_id, &logger, CancellationToken::new())
            .await;

        assert_eq!(outcome.metrics.len(), 2);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.retry_attempts, 0);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn retry_exhaustion_counts_and_records_attempts() {
        let (_dir, store, logger) = harness().await;
        // Vessel B times out on all three attempts; A and C succeed at once.
        let collector = FanOutCollector::new(
            vec![
                Arc::new(FakeProbe::always_ok("mv-aurora")),
                Arc::new(FakeProbe::failing(
                    "mv-borealis",
                    vec![timeout(), timeout(), timeout()],
                )),
                Arc::new(FakeProbe::always_ok("mv-caspian")),
            ],
            fast_config(),
        );

        let mut run = pelorus_types::SchedulerRun::begin(3);
        logger.log_run_start(&run).await.unwrap();
        let outcome = collector
            .collect(&run.run_id, &logger, CancellationToken::new())
            .await;

        assert_eq!(outcome.metrics.len(), 2);
        assert_eq!(outcome.failed, vec!["mv-borealis".to_string()]);
        assert_eq!(outcome.retry_attempts, 2, "carried into attempts 2 and 3");

        run.complete(
            outcome.metrics.len() as u32,
            outcome.failed.len() as u32,
            outcome.retry_attempts,
        );
        logger.log_run_completion(&run).await.unwrap();

        let details = store.run_details(&run.run_id).await.unwrap().unwrap();
        assert_eq!(details.run.status, pelorus_types::RunStatus::Failed);
        assert_eq!(details.run.successful_vessels, 2);
        assert_eq!(details.run.failed_vessels, 1);

        let borealis = details.results_for("mv-borealis");
        assert_eq!(borealis.len(), 3, "one record per attempt");
        assert!(borealis.iter().all(|r| !r.success));
        let attempts: Vec<u32> = borealis.iter().map(|r| r.attempt_number).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn non_retryable_failure_stops_after_one_attempt() {
        let (_dir, store, logger) = harness().await;
        let collector = FanOutCollector::new(
            vec![Arc::new(FakeProbe::failing(
                "mv-zephyr",
                vec![Some(ProbeError::Auth("HTTP 401: bad token".into()))],
            ))],
            fast_config(),
        );

        let run = pelorus_types::SchedulerRun::begin(1);
        logger.log_run_start(&run).await.unwrap();
        let outcome = collector
            .collect(&run.run_id, &logger, CancellationToken::new())
            .await;

        assert!(outcome.metrics.is_empty());
        assert_eq!(outcome.failed, vec!["mv-zephyr".to_string()]);
        assert_eq!(outcome.retry_attempts, 0);

        let details = store.run_details(&run.run_id).await.unwrap().unwrap();
        let results = details.results_for("mv-zephyr");
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error_message.as_deref().unwrap().contains("authentication"));
    }

    #[tokio::test]
    async fn vessel_recovers_on_second_attempt() {
        let (_dir, store, logger) = harness().await;
        let collector = FanOutCollector::new(
            vec![Arc::new(FakeProbe::failing("mv-aurora", vec![timeout(), None]))],
            fast_config(),
        );

        let run = pelorus_types::SchedulerRun::begin(1);
        logger.log_run_start(&run).await.unwrap();
        let outcome = collector
            .collect(&run.run_id, &logger, CancellationToken::new())
            .await;

        assert_eq!(outcome.metrics.len(), 1);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.retry_attempts, 1);

        let details = store.run_details(&run.run_id).await.unwrap().unwrap();
        let results = details.results_for("mv-aurora");
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success, "final success recorded exactly once");
    }

    #[tokio::test]
    async fn cancellation_marks_remaining_vessels_failed() {
        let (_dir, _store, logger) = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let collector = FanOutCollector::new(
            vec![Arc::new(FakeProbe::always_ok("mv-aurora"))],
            fast_config(),
        );

        let run = pelorus_types::SchedulerRun::begin(1);
        logger.log_run_start(&run).await.unwrap();
        let outcome = collector.collect(&run.run_id, &logger, cancel).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.failed, vec!["mv-aurora".to_string()]);
    }

    #[tokio::test]
    async fn connection_tests_fan_out() {
        let (_dir, _store, _logger) = harness().await;
        let collector = FanOutCollector::new(
            vec![
                Arc::new(FakeProbe::always_ok("mv-aurora")),
                Arc::new(FakeProbe::always_ok("mv-borealis")),
            ],
            fast_config(),
        );
        let results = collector.test_connections().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|ok| *ok));
    }
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info};

use pelorus_store::{MonitorStore, StoreResult};
use pelorus_types::{SchedulerRun, VesselQueryResult};

/// Progress events published to dashboard subscribers while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        total_vessels: u32,
    },
    VesselQueried {
        run_id: String,
        vessel_id: String,
        attempt: u32,
        success: bool,
        total_vessels: usize,
    },
    RunFinished {
        run_id: String,
        status: String,
        successful_vessels: u32,
        failed_vessels: u32,
        retry_attempts: u32,
    },
}

/// Persists run outcomes and per-vessel attempts, and fans progress out to
/// any number of dashboard listeners. The store write is the source of
/// truth; a full event channel only drops notifications.
#[derive(Clone)]
pub struct RunLogger {
    store: Arc<MonitorStore>,
    events: broadcast::Sender<RunEvent>,
}

impl RunLogger {
    pub fn new(store: Arc<MonitorStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<MonitorStore> {
        &self.store
    }

    pub async fn log_run_start(&self, run: &SchedulerRun) -> StoreResult<()> {
        self.store.insert_run(run).await?;
        info!(run_id = %run.run_id, total_vessels = run.total_vessels, "scheduler run started");
        let _ = self.events.send(RunEvent::RunStarted {
            run_id: run.run_id.clone(),
            total_vessels: run.total_vessels,
        });
        Ok(())
    }

    /// Append one attempt record. Persistence failures are logged, not
    /// propagated: an unlogged attempt must not fail the vessel query.
    pub async fn log_vessel_result(
        &self,
        run_id: &str,
        result: &VesselQueryResult,
        total_vessels: usize,
    ) {
        if let Err(err) = self.store.insert_vessel_result(run_id, result).await {
            error!(
                run_id,
                vessel = %result.vessel_id,
                error = %err,
                "failed to persist vessel query result"
            );
        }
        let _ = self.events.send(RunEvent::VesselQueried {
            run_id: run_id.to_string(),
            vessel_id: result.vessel_id.clone(),
            attempt: result.attempt_number,
            success: result.success,
            total_vessels,
        });
    }

    pub async fn log_run_completion(&self, run: &SchedulerRun) -> StoreResult<()> {
        self.store.update_run(run).await?;
        info!(
            run_id = %run.run_id,
            status = run.status.as_str(),
            successful = run.successful_vessels,
            failed = run.failed_vessels,
            retries = run.retry_attempts,
            "scheduler run finished"
        );
        let _ = self.events.send(RunEvent::RunFinished {
            run_id: run.run_id.clone(),
            status: run.status.as_str().to_string(),
            successful_vessels: run.successful_vessels,
            failed_vessels: run.failed_vessels,
            retry_attempts: run.retry_attempts,
        });
        Ok(())
    }
}

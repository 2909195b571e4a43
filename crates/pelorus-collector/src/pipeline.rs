use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pelorus_core::{rollup, AlertManager, SlaAnalyzer};
use pelorus_types::{Alert, SchedulerRun, VesselMetrics};

use crate::collector::FanOutCollector;
use crate::run_log::RunLogger;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no vessel data collected after retry attempts")]
    NoDataCollected,

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Seam to the ticket workflow so the pipeline does not depend on the
/// tracker/chat stack. Implemented by `pelorus-tickets`.
#[async_trait]
pub trait TicketEscalator: Send + Sync {
    /// Attempt to escalate each persistent-downtime alert into a tracker
    /// ticket. Returns how many tickets were created.
    async fn escalate(&self, alerts: &[Alert]) -> usize;
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub run_status: String,
    pub successful_vessels: usize,
    pub failed_vessels: usize,
    pub retry_attempts: u32,
    pub sla_violations: usize,
    pub alerts_created: usize,
    pub persistent_downtime_alerts: usize,
    pub tickets_created: usize,
}

/// The daily monitoring workflow: fan-out collection, persistence, SLA
/// analysis, alerting and ticket escalation, with the run recorded from
/// open to close.
pub struct MonitorPipeline {
    collector: FanOutCollector,
    analyzer: SlaAnalyzer,
    alerts: AlertManager,
    run_logger: RunLogger,
    escalator: Option<Arc<dyn TicketEscalator>>,
}

impl MonitorPipeline {
    pub fn new(
        collector: FanOutCollector,
        analyzer: SlaAnalyzer,
        alerts: AlertManager,
        run_logger: RunLogger,
        escalator: Option<Arc<dyn TicketEscalator>>,
    ) -> Self {
        Self {
            collector,
            analyzer,
            alerts,
            run_logger,
            escalator,
        }
    }

    pub fn run_logger(&self) -> &RunLogger {
        &self.run_logger
    }

    pub fn collector(&self) -> &FanOutCollector {
        &self.collector
    }

    /// Rebuild in-memory indexes from the store after a restart.
    pub async fn restore_state(&self) -> anyhow::Result<()> {
        self.analyzer.restore_violation_cache().await?;
        self.alerts.restore_open_alerts().await?;
        Ok(())
    }

    /// One complete monitoring run. Per-vessel failures never abort the
    /// run; only zero collected vessels (or cancellation) does.
    pub async fn execute(&self, cancel: CancellationToken) -> Result<PipelineReport, PipelineError> {
        let mut run = SchedulerRun::begin(self.collector.vessel_count() as u32);
        self.run_logger
            .log_run_start(&run)
            .await
            .map_err(anyhow::Error::from)?;

        let outcome = self
            .collector
            .collect(&run.run_id, &self.run_logger, cancel)
            .await;

        if outcome.cancelled {
            run.fail("cancelled");
            let _ = self.run_logger.log_run_completion(&run).await;
            return Err(PipelineError::Cancelled);
        }

        if outcome.metrics.is_empty() {
            run.fail("no vessel data collected after retry attempts");
            let _ = self.run_logger.log_run_completion(&run).await;
            return Err(PipelineError::NoDataCollected);
        }

        run.complete(
            outcome.metrics.len() as u32,
            outcome.failed.len() as u32,
            outcome.retry_attempts,
        );
        self.run_logger
            .log_run_completion(&run)
            .await
            .map_err(anyhow::Error::from)?;

        if !outcome.failed.is_empty() {
            warn!(
                failed = ?outcome.failed,
                "proceeding with partial fleet data"
            );
        }

        // Component history first, then violations, then alerts/tickets.
        let statuses = self.analyzer.analyze_fleet_with_tracking(&outcome.metrics).await;
        let sla_violations = statuses
            .values()
            .flat_map(|s| s.values())
            .filter(|s| !s.is_compliant)
            .count();

        let created = self
            .alerts
            .process_sla_statuses(&statuses)
            .await
            .map_err(PipelineError::Internal)?;

        let metrics_refs: Vec<&VesselMetrics> = outcome.metrics.values().collect();
        let persistent = self
            .alerts
            .monitor_persistent_downtime(&metrics_refs)
            .await
            .map_err(PipelineError::Internal)?;

        let tickets_created = match (&self.escalator, persistent.is_empty()) {
            (Some(escalator), false) => escalator.escalate(&persistent).await,
            _ => 0,
        };

        let maintenance = self
            .alerts
            .maintain_alert_status(&statuses)
            .await
            .map_err(PipelineError::Internal)?;

        let report = PipelineReport {
            run_id: run.run_id.clone(),
            run_status: run.status.as_str().to_string(),
            successful_vessels: outcome.metrics.len(),
            failed_vessels: outcome.failed.len(),
            retry_attempts: outcome.retry_attempts,
            sla_violations,
            alerts_created: created.len(),
            persistent_downtime_alerts: persistent.len(),
            tickets_created,
        };

        // Recovery checkpoint plus fleet summaries for the dashboard.
        let fleet = rollup::fleet_summary(
            &metrics_refs,
            self.analyzer.params().uptime_threshold_percentage,
        );
        let sla_summary = self.analyzer.fleet_summary(&statuses);
        if let Err(err) = self
            .run_logger
            .store()
            .set_system_state(
                "last_monitoring_run",
                &json!({
                    "run_id": report.run_id,
                    "status": report.run_status,
                    "successful_vessels": report.successful_vessels,
                    "failed_vessels": report.failed_vessels,
                    "sla_violations": report.sla_violations,
                    "tickets_created": report.tickets_created,
                    "fleet_summary": fleet,
                    "sla_summary": sla_summary,
                }),
                "json",
            )
            .await
        {
            error!(error = %err, "failed to checkpoint monitoring run");
        }

        info!(
            run_id = %report.run_id,
            sla_violations = report.sla_violations,
            alerts = report.alerts_created,
            persistent = report.persistent_downtime_alerts,
            tickets = report.tickets_created,
            resolved_alerts = maintenance.resolved,
            "monitoring pipeline finished"
        );

        Ok(report)
    }
}

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One execution of the fan-out collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerRun {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_vessels: u32,
    pub successful_vessels: u32,
    pub failed_vessels: u32,
    pub retry_attempts: u32,
    pub status: RunStatus,
    pub duration_seconds: Option<i64>,
    pub error_message: Option<String>,
}

impl SchedulerRun {
    pub fn begin(total_vessels: u32) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
            total_vessels,
            successful_vessels: 0,
            failed_vessels: 0,
            retry_attempts: 0,
            status: RunStatus::Running,
            duration_seconds: None,
            error_message: None,
        }
    }

    /// Close the run with final counts. A run with any failed vessel is
    /// recorded as failed.
    pub fn complete(&mut self, successful: u32, failed: u32, retry_attempts: u32) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.successful_vessels = successful;
        self.failed_vessels = failed;
        self.retry_attempts = retry_attempts;
        self.status = if failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.duration_seconds = Some((end - self.start_time).num_seconds());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.status = RunStatus::Failed;
        self.error_message = Some(error.into());
        self.duration_seconds = Some((end - self.start_time).num_seconds());
    }
}

/// Outcome of one query attempt against one vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselQueryResult {
    pub vessel_id: String,
    pub attempt_number: u32,
    pub success: bool,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A run together with its per-vessel attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerRunDetails {
    pub run: SchedulerRun,
    pub vessel_results: Vec<VesselQueryResult>,
    /// vessel_id -> number of extra attempts beyond the first.
    pub retry_summary: HashMap<String, u32>,
}

impl SchedulerRunDetails {
    pub fn results_for(&self, vessel_id: &str) -> Vec<&VesselQueryResult> {
        self.vessel_results
            .iter()
            .filter(|r| r.vessel_id == vessel_id)
            .collect()
    }

    /// Vessels that failed at least once and never succeeded.
    pub fn failed_vessels(&self) -> Vec<String> {
        let mut succeeded = HashSet::new();
        let mut failed = HashSet::new();
        for result in &self.vessel_results {
            if result.success {
                succeeded.insert(result.vessel_id.clone());
            } else {
                failed.insert(result.vessel_id.clone());
            }
        }
        let mut out: Vec<String> = failed.difference(&succeeded).cloned().collect();
        out.sort();
        out
    }

    pub fn retry_statistics(&self) -> RetryStatistics {
        let total: u32 = self.retry_summary.values().sum();
        let vessels_with_retries = self.retry_summary.values().filter(|c| **c > 0).count() as u32;
        let max_for_vessel = self.retry_summary.values().copied().max().unwrap_or(0);
        let average = if self.retry_summary.is_empty() {
            0.0
        } else {
            f64::from(total) / self.retry_summary.len() as f64
        };
        RetryStatistics {
            total_retry_attempts: total,
            vessels_requiring_retries: vessels_with_retries,
            average_retries_per_vessel: average,
            max_retries_for_vessel: max_for_vessel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStatistics {
    pub total_retry_attempts: u32,
    pub vessels_requiring_retries: u32,
    pub average_retries_per_vessel: f64,
    pub max_retries_for_vessel: u32,
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use pelorus_types::{ApprovalRequest, ApprovalState, IssueSummary};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request `{0}` not found")]
    RequestNotFound(String),

    #[error("approval request `{0}` was already decided")]
    AlreadyDecided(String),

    #[error("too many pending approval requests ({0})")]
    CapacityExceeded(usize),
}

#[derive(Debug, Clone)]
pub struct ApprovalSettings {
    pub default_timeout_minutes: u32,
    pub max_pending_requests: usize,
    pub auto_cleanup_hours: u32,
    /// Fallback poll cadence for waiters; the webhook signal is primary.
    pub poll_interval: Duration,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 60,
            max_pending_requests: 100,
            auto_cleanup_hours: 24,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// A recorded terminal decision, kept for audit and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub request_id: String,
    pub state: ApprovalState,
    pub approver: String,
    pub decided_at: DateTime<Utc>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalStatistics {
    pub total_requests: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub average_response_minutes: f64,
    pub oldest_pending_minutes: Option<f64>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, ApprovalRequest>,
    completed: HashMap<String, ApprovalRequest>,
    decisions: HashMap<String, Decision>,
}

/// Human approval gate for ticket creation.
///
/// Requests transition out of Pending exactly once; the decision path is
/// serialized behind one lock so concurrent webhook callbacks cannot both
/// land a terminal state. Waiters are woken by `Notify` when a decision
/// arrives and otherwise poll on a slow fallback tick that also enforces
/// timeouts.
pub struct ApprovalWorkflow {
    settings: ApprovalSettings,
    state: Mutex<State>,
    decided: Arc<Notify>,
}

impl ApprovalWorkflow {
    pub fn new(settings: ApprovalSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State::default()),
            decided: Arc::new(Notify::new()),
        }
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    pub async fn submit(&self, issue: IssueSummary) -> Result<ApprovalRequest, ApprovalError> {
        let mut state = self.state.lock().await;
        if state.pending.len() >= self.settings.max_pending_requests {
            return Err(ApprovalError::CapacityExceeded(state.pending.len()));
        }

        let request = ApprovalRequest::pending(uuid::Uuid::new_v4().to_string(), issue);
        state
            .pending
            .insert(request.request_id.clone(), request.clone());

        info!(
            target: "pelorus.audit",
            event = "approval_request_submitted",
            request_id = %request.request_id,
            vessel = %request.issue.vessel_id,
            kind = request.issue.kind.as_str(),
            severity = request.issue.severity.as_str(),
            "approval request submitted"
        );
        Ok(request)
    }

    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        let state = self.state.lock().await;
        state
            .pending
            .get(request_id)
            .or_else(|| state.completed.get(request_id))
            .cloned()
    }

    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let state = self.state.lock().await;
        let mut out: Vec<ApprovalRequest> = state.pending.values().cloned().collect();
        out.sort_by_key(|r| r.requested_at);
        out
    }

    /// Land a human decision. Only Pending requests accept one; a second
    /// response fails with `AlreadyDecided`.
    pub async fn decide(
        &self,
        request_id: &str,
        approved: bool,
        approver: &str,
        comments: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut state = self.state.lock().await;

        let Some(mut request) = state.pending.remove(request_id) else {
            if state.completed.contains_key(request_id) {
                return Err(ApprovalError::AlreadyDecided(request_id.to_string()));
            }
            return Err(ApprovalError::RequestNotFound(request_id.to_string()));
        };

        request.state = if approved {
            ApprovalState::Approved
        } else {
            ApprovalState::Rejected
        };
        request.responded_at = Some(Utc::now());
        request.approver = Some(approver.to_string());
        request.comments = comments.clone();

        state.decisions.insert(
            request_id.to_string(),
            Decision {
                request_id: request_id.to_string(),
                state: request.state,
                approver: approver.to_string(),
                decided_at: Utc::now(),
                comments,
            },
        );
        state
            .completed
            .insert(request_id.to_string(), request.clone());
        drop(state);

        info!(
            target: "pelorus.audit",
            event = "approval_decision",
            request_id,
            decision = request.state.as_str(),
            approver,
            "approval decision landed"
        );
        self.decided.notify_waiters();
        Ok(request)
    }

    /// Time out pending requests older than the configured window.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let timeout = ChronoDuration::minutes(i64::from(self.settings.default_timeout_minutes));
        let now = Utc::now();
        let mut timed_out = Vec::new();

        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, r)| now - r.requested_at > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for request_id in expired {
            if let Some(mut request) = state.pending.remove(&request_id) {
                request.state = ApprovalState::Timeout;
                request.responded_at = Some(now);
                state.decisions.insert(
                    request_id.clone(),
                    Decision {
                        request_id: request_id.clone(),
                        state: ApprovalState::Timeout,
                        approver: "system".to_string(),
                        decided_at: now,
                        comments: Some("request timed out without response".to_string()),
                    },
                );
                state.completed.insert(request_id.clone(), request);
                timed_out.push(request_id);
            }
        }
        drop(state);

        if !timed_out.is_empty() {
            warn!(
                target: "pelorus.audit",
                event = "approval_timeout",
                count = timed_out.len(),
                "approval requests timed out"
            );
            self.decided.notify_waiters();
        }
        timed_out
    }

    /// Block until the request reaches a terminal state. Event-driven via
    /// the decision notifier; the poll tick is a fallback that also runs
    /// the timeout sweep so a silent operator still terminates the wait.
    pub async fn wait_for_decision(
        &self,
        request_id: &str,
    ) -> Result<ApprovalState, ApprovalError> {
        loop {
            match self.get(request_id).await {
                None => return Err(ApprovalError::RequestNotFound(request_id.to_string())),
                Some(request) if request.state.is_terminal() => return Ok(request.state),
                Some(_) => {}
            }

            let notified = self.decided.notified();
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(self.settings.poll_interval) => {
                    self.check_timeouts().await;
                }
            }
        }
    }

    /// Periodic sweep: expire overdue pendings, drop stale completed ones.
    pub async fn cleanup_expired(&self) -> usize {
        self.check_timeouts().await;
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(self.settings.auto_cleanup_hours));

        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .completed
            .iter()
            .filter(|(_, r)| r.requested_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.completed.remove(id);
            state.decisions.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up old approval requests");
        }
        stale.len()
    }

    pub async fn statistics(&self) -> ApprovalStatistics {
        let state = self.state.lock().await;

        let mut approved = 0;
        let mut rejected = 0;
        let mut timed_out = 0;
        for decision in state.decisions.values() {
            match decision.state {
                ApprovalState::Approved => approved += 1,
                ApprovalState::Rejected => rejected += 1,
                ApprovalState::Timeout => timed_out += 1,
                ApprovalState::Pending => {}
            }
        }

        let response_minutes: Vec<f64> = state
            .completed
            .values()
            .filter(|r| r.state != ApprovalState::Timeout)
            .filter_map(|r| {
                r.responded_at
                    .map(|at| (at - r.requested_at).num_seconds() as f64 / 60.0)
            })
            .collect();
        let average_response_minutes = if response_minutes.is_empty() {
            0.0
        } else {
            response_minutes.iter().sum::<f64>() / response_minutes.len() as f64
        };

        let oldest_pending_minutes = state
            .pending
            .values()
            .map(|r| r.requested_at)
            .min()
            .map(|at| (Utc::now() - at).num_seconds() as f64 / 60.0);

        ApprovalStatistics {
            total_requests: state.pending.len() + state.completed.len(),
            pending: state.pending.len(),
            approved,
            rejected,
            timed_out,
            average_response_minutes,
            oldest_pending_minutes,
        }
    }

    /// Human-readable rendering for chat "details" replies and the console.
    pub fn format_request(request: &ApprovalRequest) -> String {
        let issue = &request.issue;
        format!(
            "APPROVAL REQUEST: {}\n\
             Vessel ID: {}\n\
             Component: {}\n\
             Severity: {}\n\
             Downtime Duration: {}\n\
             Requested: {}\n\n\
             {}\n\n\
             Status: {}",
            request.request_id,
            issue.vessel_id,
            issue.kind.display_name(),
            issue.severity.display_name(),
            pelorus_types::format_duration(issue.downtime_seconds),
            request.requested_at.format("%Y-%m-%d %H:%M:%S"),
            issue.description(),
            request.state.as_str().to_uppercase(),
        )
    }
}

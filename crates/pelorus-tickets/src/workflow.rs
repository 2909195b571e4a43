use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use pelorus_store::MonitorStore;
use pelorus_types::{
    Alert, ApprovalState, ComponentKind, IssueSeverity, IssueSummary, TicketLifecycle,
    TicketRecord, TrackerStatus, TrackerTicket,
};

use crate::approval::{ApprovalError, ApprovalWorkflow};
use crate::chat::ChatNotifier;
use crate::tracker::{TrackerClient, TrackerError};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("store error: {0}")]
    Store(#[from] pelorus_store::StoreError),
}

/// Duplicate-prevention rule over open ticket records.
#[derive(Debug, Clone)]
pub struct DuplicateRule {
    pub window_hours: u32,
    pub max_tickets_per_component: usize,
    pub allow_severity_escalation: bool,
}

impl Default for DuplicateRule {
    fn default() -> Self {
        Self {
            window_hours: 24,
            max_tickets_per_component: 3,
            allow_severity_escalation: true,
        }
    }
}

/// Downtime-to-issue-severity ladder for tracker tickets.
#[derive(Debug, Clone)]
pub struct SeverityLadder {
    pub critical_after_days: f64,
    pub high_after_days: f64,
}

impl Default for SeverityLadder {
    fn default() -> Self {
        Self {
            critical_after_days: 7.0,
            high_after_days: 3.0,
        }
    }
}

impl SeverityLadder {
    pub fn severity_for_downtime(&self, downtime_seconds: i64) -> IssueSeverity {
        let days = downtime_seconds as f64 / 86_400.0;
        if days >= self.critical_after_days {
            IssueSeverity::Critical
        } else if days >= self.high_after_days {
            IssueSeverity::High
        } else {
            IssueSeverity::Medium
        }
    }
}

/// Notification urgency for the chat message, from severity and age.
fn notification_priority(issue: &IssueSummary) -> &'static str {
    let days = issue.downtime_seconds as f64 / 86_400.0;
    if issue.severity == IssueSeverity::Critical || days >= 7.0 {
        "urgent"
    } else if issue.severity == IssueSeverity::High || days >= 5.0 {
        "high"
    } else if days >= 3.0 {
        "normal"
    } else {
        "low"
    }
}

/// The approval-gated ticket workflow: duplicate prevention, chat-notified
/// human approval, tracker creation, and lifecycle recording.
pub struct TicketWorkflow {
    tracker: TrackerClient,
    chat: Option<ChatNotifier>,
    approvals: Arc<ApprovalWorkflow>,
    store: Arc<MonitorStore>,
    rule: DuplicateRule,
    ladder: SeverityLadder,
}

impl TicketWorkflow {
    pub fn new(
        tracker: TrackerClient,
        chat: Option<ChatNotifier>,
        approvals: Arc<ApprovalWorkflow>,
        store: Arc<MonitorStore>,
        rule: DuplicateRule,
        ladder: SeverityLadder,
    ) -> Self {
        Self {
            tracker,
            chat,
            approvals,
            store,
            rule,
            ladder,
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalWorkflow> {
        &self.approvals
    }

    pub fn tracker(&self) -> &TrackerClient {
        &self.tracker
    }

    /// Build the issue summary for a persistent-downtime alert.
    pub fn issue_from_alert(&self, alert: &Alert) -> IssueSummary {
        let downtime_seconds = (alert.downtime_hours() * 3600.0) as i64;
        IssueSummary {
            vessel_id: alert.vessel_id.clone(),
            kind: alert.kind,
            downtime_seconds,
            historical_context: alert.historical_context(),
            severity: self.ladder.severity_for_downtime(downtime_seconds),
        }
    }

    /// Apply the duplicate-prevention rule. A new ticket is rejected iff an
    /// open record exists in the window AND (the per-component cap is
    /// reached OR the offered severity does not strictly exceed every
    /// existing open ticket's).
    pub async fn check_duplicates(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
        offered: IssueSeverity,
    ) -> Result<(bool, Vec<TicketRecord>), WorkflowError> {
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(self.rule.window_hours));
        let existing = self
            .store
            .open_ticket_records_since(vessel_id, kind, cutoff)
            .await?;

        if existing.is_empty() {
            return Ok((false, existing));
        }

        if existing.len() >= self.rule.max_tickets_per_component {
            info!(
                vessel = vessel_id,
                kind = kind.as_str(),
                open = existing.len(),
                cap = self.rule.max_tickets_per_component,
                "ticket cap reached, suppressing"
            );
            return Ok((true, existing));
        }

        if self.rule.allow_severity_escalation {
            let max_existing = existing
                .iter()
                .map(|t| t.severity)
                .max()
                .unwrap_or(IssueSeverity::Low);
            if offered > max_existing {
                info!(
                    vessel = vessel_id,
                    kind = kind.as_str(),
                    offered = offered.as_str(),
                    existing = max_existing.as_str(),
                    "allowing ticket for severity escalation"
                );
                return Ok((false, existing));
            }
        }

        Ok((true, existing))
    }

    /// The full guarded path: check-existing → duplicate-rule → approval →
    /// create. Returns the created ticket, or None when suppressed,
    /// rejected or timed out.
    pub async fn create_ticket_with_approval(
        &self,
        issue: IssueSummary,
        alert_id: Option<i64>,
    ) -> Result<Option<TrackerTicket>, WorkflowError> {
        let (is_duplicate, existing) = self
            .check_duplicates(&issue.vessel_id, issue.kind, issue.severity)
            .await?;
        if is_duplicate {
            if let (Some(alert_id), Some(newest)) = (alert_id, existing.first()) {
                self.store
                    .link_alert_to_ticket(&newest.tracker_key, alert_id)
                    .await?;
                info!(
                    alert_id,
                    ticket = %newest.tracker_key,
                    "linked alert to existing open ticket"
                );
            }
            return Ok(None);
        }

        // With no local record to judge against, consult the tracker so
        // tickets opened outside this agent still suppress new ones.
        if existing.is_empty() {
            match self
                .tracker
                .search_open_tickets(&issue.vessel_id, issue.kind)
                .await
            {
                Ok(remote) if !remote.is_empty() => {
                    info!(
                        vessel = %issue.vessel_id,
                        kind = issue.kind.as_str(),
                        ticket = %remote[0].key,
                        "open tracker ticket already exists, suppressing"
                    );
                    return Ok(None);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        vessel = %issue.vessel_id,
                        error = %err,
                        "existing-ticket search failed, relying on local records"
                    );
                }
            }
        }

        let request = self.approvals.submit(issue.clone()).await?;
        self.notify(&request).await;

        let state = self.approvals.wait_for_decision(&request.request_id).await?;
        match state {
            ApprovalState::Approved => {}
            ApprovalState::Rejected => {
                info!(
                    target: "pelorus.audit",
                    event = "ticket_rejected",
                    request_id = %request.request_id,
                    vessel = %issue.vessel_id,
                    "ticket creation rejected by operator"
                );
                return Ok(None);
            }
            ApprovalState::Timeout => {
                warn!(
                    target: "pelorus.audit",
                    event = "ticket_approval_timeout",
                    request_id = %request.request_id,
                    vessel = %issue.vessel_id,
                    "ticket approval timed out"
                );
                return Ok(None);
            }
            ApprovalState::Pending => unreachable!("wait_for_decision returns terminal states"),
        }

        // The approval stays approved even if the tracker call fails; the
        // failure is checkpointed for operator retry, never re-prompted.
        let ticket = match self.tracker.create_issue(&issue).await {
            Ok(ticket) => ticket,
            Err(err) => {
                error!(
                    request_id = %request.request_id,
                    error = %err,
                    "tracker creation failed after approval"
                );
                let _ = self
                    .store
                    .set_system_state(
                        &format!("failed_ticket_creation:{}", request.request_id),
                        &json!({
                            "issue": issue,
                            "approved_request_id": request.request_id,
                            "error": err.to_string(),
                        }),
                        "json",
                    )
                    .await;
                return Err(err.into());
            }
        };

        self.record_created_ticket(&ticket, &issue, alert_id).await?;
        Ok(Some(ticket))
    }

    async fn record_created_ticket(
        &self,
        ticket: &TrackerTicket,
        issue: &IssueSummary,
        alert_id: Option<i64>,
    ) -> Result<(), WorkflowError> {
        let now = Utc::now();
        let record = TicketRecord {
            id: None,
            tracker_key: ticket.key.clone(),
            tracker_id: ticket.id.clone(),
            vessel_id: issue.vessel_id.clone(),
            kind: issue.kind,
            severity: issue.severity,
            lifecycle: TicketLifecycle::Created,
            created_at: now,
            updated_at: now,
            alert_ids: Vec::new(),
            downtime_seconds: issue.downtime_seconds,
            historical_context: issue.historical_context.clone(),
            resolution_notes: None,
        };
        self.store.insert_ticket_record(&record).await?;
        self.store
            .record_ticket(
                &ticket.key,
                &issue.vessel_id,
                issue.kind,
                &ticket.summary,
                ticket.status.display_name(),
                issue.downtime_seconds,
                alert_id,
            )
            .await?;

        if let Some(alert_id) = alert_id {
            self.store
                .link_alert_to_ticket(&ticket.key, alert_id)
                .await?;
        }
        Ok(())
    }

    /// Escalate persistent-downtime alerts into tickets. Returns how many
    /// were created; per-alert failures are isolated.
    pub async fn escalate_alerts(&self, alerts: &[Alert]) -> usize {
        let mut created = 0;

        for alert in alerts {
            let issue = self.issue_from_alert(alert);
            match self.create_ticket_with_approval(issue, alert.id).await {
                Ok(Some(ticket)) => {
                    created += 1;
                    if let Err(err) = self.mark_alert_ticketed(alert, &ticket.key).await {
                        warn!(error = %err, "failed to annotate alert with ticket");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(
                        vessel = %alert.vessel_id,
                        kind = alert.kind.as_str(),
                        error = %err,
                        "ticket escalation failed for alert"
                    );
                }
            }
        }

        created
    }

    async fn mark_alert_ticketed(&self, alert: &Alert, ticket_key: &str) -> anyhow::Result<()> {
        let Some(alert_id) = alert.id else {
            anyhow::bail!("alert has no id");
        };
        let mut metadata = alert.metadata.clone();
        if !metadata.is_object() {
            metadata = json!({});
        }
        metadata["ticket_created"] = json!(true);
        metadata["ticket_key"] = json!(ticket_key);
        self.store.update_alert_metadata(alert_id, metadata).await?;
        Ok(())
    }

    /// Mirror a tracker status change into the tracker and both local
    /// tables.
    pub async fn update_ticket_status(
        &self,
        ticket_key: &str,
        new_status: TrackerStatus,
        resolution_notes: Option<&str>,
    ) -> Result<(), WorkflowError> {
        self.tracker.transition(ticket_key, new_status).await?;
        let resolved_at = matches!(
            new_status,
            TrackerStatus::Resolved | TrackerStatus::Closed
        )
        .then(Utc::now);
        self.store
            .update_ticket_status(ticket_key, new_status.display_name(), resolved_at)
            .await?;
        self.store
            .update_ticket_lifecycle(ticket_key, new_status.lifecycle(), resolution_notes)
            .await?;
        Ok(())
    }

    async fn notify(&self, request: &pelorus_types::ApprovalRequest) {
        let priority = notification_priority(&request.issue);
        info!(
            request_id = %request.request_id,
            priority,
            "approval required: vessel {} {} down for {}",
            request.issue.vessel_id,
            request.issue.kind.display_name(),
            pelorus_types::format_duration(request.issue.downtime_seconds)
        );
        if let Some(chat) = &self.chat {
            if let Err(err) = chat.notify_approval_request(request, priority).await {
                error!(error = %err, "chat notification failed, approval pending in log only");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalSettings;
    use crate::tracker::TrackerConnection;
    use std::time::Duration;

    async fn workflow() -> (tempfile::TempDir, Arc<MonitorStore>, TicketWorkflow) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        let tracker = TrackerClient::new(TrackerConnection {
            url: "http://tracker.invalid".into(),
            username: "bot".into(),
            api_token: "token".into(),
            project_key: "INFRA".into(),
            issue_type: "Bug".into(),
        })
        .unwrap()
        .with_retry_base(Duration::from_millis(5));
        let approvals = Arc::new(ApprovalWorkflow::new(ApprovalSettings {
            poll_interval: Duration::from_millis(20),
            ..ApprovalSettings::default()
        }));
        let workflow = TicketWorkflow::new(
            tracker,
            None,
            approvals,
            store.clone(),
            DuplicateRule::default(),
            SeverityLadder::default(),
        );
        (dir, store, workflow)
    }

    fn record(key: &str, severity: IssueSeverity) -> TicketRecord {
        let now = Utc::now();
        TicketRecord {
            id: None,
            tracker_key: key.into(),
            tracker_id: "1".into(),
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Server,
            severity,
            lifecycle: TicketLifecycle::Created,
            created_at: now,
            updated_at: now,
            alert_ids: vec![],
            downtime_seconds: 4 * 86_400,
            historical_context: "ctx".into(),
            resolution_notes: None,
        }
    }

    #[test]
    fn downtime_ladder_assigns_severity_by_age() {
        let ladder = SeverityLadder::default();
        assert_eq!(
            ladder.severity_for_downtime(8 * 86_400),
            IssueSeverity::Critical
        );
        assert_eq!(ladder.severity_for_downtime(7 * 86_400), IssueSeverity::Critical);
        assert_eq!(ladder.severity_for_downtime(4 * 86_400), IssueSeverity::High);
        assert_eq!(ladder.severity_for_downtime(3 * 86_400), IssueSeverity::High);
        assert_eq!(ladder.severity_for_downtime(86_400), IssueSeverity::Medium);
    }

    #[test]
    fn notification_priority_tracks_severity_and_age() {
        let mut issue = IssueSummary {
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Server,
            downtime_seconds: 8 * 86_400,
            historical_context: "ctx".into(),
            severity: IssueSeverity::Critical,
        };
        assert_eq!(notification_priority(&issue), "urgent");

        issue.severity = IssueSeverity::High;
        issue.downtime_seconds = 4 * 86_400;
        assert_eq!(notification_priority(&issue), "high");

        issue.severity = IssueSeverity::Medium;
        issue.downtime_seconds = 3 * 86_400;
        assert_eq!(notification_priority(&issue), "normal");

        issue.downtime_seconds = 86_400;
        assert_eq!(notification_priority(&issue), "low");
    }

    #[tokio::test]
    async fn no_open_tickets_means_no_duplicate() {
        let (_dir, _store, workflow) = workflow().await;
        let (dup, existing) = workflow
            .check_duplicates("mv-aurora", ComponentKind::Server, IssueSeverity::High)
            .await
            .unwrap();
        assert!(!dup);
        assert!(existing.is_empty());
    }

    #[tokio::test]
    async fn same_severity_within_window_is_a_duplicate() {
        let (_dir, store, workflow) = workflow().await;
        store
            .insert_ticket_record(&record("INFRA-1", IssueSeverity::High))
            .await
            .unwrap();

        let (dup, existing) = workflow
            .check_duplicates("mv-aurora", ComponentKind::Server, IssueSeverity::High)
            .await
            .unwrap();
        assert!(dup);
        assert_eq!(existing.len(), 1);
    }

    #[tokio::test]
    async fn strictly_higher_severity_escalates() {
        let (_dir, store, workflow) = workflow().await;
        store
            .insert_ticket_record(&record("INFRA-1", IssueSeverity::High))
            .await
            .unwrap();

        let (dup, _) = workflow
            .check_duplicates("mv-aurora", ComponentKind::Server, IssueSeverity::Critical)
            .await
            .unwrap();
        assert!(!dup, "escalation tickets bypass the duplicate rule");
    }

    #[tokio::test]
    async fn cap_blocks_even_escalations() {
        let (_dir, store, workflow) = workflow().await;
        for (i, severity) in [
            IssueSeverity::Low,
            IssueSeverity::Medium,
            IssueSeverity::High,
        ]
        .iter()
        .enumerate()
        {
            store
                .insert_ticket_record(&record(&format!("INFRA-{i}"), *severity))
                .await
                .unwrap();
        }

        let (dup, existing) = workflow
            .check_duplicates("mv-aurora", ComponentKind::Server, IssueSeverity::Critical)
            .await
            .unwrap();
        assert!(dup, "cap of 3 open tickets holds regardless of severity");
        assert_eq!(existing.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_with_alert_links_to_newest_ticket() {
        let (_dir, store, workflow) = workflow().await;
        store
            .insert_ticket_record(&record("INFRA-7", IssueSeverity::High))
            .await
            .unwrap();

        let issue = IssueSummary {
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Server,
            downtime_seconds: 4 * 86_400,
            historical_context: "ctx".into(),
            severity: IssueSeverity::High,
        };
        let created = workflow
            .create_ticket_with_approval(issue, Some(99))
            .await
            .unwrap();
        assert!(created.is_none());

        let linked = store.ticket_record_by_key("INFRA-7").await.unwrap().unwrap();
        assert_eq!(linked.alert_ids, vec![99]);
    }

    #[tokio::test]
    async fn rejection_creates_no_ticket() {
        let (_dir, store, workflow) = workflow().await;
        let issue = IssueSummary {
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Server,
            downtime_seconds: 4 * 86_400,
            historical_context: "ctx".into(),
            severity: IssueSeverity::High,
        };

        let approvals = workflow.approvals().clone();
        let reject = tokio::spawn(async move {
            // Wait for the request to appear, then reject it.
            loop {
                let pending = approvals.pending_requests().await;
                if let Some(request) = pending.first() {
                    approvals
                        .decide(&request.request_id, false, "ops.kari", None)
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let created = workflow
            .create_ticket_with_approval(issue, None)
            .await
            .unwrap();
        reject.await.unwrap();

        assert!(created.is_none());
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        assert!(store
            .open_ticket_records_since("mv-aurora", ComponentKind::Server, cutoff)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn tracker_failure_after_approval_keeps_the_approval() {
        let (_dir, store, workflow) = workflow().await;
        let issue = IssueSummary {
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Server,
            downtime_seconds: 4 * 86_400,
            historical_context: "ctx".into(),
            severity: IssueSeverity::High,
        };

        let approvals = workflow.approvals().clone();
        let approve = tokio::spawn(async move {
            loop {
                let pending = approvals.pending_requests().await;
                if let Some(request) = pending.first() {
                    approvals
                        .decide(&request.request_id, true, "ops.kari", None)
                        .await
                        .unwrap();
                    return request.request_id.clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        // The tracker endpoint is unreachable, so creation fails after the
        // human said yes.
        let err = workflow
            .create_ticket_with_approval(issue, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Tracker(_)));

        let request_id = approve.await.unwrap();
        let request = workflow.approvals().get(&request_id).await.unwrap();
        assert_eq!(request.state, ApprovalState::Approved, "approval survives");

        // The failure is checkpointed for operator retry.
        let checkpoint = store
            .get_system_state(&format!("failed_ticket_creation:{request_id}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint["approved_request_id"], json!(request_id));
        assert!(checkpoint["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn issue_from_alert_uses_metadata() {
        let (_dir, _store, workflow) = workflow().await;
        let alert = Alert::new(
            "mv-aurora",
            ComponentKind::Dashboard,
            pelorus_types::AlertKind::PersistentDowntime,
            pelorus_types::AlertSeverity::Critical,
            "down",
            json!({
                "downtime_aging_hours": 96.0,
                "historical_context": "4 outages in 30 days"
            }),
        );
        let issue = workflow.issue_from_alert(&alert);
        assert_eq!(issue.downtime_seconds, 96 * 3600);
        assert_eq!(issue.severity, IssueSeverity::High);
        assert_eq!(issue.historical_context, "4 outages in 30 days");
    }
}

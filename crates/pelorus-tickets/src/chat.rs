use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

use pelorus_types::ApprovalRequest;

use crate::approval::{ApprovalError, ApprovalWorkflow};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    pub webhook_url: String,
    pub channel: String,
    pub username: String,
    pub icon_emoji: String,
}

/// Posts approval requests to the chat channel as an interactive message
/// with approve/reject/details buttons, and maps button callbacks back
/// onto the approval workflow.
pub struct ChatNotifier {
    settings: ChatSettings,
    client: Client,
}

fn priority_color(priority: &str) -> &'static str {
    match priority {
        "urgent" => "#ff0000",
        "high" => "#ff8c00",
        "low" => "#00ff00",
        _ => "#ffff00",
    }
}

impl ChatNotifier {
    pub fn new(settings: ChatSettings) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { settings, client })
    }

    /// The outbound message payload: one attachment with context fields and
    /// three buttons carrying the request id as their value.
    pub fn approval_message(&self, request: &ApprovalRequest, priority: &str) -> Value {
        let issue = &request.issue;
        json!({
            "channel": self.settings.channel,
            "username": self.settings.username,
            "icon_emoji": self.settings.icon_emoji,
            "attachments": [{
                "color": priority_color(priority),
                "title": format!(
                    "Infrastructure Alert - Approval Required [{}]",
                    priority.to_uppercase()
                ),
                "fields": [
                    {"title": "Vessel ID", "value": issue.vessel_id, "short": true},
                    {"title": "Component", "value": issue.kind.display_name(), "short": true},
                    {"title": "Severity", "value": issue.severity.display_name(), "short": true},
                    {
                        "title": "Downtime Duration",
                        "value": pelorus_types::format_duration(issue.downtime_seconds),
                        "short": true
                    },
                    {"title": "Request ID", "value": request.request_id, "short": false},
                    {
                        "title": "Historical Context",
                        "value": truncate(&issue.historical_context, 500),
                        "short": false
                    }
                ],
                "actions": [
                    {
                        "type": "button",
                        "text": "Approve Ticket",
                        "style": "primary",
                        "name": "approve",
                        "value": request.request_id
                    },
                    {
                        "type": "button",
                        "text": "Reject",
                        "style": "danger",
                        "name": "reject",
                        "value": request.request_id
                    },
                    {
                        "type": "button",
                        "text": "More Details",
                        "name": "details",
                        "value": request.request_id
                    }
                ],
                "footer": "Pelorus Fleet Monitor",
                "ts": request.requested_at.timestamp()
            }]
        })
    }

    pub async fn notify_approval_request(
        &self,
        request: &ApprovalRequest,
        priority: &str,
    ) -> anyhow::Result<()> {
        let payload = self.approval_message(request, priority);
        let response = self
            .client
            .post(&self.settings.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat webhook rejected notification: {status} {body}");
        }

        info!(request_id = %request.request_id, "sent chat approval notification");
        Ok(())
    }
}

/// Handle an interactive button callback. The payload carries the acting
/// user and the button (`approve`/`reject`/`details`) whose value is the
/// request id. Returns the chat-facing response message.
pub async fn handle_interaction(workflow: &ApprovalWorkflow, payload: &Value) -> Value {
    let user = payload.get("user").cloned().unwrap_or_default();
    let user_id = user
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let user_name = user
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Unknown User")
        .to_string();

    let Some(action) = payload
        .get("actions")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    else {
        return json!({"text": "No action specified"});
    };
    let action_name = action.get("name").and_then(Value::as_str).unwrap_or("");
    let Some(request_id) = action.get("value").and_then(Value::as_str) else {
        return json!({"text": "No request id in action"});
    };

    info!(
        action = action_name,
        request_id,
        user = %user_name,
        "chat interaction received"
    );

    match action_name {
        "approve" | "reject" => {
            let approved = action_name == "approve";
            let comment = if approved {
                "Approved via chat"
            } else {
                "Rejected via chat"
            };
            match workflow
                .decide(request_id, approved, &user_name, Some(comment.to_string()))
                .await
            {
                Ok(_) => {
                    let verdict = if approved { "approved" } else { "rejected" };
                    json!({
                        "text": format!("Ticket creation {verdict} by {user_name}"),
                        "response_type": "in_channel",
                        "replace_original": true,
                        "attachments": [{
                            "color": if approved { "good" } else { "danger" },
                            "text": format!(
                                "Tracker ticket creation {verdict} for request {request_id}"
                            ),
                            "footer": format!("decided by {user_name} ({user_id})")
                        }]
                    })
                }
                Err(err @ ApprovalError::AlreadyDecided(_)) => {
                    warn!(request_id, error = %err, "duplicate chat decision ignored");
                    json!({
                        "text": format!("Request {request_id} was already decided"),
                        "response_type": "ephemeral"
                    })
                }
                Err(err) => {
                    error!(request_id, error = %err, "chat decision failed");
                    json!({
                        "text": format!("Error processing request: {err}"),
                        "response_type": "ephemeral"
                    })
                }
            }
        }
        "details" => match workflow.get(request_id).await {
            Some(request) => json!({
                "text": format!("Detailed information for request {request_id}:"),
                "response_type": "ephemeral",
                "attachments": [{
                    "color": "#36a64f",
                    "text": format!("```{}```", ApprovalWorkflow::format_request(&request))
                }]
            }),
            None => json!({"text": "Request not found"}),
        },
        other => json!({"text": format!("Unknown action: {other}")}),
    }
}

fn truncate(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        input.to_string()
    } else {
        let cut: String = input.chars().take(max_len).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalSettings;
    use pelorus_types::{ApprovalState, ComponentKind, IssueSeverity, IssueSummary};

    fn settings() -> ChatSettings {
        ChatSettings {
            webhook_url: "https://chat.example/webhook/T000/B000".into(),
            channel: "#infrastructure-alerts".into(),
            username: "Pelorus Monitor".into(),
            icon_emoji: ":warning:".into(),
        }
    }

    fn issue() -> IssueSummary {
        IssueSummary {
            vessel_id: "mv-aurora".into(),
            kind: ComponentKind::Dashboard,
            downtime_seconds: 3 * 86_400 + 7_200,
            historical_context: "flapping since July".into(),
            severity: IssueSeverity::High,
        }
    }

    fn interaction(action: &str, request_id: &str) -> Value {
        json!({
            "user": {"id": "U123", "name": "kari"},
            "actions": [{"name": action, "value": request_id}]
        })
    }

    #[tokio::test]
    async fn message_carries_request_id_on_every_button() {
        let notifier = ChatNotifier::new(settings()).unwrap();
        let workflow = ApprovalWorkflow::new(ApprovalSettings::default());
        let request = workflow.submit(issue()).await.unwrap();

        let message = notifier.approval_message(&request, "high");
        let actions = message["attachments"][0]["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 3);
        for action in actions {
            assert_eq!(action["value"], json!(request.request_id));
        }
        let names: Vec<&str> = actions
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["approve", "reject", "details"]);
        assert_eq!(message["attachments"][0]["color"], "#ff8c00");
    }

    #[tokio::test]
    async fn approve_button_lands_the_decision() {
        let workflow = ApprovalWorkflow::new(ApprovalSettings::default());
        let request = workflow.submit(issue()).await.unwrap();

        let response =
            handle_interaction(&workflow, &interaction("approve", &request.request_id)).await;
        assert!(response["text"].as_str().unwrap().contains("approved by kari"));

        let decided = workflow.get(&request.request_id).await.unwrap();
        assert_eq!(decided.state, ApprovalState::Approved);
        assert_eq!(decided.approver.as_deref(), Some("kari"));
    }

    #[tokio::test]
    async fn second_button_press_is_reported_as_already_decided() {
        let workflow = ApprovalWorkflow::new(ApprovalSettings::default());
        let request = workflow.submit(issue()).await.unwrap();

        handle_interaction(&workflow, &interaction("reject", &request.request_id)).await;
        let response =
            handle_interaction(&workflow, &interaction("approve", &request.request_id)).await;
        assert!(response["text"]
            .as_str()
            .unwrap()
            .contains("already decided"));

        let decided = workflow.get(&request.request_id).await.unwrap();
        assert_eq!(decided.state, ApprovalState::Rejected, "first decision holds");
    }

    #[tokio::test]
    async fn details_button_renders_the_request() {
        let workflow = ApprovalWorkflow::new(ApprovalSettings::default());
        let request = workflow.submit(issue()).await.unwrap();

        let response =
            handle_interaction(&workflow, &interaction("details", &request.request_id)).await;
        let text = response["attachments"][0]["text"].as_str().unwrap();
        assert!(text.contains("mv-aurora"));
        assert!(text.contains("Dashboard"));
    }

    #[tokio::test]
    async fn malformed_payloads_do_not_panic() {
        let workflow = ApprovalWorkflow::new(ApprovalSettings::default());
        let response = handle_interaction(&workflow, &json!({})).await;
        assert_eq!(response["text"], "No action specified");

        let response = handle_interaction(
            &workflow,
            &json!({"actions": [{"name": "approve"}]}),
        )
        .await;
        assert_eq!(response["text"], "No request id in action");
    }
}

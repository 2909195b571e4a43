use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use pelorus_types::{ComponentKind, IssueSeverity, IssueSummary, TrackerStatus, TrackerTicket};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker network error: {0}")]
    Network(String),

    #[error("tracker rejected credentials or permissions: {0}")]
    Permission(String),

    #[error("tracker rejected the request: {0}")]
    Validation(String),

    #[error("unexpected tracker response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConnection {
    pub url: String,
    pub username: String,
    pub api_token: String,
    pub project_key: String,
    pub issue_type: String,
}

/// Issue severity to tracker priority name. Distinct from the alert
/// severity ladder.
pub fn priority_name(severity: IssueSeverity) -> &'static str {
    match severity {
        IssueSeverity::Low => "Low",
        IssueSeverity::Medium => "Medium",
        IssueSeverity::High => "High",
        IssueSeverity::Critical => "Highest",
    }
}

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const MAX_RETRIES: u32 = 3;

/// REST client for the external issue tracker. Retries transient statuses,
/// surfaces permission and validation failures untouched.
pub struct TrackerClient {
    connection: TrackerConnection,
    client: Client,
    retry_base: Duration,
}

impl TrackerClient {
    pub fn new(connection: TrackerConnection) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        info!(url = %connection.url, project = %connection.project_key, "initialized tracker client");
        Ok(Self {
            connection,
            client,
            retry_base: Duration::from_secs(1),
        })
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn connection(&self) -> &TrackerConnection {
        &self.connection
    }

    fn api(&self, path: &str) -> String {
        format!("{}{path}", self.connection.url.trim_end_matches('/'))
    }

    fn classify_status(status: StatusCode, body: &str) -> TrackerError {
        match status.as_u16() {
            401 | 403 => TrackerError::Permission(format!("HTTP {status}: {body}")),
            400 | 404 | 422 => TrackerError::Validation(format!("HTTP {status}: {body}")),
            _ => TrackerError::Protocol(format!("HTTP {status}: {body}")),
        }
    }

    /// Issue a request, retrying 429/5xx up to three times with doubling
    /// delays. The request must be cloneable (no streaming bodies).
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TrackerError> {
        let mut delay = self.retry_base;
        let mut last_status = None;

        for attempt in 0..=MAX_RETRIES {
            let request = build()
                .basic_auth(&self.connection.username, Some(&self.connection.api_token))
                .header("Accept", "application/json");

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt < MAX_RETRIES {
                        warn!(
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            "tracker returned transient status, retrying"
                        );
                        last_status = Some(status);
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) if attempt < MAX_RETRIES => {
                    warn!(attempt = attempt + 1, error = %err, "tracker request failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(TrackerError::Network(err.to_string())),
            }
        }

        Err(TrackerError::Network(format!(
            "retries exhausted (last status {last_status:?})"
        )))
    }

    pub async fn test_connection(&self) -> bool {
        let url = self.api("/rest/api/2/myself");
        match self.send_with_retry(|| self.client.get(&url)).await {
            Ok(response) if response.status().is_success() => {
                let name = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("displayName").and_then(Value::as_str).map(String::from))
                    .unwrap_or_default();
                info!(user = %name, "tracker connection test succeeded");
                true
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "tracker connection test failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "tracker connection test failed");
                false
            }
        }
    }

    /// Search open tickets for (vessel, component) in the project.
    pub async fn search_open_tickets(
        &self,
        vessel_id: &str,
        kind: ComponentKind,
    ) -> Result<Vec<TrackerTicket>, TrackerError> {
        let jql = format!(
            "project = \"{}\" AND summary ~ \"Vessel {}\" AND summary ~ \"{}\" \
             AND status in (\"Open\", \"In Progress\", \"Reopened\")",
            self.connection.project_key,
            vessel_id,
            kind.display_name()
        );
        let url = self.api("/rest/api/2/search");

        let response = self
            .send_with_retry(|| {
                self.client.get(&url).query(&[
                    ("jql", jql.as_str()),
                    ("fields", "key,id,summary,description,status,created,updated"),
                    ("maxResults", "100"),
                ])
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TrackerError::Protocol(e.to_string()))?;

        let mut tickets = Vec::new();
        for issue in body
            .get("issues")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match parse_issue(issue, vessel_id, kind) {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => warn!(error = %err, "skipping unparseable tracker issue"),
            }
        }

        info!(
            vessel = vessel_id,
            kind = kind.as_str(),
            count = tickets.len(),
            "searched existing tracker tickets"
        );
        Ok(tickets)
    }

    /// Create an issue for the approved summary and return the full ticket.
    pub async fn create_issue(&self, issue: &IssueSummary) -> Result<TrackerTicket, TrackerError> {
        let payload = json!({
            "fields": {
                "project": {"key": self.connection.project_key},
                "summary": issue.title(),
                "description": issue.description(),
                "issuetype": {"name": self.connection.issue_type},
                "priority": {"name": priority_name(issue.severity)},
                "labels": [
                    format!("vessel-{}", issue.vessel_id),
                    format!("component-{}", issue.kind.as_str()),
                    "infrastructure-monitoring",
                    "automated"
                ]
            }
        });

        let url = self.api("/rest/api/2/issue");
        let response = self
            .send_with_retry(|| self.client.post(&url).json(&payload))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let created: Value = response
            .json()
            .await
            .map_err(|e| TrackerError::Protocol(e.to_string()))?;
        let key = created
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::Protocol("create response missing key".into()))?
            .to_string();

        info!(ticket = %key, vessel = %issue.vessel_id, "created tracker ticket");
        self.fetch_ticket(&key, &issue.vessel_id, issue.kind).await
    }

    pub async fn fetch_ticket(
        &self,
        key: &str,
        vessel_id: &str,
        kind: ComponentKind,
    ) -> Result<TrackerTicket, TrackerError> {
        let url = self.api(&format!("/rest/api/2/issue/{key}"));
        let response = self
            .send_with_retry(|| {
                self.client.get(&url).query(&[(
                    "fields",
                    "key,id,summary,description,status,created,updated",
                )])
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let issue: Value = response
            .json()
            .await
            .map_err(|e| TrackerError::Protocol(e.to_string()))?;
        parse_issue(&issue, vessel_id, kind)
    }

    /// Transition a ticket to a new status via the tracker's transition
    /// endpoint. Fails with Validation when no transition leads there.
    pub async fn transition(
        &self,
        key: &str,
        target: TrackerStatus,
    ) -> Result<(), TrackerError> {
        let url = self.api(&format!("/rest/api/2/issue/{key}/transitions"));

        let response = self.send_with_retry(|| self.client.get(&url)).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TrackerError::Protocol(e.to_string()))?;

        let transition_id = body
            .get("transitions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|t| {
                t.pointer("/to/name").and_then(Value::as_str) == Some(target.display_name())
            })
            .and_then(|t| t.get("id").and_then(Value::as_str))
            .map(String::from);

        let Some(transition_id) = transition_id else {
            return Err(TrackerError::Validation(format!(
                "no transition from current status to {}",
                target.display_name()
            )));
        };

        let payload = json!({"transition": {"id": transition_id}});
        let response = self
            .send_with_retry(|| self.client.post(&url).json(&payload))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        info!(ticket = key, status = target.display_name(), "transitioned tracker ticket");
        Ok(())
    }
}

fn parse_issue(
    issue: &Value,
    vessel_id: &str,
    kind: ComponentKind,
) -> Result<TrackerTicket, TrackerError> {
    let fields = issue
        .get("fields")
        .ok_or_else(|| TrackerError::Protocol("issue missing fields".into()))?;

    let get_str = |v: &Value, key: &str| -> Option<String> {
        v.get(key).and_then(Value::as_str).map(String::from)
    };

    let status_name = fields
        .pointer("/status/name")
        .and_then(Value::as_str)
        .ok_or_else(|| TrackerError::Protocol("issue missing status".into()))?;
    let status = TrackerStatus::parse(status_name)
        .ok_or_else(|| TrackerError::Protocol(format!("unknown tracker status `{status_name}`")))?;

    Ok(TrackerTicket {
        key: get_str(issue, "key")
            .ok_or_else(|| TrackerError::Protocol("issue missing key".into()))?,
        id: get_str(issue, "id").unwrap_or_default(),
        summary: get_str(fields, "summary").unwrap_or_default(),
        description: get_str(fields, "description").unwrap_or_default(),
        status,
        created: parse_tracker_time(fields.get("created"))?,
        updated: parse_tracker_time(fields.get("updated"))?,
        vessel_id: vessel_id.to_string(),
        kind,
    })
}

fn parse_tracker_time(value: Option<&Value>) -> Result<DateTime<Utc>, TrackerError> {
    let raw = value
        .and_then(Value::as_str)
        .ok_or_else(|| TrackerError::Protocol("issue missing timestamp".into()))?;
    // The tracker emits RFC3339 with or without a colon in the offset.
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrackerError::Protocol(format!("bad timestamp `{raw}`: {e}")))
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use tracing::{debug, info, warn};

use pelorus_types::ComponentKind;

use crate::wire::QueryResponse;
use crate::{ComponentMapping, PingData, PingSource, ProbeError, VesselConnection};

/// Bounded exponential backoff with jitter for in-client retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base · 2^attempt`, capped, plus 10–30% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.1..=0.3) * capped;
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Read-only client for one vessel's ping table.
pub struct ProbeClient {
    vessel_id: String,
    connection: VesselConnection,
    mapping: ComponentMapping,
    retry: RetryPolicy,
    client: Client,
}

impl ProbeClient {
    pub fn new(
        vessel_id: impl Into<String>,
        connection: VesselConnection,
        mapping: ComponentMapping,
    ) -> Result<Self, ProbeError> {
        let vessel_id = vessel_id.into();
        if !connection.url.starts_with("http://") && !connection.url.starts_with("https://") {
            return Err(ProbeError::Config(format!(
                "vessel {} has a malformed endpoint url: {}",
                vessel_id, connection.url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(connection.timeout_seconds))
            .build()
            .map_err(|e| ProbeError::Config(format!("failed to build http client: {e}")))?;

        info!(
            vessel = %vessel_id,
            url = %connection.url,
            "initialized probe client"
        );

        Ok(Self {
            vessel_id,
            connection,
            mapping,
            retry: RetryPolicy::default(),
            client,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn mapping(&self) -> &ComponentMapping {
        &self.mapping
    }

    fn ping_query(&self, ips: &[String], window_hours: u32) -> String {
        let ip_conditions = ips
            .iter()
            .map(|ip| format!("url = '{ip}'"))
            .collect::<Vec<_>>()
            .join(" OR ");
        format!(
            "SELECT time, url, result_code, percent_packet_loss \
             FROM ping \
             WHERE time > now() - {window_hours}h \
             AND ({ip_conditions}) \
             ORDER BY time ASC"
        )
    }

    async fn execute_query(&self, query: &str) -> Result<QueryResponse, ProbeError> {
        let url = format!("{}/query", self.connection.url.trim_end_matches('/'));
        debug!(vessel = %self.vessel_id, db = %self.connection.bucket, query, "executing query");

        let response = self
            .client
            .get(&url)
            .header(
                "Authorization",
                format!("Token {}", self.connection.token),
            )
            .query(&[("db", self.connection.bucket.as_str()), ("q", query)])
            .send()
            .await
            .map_err(|e| ProbeError::classify_transport(&e, self.connection.timeout_seconds))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::from_status(status.as_u16(), truncate(&body, 500)));
        }

        response
            .json::<QueryResponse>()
            .await
            .map_err(|e| ProbeError::Config(format!("unparseable query response: {e}")))
    }

    /// Run `op` with the retry policy: only retryable errors re-attempt,
    /// non-retryable classes surface immediately.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, ProbeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProbeError>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.retry.max_retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        vessel = %self.vessel_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "probe attempt failed, retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ProbeError::Config("retry loop exhausted".to_string())))
    }

    /// Most recent ping timestamp for a component, looking back 7 days.
    pub async fn latest_ping_time(
        &self,
        kind: ComponentKind,
    ) -> Result<Option<DateTime<Utc>>, ProbeError> {
        let ips = self.mapping.ips_for(kind);
        if ips.is_empty() {
            return Ok(None);
        }
        let ip_conditions = ips
            .iter()
            .map(|ip| format!("url = '{ip}'"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let query = format!(
            "SELECT time, url, result_code, percent_packet_loss \
             FROM ping WHERE time > now() - 7d AND ({ip_conditions}) \
             ORDER BY time DESC LIMIT 1"
        );
        let samples = self
            .with_retries(|| self.execute_query(&query))
            .await?
            .into_samples()?;
        Ok(samples.last().map(|s| s.timestamp))
    }
}

#[async_trait]
impl PingSource for ProbeClient {
    fn vessel_id(&self) -> &str {
        &self.vessel_id
    }

    async fn query_pings(
        &self,
        kind: ComponentKind,
        window_hours: u32,
    ) -> Result<PingData, ProbeError> {
        let ips = self.mapping.ips_for(kind).to_vec();
        if ips.is_empty() {
            warn!(
                vessel = %self.vessel_id,
                kind = kind.as_str(),
                "no ip addresses configured for component"
            );
            return Ok(PingData::empty(self.vessel_id.clone(), kind, ips));
        }

        let query = self.ping_query(&ips, window_hours);
        let samples = self
            .with_retries(|| self.execute_query(&query))
            .await?
            .into_samples()?;

        info!(
            vessel = %self.vessel_id,
            kind = kind.as_str(),
            samples = samples.len(),
            "retrieved ping records"
        );

        Ok(PingData {
            vessel_id: self.vessel_id.clone(),
            kind,
            configured_ips: ips,
            samples,
        })
    }

    async fn test_connection(&self) -> bool {
        let probe = self
            .with_retries(|| self.execute_query("SHOW MEASUREMENTS LIMIT 1"))
            .await;
        match probe {
            Ok(_) => {
                info!(vessel = %self.vessel_id, "connection test succeeded");
                true
            }
            Err(err) => {
                warn!(vessel = %self.vessel_id, error = %err, "connection test failed");
                false
            }
        }
    }
}

fn truncate(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut end = max_len;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &input[..end])
    }
}

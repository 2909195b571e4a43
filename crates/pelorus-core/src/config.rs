use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use pelorus_probe::{ComponentMapping, VesselConnection};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One vessel's database endpoint plus its device-role mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselDatabase {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub org: String,
    pub bucket: String,
    #[serde(default = "defaults::timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_mapping: Option<ComponentMapping>,
}

impl VesselDatabase {
    pub fn connection(&self) -> VesselConnection {
        VesselConnection {
            url: self.url.clone(),
            token: self.token.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            timeout_seconds: self.timeout_seconds,
        }
    }

    pub fn mapping(&self) -> ComponentMapping {
        self.component_mapping
            .clone()
            .unwrap_or_else(ComponentMapping::shipboard_default)
    }
}

/// Alert-severity ladder applied when an alert is opened. Kept separate from
/// the tracker priority ladder so the two can be tuned independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLadder {
    pub critical_downtime_hours: f64,
    pub critical_uptime_below: f64,
    pub warning_high_downtime_hours: f64,
    pub warning_high_uptime_below: f64,
    pub warning_medium_downtime_hours: f64,
    pub warning_medium_uptime_below: f64,
}

impl Default for AlertLadder {
    fn default() -> Self {
        Self {
            critical_downtime_hours: 72.0,
            critical_uptime_below: 50.0,
            warning_high_downtime_hours: 24.0,
            warning_high_uptime_below: 80.0,
            warning_medium_downtime_hours: 4.0,
            warning_medium_uptime_below: 90.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaParameters {
    #[serde(default = "defaults::uptime_threshold")]
    pub uptime_threshold_percentage: f64,
    #[serde(default = "defaults::downtime_alert_days")]
    pub downtime_alert_threshold_days: u32,
    #[serde(default = "defaults::monitoring_window_hours")]
    pub monitoring_window_hours: u32,
    #[serde(default)]
    pub alert_ladder: AlertLadder,
}

impl Default for SlaParameters {
    fn default() -> Self {
        Self {
            uptime_threshold_percentage: defaults::uptime_threshold(),
            downtime_alert_threshold_days: defaults::downtime_alert_days(),
            monitoring_window_hours: defaults::monitoring_window_hours(),
            alert_ladder: AlertLadder::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "defaults::monitoring_hour")]
    pub daily_monitoring_hour: u32,
    #[serde(default)]
    pub daily_monitoring_minute: u32,
    #[serde(default = "defaults::timezone")]
    pub timezone: String,
    /// Missed triggers within this window still fire (coalesced to one).
    #[serde(default = "defaults::misfire_grace_seconds")]
    pub misfire_grace_seconds: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            daily_monitoring_hour: defaults::monitoring_hour(),
            daily_monitoring_minute: 0,
            timezone: defaults::timezone(),
            misfire_grace_seconds: defaults::misfire_grace_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebServerConfig {
    #[serde(default = "defaults::web_host")]
    pub host: String,
    #[serde(default = "defaults::web_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::web_host(),
            port: defaults::web_port(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub url: String,
    pub username: String,
    pub api_token: String,
    pub project_key: String,
    #[serde(default = "defaults::issue_type")]
    pub issue_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub webhook_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    #[serde(default = "defaults::chat_channel")]
    pub channel: String,
    #[serde(default = "defaults::chat_username")]
    pub username: String,
    #[serde(default = "defaults::chat_icon")]
    pub icon_emoji: String,
    #[serde(default = "defaults::webhook_port")]
    pub webhook_port: u16,
}

/// Ticket-workflow tuning: duplicate prevention window, approval limits and
/// the downtime-to-severity ladder used for tracker issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketPolicy {
    #[serde(default = "defaults::duplicate_window_hours")]
    pub duplicate_window_hours: u32,
    #[serde(default = "defaults::max_tickets_per_component")]
    pub max_tickets_per_component: usize,
    #[serde(default = "defaults::yes")]
    pub allow_severity_escalation: bool,
    #[serde(default = "defaults::approval_timeout_minutes")]
    pub default_timeout_minutes: u32,
    #[serde(default = "defaults::max_pending_requests")]
    pub max_pending_requests: usize,
    #[serde(default = "defaults::auto_cleanup_hours")]
    pub auto_cleanup_hours: u32,
    /// Downtime at or above this many days files a Critical issue.
    #[serde(default = "defaults::critical_after_days")]
    pub critical_after_days: f64,
    /// Downtime at or above this many days files a High issue.
    #[serde(default = "defaults::high_after_days")]
    pub high_after_days: f64,
}

impl Default for TicketPolicy {
    fn default() -> Self {
        Self {
            duplicate_window_hours: defaults::duplicate_window_hours(),
            max_tickets_per_component: defaults::max_tickets_per_component(),
            allow_severity_escalation: true,
            default_timeout_minutes: defaults::approval_timeout_minutes(),
            max_pending_requests: defaults::max_pending_requests(),
            auto_cleanup_hours: defaults::auto_cleanup_hours(),
            critical_after_days: defaults::critical_after_days(),
            high_after_days: defaults::high_after_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub vessel_databases: HashMap<String, VesselDatabase>,
    #[serde(default)]
    pub sla_parameters: SlaParameters,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub web_server: WebServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<TrackerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatConfig>,
    #[serde(default)]
    pub ticket_policy: TicketPolicy,
    #[serde(default = "defaults::database_path")]
    pub database_path: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::log_file")]
    pub log_file: String,
}

mod defaults {
    pub fn timeout_seconds() -> u64 {
        30
    }
    pub fn uptime_threshold() -> f64 {
        95.0
    }
    pub fn downtime_alert_days() -> u32 {
        3
    }
    pub fn monitoring_window_hours() -> u32 {
        24
    }
    pub fn monitoring_hour() -> u32 {
        6
    }
    pub fn timezone() -> String {
        "UTC".to_string()
    }
    pub fn misfire_grace_seconds() -> u64 {
        3600
    }
    pub fn web_host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn web_port() -> u16 {
        8000
    }
    pub fn issue_type() -> String {
        "Bug".to_string()
    }
    pub fn chat_channel() -> String {
        "#infrastructure-alerts".to_string()
    }
    pub fn chat_username() -> String {
        "Pelorus Monitor".to_string()
    }
    pub fn chat_icon() -> String {
        ":warning:".to_string()
    }
    pub fn webhook_port() -> u16 {
        5000
    }
    pub fn duplicate_window_hours() -> u32 {
        24
    }
    pub fn max_tickets_per_component() -> usize {
        3
    }
    pub fn yes() -> bool {
        true
    }
    pub fn approval_timeout_minutes() -> u32 {
        60
    }
    pub fn max_pending_requests() -> usize {
        100
    }
    pub fn auto_cleanup_hours() -> u32 {
        24
    }
    pub fn critical_after_days() -> f64 {
        7.0
    }
    pub fn high_after_days() -> f64 {
        3.0
    }
    pub fn database_path() -> String {
        "./pelorus.db".to_string()
    }
    pub fn log_level() -> String {
        "INFO".to_string()
    }
    pub fn log_file() -> String {
        "pelorus.log".to_string()
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

impl AppConfig {
    /// Load from environment variables, then overlay an optional JSON file
    /// (file values win), then validate.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut value = Self::env_value();
        if let Some(path) = config_file {
            let raw = std::fs::read_to_string(path)?;
            let file_value: serde_json::Value = serde_json::from_str(&raw)?;
            merge(&mut value, &file_value);
            info!(path = %path.display(), "loaded configuration file");
        }
        let config: AppConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn vessel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.vessel_databases.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn vessel(&self, vessel_id: &str) -> Result<&VesselDatabase, ConfigError> {
        self.vessel_databases.get(vessel_id).ok_or_else(|| {
            ConfigError::Invalid(format!("no database configured for vessel `{vessel_id}`"))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vessel_databases.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one vessel database must be configured".into(),
            ));
        }
        for (vessel_id, db) in &self.vessel_databases {
            if db.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "vessel `{vessel_id}` has an empty url"
                )));
            }
            if db.bucket.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "vessel `{vessel_id}` has an empty bucket"
                )));
            }
            if db.timeout_seconds == 0 {
                return Err(ConfigError::Invalid(format!(
                    "vessel `{vessel_id}` timeout must be positive"
                )));
            }
        }

        let sla = &self.sla_parameters;
        if !(sla.uptime_threshold_percentage > 0.0 && sla.uptime_threshold_percentage <= 100.0) {
            return Err(ConfigError::Invalid(
                "uptime threshold must be in (0, 100]".into(),
            ));
        }
        if sla.downtime_alert_threshold_days == 0 {
            return Err(ConfigError::Invalid(
                "downtime alert threshold must be positive".into(),
            ));
        }
        if sla.monitoring_window_hours == 0 {
            return Err(ConfigError::Invalid(
                "monitoring window must be positive".into(),
            ));
        }

        if self.scheduling.daily_monitoring_hour > 23 {
            return Err(ConfigError::Invalid(
                "daily monitoring hour must be 0-23".into(),
            ));
        }
        if self.scheduling.daily_monitoring_minute > 59 {
            return Err(ConfigError::Invalid(
                "daily monitoring minute must be 0-59".into(),
            ));
        }

        if self.web_server.port == 0 {
            return Err(ConfigError::Invalid("web server port must be 1-65535".into()));
        }

        if let Some(chat) = &self.chat {
            if chat.webhook_url.trim().is_empty() {
                return Err(ConfigError::Invalid("chat webhook url cannot be empty".into()));
            }
            if chat.webhook_port == 0 {
                return Err(ConfigError::Invalid("chat webhook port must be 1-65535".into()));
            }
        }

        if let Some(tracker) = &self.tracker {
            for (field, value) in [
                ("url", &tracker.url),
                ("username", &tracker.username),
                ("api_token", &tracker.api_token),
                ("project_key", &tracker.project_key),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "tracker {field} cannot be empty"
                    )));
                }
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.to_ascii_uppercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log level must be one of {VALID_LOG_LEVELS:?}"
            )));
        }

        Ok(())
    }

    /// Build the environment layer. Vessel endpoints come from per-vessel
    /// `VESSEL_<ID>_DB_*` keys when any are present; otherwise a single
    /// cluster endpoint (`FLEET_DB_*` + `VESSEL_IDS`) is expanded with one
    /// bucket per vessel (`{vessel_id}_{bucket}`).
    fn env_value() -> serde_json::Value {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let mut vessels = serde_json::Map::new();

        // Per-vessel keys take precedence.
        for (key, _) in std::env::vars() {
            let Some(rest) = key.strip_prefix("VESSEL_") else {
                continue;
            };
            let Some(prefix) = rest.strip_suffix("_DB_URL") else {
                continue;
            };
            let vessel_id = prefix.to_ascii_lowercase();
            let at = |suffix: &str| env(&format!("VESSEL_{prefix}_DB_{suffix}"));
            let Some(url) = at("URL") else { continue };
            vessels.insert(
                vessel_id,
                serde_json::json!({
                    "url": url,
                    "token": at("TOKEN").unwrap_or_default(),
                    "org": at("ORG").unwrap_or_default(),
                    "bucket": at("BUCKET").unwrap_or_else(|| "monitoring".into()),
                    "timeout_seconds": at("TIMEOUT")
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(30),
                }),
            );
        }

        if vessels.is_empty() {
            if let Some(url) = env("FLEET_DB_URL") {
                let bucket = env("FLEET_DB_BUCKET").unwrap_or_else(|| "monitoring".into());
                let ids = env("VESSEL_IDS").unwrap_or_default();
                for vessel_id in ids.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                    vessels.insert(
                        vessel_id.to_string(),
                        serde_json::json!({
                            "url": url,
                            "token": env("FLEET_DB_TOKEN").unwrap_or_default(),
                            "org": env("FLEET_DB_ORG").unwrap_or_default(),
                            "bucket": format!("{vessel_id}_{bucket}"),
                            "timeout_seconds": env("FLEET_DB_TIMEOUT")
                                .and_then(|v| v.parse::<u64>().ok())
                                .unwrap_or(30),
                        }),
                    );
                }
            }
        }

        let mut root = serde_json::json!({
            "vessel_databases": vessels,
            "sla_parameters": {},
            "scheduling": {},
            "web_server": {},
            "ticket_policy": {},
        });

        let set = |root: &mut serde_json::Value, pointer: &str, value: serde_json::Value| {
            if let Some(slot) = root.pointer_mut(pointer) {
                *slot = value;
            }
        };

        if let Some(v) = env("SLA_THRESHOLD").and_then(|v| v.parse::<f64>().ok()) {
            set(
                &mut root,
                "/sla_parameters/uptime_threshold_percentage",
                serde_json::json!(v),
            );
        }
        if let Some(v) = env("DOWNTIME_ALERT_THRESHOLD_DAYS").and_then(|v| v.parse::<u32>().ok()) {
            set(
                &mut root,
                "/sla_parameters/downtime_alert_threshold_days",
                serde_json::json!(v),
            );
        }
        if let Some(v) = env("MONITORING_WINDOW_HOURS").and_then(|v| v.parse::<u32>().ok()) {
            set(
                &mut root,
                "/sla_parameters/monitoring_window_hours",
                serde_json::json!(v),
            );
        }
        if let Some(v) = env("MONITORING_SCHEDULE_HOUR").and_then(|v| v.parse::<u32>().ok()) {
            set(
                &mut root,
                "/scheduling/daily_monitoring_hour",
                serde_json::json!(v),
            );
        }
        if let Some(v) = env("MONITORING_SCHEDULE_MINUTE").and_then(|v| v.parse::<u32>().ok()) {
            set(
                &mut root,
                "/scheduling/daily_monitoring_minute",
                serde_json::json!(v),
            );
        }
        if let Some(v) = env("MONITORING_TIMEZONE") {
            set(&mut root, "/scheduling/timezone", serde_json::json!(v));
        }
        if let Some(v) = env("WEB_HOST") {
            set(&mut root, "/web_server/host", serde_json::json!(v));
        }
        if let Some(v) = env("WEB_PORT").and_then(|v| v.parse::<u16>().ok()) {
            set(&mut root, "/web_server/port", serde_json::json!(v));
        }
        if let Some(v) = env("WEB_DEBUG") {
            set(
                &mut root,
                "/web_server/debug",
                serde_json::json!(v.eq_ignore_ascii_case("true")),
            );
        }

        if let Some(url) = env("TRACKER_URL") {
            root["tracker"] = serde_json::json!({
                "url": url,
                "username": env("TRACKER_USERNAME").unwrap_or_default(),
                "api_token": env("TRACKER_API_TOKEN").unwrap_or_default(),
                "project_key": env("TRACKER_PROJECT_KEY").unwrap_or_else(|| "INFRA".into()),
                "issue_type": env("TRACKER_ISSUE_TYPE").unwrap_or_else(|| "Bug".into()),
            });
        }

        if let Some(url) = env("CHAT_WEBHOOK_URL") {
            let mut chat = serde_json::json!({ "webhook_url": url });
            if let Some(secret) = env("CHAT_SIGNING_SECRET") {
                chat["signing_secret"] = serde_json::json!(secret);
            }
            if let Some(channel) = env("CHAT_CHANNEL") {
                chat["channel"] = serde_json::json!(channel);
            }
            if let Some(port) = env("CHAT_WEBHOOK_PORT").and_then(|v| v.parse::<u16>().ok()) {
                chat["webhook_port"] = serde_json::json!(port);
            }
            root["chat"] = chat;
        }

        if let Some(v) = env("DATABASE_PATH") {
            root["database_path"] = serde_json::json!(v);
        }
        if let Some(v) = env("LOG_LEVEL") {
            root["log_level"] = serde_json::json!(v);
        }
        if let Some(v) = env("LOG_FILE") {
            root["log_file"] = serde_json::json!(v);
        }

        root
    }
}

/// Recursive merge: objects merge key-wise, everything else overrides.
fn merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => merge(slot, value),
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

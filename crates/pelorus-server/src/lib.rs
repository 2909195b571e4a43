use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use pelorus_collector::DailyScheduler;
use pelorus_core::AppConfig;
use pelorus_store::MonitorStore;
use pelorus_tickets::ApprovalWorkflow;

mod http;
mod webhook;

pub use http::{serve, serve_webhook};
pub use webhook::verify_signature;

/// Credentials accepted for the dashboard's basic-auth seed and fallback.
#[derive(Clone)]
pub struct DashboardAuth {
    pub username: String,
    pub password: String,
}

/// Everything the HTTP surface needs, passed explicitly; no globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<MonitorStore>,
    pub scheduler: Arc<DailyScheduler>,
    pub approvals: Arc<ApprovalWorkflow>,
    pub auth: DashboardAuth,
    pub bearer_tokens: Arc<RwLock<HashSet<String>>>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<MonitorStore>,
        scheduler: Arc<DailyScheduler>,
        approvals: Arc<ApprovalWorkflow>,
        auth: DashboardAuth,
    ) -> Self {
        Self {
            config,
            store,
            scheduler,
            approvals,
            auth,
            bearer_tokens: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn chat_signing_secret(&self) -> Option<&str> {
        self.config
            .chat
            .as_ref()
            .and_then(|c| c.signing_secret.as_deref())
    }
}

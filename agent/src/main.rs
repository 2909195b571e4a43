use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use pelorus_collector::{
    CollectorConfig, DailyScheduler, FanOutCollector, MonitorPipeline, RunLogger, TicketEscalator,
};
use pelorus_core::{AlertManager, AppConfig, SlaAnalyzer};
use pelorus_observability::ProcessKind;
use pelorus_probe::{PingSource, ProbeClient};
use pelorus_server::{AppState, DashboardAuth};
use pelorus_store::MonitorStore;
use pelorus_tickets::{
    ApprovalSettings, ApprovalWorkflow, ChatNotifier, ChatSettings, DuplicateRule, SeverityLadder,
    TicketWorkflow, TrackerClient, TrackerConnection,
};
use pelorus_types::Alert;

#[derive(Parser, Debug)]
#[command(name = "pelorus-agent")]
#[command(about = "Fleet infrastructure monitoring agent")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "PELORUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daily scheduler and the dashboard API until interrupted.
    Serve,
    /// Execute one monitoring run immediately and print the report.
    Run,
    /// Test connectivity to every vessel database and the tracker.
    Check,
    /// Delete history older than the retention window.
    Cleanup {
        #[arg(long, default_value_t = 90)]
        days_to_keep: i64,
    },
}

// Exit codes: 0 on clean shutdown, 1 on fatal startup or migration
// failure (the Err path out of main).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let logs_dir =
        pelorus_observability::canonical_logs_dir_from_root(state_root(&config.database_path));
    let (_log_guard, log_info) = pelorus_observability::init_process_logging(
        ProcessKind::Agent,
        &logs_dir,
        &config.log_level,
        14,
    )?;
    info!(logs_dir = %log_info.logs_dir, "logging initialized");

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Run => run_once(config).await,
        Command::Check => check_connections(config).await,
        Command::Cleanup { days_to_keep } => cleanup(config, days_to_keep).await,
    }
}

fn state_root(database_path: &str) -> &Path {
    Path::new(database_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Adapter from the ticket workflow onto the pipeline's escalation seam.
struct WorkflowEscalator(Arc<TicketWorkflow>);

#[async_trait]
impl TicketEscalator for WorkflowEscalator {
    async fn escalate(&self, alerts: &[Alert]) -> usize {
        self.0.escalate_alerts(alerts).await
    }
}

struct AgentContext {
    config: Arc<AppConfig>,
    store: Arc<MonitorStore>,
    scheduler: Arc<DailyScheduler>,
    approvals: Arc<ApprovalWorkflow>,
}

/// Wire the whole agent together. Startup fails (exit 1) on config, store
/// or migration problems.
async fn build_context(config: AppConfig) -> anyhow::Result<AgentContext> {
    let config = Arc::new(config);
    let store = Arc::new(
        MonitorStore::open(Path::new(&config.database_path))
            .await
            .context("opening monitoring store")?,
    );

    let mut probes: Vec<Arc<dyn PingSource>> = Vec::new();
    for vessel_id in config.vessel_ids() {
        let db = config.vessel(&vessel_id)?;
        let probe = ProbeClient::new(vessel_id.clone(), db.connection(), db.mapping())
            .with_context(|| format!("building probe for vessel `{vessel_id}`"))?;
        probes.push(Arc::new(probe));
    }

    let approvals = Arc::new(ApprovalWorkflow::new(ApprovalSettings {
        default_timeout_minutes: config.ticket_policy.default_timeout_minutes,
        max_pending_requests: config.ticket_policy.max_pending_requests,
        auto_cleanup_hours: config.ticket_policy.auto_cleanup_hours,
        poll_interval: Duration::from_secs(30),
    }));

    let escalator: Option<Arc<dyn TicketEscalator>> = match &config.tracker {
        Some(tracker) => {
            let tracker_client = TrackerClient::new(TrackerConnection {
                url: tracker.url.clone(),
                username: tracker.username.clone(),
                api_token: tracker.api_token.clone(),
                project_key: tracker.project_key.clone(),
                issue_type: tracker.issue_type.clone(),
            })?;
            let chat = match &config.chat {
                Some(chat) => Some(ChatNotifier::new(ChatSettings {
                    webhook_url: chat.webhook_url.clone(),
                    channel: chat.channel.clone(),
                    username: chat.username.clone(),
                    icon_emoji: chat.icon_emoji.clone(),
                })?),
                None => None,
            };
            let workflow = Arc::new(TicketWorkflow::new(
                tracker_client,
                chat,
                approvals.clone(),
                store.clone(),
                DuplicateRule {
                    window_hours: config.ticket_policy.duplicate_window_hours,
                    max_tickets_per_component: config.ticket_policy.max_tickets_per_component,
                    allow_severity_escalation: config.ticket_policy.allow_severity_escalation,
                },
                SeverityLadder {
                    critical_after_days: config.ticket_policy.critical_after_days,
                    high_after_days: config.ticket_policy.high_after_days,
                },
            ));
            Some(Arc::new(WorkflowEscalator(workflow)))
        }
        None => {
            warn!("no tracker configured, persistent downtime will alert but not ticket");
            None
        }
    };

    let collector = FanOutCollector::new(
        probes,
        CollectorConfig {
            window_hours: config.sla_parameters.monitoring_window_hours,
            ..CollectorConfig::default()
        },
    );
    let pipeline = Arc::new(MonitorPipeline::new(
        collector,
        SlaAnalyzer::new(config.sla_parameters.clone(), store.clone()),
        AlertManager::new(config.sla_parameters.clone(), store.clone()),
        RunLogger::new(store.clone()),
        escalator,
    ));
    pipeline
        .restore_state()
        .await
        .context("restoring in-memory state from store")?;

    let scheduler = Arc::new(DailyScheduler::new(config.scheduling.clone(), pipeline)?);

    Ok(AgentContext {
        config,
        store,
        scheduler,
        approvals,
    })
}

fn dashboard_auth() -> DashboardAuth {
    let username = std::env::var("DASHBOARD_USERNAME").unwrap_or_else(|_| "admin".to_string());
    let password = match std::env::var("DASHBOARD_PASSWORD") {
        Ok(password) if !password.trim().is_empty() => password,
        _ => {
            warn!("DASHBOARD_PASSWORD not set, dashboard uses a default credential");
            "pelorus".to_string()
        }
    };
    DashboardAuth { username, password }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;

    let recovery = ctx.store.recovery_info().await?;
    info!(
        active_violations = recovery.active_violations,
        pending_tickets = recovery.pending_tickets,
        "recovered state from store"
    );

    // Daily trigger loop.
    let scheduler_task = tokio::spawn(ctx.scheduler.clone().run_loop());

    // Approval timeout/cleanup sweep.
    let approvals = ctx.approvals.clone();
    let sweep_cancel = ctx.scheduler.cancel_token();
    let sweep_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                () = sweep_cancel.cancelled() => return,
                _ = tick.tick() => {
                    approvals.cleanup_expired().await;
                }
            }
        }
    });

    // Dashboard + webhook surface.
    let addr: SocketAddr = format!(
        "{}:{}",
        ctx.config.web_server.host, ctx.config.web_server.port
    )
    .parse()
    .context("invalid web server host or port")?;
    let state = AppState::new(
        ctx.config.clone(),
        ctx.store.clone(),
        ctx.scheduler.clone(),
        ctx.approvals.clone(),
        dashboard_auth(),
    );
    let server_task = tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(err) = pelorus_server::serve(addr, state).await {
                error!(error = %err, "dashboard server exited");
            }
        }
    });

    // Chat callbacks get their own listener when configured on a
    // different port.
    let webhook_task = ctx.config.chat.as_ref().and_then(|chat| {
        if chat.webhook_port == ctx.config.web_server.port {
            return None;
        }
        let webhook_addr: SocketAddr =
            match format!("{}:{}", ctx.config.web_server.host, chat.webhook_port).parse() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(error = %err, "invalid chat webhook address, callbacks share the dashboard port");
                    return None;
                }
            };
        let state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = pelorus_server::serve_webhook(webhook_addr, state).await {
                error!(error = %err, "chat webhook server exited");
            }
        }))
    });

    info!(
        vessels = ctx.config.vessel_ids().len(),
        addr = %addr,
        "pelorus agent running"
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping scheduler");

    // Stop the scheduler first so in-flight probes abort at their next
    // await point, then let pending store writes settle.
    ctx.scheduler.shutdown();
    let _ = scheduler_task.await;
    let _ = sweep_task.await;
    server_task.abort();
    if let Some(task) = webhook_task {
        task.abort();
    }

    info!("shutdown complete");
    Ok(())
}

async fn run_once(config: AppConfig) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;
    let report = ctx.scheduler.execute_guarded().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn check_connections(config: AppConfig) -> anyhow::Result<()> {
    let tracker = config.tracker.clone();
    let ctx = build_context(config).await?;

    let results = ctx.scheduler.pipeline().collector().test_connections().await;
    let mut vessels: Vec<(&String, &bool)> = results.iter().collect();
    vessels.sort();
    for (vessel_id, ok) in vessels {
        println!("vessel {vessel_id}: {}", if *ok { "ok" } else { "FAILED" });
    }

    if let Some(tracker) = tracker {
        let client = TrackerClient::new(TrackerConnection {
            url: tracker.url,
            username: tracker.username,
            api_token: tracker.api_token,
            project_key: tracker.project_key,
            issue_type: tracker.issue_type,
        })?;
        let ok = client.test_connection().await;
        println!("tracker: {}", if ok { "ok" } else { "FAILED" });
    }

    Ok(())
}

async fn cleanup(config: AppConfig, days_to_keep: i64) -> anyhow::Result<()> {
    let store = MonitorStore::open(Path::new(&config.database_path)).await?;
    let report = store.cleanup_old_records(days_to_keep).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use pelorus_collector::SchedulerError;
use pelorus_types::ComponentKind;

use crate::webhook::{chat_health, chat_interactive};
use crate::AppState;

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<u32>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "dashboard api listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Serve only the chat webhook surface, for deployments that expose the
/// callback endpoint on its own port.
pub async fn serve_webhook(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/chat/interactive", post(chat_interactive))
        .route("/chat/health", get(chat_health))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "chat webhook listening");
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/fleet-overview", get(fleet_overview))
        .route("/api/vessel/{id}/details", get(vessel_details))
        .route("/api/sla-violations", get(sla_violations))
        .route("/api/scheduler-runs", get(scheduler_runs))
        .route("/api/scheduler-runs/active", get(active_run))
        .route("/api/scheduler-runs/{id}", get(run_details))
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/api/scheduler/trigger", post(trigger_run))
        .route("/api/approvals/pending", get(pending_approvals))
        .route("/api/approvals/statistics", get(approval_statistics))
        .route("/api/events", get(run_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    Router::new()
        .route("/api/auth/token", post(issue_token))
        .route("/chat/interactive", post(chat_interactive))
        .route("/chat/health", get(chat_health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

// ----------------------------------------------------------------------
// Auth
// ----------------------------------------------------------------------

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();

    if let Some(token) = bearer_token(headers) {
        if state.bearer_tokens.read().await.contains(&token) {
            return next.run(request).await;
        }
    }

    // Basic-auth fallback for simple clients.
    if let Some((user, pass)) = basic_credentials(headers) {
        if user == state.auth.username && pass == state.auth.password {
            return next.run(request).await;
        }
    }

    warn!("rejected unauthenticated dashboard request");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication required"})),
    )
        .into_response()
}

/// `POST /api/auth/token`: exchange basic credentials for a bearer token.
async fn issue_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some((user, pass)) = basic_credentials(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "basic credentials required"})),
        )
            .into_response();
    };
    if user != state.auth.username || pass != state.auth.password {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid credentials"})),
        )
            .into_response();
    }

    let token = Uuid::new_v4().to_string();
    state.bearer_tokens.write().await.insert(token.clone());
    Json(json!({"token": token, "token_type": "bearer"})).into_response()
}

// ----------------------------------------------------------------------
// Read-only dashboard surface
// ----------------------------------------------------------------------

fn store_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

async fn fleet_overview(State(state): State<AppState>) -> Response {
    let mut vessels = Vec::new();
    let mut components_below_sla = 0;
    let mut total_components = 0;
    let threshold = state.config.sla_parameters.uptime_threshold_percentage;

    for vessel_id in state.config.vessel_ids() {
        let mut components = serde_json::Map::new();
        for kind in ComponentKind::ALL {
            let trends = match state
                .store
                .component_status_trends(&vessel_id, kind, 7)
                .await
            {
                Ok(trends) => trends,
                Err(err) => return store_error(err),
            };
            if let Some(latest) = trends.last() {
                total_components += 1;
                if latest.uptime_percentage < threshold {
                    components_below_sla += 1;
                }
                components.insert(
                    kind.as_str().to_string(),
                    json!({
                        "uptime_percentage": latest.uptime_percentage,
                        "current_status": latest.current_status,
                        "downtime_aging_seconds": latest.downtime_aging_seconds,
                        "recorded_at": latest.recorded_at,
                    }),
                );
            } else {
                components.insert(kind.as_str().to_string(), Value::Null);
            }
        }
        vessels.push(json!({
            "vessel_id": vessel_id,
            "components": components,
        }));
    }

    let last_run = match state.store.get_system_state("last_monitoring_run").await {
        Ok(last_run) => last_run,
        Err(err) => return store_error(err),
    };

    Json(json!({
        "vessels": vessels,
        "total_vessels": state.config.vessel_ids().len(),
        "total_components": total_components,
        "components_below_sla": components_below_sla,
        "sla_threshold": threshold,
        "last_run": last_run,
    }))
    .into_response()
}

async fn vessel_details(
    State(state): State<AppState>,
    Path(vessel_id): Path<String>,
) -> Response {
    if state.config.vessel(&vessel_id).is_err() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown vessel `{vessel_id}`")})),
        )
            .into_response();
    }

    let mut trends = serde_json::Map::new();
    let mut alerts = Vec::new();
    let mut tickets = Vec::new();
    for kind in ComponentKind::ALL {
        match state
            .store
            .component_status_trends(&vessel_id, kind, 7)
            .await
        {
            Ok(points) => {
                trends.insert(kind.as_str().to_string(), json!(points));
            }
            Err(err) => return store_error(err),
        }
        match state.store.alerts_for(&vessel_id, kind, false).await {
            Ok(mut open) => alerts.append(&mut open),
            Err(err) => return store_error(err),
        }
        match state.store.open_tickets_for(&vessel_id, kind).await {
            Ok(mut open) => tickets.append(&mut open),
            Err(err) => return store_error(err),
        }
    }

    let violations = match state.store.open_violations(Some(&vessel_id), None).await {
        Ok(violations) => violations,
        Err(err) => return store_error(err),
    };

    Json(json!({
        "vessel_id": vessel_id,
        "status_trends": trends,
        "open_violations": violations,
        "open_alerts": alerts,
        "open_tickets": tickets,
    }))
    .into_response()
}

async fn sla_violations(State(state): State<AppState>) -> Response {
    let active = match state.store.open_violations(None, None).await {
        Ok(active) => active,
        Err(err) => return store_error(err),
    };
    let recent = match state.store.violation_history(None, None, 30).await {
        Ok(recent) => recent,
        Err(err) => return store_error(err),
    };
    let stats = match state.store.violation_duration_stats(None, 30).await {
        Ok(stats) => stats,
        Err(err) => return store_error(err),
    };

    Json(json!({
        "active": active,
        "recent": recent,
        "duration_statistics": stats,
    }))
    .into_response()
}

async fn scheduler_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Response {
    match state.store.recent_runs(query.limit.unwrap_or(20)).await {
        Ok(runs) => Json(json!({"runs": runs})).into_response(),
        Err(err) => store_error(err),
    }
}

async fn run_details(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.store.run_details(&run_id).await {
        Ok(Some(details)) => Json(json!({
            "run": details.run,
            "vessel_results": details.vessel_results,
            "retry_summary": details.retry_summary,
            "retry_statistics": details.retry_statistics(),
            "failed_vessels": details.failed_vessels(),
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown run `{run_id}`")})),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn active_run(State(state): State<AppState>) -> Response {
    match state.store.active_run().await {
        Ok(run) => Json(json!({"active": run})).into_response(),
        Err(err) => store_error(err),
    }
}

async fn scheduler_status(State(state): State<AppState>) -> Response {
    let status = state.scheduler.status(state.scheduler.is_running());
    Json(json!(status)).into_response()
}

/// `POST /api/scheduler/trigger`: manual "run now". Reuses the scheduled
/// path, so the single-instance guard applies; a busy scheduler is a 409.
async fn trigger_run(State(state): State<AppState>) -> Response {
    if state.scheduler.is_running() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "a monitoring run is already in progress"})),
        )
            .into_response();
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        match scheduler.execute_guarded().await {
            Ok(report) => info!(run_id = %report.run_id, "manual monitoring run finished"),
            Err(SchedulerError::Busy) => warn!("manual trigger lost the race to a scheduled run"),
            Err(err) => warn!(error = %err, "manual monitoring run failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "triggered"})),
    )
        .into_response()
}

async fn pending_approvals(State(state): State<AppState>) -> Response {
    let pending = state.approvals.pending_requests().await;
    Json(json!({"pending": pending})).into_response()
}

async fn approval_statistics(State(state): State<AppState>) -> Response {
    Json(json!(state.approvals.statistics().await)).into_response()
}

/// `GET /api/events`: run progress as server-sent events.
async fn run_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.scheduler.pipeline().run_logger().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|event| {
        event.ok().map(|event| {
            Ok(Event::default()
                .event("run")
                .data(serde_json::to_string(&event).unwrap_or_default()))
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use pelorus_collector::{
        CollectorConfig, DailyScheduler, FanOutCollector, MonitorPipeline, RunLogger,
    };
    use pelorus_core::{AlertManager, AppConfig, SlaAnalyzer, SlaParameters};
    use pelorus_store::MonitorStore;
    use pelorus_tickets::{ApprovalSettings, ApprovalWorkflow};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MonitorStore::open(&dir.path().join("pelorus.db"))
                .await
                .unwrap(),
        );
        let config: AppConfig = serde_json::from_value(json!({
            "vessel_databases": {
                "mv-aurora": {
                    "url": "http://aurora.fleet.local:8086",
                    "token": "t",
                    "bucket": "pings"
                }
            }
        }))
        .unwrap();

        let pipeline = Arc::new(MonitorPipeline::new(
            FanOutCollector::new(vec![], CollectorConfig::default()),
            SlaAnalyzer::new(SlaParameters::default(), store.clone()),
            AlertManager::new(SlaParameters::default(), store.clone()),
            RunLogger::new(store.clone()),
            None,
        ));
        let scheduler =
            Arc::new(DailyScheduler::new(config.scheduling.clone(), pipeline).unwrap());

        let state = AppState::new(
            Arc::new(config),
            store,
            scheduler,
            Arc::new(ApprovalWorkflow::new(ApprovalSettings::default())),
            crate::DashboardAuth {
                username: "admin".into(),
                password: "anchor-chain".into(),
            },
        );
        (dir, state)
    }

    fn basic_auth_header() -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("admin:anchor-chain")
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn protected_routes_require_auth() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::get("/api/fleet-overview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn basic_auth_fallback_works() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::get("/api/fleet-overview")
                    .header(header::AUTHORIZATION, basic_auth_header())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_vessels"], 1);
    }

    #[tokio::test]
    async fn token_flow_issues_and_accepts_bearer() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/api/auth/token")
                    .header(header::AUTHORIZATION, basic_auth_header())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = body_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(
                HttpRequest::get("/api/scheduler/status")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["timezone"], "UTC");
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected_for_tokens() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::post("/api/auth/token")
                    .header(
                        header::AUTHORIZATION,
                        format!(
                            "Basic {}",
                            base64::engine::general_purpose::STANDARD.encode("admin:wrong")
                        ),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_vessel_details_is_404() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::get("/api/vessel/mv-nautilus/details")
                    .header(header::AUTHORIZATION, basic_auth_header())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_run_is_404_and_active_is_null_when_idle() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/api/scheduler-runs/not-a-run")
                    .header(header::AUTHORIZATION, basic_auth_header())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(
                HttpRequest::get("/api/scheduler-runs/active")
                    .header(header::AUTHORIZATION, basic_auth_header())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["active"].is_null());
    }

    #[tokio::test]
    async fn chat_health_is_public() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::get("/chat/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_interactive_rejects_missing_payload() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::post("/chat/interactive")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("nonsense=1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Reject callbacks whose timestamp is older than this, to stop replays.
const MAX_TIMESTAMP_AGE_SECONDS: i64 = 300;

#[derive(Debug, Deserialize)]
struct InteractionForm {
    payload: String,
}

/// Verify `v0=<hex hmac-sha256 of "v0:<ts>:<body>">` against the signing
/// secret, with a freshness bound on the timestamp.
pub fn verify_signature(
    secret: &str,
    signature: &str,
    timestamp: &str,
    body: &[u8],
    now_epoch: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_epoch - ts).abs() > MAX_TIMESTAMP_AGE_SECONDS {
        return false;
    }

    let Some(provided) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// `POST /chat/interactive`: the inbound button-callback endpoint. The
/// signature is checked over the raw body before anything is parsed.
pub async fn chat_interactive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = state.chat_signing_secret() {
        let signature = headers
            .get("X-Chat-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let timestamp = headers
            .get("X-Chat-Request-Timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, signature, timestamp, &body, Utc::now().timestamp()) {
            warn!("rejected chat callback with invalid signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid request signature"})),
            );
        }
    }

    let form: InteractionForm = match serde_urlencoded::from_bytes(&body) {
        Ok(form) => form,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "no payload provided"})),
            );
        }
    };

    let payload: Value = match serde_json::from_str(&form.payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "chat callback carried invalid json payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid json payload"})),
            );
        }
    };

    let response = pelorus_tickets::handle_interaction(&state.approvals, &payload).await;
    info!("handled chat interaction");
    (StatusCode::OK, Json(response))
}

pub async fn chat_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "chat_webhook",
        "timestamp": Utc::now(),
    }))
}

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::ceil_secs;
use crate::decision::RejectReason;
use crate::engine::{CallerIdentity, EngineHealth, QuotaEngine};
use crate::error::QuotaError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QuotaEngine>,
}

impl AppState {
    pub fn new(engine: Arc<QuotaEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateCheckRequest {
    pub scope_id: String,
    pub tier: String,
}

#[derive(Debug, Deserialize)]
pub struct QuotaCheckRequest {
    pub scope_id: String,
    pub tier: String,
    #[serde(default)]
    pub exempt: bool,
}

#[derive(Debug, Deserialize)]
pub struct AbuseCheckRequest {
    pub scope_id: String,
    pub tier: String,
    pub message: String,
    pub conversation_length: u64,
}

#[derive(Debug, Deserialize)]
pub struct AdmitMessageRequest {
    #[serde(flatten)]
    pub caller: CallerIdentity,
    pub message: String,
    pub conversation_length: u64,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub scope_id: String,
    pub tier: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub engine: EngineHealth,
}

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

fn rate_limit_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, reset_secs: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_secs));
}

/// A fail-closed backend rejection is an outage, not the caller's fault.
fn rejection_status(reason: Option<RejectReason>) -> StatusCode {
    match reason {
        Some(RejectReason::BackendUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::TOO_MANY_REQUESTS,
    }
}

fn reject(resp: &mut Response, reason: Option<RejectReason>, retry_after: Option<u64>) {
    *resp.status_mut() = rejection_status(reason);
    if let Some(secs) = retry_after {
        resp.headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
}

/// Sliding-window rate check
pub async fn check_rate(
    State(state): State<AppState>,
    Json(payload): Json<RateCheckRequest>,
) -> Result<Response, QuotaError> {
    let decision = state
        .engine
        .check_rate(&payload.scope_id, &payload.tier)
        .await?;

    let mut resp = Json(&decision).into_response();
    rate_limit_headers(
        resp.headers_mut(),
        decision.limit,
        decision.remaining,
        decision.reset_at,
    );

    if !decision.allowed {
        reject(&mut resp, decision.reason, decision.retry_after);
    }

    Ok(resp)
}

/// Daily quota check; consumes one unit when allowed
pub async fn check_quota(
    State(state): State<AppState>,
    Json(payload): Json<QuotaCheckRequest>,
) -> Result<Response, QuotaError> {
    let decision = state
        .engine
        .check_quota(&payload.scope_id, &payload.tier, payload.exempt)
        .await?;

    let mut resp = Json(&decision).into_response();
    if let (Some(limit), Some(remaining)) = (decision.limit, decision.remaining) {
        rate_limit_headers(resp.headers_mut(), limit, remaining, decision.reset_at / 1000);
    }

    if !decision.allowed {
        let wait_ms = decision.reset_at.saturating_sub(state.engine.now_ms());
        reject(&mut resp, decision.reason, Some(ceil_secs(wait_ms)));
    }

    Ok(resp)
}

pub async fn check_abuse(
    State(state): State<AppState>,
    Json(payload): Json<AbuseCheckRequest>,
) -> Result<Response, QuotaError> {
    let decision = state
        .engine
        .check_abuse(
            &payload.scope_id,
            &payload.tier,
            &payload.message,
            payload.conversation_length,
        )
        .await?;

    let mut resp = Json(&decision).into_response();
    if !decision.allowed {
        reject(&mut resp, decision.reason, None);
    }

    Ok(resp)
}

/// Abuse heuristics then quota, for one chat message
pub async fn admit_message(
    State(state): State<AppState>,
    Json(payload): Json<AdmitMessageRequest>,
) -> Result<Response, QuotaError> {
    let decision = state
        .engine
        .admit_message(&payload.caller, &payload.message, payload.conversation_length)
        .await?;

    let mut resp = Json(&decision).into_response();
    if let Some(quota) = &decision.quota {
        if let (Some(limit), Some(remaining)) = (quota.limit, quota.remaining) {
            rate_limit_headers(resp.headers_mut(), limit, remaining, quota.reset_at / 1000);
        }
    }

    if !decision.allowed {
        let retry_after = match decision.reason {
            Some(RejectReason::QuotaExceeded) => decision.quota.as_ref().map(|q| {
                ceil_secs(q.reset_at.saturating_sub(state.engine.now_ms()))
            }),
            _ => None,
        };
        reject(&mut resp, decision.reason, retry_after);
    }

    Ok(resp)
}

/// Read-only usage for a scope
pub async fn get_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, QuotaError> {
    let usage = state.engine.peek_usage(&query.scope_id, &query.tier).await?;
    Ok(Json(usage))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.engine.health().await;
    let status = if engine.degraded { "degraded" } else { "healthy" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        engine,
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.engine.health().await;

    if health.store_reachable {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": health.store,
            })),
        )
    } else if health.store == "failover" {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": health.store,
                "note": "Distributed store unreachable, enforcing per-instance limits"
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": health.store,
            })),
        )
    }
}

//! Gateway handler
//! Mission: the single reverse-proxy entry point. Implements the
//! route-dependent ingress stages (size gate, rate limit, token
//! verification) that cannot live in generic middleware because they need
//! the resolved route's metadata, then either serves the route locally or
//! forwards it to the mapped backend.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use reqwest::Method as ReqMethod;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{extract_token, JwtHandler};
use crate::budget::{ApprovalDecision, BudgetEngine, SpendKind, SpendRequest};
use crate::error::{ApiError, Envelope};
use crate::metrics::{MetricRecord, MetricsRing};
use crate::middleware::{RateLimitOutcome, RateLimiter};
use crate::models::{new_correlation_id, CallerIdentity, Config};
use crate::registry::Dispatcher;
use crate::route_table::{AuthRequirement, ForwardingMode, RateLimitClass, RouteTable};
use crate::ws_hub::RealtimeHub;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub route_table: Arc<RouteTable>,
    pub metrics: Arc<MetricsRing>,
    pub rate_limiter: Arc<RateLimiter>,
    pub jwt: Arc<JwtHandler>,
    pub hub: Arc<RealtimeHub>,
    pub budget: Arc<BudgetEngine>,
    pub started_at: chrono::DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route(
            "/api/v1/budget/:user_id/evaluate",
            axum::routing::post(evaluate_spend),
        )
        .route(
            "/api/v1/budget/:user_id/confirm-limit-change",
            axum::routing::post(confirm_limit_change),
        )
        .route(
            "/api/v1/budget/:user_id/emergency-stop/resolve",
            axum::routing::post(resolve_emergency_stop),
        )
        .fallback(gateway_handler)
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> Response {
    let token = extract_token(&headers, params.get("token").map(|s| format!("token={s}")).as_deref());
    let Some(token) = token else {
        return ApiError::Unauthenticated.into_response();
    };
    let claims = match state.jwt.validate_token(&token) {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    let identity = claims.into_identity();
    ws.on_upgrade(move |socket| state.hub.handle_connection(socket, identity.user_id))
}

fn client_ip(headers: &HeaderMap, fallback: SocketAddr) -> IpAddr {
    headers
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .unwrap_or(fallback.ip())
}

/// The single fallback entry point: every method, every path not served by
/// an explicit route (currently only `/ws`) lands here.
async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let start = Instant::now();
    let correlation_id = req
        .extensions()
        .get::<crate::middleware::CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(new_correlation_id);

    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let mut split = pair.splitn(2, '=');
                    Some((split.next()?.to_string(), split.next().unwrap_or("").to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let Some(route_match) = state.route_table.resolve(&method, &path) else {
        return finish(&state, &correlation_id, start, &method, &path, None, None, ApiError::NotFound.into_response());
    };
    let entry = route_match.entry.clone();

    let body_bytes = match to_bytes(body, state.config.body_size_limit_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return finish(&state, &correlation_id, start, &method, &path, None, None, ApiError::PayloadTooLarge.into_response());
        }
    };

    let ip = client_ip(&parts.headers, addr);
    let rate_limit_outcome = state.rate_limiter.check(ip, entry.rate_limit_class);
    if let Some(outcome) = &rate_limit_outcome {
        if !outcome.allowed {
            let err = ApiError::RateLimited { retry_after_secs: outcome.retry_after.as_secs() };
            return finish(&state, &correlation_id, start, &method, &path, None, rate_limit_outcome, err.into_response());
        }
    }

    let raw_query = parts.uri.query().unwrap_or("");
    let token = extract_token(&parts.headers, Some(raw_query));
    let caller = match (entry.auth, token) {
        (AuthRequirement::NoAuth, _) => None,
        (AuthRequirement::Optional, None) => None,
        (AuthRequirement::Optional, Some(tok)) => state.jwt.validate_token(&tok).ok().map(|c| c.into_identity()),
        (AuthRequirement::Required, None) => {
            return finish(&state, &correlation_id, start, &method, &path, None, rate_limit_outcome, ApiError::Unauthenticated.into_response());
        }
        (AuthRequirement::Required, Some(tok)) => match state.jwt.validate_token(&tok) {
            Ok(claims) => Some(claims.into_identity()),
            Err(err) => {
                return finish(&state, &correlation_id, start, &method, &path, None, rate_limit_outcome, err.into_response());
            }
        },
    };
    let caller_user_id = caller.as_ref().map(|c| c.user_id.clone());

    if entry.forwarding == ForwardingMode::Local {
        let response = serve_local(&state, &path, &method, &body_bytes, caller.as_ref()).await;
        return finish(&state, &correlation_id, start, &method, &path, caller_user_id, rate_limit_outcome, response);
    }

    let body_json: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };

    // Scenario F: a trade execution must clear risk-management validation
    // before it ever reaches the trading service.
    if entry.service == "trading" && route_match.upstream_path == "/trades/execute" {
        let Some(user) = caller.as_ref() else {
            return finish(&state, &correlation_id, start, &method, &path, None, rate_limit_outcome, ApiError::Unauthenticated.into_response());
        };
        match validate_trade(&state, user, body_json.clone(), &correlation_id).await {
            Ok(None) => {}
            Ok(Some(reason)) => {
                let err = ApiError::Validation(reason);
                return finish(&state, &correlation_id, start, &method, &path, caller_user_id, rate_limit_outcome, err.into_response());
            }
            Err(err) => {
                return finish(&state, &correlation_id, start, &method, &path, caller_user_id, rate_limit_outcome, err.into_response());
            }
        }
    }

    let reqwest_method = to_reqwest_method(&method);
    let params: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let result = state
        .dispatcher
        .call(entry.service, reqwest_method, &route_match.upstream_path, body_json, Some(&params), &correlation_id)
        .await;

    let response = match result {
        Ok(dispatch) => {
            let status = StatusCode::from_u16(dispatch.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(dispatch.body)).into_response()
        }
        Err(err) => err.into_response(),
    };

    finish(&state, &correlation_id, start, &method, &path, caller_user_id, rate_limit_outcome, response)
}

/// Calls risk-management's `/validate-trade` and checks `approved == true`
/// in the response body. Returns the rejection reason
/// (surfaced to the client as a 400) when the trade is not approved.
async fn validate_trade(
    state: &AppState,
    user: &CallerIdentity,
    body: Option<Value>,
    correlation_id: &str,
) -> Result<Option<String>, ApiError> {
    let mut payload = body.unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut payload {
        map.insert("userId".to_string(), json!(user.user_id));
    }
    let response = state
        .dispatcher
        .call("risk-management", ReqMethod::POST, "/validate-trade", Some(payload), None, correlation_id)
        .await?;
    let approved = response.body.get("approved").and_then(Value::as_bool).unwrap_or(false);
    if approved {
        Ok(None)
    } else {
        let reason = response
            .body
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("trade rejected by risk management")
            .to_string();
        Ok(Some(reason))
    }
}

fn to_reqwest_method(method: &Method) -> ReqMethod {
    ReqMethod::from_bytes(method.as_str().as_bytes()).unwrap_or(ReqMethod::GET)
}

async fn serve_local(
    state: &AppState,
    path: &str,
    method: &Method,
    body: &axum::body::Bytes,
    caller: Option<&CallerIdentity>,
) -> Response {
    match (method.as_str(), path) {
        ("GET", "/health") | ("GET", "/api/health") => Envelope::ok(json!({
            "status": "ok",
            "uptimeSeconds": Utc::now().signed_duration_since(state.started_at).num_seconds(),
        }))
        .into_response(),
        ("GET", "/api/status") => Envelope::ok(json!({
            "status": "ok",
            "connections": state.hub.connection_count(),
            "users": state.hub.user_count(),
        }))
        .into_response(),
        ("GET", "/api/metrics") => {
            let summary = state.metrics.summary(chrono::Duration::seconds(state.config.metrics_rolling_window_secs));
            Envelope::ok(summary).into_response()
        }
        ("GET", "/api/performance") => {
            let top = state.metrics.top_endpoints(10, chrono::Duration::seconds(state.config.metrics_rolling_window_secs));
            Envelope::ok(json!({ "topEndpoints": top })).into_response()
        }
        ("GET", "/api/v1/websocket/status") => Envelope::ok(json!({
            "connections": state.hub.connection_count(),
            "users": state.hub.user_count(),
        }))
        .into_response(),
        ("POST", "/api/v1/websocket/test-message") => {
            let Some(caller) = caller else { return ApiError::Unauthenticated.into_response() };
            let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
            state.hub.send_to_user(
                &caller.user_id,
                &crate::ws_hub::ServerEvent::SystemNotification(payload),
            );
            Envelope::ok(json!({ "delivered": true })).into_response()
        }
        _ => ApiError::NotFound.into_response(),
    }
}

fn finish(
    state: &AppState,
    correlation_id: &str,
    start: Instant,
    method: &Method,
    path: &str,
    caller_user_id: Option<String>,
    rate_limit: Option<RateLimitOutcome>,
    mut response: Response,
) -> Response {
    let status = response.status().as_u16();
    state.metrics.append(MetricRecord {
        correlation_id: correlation_id.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency: start.elapsed(),
        caller_user_id,
        client_addr: None,
        user_agent: None,
        received_at: Utc::now(),
    });
    if status >= 500 {
        warn!(correlation_id, method = %method, path, status, "request completed with server error");
    } else {
        info!(correlation_id, method = %method, path, status, latency_ms = start.elapsed().as_millis() as u64, "request completed");
    }
    let headers = response.headers_mut();
    headers.insert("X-Request-ID", correlation_id.parse().unwrap());
    if let Some(outcome) = rate_limit {
        if let Ok(limit) = outcome.limit.to_string().parse() {
            headers.insert("RateLimit-Limit", limit);
        }
        if let Ok(remaining) = outcome.remaining.to_string().parse() {
            headers.insert("RateLimit-Remaining", remaining);
        }
    }
    response
}

/// Evaluates a proposed spend against the caller's budget. Not part of the
/// forwarding table since it consults in-process state rather than an
/// upstream service.
pub async fn evaluate_spend(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<SpendEvaluateRequest>,
) -> Response {
    let request = SpendRequest {
        user_id,
        amount: payload.amount,
        moment_id: payload.moment_id,
        strategy: payload.strategy,
        kind: if payload.sell { SpendKind::Sell } else { SpendKind::Buy },
        device_id: payload.device_id,
        geo: payload.geo,
    };
    let result = state.budget.evaluate(request).await;
    match result.decision {
        ApprovalDecision::Approved => Envelope::ok(json!({
            "decision": "approved",
            "warnings": result.warnings,
            "suspicionScore": result.suspicion_score,
        }))
        .into_response(),
        ApprovalDecision::RequiresConfirmation => ApiError::NeedsVerification.into_response(),
        ApprovalDecision::Rejected => ApiError::BudgetExceeded {
            window: result.reason.unwrap_or_default(),
        }
        .into_response(),
    }
}

#[derive(serde::Deserialize)]
pub struct SpendEvaluateRequest {
    pub amount: rust_decimal::Decimal,
    #[serde(default)]
    pub moment_id: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub sell: bool,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub geo: Option<String>,
}

/// Confirms or discards a significant limit change that was stashed as
/// pending by `BudgetEngine::set_limits`.
pub async fn confirm_limit_change(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<ConfirmLimitChangeRequest>,
) -> Response {
    match state.budget.confirm_limit_change(&user_id, payload.confirm).await {
        Ok(()) => Envelope::ok(json!({ "confirmed": payload.confirm })).into_response(),
        Err(reason) => ApiError::Validation(reason).into_response(),
    }
}

#[derive(serde::Deserialize)]
pub struct ConfirmLimitChangeRequest {
    pub confirm: bool,
}

/// Resolves an active emergency stop so the user can transact again.
pub async fn resolve_emergency_stop(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ResolveEmergencyStopRequest>,
) -> Response {
    let resolved_by = extract_token(&headers, None)
        .and_then(|tok| state.jwt.validate_token(&tok).ok())
        .map(|claims| claims.into_identity().user_id)
        .unwrap_or(payload.resolved_by);
    match state.budget.resolve_emergency_stop(&user_id, resolved_by).await {
        Ok(()) => Envelope::ok(json!({ "resolved": true })).into_response(),
        Err(reason) => ApiError::Validation(reason).into_response(),
    }
}

#[derive(serde::Deserialize, Default)]
pub struct ResolveEmergencyStopRequest {
    #[serde(default)]
    pub resolved_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let fallback: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(client_ip(&headers, fallback), "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_ip_falls_back_to_socket_addr() {
        let headers = HeaderMap::new();
        let fallback: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(client_ip(&headers, fallback), fallback.ip());
    }
}

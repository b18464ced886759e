//! End-to-end tests that drive the assembled gateway router the way a real
//! client would: through `tower::ServiceExt::oneshot`, with stub upstream
//! services standing in for user/trading/risk-management.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tower::ServiceExt;
use tradeplane_core::auth::{Claims, JwtHandler};
use tradeplane_core::budget::{BudgetEngine, BudgetEngineConfig, BudgetLimits};
use tradeplane_core::gateway::{self, AppState};
use tradeplane_core::metrics::MetricsRing;
use tradeplane_core::middleware::{RateLimitConfig, RateLimiter};
use tradeplane_core::models::Config;
use tradeplane_core::registry::{Dispatcher, ServiceDescriptor, ServiceRegistry};
use tradeplane_core::route_table::RouteTable;
use tradeplane_core::store::SqliteStore;
use tradeplane_core::ws_hub::RealtimeHub;

const JWT_SECRET: &str = "integration-test-secret";

fn test_token(user_id: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        username: format!("{user_id}-name"),
        role: "trader".to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

/// Spawns a minimal stub backend and returns its base URL. Used in place of
/// the real user/trading/risk-management services for dispatcher tests.
async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    format!("http://{addr}")
}

fn base_config(user_url: String, trading_url: String, risk_url: String) -> Config {
    Config {
        port: 0,
        jwt_secret: JWT_SECRET.to_string(),
        production: false,
        log_level: "info".to_string(),
        user_service_url: user_url,
        ai_scouting_service_url: "http://localhost:4002".to_string(),
        marketplace_monitor_service_url: "http://localhost:4003".to_string(),
        trading_service_url: trading_url,
        notification_service_url: "http://localhost:4004".to_string(),
        risk_management_service_url: risk_url,
        strategy_service_url: "http://localhost:4005".to_string(),
        execution_primary_url: "http://localhost:4006".to_string(),
        execution_secondary_url: "http://localhost:4007".to_string(),
        rate_limit_window_secs: 900,
        rate_limit_capacity: 100,
        rate_limit_auth_capacity: 2,
        body_size_limit_bytes: 1_000_000,
        health_check_interval_secs: 30,
        health_check_timeout_secs: 5,
        reset_scheduler_interval_secs: 60,
        database_path: ":memory:".to_string(),
        metrics_ring_capacity: 1000,
        metrics_rolling_window_secs: 300,
        price_update_interval_ms: 60_000,
        price_change_threshold_pct: Decimal::new(10, 2),
        price_history_retention_days: 30,
        volume_spike_multiple: Decimal::from(3),
        arbitrage_scan_interval_ms: 30_000,
        arbitrage_min_profit_pct: Decimal::new(5, 2),
        arbitrage_min_profit_amount: Decimal::from(1),
        arbitrage_max_risk_score: 70,
        arbitrage_ttl_secs: 300,
        default_daily_cap: Decimal::from(1000),
        default_weekly_cap: Decimal::from(5000),
        default_monthly_cap: Decimal::from(20000),
        default_total_budget: Decimal::from(100000),
        default_max_per_item: Decimal::from(500),
        default_emergency_threshold: Decimal::from(900),
        default_reserve: Decimal::ZERO,
        default_currency: "USD".to_string(),
        budget_warning_threshold: Decimal::new(50, 2),
        suspicious_hourly_max: 5,
        suspicious_daily_max: 20,
        suspicious_amount_ratio_threshold: Decimal::from(5),
        suspicious_rapid_fire_secs: 10,
    }
}

fn test_state(config: Config) -> AppState {
    let registry = ServiceRegistry::new(vec![
        ServiceDescriptor {
            name: "user".to_string(),
            base_endpoint: config.user_service_url.clone(),
            timeout: std::time::Duration::from_secs(5),
            max_retries: 1,
            auth_header: None,
        },
        ServiceDescriptor {
            name: "trading".to_string(),
            base_endpoint: config.trading_service_url.clone(),
            timeout: std::time::Duration::from_secs(5),
            max_retries: 1,
            auth_header: None,
        },
        ServiceDescriptor {
            name: "risk-management".to_string(),
            base_endpoint: config.risk_management_service_url.clone(),
            timeout: std::time::Duration::from_secs(5),
            max_retries: 1,
            auth_header: None,
        },
    ]);
    let http_client = reqwest::Client::new();
    let dispatcher = Arc::new(Dispatcher::new(registry, http_client));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        window: std::time::Duration::from_secs(config.rate_limit_window_secs),
        standard_capacity: config.rate_limit_capacity,
        strict_capacity: config.rate_limit_auth_capacity,
    }));

    let budget_store = SqliteStore::open(":memory:").unwrap();
    let budget_config = BudgetEngineConfig {
        warning_threshold: config.budget_warning_threshold,
        suspicious_hourly_max: config.suspicious_hourly_max,
        suspicious_daily_max: config.suspicious_daily_max,
        suspicious_amount_ratio_threshold: config.suspicious_amount_ratio_threshold,
        suspicious_rapid_fire_secs: config.suspicious_rapid_fire_secs,
        default_daily_cap: config.default_daily_cap,
        default_weekly_cap: config.default_weekly_cap,
        default_monthly_cap: config.default_monthly_cap,
        default_total_budget: config.default_total_budget,
        default_max_per_item: config.default_max_per_item,
        default_emergency_threshold: config.default_emergency_threshold,
        default_reserve: config.default_reserve,
        default_currency: config.default_currency.clone(),
    };

    AppState {
        config: Arc::new(config),
        dispatcher,
        route_table: Arc::new(RouteTable::default_table()),
        metrics: Arc::new(MetricsRing::new(1000)),
        rate_limiter,
        jwt: Arc::new(JwtHandler::new(JWT_SECRET.to_string())),
        hub: RealtimeHub::new(),
        budget: BudgetEngine::new(budget_config, budget_store),
        started_at: chrono::Utc::now(),
    }
}

/// `gateway_handler` extracts `ConnectInfo<SocketAddr>`, which is normally
/// populated by `into_make_service_with_connect_info` on a live listener.
/// Driving the router directly through `oneshot` needs the same extension
/// inserted by hand.
fn with_connect_info(mut req: Request<Body>) -> Request<Body> {
    let fallback: SocketAddr = "127.0.0.1:12345".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(fallback));
    req
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(with_connect_info(req)).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

/// Scenario: an unauthenticated request to a route requiring a token is
/// rejected before it ever reaches the dispatcher.
#[tokio::test]
async fn protected_route_without_token_is_unauthenticated() {
    let user_stub = spawn_stub(Router::new()).await;
    let state = test_state(base_config(user_stub, "http://localhost:1".into(), "http://localhost:1".into()));
    let app = gateway::router(state);

    let req = Request::builder().method("GET").uri("/api/v1/users/me").body(Body::empty()).unwrap();
    let (status, _) = send(app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

/// Scenario: the local `/health` route never touches the dispatcher or
/// rate limiter and always answers.
#[tokio::test]
async fn health_check_is_served_locally_without_auth() {
    let state = test_state(base_config("http://localhost:1".into(), "http://localhost:1".into(), "http://localhost:1".into()));
    let app = gateway::router(state);

    let req = Request::builder().method("GET").uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
}

/// Scenario: an authenticated request is forwarded to the mapped backend
/// and its response is passed straight through.
#[tokio::test]
async fn authenticated_request_is_forwarded_to_upstream() {
    let user_stub = spawn_stub(Router::new().route(
        "/users/me",
        axum::routing::get(|| async { Json(json!({ "id": "u1", "name": "trader one" })) }),
    ))
    .await;
    let state = test_state(base_config(user_stub, "http://localhost:1".into(), "http://localhost:1".into()));
    let app = gateway::router(state);

    let token = test_token("u1");
    let req = Request::builder()
        .method("GET")
        .uri("/api/v1/users/me")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "trader one");
}

/// Scenario F: a trade execution must clear risk-management validation
/// first; a rejection there never reaches the trading service.
#[tokio::test]
async fn trade_execute_is_blocked_when_risk_management_rejects() {
    let risk_stub = spawn_stub(Router::new().route(
        "/validate-trade",
        post(|| async { Json(json!({ "approved": false, "reason": "exceeds position limit" })) }),
    ))
    .await;
    let trading_stub = spawn_stub(Router::new().route(
        "/trades/execute",
        post(|| async { Json(json!({ "executed": true })) }),
    ))
    .await;
    let state = test_state(base_config("http://localhost:1".into(), trading_stub, risk_stub));
    let app = gateway::router(state);

    let token = test_token("u1");
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/trades/execute")
        .header("Authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "momentId": "m1", "amount": "10" }).to_string()))
        .unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("exceeds position limit"));
}

/// Scenario F (happy path): an approved trade is forwarded on to trading.
#[tokio::test]
async fn trade_execute_forwards_once_risk_management_approves() {
    let risk_stub = spawn_stub(Router::new().route(
        "/validate-trade",
        post(|| async { Json(json!({ "approved": true })) }),
    ))
    .await;
    let trading_stub = spawn_stub(Router::new().route(
        "/trades/execute",
        post(|| async { Json(json!({ "executed": true, "fillPrice": "12.50" })) }),
    ))
    .await;
    let state = test_state(base_config("http://localhost:1".into(), trading_stub, risk_stub));
    let app = gateway::router(state);

    let token = test_token("u1");
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/trades/execute")
        .header("Authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "momentId": "m1", "amount": "10" }).to_string()))
        .unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executed"], true);
}

/// Scenario: repeated login attempts from the same client past the strict
/// rate-limit capacity are throttled.
#[tokio::test]
async fn strict_rate_limit_trips_after_capacity_is_exhausted() {
    let user_stub = spawn_stub(Router::new().route(
        "/login",
        post(|| async { Json(json!({ "token": "ignored" })) }),
    ))
    .await;
    let mut config = base_config(user_stub, "http://localhost:1".into(), "http://localhost:1".into());
    config.rate_limit_auth_capacity = 2;
    let state = test_state(config);
    let app = gateway::router(state);

    let mut last_status = StatusCode::OK;
    for _ in 0..5 {
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/users/login")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "email": "a@example.com", "password": "x" }).to_string()))
            .unwrap();
        let (status, _) = send(app.clone(), req).await;
        last_status = status;
    }
    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
}

/// Scenario: a spend request for a user with no prior activity still gets
/// evaluated against the engine's configured defaults (not rejected outright
/// for lack of setup) through the dedicated evaluate endpoint.
#[tokio::test]
async fn budget_evaluate_within_default_limits_is_approved() {
    let state = test_state(base_config("http://localhost:1".into(), "http://localhost:1".into(), "http://localhost:1".into()));
    let app = gateway::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/budget/u-default/evaluate")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "amount": "25.00" }).to_string()))
        .unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["decision"], "approved");
}

/// Scenario: a spend above the per-transaction limit is rejected through the
/// same endpoint once limits are set directly on the engine.
#[tokio::test]
async fn budget_evaluate_above_per_transaction_limit_is_rejected() {
    let state = test_state(base_config("http://localhost:1".into(), "http://localhost:1".into(), "http://localhost:1".into()));
    state
        .budget
        .set_limits(BudgetLimits {
            user_id: "u-capped".to_string(),
            max_per_transaction: Decimal::from(200),
            daily_limit: Decimal::from(1000),
            weekly_limit: Decimal::from(7000),
            monthly_limit: Decimal::from(28000),
            total_limit: None,
            emergency_stop_threshold: Decimal::from(900),
            reserve_amount: Decimal::ZERO,
            currency: "USD".to_string(),
        })
        .await
        .unwrap();
    let app = gateway::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/budget/u-capped/evaluate")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "amount": "250.00" }).to_string()))
        .unwrap();
    let (status, _) = send(app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

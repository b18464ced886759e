//! Tradeplane Core — Gateway, Marketplace Monitoring, and Budget/Risk
//! control plane.
//!
//! Wires the environment-driven config into a service registry, the
//! ingress route table, the realtime push hub, the marketplace venue
//! pool with its background price-monitor and arbitrage-detector cycles,
//! and the budget approval engine, then serves the whole thing behind a
//! single axum router.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeplane_core::auth::JwtHandler;
use tradeplane_core::budget::{BudgetEngine, BudgetEngineConfig};
use tradeplane_core::gateway::{self, AppState};
use tradeplane_core::marketplace::{
    ArbitrageConfig, ArbitrageDetector, MarketplaceAdapter, PriceMonitor, PriceMonitorConfig,
    VenueConfig, VenuePool,
};
use tradeplane_core::metrics::MetricsRing;
use tradeplane_core::middleware::{correlation_and_security_headers, RateLimitConfig, RateLimiter};
use tradeplane_core::models::Config;
use tradeplane_core::registry::{Dispatcher, ServiceDescriptor, ServiceRegistry};
use tradeplane_core::route_table::RouteTable;
use tradeplane_core::store::SqliteStore;
use tradeplane_core::ws_hub::RealtimeHub;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    info!(port = config.port, production = config.production, "tradeplane core starting");

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build http client")?;

    let registry = ServiceRegistry::new(vec![
        service_descriptor("user", &config.user_service_url),
        service_descriptor("ai-scouting", &config.ai_scouting_service_url),
        service_descriptor("marketplace-monitor", &config.marketplace_monitor_service_url),
        service_descriptor("trading", &config.trading_service_url),
        service_descriptor("notification", &config.notification_service_url),
        service_descriptor("risk-management", &config.risk_management_service_url),
        service_descriptor("strategy", &config.strategy_service_url),
        service_descriptor("execution-primary", &config.execution_primary_url),
        service_descriptor("execution-secondary", &config.execution_secondary_url),
    ]);
    let dispatcher = Arc::new(Dispatcher::new(registry, http_client.clone()));
    let route_table = Arc::new(RouteTable::default_table());
    let metrics = Arc::new(MetricsRing::new(config.metrics_ring_capacity));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        window: std::time::Duration::from_secs(config.rate_limit_window_secs),
        standard_capacity: config.rate_limit_capacity,
        strict_capacity: config.rate_limit_auth_capacity,
    }));
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let hub = RealtimeHub::new();
    let budget_store = SqliteStore::open(&config.database_path).context("failed to open budget store")?;
    let budget = BudgetEngine::new(budget_engine_config(&config), budget_store);

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (marketplace_tx, marketplace_rx) = mpsc::unbounded_channel();

    let venue_pool = Arc::new(VenuePool::new(build_venue_adapters(&http_client)));
    let price_monitor = PriceMonitor::new(price_monitor_config(&config), hub.clone());
    let arbitrage_detector = ArbitrageDetector::new(arbitrage_config(&config), venue_pool.clone(), hub.clone());

    for adapter in venue_pool.adapters.values().cloned() {
        let tx = marketplace_tx.clone();
        tokio::spawn(adapter.run_stream(tx));
    }
    tokio::spawn(price_monitor.clone().run(marketplace_rx, shutdown_tx.subscribe()));
    tokio::spawn(arbitrage_detector.clone().run(shutdown_tx.subscribe()));
    tokio::spawn(run_health_check_loop(venue_pool.clone(), config.clone(), shutdown_tx.subscribe()));
    tokio::spawn(run_reset_scheduler_loop(budget.clone(), config.clone(), shutdown_tx.subscribe()));

    let state = AppState {
        config: config.clone(),
        dispatcher,
        route_table,
        metrics,
        rate_limiter,
        jwt,
        hub: hub.clone(),
        budget,
        started_at: chrono::Utc::now(),
    };

    let app = gateway::router(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(correlation_and_security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    let mut shutdown_signal = shutdown_tx.subscribe();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            hub.shutdown();
            let _ = shutdown_tx.send(());
            let _ = shutdown_signal.recv().await;
        })
        .await
        .context("server error")?;

    Ok(())
}

fn service_descriptor(name: &str, base_url: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        base_endpoint: base_url.to_string(),
        timeout: std::time::Duration::from_secs(10),
        max_retries: 2,
        auth_header: None,
    }
}

/// Venue endpoints are not yet surfaced as individual env vars in `Config`;
/// a single comma-separated `MARKETPLACE_VENUES` list of `id=rest,stream`
/// pairs would be the natural extension point. Until an operator supplies
/// one, the pool starts empty and the detector simply finds no healthy
/// venues, which is a safe default rather than a crash.
fn build_venue_adapters(http: &reqwest::Client) -> Vec<Arc<MarketplaceAdapter>> {
    std::env::var("MARKETPLACE_VENUES")
        .ok()
        .map(|raw| {
            raw.split(',')
                .filter_map(|entry| {
                    let mut parts = entry.splitn(3, '|');
                    let id = parts.next()?.to_string();
                    let rest_base_url = parts.next()?.to_string();
                    let stream_url = parts.next()?.to_string();
                    Some(MarketplaceAdapter::new(
                        VenueConfig {
                            id,
                            rest_base_url,
                            stream_url,
                            channels: vec!["listings".to_string(), "sales".to_string()],
                            requests_per_second: 5.0,
                            health_probe_path: "/health".to_string(),
                            health_probe_fallback_path: "/stats".to_string(),
                            max_reconnect_attempts: 10,
                            queue_depth_threshold: 1000,
                            execution_risk_score: 10,
                        },
                        http.clone(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn price_monitor_config(config: &Config) -> PriceMonitorConfig {
    PriceMonitorConfig {
        significant_change_threshold: config.price_change_threshold_pct / rust_decimal::Decimal::from(100),
        volume_spike_multiple: config.volume_spike_multiple,
        rolling_window_days: 7,
        history_retention_days: config.price_history_retention_days,
        poll_interval_secs: config.price_update_interval_ms / 1000,
    }
}

fn arbitrage_config(config: &Config) -> ArbitrageConfig {
    ArbitrageConfig {
        min_profit_percentage: config.arbitrage_min_profit_pct,
        min_profit_amount: config.arbitrage_min_profit_amount,
        max_risk_score: config.arbitrage_max_risk_score,
        opportunity_ttl_secs: config.arbitrage_ttl_secs,
        scan_interval_secs: config.arbitrage_scan_interval_ms / 1000,
    }
}

fn budget_engine_config(config: &Config) -> BudgetEngineConfig {
    BudgetEngineConfig {
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
    }
}

/// Probes every venue's health endpoint on a fixed interval; a venue that
/// fails its probe doesn't get marked unhealthy here directly (that's
/// driven by stream connectivity) but the probe result is logged so an
/// operator can see a degrading venue before its stream drops.
async fn run_health_check_loop(venues: Arc<VenuePool>, config: Arc<Config>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(config.health_check_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("health check loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                for adapter in venues.adapters.values() {
                    let healthy = tokio::time::timeout(
                        std::time::Duration::from_secs(config.health_check_timeout_secs.max(1)),
                        adapter.probe_health(),
                    )
                    .await
                    .unwrap_or(false);
                    if !healthy {
                        tracing::warn!(venue = %adapter.config.id, "venue health probe failed");
                    }
                }
            }
        }
    }
}

/// Runs the budget engine's window-reset and de-escalation-restore sweep
/// on a fixed interval.
async fn run_reset_scheduler_loop(budget: Arc<BudgetEngine>, config: Arc<Config>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(config.reset_scheduler_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("reset scheduler shutting down");
                return;
            }
            _ = ticker.tick() => {
                budget.run_scheduled_resets(chrono::Utc::now()).await;
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeplane_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

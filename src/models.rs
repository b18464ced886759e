//! Shared data model
//! Mission: types that cross module boundaries — the request envelope,
//! caller identity, and process-wide configuration.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller identity parsed from a verified bearer token. `None` on an
/// unauthenticated or optionally-authenticated route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub username: String,
    pub role: String,
}

/// Internal request envelope threaded through the ingress pipeline.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub caller: Option<CallerIdentity>,
    pub received_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub client_addr: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestEnvelope {
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            caller: None,
            received_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
            client_addr: None,
            user_agent: None,
        }
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Process-wide configuration, parsed once at startup from environment
/// variables. Unknown variables are ignored.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub production: bool,
    pub log_level: String,

    // service endpoints, one per backend named in the route table
    pub user_service_url: String,
    pub ai_scouting_service_url: String,
    pub marketplace_monitor_service_url: String,
    pub trading_service_url: String,
    pub notification_service_url: String,
    pub risk_management_service_url: String,
    pub strategy_service_url: String,
    pub execution_primary_url: String,
    pub execution_secondary_url: String,

    // ingress
    pub rate_limit_window_secs: u64,
    pub rate_limit_capacity: u32,
    pub rate_limit_auth_capacity: u32,
    pub body_size_limit_bytes: usize,

    // health checks
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,

    // reset scheduler
    pub reset_scheduler_interval_secs: u64,

    // persistence
    pub database_path: String,

    // metrics ring
    pub metrics_ring_capacity: usize,
    pub metrics_rolling_window_secs: i64,

    // marketplace / price monitor
    pub price_update_interval_ms: u64,
    pub price_change_threshold_pct: Decimal,
    pub price_history_retention_days: i64,
    pub volume_spike_multiple: Decimal,

    // arbitrage detector
    pub arbitrage_scan_interval_ms: u64,
    pub arbitrage_min_profit_pct: Decimal,
    pub arbitrage_min_profit_amount: Decimal,
    pub arbitrage_max_risk_score: u32,
    pub arbitrage_ttl_secs: i64,

    // budget engine defaults
    pub default_daily_cap: Decimal,
    pub default_weekly_cap: Decimal,
    pub default_monthly_cap: Decimal,
    pub default_total_budget: Decimal,
    pub default_max_per_item: Decimal,
    pub default_emergency_threshold: Decimal,
    pub default_reserve: Decimal,
    pub default_currency: String,
    pub budget_warning_threshold: Decimal,

    // suspicious-activity scorer
    pub suspicious_hourly_max: u32,
    pub suspicious_daily_max: u32,
    pub suspicious_amount_ratio_threshold: Decimal,
    pub suspicious_rapid_fire_secs: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        fn var(key: &str, default: &str) -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        }
        fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<T>().ok())
                .unwrap_or(default)
        }
        fn parse_decimal(key: &str, default: &str) -> Decimal {
            std::env::var(key)
                .ok()
                .and_then(|v| Decimal::from_str_exact(&v).ok())
                .unwrap_or_else(|| Decimal::from_str_exact(default).unwrap())
        }

        Ok(Self {
            port: parse_var("PORT", 8080),
            jwt_secret: var("JWT_SECRET", "dev-secret-change-me"),
            production: var("ENVIRONMENT", "development") == "production",
            log_level: var("LOG_LEVEL", "info"),

            user_service_url: var("USER_SERVICE_URL", "http://localhost:4001"),
            ai_scouting_service_url: var("AI_SCOUTING_SERVICE_URL", "http://localhost:4002"),
            marketplace_monitor_service_url: var(
                "MARKETPLACE_MONITOR_SERVICE_URL",
                "http://localhost:4003",
            ),
            trading_service_url: var("TRADING_SERVICE_URL", "http://localhost:4004"),
            notification_service_url: var("NOTIFICATION_SERVICE_URL", "http://localhost:4005"),
            risk_management_service_url: var(
                "RISK_MANAGEMENT_SERVICE_URL",
                "http://localhost:4006",
            ),
            strategy_service_url: var("STRATEGY_SERVICE_URL", "http://localhost:4007"),
            execution_primary_url: var("EXECUTION_PRIMARY_URL", "http://localhost:4008"),
            execution_secondary_url: var("EXECUTION_SECONDARY_URL", "http://localhost:4009"),

            rate_limit_window_secs: parse_var("RATE_LIMIT_WINDOW_SECS", 15 * 60),
            rate_limit_capacity: parse_var("RATE_LIMIT_CAPACITY", 100),
            rate_limit_auth_capacity: parse_var("RATE_LIMIT_AUTH_CAPACITY", 10),
            body_size_limit_bytes: parse_var("BODY_SIZE_LIMIT_BYTES", 10 * 1024 * 1024),

            health_check_interval_secs: parse_var("HEALTH_CHECK_INTERVAL_SECS", 30),
            health_check_timeout_secs: parse_var("HEALTH_CHECK_TIMEOUT_SECS", 5),

            reset_scheduler_interval_secs: parse_var("RESET_SCHEDULER_INTERVAL_SECS", 60),

            database_path: var("DATABASE_PATH", "tradeplane.db"),

            metrics_ring_capacity: parse_var("METRICS_RING_CAPACITY", 1000),
            metrics_rolling_window_secs: parse_var("METRICS_ROLLING_WINDOW_SECS", 5 * 60),

            price_update_interval_ms: parse_var("PRICE_UPDATE_INTERVAL_MS", 60_000),
            price_change_threshold_pct: parse_decimal("PRICE_CHANGE_THRESHOLD_PCT", "10"),
            price_history_retention_days: parse_var("PRICE_HISTORY_RETENTION_DAYS", 30),
            volume_spike_multiple: parse_decimal("VOLUME_SPIKE_MULTIPLE", "3"),

            arbitrage_scan_interval_ms: parse_var("ARBITRAGE_SCAN_INTERVAL_MS", 30_000),
            arbitrage_min_profit_pct: parse_decimal("ARBITRAGE_MIN_PROFIT_PCT", "5"),
            arbitrage_min_profit_amount: parse_decimal("ARBITRAGE_MIN_PROFIT_AMOUNT", "1"),
            arbitrage_max_risk_score: parse_var("ARBITRAGE_MAX_RISK_SCORE", 70),
            arbitrage_ttl_secs: parse_var("ARBITRAGE_TTL_SECS", 10 * 60),

            default_daily_cap: parse_decimal("DEFAULT_DAILY_CAP", "500"),
            default_weekly_cap: parse_decimal("DEFAULT_WEEKLY_CAP", "3500"),
            default_monthly_cap: parse_decimal("DEFAULT_MONTHLY_CAP", "14000"),
            default_total_budget: parse_decimal("DEFAULT_TOTAL_BUDGET", "10000"),
            default_max_per_item: parse_decimal("DEFAULT_MAX_PER_ITEM", "200"),
            default_emergency_threshold: parse_decimal("DEFAULT_EMERGENCY_THRESHOLD", "8000"),
            default_reserve: parse_decimal("DEFAULT_RESERVE", "0"),
            default_currency: var("DEFAULT_CURRENCY", "USD"),
            budget_warning_threshold: parse_decimal("BUDGET_WARNING_THRESHOLD", "0.8"),

            suspicious_hourly_max: parse_var("SUSPICIOUS_HOURLY_MAX", 10),
            suspicious_daily_max: parse_var("SUSPICIOUS_DAILY_MAX", 30),
            suspicious_amount_ratio_threshold: parse_decimal(
                "SUSPICIOUS_AMOUNT_RATIO_THRESHOLD",
                "3",
            ),
            suspicious_rapid_fire_secs: parse_var("SUSPICIOUS_RAPID_FIRE_SECS", 5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_env_has_sane_defaults() {
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert!(cfg.default_daily_cap <= cfg.default_weekly_cap);
        assert!(cfg.default_weekly_cap <= cfg.default_monthly_cap);
    }
}

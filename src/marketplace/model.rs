//! Marketplace data model: listings, per-moment price state,
//! arbitrage opportunities, and price alerts.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Sold,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub moment_id: String,
    pub player_id: String,
    pub player_name: String,
    pub moment_type: String,
    pub serial_number: i64,
    pub price: Decimal,
    pub currency: String,
    pub venue_id: String,
    pub seller_id: String,
    pub listed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ListingStatus,
}

/// Rolling per-moment state maintained by the Price Monitor.
#[derive(Debug, Clone)]
pub struct MomentPriceState {
    pub moment_id: String,
    pub current_price: Decimal,
    pub floor_price: Decimal,
    pub average_price: Decimal,
    pub last_sale_price: Option<Decimal>,
    /// Bounded to `price_history_retention_days` (default 30d).
    pub history: VecDeque<(DateTime<Utc>, Decimal)>,
    /// 24h-volume samples, one per update, pruned on the same schedule as
    /// `history`; the rolling mean over this is the volume-spike baseline.
    pub volume_history: VecDeque<(DateTime<Utc>, Decimal)>,
    pub volume_24h: Decimal,
    pub sales_count_24h: u64,
    pub listing_count: u64,
    pub percent_change_24h: Decimal,
    pub volatility: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl MomentPriceState {
    pub fn new(moment_id: String, current_price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            moment_id,
            current_price,
            floor_price: current_price,
            average_price: current_price,
            last_sale_price: None,
            history: VecDeque::from([(now, current_price)]),
            volume_history: VecDeque::new(),
            volume_24h: Decimal::ZERO,
            sales_count_24h: 0,
            listing_count: 0,
            percent_change_24h: Decimal::ZERO,
            volatility: Decimal::ZERO,
            last_updated: now,
        }
    }

    /// Drop history older than `retention_days`.
    pub fn prune_history(&mut self, retention_days: i64) {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        while matches!(self.history.front(), Some((ts, _)) if *ts < cutoff) {
            self.history.pop_front();
        }
        while matches!(self.volume_history.front(), Some((ts, _)) if *ts < cutoff) {
            self.volume_history.pop_front();
        }
    }

    /// Records a fresh 24h-volume sample into the volume ring.
    pub fn record_volume_sample(&mut self, at: DateTime<Utc>, volume_24h: Decimal) {
        self.volume_history.push_back((at, volume_24h));
    }

    /// Rolling mean price over `window_days`, used as a coarse volatility
    /// proxy for price.
    pub fn rolling_mean_price(&self, window_days: i64) -> Option<Decimal> {
        rolling_mean(&self.history, window_days)
    }

    /// Rolling mean 24h volume over `window_days` — the volume-spike
    /// baseline, computed from the volume ring rather than the price ring.
    pub fn rolling_mean_volume(&self, window_days: i64) -> Option<Decimal> {
        rolling_mean(&self.volume_history, window_days)
    }
}

fn rolling_mean(ring: &VecDeque<(DateTime<Utc>, Decimal)>, window_days: i64) -> Option<Decimal> {
    let cutoff = Utc::now() - chrono::Duration::days(window_days);
    let (sum, count) = ring
        .iter()
        .filter(|(ts, _)| *ts >= cutoff)
        .fold((Decimal::ZERO, 0u32), |(sum, count), (_, value)| (sum + *value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / Decimal::from(count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Active,
    Executed,
    Expired,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRisk {
    pub liquidity: u32,
    pub price_movement: u32,
    pub execution_time: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub moment_id: String,
    pub source_venue: String,
    pub source_price: Decimal,
    pub target_venue: String,
    pub target_price: Decimal,
    pub profit_amount: Decimal,
    pub profit_percentage: Decimal,
    pub confidence: f64,
    pub risk_score: u32,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: OpportunityStatus,
    pub execution_risk: ExecutionRisk,
}

impl ArbitrageOpportunity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn key(&self) -> (String, String, String) {
        (self.moment_id.clone(), self.source_venue.clone(), self.target_venue.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PriceDrop,
    PriceIncrease,
    VolumeSpike,
    NewListing,
    Arbitrage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: String,
    pub user_id: String,
    pub moment_id: Option<String>,
    pub player_id: Option<String>,
    pub alert_type: AlertType,
    pub threshold: Decimal,
    pub current_value: Decimal,
    pub active: bool,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl PriceAlert {
    /// price_drop: current <= threshold; price_increase: current >=
    /// threshold; volume_spike: current >= avg*threshold (threshold is the
    /// multiple here, handled by the caller passing the right current_value).
    pub fn predicate_holds(&self) -> bool {
        match self.alert_type {
            AlertType::PriceDrop => self.current_value <= self.threshold,
            AlertType::PriceIncrease => self.current_value >= self.threshold,
            AlertType::VolumeSpike => self.current_value >= self.threshold,
            AlertType::NewListing | AlertType::Arbitrage => self.current_value >= self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_drop_alert_is_idempotent_once_triggered() {
        let mut alert = PriceAlert {
            id: "a1".into(),
            user_id: "u1".into(),
            moment_id: Some("m1".into()),
            player_id: None,
            alert_type: AlertType::PriceDrop,
            threshold: Decimal::from(100),
            current_value: Decimal::from(90),
            active: true,
            triggered: false,
            triggered_at: None,
        };
        assert!(alert.predicate_holds());
        alert.triggered = true;
        // the evaluator (price_monitor) is responsible for skipping
        // already-triggered alerts; the predicate itself is stateless.
        assert!(alert.predicate_holds());
    }

    #[test]
    fn prune_history_drops_entries_older_than_retention() {
        let mut state = MomentPriceState::new("m1".into(), Decimal::from(10));
        state.history.push_front((Utc::now() - chrono::Duration::days(60), Decimal::from(5)));
        state.prune_history(30);
        assert!(state.history.iter().all(|(ts, _)| *ts >= Utc::now() - chrono::Duration::days(30)));
    }
}

//! Arbitrage Detector
//! Scan cycle: drop expired opportunities, pull active listings from
//! healthy venues, group by moment then by venue, compare every unordered
//! venue pair in both directions, score and publish opportunities that
//! clear the configured thresholds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::marketplace::adapter::VenuePool;
use crate::marketplace::model::{ArbitrageOpportunity, ExecutionRisk, Listing, OpportunityStatus};
use crate::ws_hub::{RealtimeHub, ServerEvent};

#[derive(Debug, Clone)]
pub struct ArbitrageConfig {
    pub min_profit_percentage: Decimal,
    pub min_profit_amount: Decimal,
    pub max_risk_score: u32,
    pub opportunity_ttl_secs: i64,
    pub scan_interval_secs: u64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            min_profit_percentage: Decimal::new(5, 2), // 5%
            min_profit_amount: Decimal::from(1),
            max_risk_score: 70,
            opportunity_ttl_secs: 300,
            scan_interval_secs: 30,
        }
    }
}

pub struct ArbitrageDetector {
    config: ArbitrageConfig,
    venues: Arc<VenuePool>,
    hub: Arc<RealtimeHub>,
    opportunities: parking_lot::Mutex<HashMap<String, ArbitrageOpportunity>>,
}

impl ArbitrageDetector {
    pub fn new(config: ArbitrageConfig, venues: Arc<VenuePool>, hub: Arc<RealtimeHub>) -> Arc<Self> {
        Arc::new(Self {
            config,
            venues,
            hub,
            opportunities: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn active_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        self.opportunities
            .lock()
            .values()
            .filter(|o| o.status == OpportunityStatus::Active)
            .cloned()
            .collect()
    }

    fn expire_stale(&self) {
        let now = Utc::now();
        let mut opportunities = self.opportunities.lock();
        for opp in opportunities.values_mut() {
            if opp.status == OpportunityStatus::Active && opp.is_expired(now) {
                opp.status = OpportunityStatus::Expired;
            }
        }
    }

    /// 20/10/5 bonus for listings priced >1000/>500/>100, else 0. Shared by
    /// the risk score's price bucket and the liquidity sub-score.
    fn price_bucket_bonus(price: Decimal) -> u32 {
        if price > Decimal::from(1000) {
            20
        } else if price > Decimal::from(500) {
            10
        } else if price > Decimal::from(100) {
            5
        } else {
            0
        }
    }

    /// 15/10/5 for serials ≤10/≤100/≤1000 — a lower serial number is a
    /// rarer, harder-to-verify copy.
    fn serial_rarity_bonus(serial_number: i64) -> u32 {
        if serial_number <= 10 {
            15
        } else if serial_number <= 100 {
            10
        } else if serial_number <= 1000 {
            5
        } else {
            0
        }
    }

    /// Age in hours of the older of the two listings, capped at 30 (1
    /// point per hour).
    fn age_risk_points(source: &Listing, target: &Listing, now: chrono::DateTime<Utc>) -> u32 {
        let age_hours = now
            .signed_duration_since(source.listed_at.min(target.listed_at))
            .num_hours()
            .max(0) as u32;
        age_hours.min(30)
    }

    fn risk_score(source: &Listing, target: &Listing, now: chrono::DateTime<Utc>) -> u32 {
        let age = Self::age_risk_points(source, target, now);
        let price_bucket = Self::price_bucket_bonus(source.price.max(target.price));
        let rarity = Self::serial_rarity_bonus(source.serial_number.min(target.serial_number));
        (age + price_bucket + rarity).min(100)
    }

    fn liquidity_risk(source: &Listing) -> u32 {
        20 + Self::price_bucket_bonus(source.price)
    }

    /// 80/60/40/20/10 by profit-percentage bucket.
    fn price_movement_risk(profit_pct: Decimal) -> u32 {
        if profit_pct >= Decimal::from(50) {
            80
        } else if profit_pct >= Decimal::from(25) {
            60
        } else if profit_pct >= Decimal::from(10) {
            40
        } else if profit_pct >= Decimal::from(5) {
            20
        } else {
            10
        }
    }

    fn execution_time_risk(&self, source: &Listing, target: &Listing) -> u32 {
        let source_risk = self.venues.adapters.get(&source.venue_id).map(|a| a.config.execution_risk_score).unwrap_or(0);
        let target_risk = self.venues.adapters.get(&target.venue_id).map(|a| a.config.execution_risk_score).unwrap_or(0);
        source_risk.max(target_risk)
    }

    fn confidence(profit_pct: Decimal, source: &Listing, target: &Listing, now: chrono::DateTime<Utc>) -> f64 {
        let mut confidence = 0.5;
        let pct_component = (profit_pct.to_string().parse::<f64>().unwrap_or(0.0) * 2.0).min(30.0);
        confidence += pct_component / 100.0;

        let age_hours = now.signed_duration_since(source.listed_at.min(target.listed_at)).num_hours();
        confidence += if age_hours < 1 {
            0.15
        } else if age_hours < 6 {
            0.10
        } else if age_hours < 24 {
            0.05
        } else {
            -0.10
        };

        if source.serial_number == target.serial_number {
            confidence += 0.20;
        }

        confidence.clamp(0.0, 1.0)
    }

    fn evaluate_pair(&self, moment_id: &str, source: &Listing, target: &Listing) -> Option<ArbitrageOpportunity> {
        if target.price <= source.price {
            return None;
        }
        let profit_amount = target.price - source.price;
        let profit_percentage = profit_amount / source.price * Decimal::from(100);
        if profit_percentage < self.config.min_profit_percentage || profit_amount < self.config.min_profit_amount {
            return None;
        }

        let now = Utc::now();
        let risk_score = Self::risk_score(source, target, now);
        if risk_score > self.config.max_risk_score {
            return None;
        }

        let liquidity = Self::liquidity_risk(source);
        let price_movement = Self::price_movement_risk(profit_percentage);
        let execution_time = self.execution_time_risk(source, target);

        Some(ArbitrageOpportunity {
            id: Uuid::new_v4().to_string(),
            moment_id: moment_id.to_string(),
            source_venue: source.venue_id.clone(),
            source_price: source.price,
            target_venue: target.venue_id.clone(),
            target_price: target.price,
            profit_amount,
            profit_percentage,
            confidence: Self::confidence(profit_percentage, source, target, now),
            risk_score,
            detected_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.opportunity_ttl_secs),
            status: OpportunityStatus::Active,
            execution_risk: ExecutionRisk { liquidity, price_movement, execution_time },
        })
    }

    async fn scan_once(&self) {
        self.expire_stale();

        let healthy = self.venues.healthy_venues();
        if healthy.is_empty() {
            warn!("no healthy marketplace venues, skipping arbitrage scan");
            return;
        }

        let mut by_moment: HashMap<String, Vec<Listing>> = HashMap::new();
        for adapter in &healthy {
            match adapter.fetch_active_listings().await {
                Ok(listings) => {
                    for listing in listings {
                        by_moment.entry(listing.moment_id.clone()).or_default().push(listing);
                    }
                }
                Err(err) => warn!(venue = %adapter.config.id, error = %err, "listings fetch failed"),
            }
        }

        let mut discovered = Vec::new();
        for (moment_id, listings) in &by_moment {
            let mut by_venue: HashMap<&str, Vec<&Listing>> = HashMap::new();
            for listing in listings {
                by_venue.entry(listing.venue_id.as_str()).or_default().push(listing);
            }
            if by_venue.len() < 2 {
                continue;
            }
            let venue_ids: Vec<&str> = by_venue.keys().copied().collect();
            for i in 0..venue_ids.len() {
                for j in (i + 1)..venue_ids.len() {
                    let listings_a = &by_venue[venue_ids[i]];
                    let listings_b = &by_venue[venue_ids[j]];
                    let min_a = listings_a.iter().min_by_key(|l| l.price).unwrap();
                    let max_a = listings_a.iter().max_by_key(|l| l.price).unwrap();
                    let min_b = listings_b.iter().min_by_key(|l| l.price).unwrap();
                    let max_b = listings_b.iter().max_by_key(|l| l.price).unwrap();

                    if let Some(opp) = self.evaluate_pair(moment_id, min_a, max_b) {
                        discovered.push(opp);
                    }
                    if let Some(opp) = self.evaluate_pair(moment_id, min_b, max_a) {
                        discovered.push(opp);
                    }
                }
            }
        }

        let mut opportunities = self.opportunities.lock();
        for opp in discovered {
            let key = format!("{}:{}:{}", opp.moment_id, opp.source_venue, opp.target_venue);
            let is_new = !opportunities.contains_key(&key);
            opportunities.insert(key, opp.clone());
            if is_new {
                info!(
                    moment_id = %opp.moment_id,
                    source = %opp.source_venue,
                    target = %opp.target_venue,
                    profit_pct = %opp.profit_percentage,
                    "arbitrage opportunity detected"
                );
                self.hub.broadcast(
                    &ServerEvent::MarketAlert(serde_json::json!({
                        "type": "arbitrage",
                        "opportunityId": opp.id,
                        "momentId": opp.moment_id,
                        "profitPercentage": opp.profit_percentage.to_string(),
                    })),
                    None,
                );
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("arbitrage detector shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
            }
        }
    }
}

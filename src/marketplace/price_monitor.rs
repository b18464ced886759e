//! Price Monitor
//! Mission: fold adapter events and periodic polls into per-moment rolling
//! state, detect significant moves, and evaluate/trigger price alerts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::marketplace::adapter::MarketplaceEvent;
use crate::marketplace::model::{AlertType, MomentPriceState, PriceAlert};
use crate::ws_hub::{RealtimeHub, ServerEvent};

#[derive(Debug, Clone)]
pub struct PriceMonitorConfig {
    pub significant_change_threshold: Decimal,
    pub volume_spike_multiple: Decimal,
    pub rolling_window_days: i64,
    pub history_retention_days: i64,
    pub poll_interval_secs: u64,
}

impl Default for PriceMonitorConfig {
    fn default() -> Self {
        Self {
            significant_change_threshold: Decimal::new(10, 2), // 10%
            volume_spike_multiple: Decimal::from(3),
            rolling_window_days: 7,
            history_retention_days: 30,
            poll_interval_secs: 60,
        }
    }
}

pub struct PriceMonitor {
    config: PriceMonitorConfig,
    states: Mutex<HashMap<String, MomentPriceState>>,
    alerts: Mutex<Vec<PriceAlert>>,
    hub: Arc<RealtimeHub>,
}

impl PriceMonitor {
    pub fn new(config: PriceMonitorConfig, hub: Arc<RealtimeHub>) -> Arc<Self> {
        Arc::new(Self {
            config,
            states: Mutex::new(HashMap::new()),
            alerts: Mutex::new(Vec::new()),
            hub,
        })
    }

    pub fn register_alert(&self, alert: PriceAlert) {
        self.alerts.lock().push(alert);
    }

    pub fn snapshot(&self, moment_id: &str) -> Option<MomentPriceState> {
        self.states.lock().get(moment_id).cloned()
    }

    /// Applies a new observed price to the moment's rolling state, emits a
    /// `price_update` push on significant change, evaluates alerts.
    fn apply_price(&self, moment_id: &str, new_price: Decimal) {
        let mut states = self.states.lock();
        let entry = states
            .entry(moment_id.to_string())
            .or_insert_with(|| MomentPriceState::new(moment_id.to_string(), new_price));

        let previous = entry.current_price;
        entry.current_price = new_price;
        entry.history.push_back((Utc::now(), new_price));
        entry.last_updated = Utc::now();
        entry.prune_history(self.config.history_retention_days);
        if let Some(mean) = entry.rolling_mean_price(self.config.rolling_window_days) {
            entry.average_price = mean;
        }

        let pct_change = if previous.is_zero() {
            Decimal::ZERO
        } else {
            ((new_price - previous) / previous).abs()
        };
        entry.percent_change_24h = pct_change;
        let significant = pct_change >= self.config.significant_change_threshold;
        let state_clone = entry.clone();
        drop(states);

        if significant {
            info!(moment_id, %previous, %new_price, "significant price change detected");
            self.hub.broadcast(
                &ServerEvent::PriceUpdate(serde_json::json!({
                    "momentId": moment_id,
                    "previousPrice": previous.to_string(),
                    "newPrice": new_price.to_string(),
                    "percentChange": pct_change.to_string(),
                })),
                None,
            );
        }

        self.evaluate_alerts(moment_id, new_price, &state_clone);
    }

    fn apply_volume(&self, moment_id: &str, volume_24h: Decimal) {
        let mut states = self.states.lock();
        let entry = states
            .entry(moment_id.to_string())
            .or_insert_with(|| MomentPriceState::new(moment_id.to_string(), volume_24h));
        let baseline = entry.rolling_mean_volume(self.config.rolling_window_days).unwrap_or(volume_24h);
        entry.volume_24h = volume_24h;
        entry.record_volume_sample(Utc::now(), volume_24h);
        let spike = !baseline.is_zero() && volume_24h >= baseline * self.config.volume_spike_multiple;
        drop(states);

        if spike {
            info!(moment_id, %volume_24h, %baseline, "volume spike detected");
            self.trigger_matching_alerts(moment_id, AlertType::VolumeSpike, volume_24h);
        }
    }

    /// Periodic "active set" cycle: re-runs cleanup and rolling-average
    /// recomputation across every cached moment. Active-set price refetch
    /// from venues is driven by the per-venue stream; this cycle
    /// covers the retention and rolling-mean upkeep that must happen even
    /// when a moment goes quiet.
    fn run_cleanup_cycle(&self) {
        let mut states = self.states.lock();
        for entry in states.values_mut() {
            entry.prune_history(self.config.history_retention_days);
            if let Some(mean) = entry.rolling_mean_price(self.config.rolling_window_days) {
                entry.average_price = mean;
            }
        }
        debug!(moments = states.len(), "price monitor cleanup cycle completed");
    }

    /// Idempotent: an alert already `triggered` is skipped even if its
    /// predicate still holds. One-shot until explicitly reset.
    fn evaluate_alerts(&self, moment_id: &str, current_price: Decimal, state: &MomentPriceState) {
        self.trigger_matching_alerts(moment_id, AlertType::PriceDrop, current_price);
        self.trigger_matching_alerts(moment_id, AlertType::PriceIncrease, current_price);
        let _ = state;
    }

    fn trigger_matching_alerts(&self, moment_id: &str, alert_type: AlertType, current_value: Decimal) {
        let mut alerts = self.alerts.lock();
        let mut fired = Vec::new();
        for alert in alerts.iter_mut() {
            if alert.triggered || !alert.active {
                continue;
            }
            if alert.alert_type != alert_type {
                continue;
            }
            if alert.moment_id.as_deref() != Some(moment_id) {
                continue;
            }
            alert.current_value = current_value;
            if alert.predicate_holds() {
                alert.triggered = true;
                alert.triggered_at = Some(Utc::now());
                fired.push(alert.clone());
            }
        }
        drop(alerts);

        for alert in fired {
            self.hub.send_to_user(
                &alert.user_id,
                &ServerEvent::MarketAlert(serde_json::json!({
                    "alertId": alert.id,
                    "momentId": alert.moment_id,
                    "alertType": alert_type,
                    "currentValue": alert.current_value.to_string(),
                    "threshold": alert.threshold.to_string(),
                })),
            );
        }
    }

    /// Reset an alert so it can fire again. Explicit only — an automatic
    /// reset could refire endlessly on a moment hovering near the threshold.
    pub fn reset_alert(&self, alert_id: Uuid) {
        let mut alerts = self.alerts.lock();
        if let Some(alert) = alerts.iter_mut().find(|a| a.id == alert_id.to_string()) {
            alert.triggered = false;
            alert.triggered_at = None;
        }
    }

    /// Background cycle: drains adapter events, periodically prunes stale
    /// history, exits on shutdown signal.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MarketplaceEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("price monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_cleanup_cycle();
                }
                event = events.recv() => {
                    match event {
                        Some(MarketplaceEvent::PriceChange { moment_id, new_price, .. })
                        | Some(MarketplaceEvent::Sale { moment_id, price: new_price, .. }) => {
                            self.apply_price(&moment_id, new_price);
                        }
                        Some(MarketplaceEvent::VolumeUpdate { moment_id, volume_24h, .. }) => {
                            self.apply_volume(&moment_id, volume_24h);
                        }
                        Some(MarketplaceEvent::ListingUpdate(listing)) => {
                            self.apply_price(&listing.moment_id, listing.price);
                        }
                        None => {
                            debug!("marketplace event channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<PriceMonitor> {
        PriceMonitor::new(PriceMonitorConfig::default(), RealtimeHub::new())
    }

    #[test]
    fn significant_price_drop_is_detected() {
        let monitor = monitor();
        monitor.apply_price("m1", Decimal::from(100));
        monitor.apply_price("m1", Decimal::from(85));
        let state = monitor.snapshot("m1").unwrap();
        assert!(state.percent_change_24h >= Decimal::new(10, 2));
    }

    #[test]
    fn alert_triggers_once_then_stays_triggered() {
        let monitor = monitor();
        monitor.register_alert(PriceAlert {
            id: "a1".into(),
            user_id: "u1".into(),
            moment_id: Some("m1".into()),
            player_id: None,
            alert_type: AlertType::PriceDrop,
            threshold: Decimal::from(90),
            current_value: Decimal::from(100),
            active: true,
            triggered: false,
            triggered_at: None,
        });
        monitor.apply_price("m1", Decimal::from(80));
        assert!(monitor.alerts.lock()[0].triggered);

        let triggered_at_first = monitor.alerts.lock()[0].triggered_at;
        monitor.apply_price("m1", Decimal::from(70));
        assert_eq!(monitor.alerts.lock()[0].triggered_at, triggered_at_first);
    }

    #[test]
    fn volume_spike_detection_requires_baseline() {
        let monitor = monitor();
        monitor.apply_volume("m1", Decimal::from(1000));
        let state = monitor.snapshot("m1").unwrap();
        assert_eq!(state.volume_24h, Decimal::from(1000));
    }

    #[test]
    fn volume_spike_baseline_ignores_price_history() {
        let monitor = monitor();
        // Push a price history that would skew a price-based baseline far
        // from the real volume baseline if the two rings were conflated.
        monitor.apply_price("m1", Decimal::from(5));
        monitor.apply_volume("m1", Decimal::from(100));
        monitor.apply_volume("m1", Decimal::from(100));
        monitor.register_alert(PriceAlert {
            id: "a1".into(),
            user_id: "u1".into(),
            moment_id: Some("m1".into()),
            player_id: None,
            alert_type: AlertType::VolumeSpike,
            threshold: Decimal::from(250),
            current_value: Decimal::ZERO,
            active: true,
            triggered: false,
            triggered_at: None,
        });
        monitor.apply_volume("m1", Decimal::from(400));
        assert!(monitor.alerts.lock()[0].triggered);
    }

    #[test]
    fn cleanup_cycle_prunes_stale_history_without_new_events() {
        let monitor = monitor();
        monitor.apply_price("m1", Decimal::from(10));
        {
            let mut states = monitor.states.lock();
            let entry = states.get_mut("m1").unwrap();
            entry.history.push_front((Utc::now() - chrono::Duration::days(60), Decimal::from(1)));
        }
        monitor.run_cleanup_cycle();
        let state = monitor.snapshot("m1").unwrap();
        assert!(state.history.iter().all(|(ts, _)| *ts >= Utc::now() - chrono::Duration::days(30)));
    }
}

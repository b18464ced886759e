//! Budget/risk data model: per-user limits, rolling spend
//! trackers, emergency-stop records, and the activity pattern fed to the
//! suspicious-activity scorer.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub user_id: String,
    pub max_per_transaction: Decimal,
    pub daily_limit: Decimal,
    pub weekly_limit: Decimal,
    pub monthly_limit: Decimal,
    pub total_limit: Option<Decimal>,
    pub emergency_stop_threshold: Decimal,
    pub reserve_amount: Decimal,
    pub currency: String,
}

impl BudgetLimits {
    /// Window ordering, the 7x/4x minimum ratios, and the reserve/emergency
    /// ceilings from the data-model invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.daily_limit > self.weekly_limit {
            return Err("daily limit must not exceed weekly limit".to_string());
        }
        if self.weekly_limit > self.monthly_limit {
            return Err("weekly limit must not exceed monthly limit".to_string());
        }
        if self.weekly_limit < self.daily_limit * Decimal::from(7) {
            return Err("weekly limit must be at least 7x the daily limit".to_string());
        }
        if self.monthly_limit < self.weekly_limit * Decimal::from(4) {
            return Err("monthly limit must be at least 4x the weekly limit".to_string());
        }
        if self.max_per_transaction > self.daily_limit {
            return Err("max-per-item must not exceed the daily limit".to_string());
        }
        if let Some(total) = self.total_limit {
            if self.emergency_stop_threshold > total {
                return Err("emergency-stop threshold must not exceed the total budget".to_string());
            }
            if self.reserve_amount > total * Decimal::new(5, 1) {
                return Err("reserve amount must not exceed half the total budget".to_string());
            }
        }
        Ok(())
    }

    /// True if any changed field more than doubles or falls under half of
    /// its previous value — the significant-change test gating the
    /// pending-limit-change workflow.
    pub fn differs_significantly_from(&self, previous: &BudgetLimits) -> bool {
        let fields = [
            (self.max_per_transaction, previous.max_per_transaction),
            (self.daily_limit, previous.daily_limit),
            (self.weekly_limit, previous.weekly_limit),
            (self.monthly_limit, previous.monthly_limit),
            (self.emergency_stop_threshold, previous.emergency_stop_threshold),
        ];
        fields.iter().any(|(new, old)| {
            if old.is_zero() {
                return !new.is_zero();
            }
            let ratio = *new / *old;
            ratio > Decimal::from(2) || ratio < Decimal::new(5, 1)
        })
    }
}

/// A pending, not-yet-confirmed change to a user's limits. 24h TTL; confirm
/// applies `proposed`, anything else (including expiry) leaves `previous` in
/// effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLimitChange {
    pub user_id: String,
    pub proposed: BudgetLimits,
    pub previous: BudgetLimits,
    pub created_at: DateTime<Utc>,
}

impl PendingLimitChange {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at).num_hours() >= 24
    }
}

/// Safety de-escalation applied after a `Block` verdict: daily and
/// per-item limits are halved for 24h, with enough of the original kept to
/// restore them once the window lapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeescalationRecord {
    pub user_id: String,
    pub original_daily_limit: Decimal,
    pub original_max_per_transaction: Decimal,
    pub applied_at: DateTime<Utc>,
}

impl DeescalationRecord {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.applied_at).num_hours() >= 24
    }
}

/// Rolling spend counters, reset by the scheduler at each window boundary.
/// `updated_at` lets the engine detect a stale tracker that needs a lazy
/// reset before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingTracker {
    pub user_id: String,
    pub daily_spent: Decimal,
    pub weekly_spent: Decimal,
    pub monthly_spent: Decimal,
    pub total_spent: Decimal,
    pub transaction_count: u64,
    pub average_transaction_size: Decimal,
    pub largest_transaction: Decimal,
    pub daily_window_start: DateTime<Utc>,
    pub weekly_window_start: DateTime<Utc>,
    pub monthly_window_start: DateTime<Utc>,
    pub transactions_today: u32,
    pub last_transaction_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SpendingTracker {
    pub fn new(user_id: String) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            daily_spent: Decimal::ZERO,
            weekly_spent: Decimal::ZERO,
            monthly_spent: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            transaction_count: 0,
            average_transaction_size: Decimal::ZERO,
            largest_transaction: Decimal::ZERO,
            daily_window_start: now,
            weekly_window_start: now,
            monthly_window_start: now,
            transactions_today: 0,
            last_transaction_at: None,
            updated_at: now,
        }
    }

    /// Reset whichever windows have elapsed. Idempotent: calling this twice
    /// in the same window is a no-op.
    pub fn reset_elapsed_windows(&mut self, now: DateTime<Utc>) {
        if now.signed_duration_since(self.daily_window_start).num_hours() >= 24 {
            self.daily_spent = Decimal::ZERO;
            self.transactions_today = 0;
            self.daily_window_start = now;
        }
        if now.signed_duration_since(self.weekly_window_start).num_days() >= 7 {
            self.weekly_spent = Decimal::ZERO;
            self.weekly_window_start = now;
        }
        if now.signed_duration_since(self.monthly_window_start).num_days() >= 30 {
            self.monthly_spent = Decimal::ZERO;
            self.monthly_window_start = now;
        }
    }

    pub fn record_spend(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.daily_spent += amount;
        self.weekly_spent += amount;
        self.monthly_spent += amount;
        self.total_spent += amount;
        self.transactions_today += 1;
        self.transaction_count += 1;
        self.average_transaction_size = (self.average_transaction_size * Decimal::from(self.transaction_count - 1) + amount)
            / Decimal::from(self.transaction_count);
        if amount > self.largest_transaction {
            self.largest_transaction = amount;
        }
        self.last_transaction_at = Some(now);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopRecord {
    pub user_id: String,
    pub active: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_reason: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl EmergencyStopRecord {
    pub fn inactive(user_id: String) -> Self {
        Self {
            user_id,
            active: false,
            triggered_at: None,
            triggered_reason: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn trigger(&mut self, reason: String, at: DateTime<Utc>) {
        self.active = true;
        self.triggered_at = Some(at);
        self.triggered_reason = Some(reason);
        self.resolved_at = None;
        self.resolved_by = None;
    }

    pub fn resolve(&mut self, resolved_by: String, at: DateTime<Utc>) {
        self.active = false;
        self.resolved_at = Some(at);
        self.resolved_by = Some(resolved_by);
    }
}

const TRANSACTION_RING_CAPACITY: usize = 100;
const DEVICE_RING_CAPACITY: usize = 5;
const IP_RING_CAPACITY: usize = 10;
const GEO_RING_CAPACITY: usize = 10;

/// Per-user behavioural history consulted by the suspicious-activity
/// scorer: a bounded ring of recent transactions, the set of hours the user
/// typically transacts in, and small bounded sets of device/IP/geo
/// identifiers seen before.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPattern {
    pub user_id: String,
    pub transactions: VecDeque<(DateTime<Utc>, Decimal)>,
    pub mean_amount: Decimal,
    pub typical_hours: HashSet<u32>,
    pub known_devices: VecDeque<String>,
    pub known_ips: VecDeque<String>,
    pub known_geos: VecDeque<String>,
}

impl ActivityPattern {
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            transactions: VecDeque::new(),
            mean_amount: Decimal::ZERO,
            typical_hours: HashSet::new(),
            known_devices: VecDeque::new(),
            known_ips: VecDeque::new(),
            known_geos: VecDeque::new(),
        }
    }

    pub fn transactions_since(&self, now: DateTime<Utc>, minutes: i64) -> u32 {
        self.transactions
            .iter()
            .filter(|(ts, _)| now.signed_duration_since(*ts).num_minutes() < minutes)
            .count() as u32
    }

    pub fn last_transaction_at(&self) -> Option<DateTime<Utc>> {
        self.transactions.back().map(|(ts, _)| *ts)
    }

    pub fn is_new_device(&self, device_id: &str) -> bool {
        !self.known_devices.iter().any(|d| d == device_id)
    }

    pub fn is_new_geo(&self, geo: &str) -> bool {
        !self.known_geos.iter().any(|g| g == geo)
    }

    /// Circular hour-of-day distance to the nearest typical hour; 0 if the
    /// user has no history yet.
    pub fn hour_distance(&self, hour: u32) -> u32 {
        self.typical_hours
            .iter()
            .map(|&h| {
                let diff = (hour as i32 - h as i32).abs();
                diff.min(24 - diff) as u32
            })
            .min()
            .unwrap_or(0)
    }

    /// Folds a transaction into the pattern: bounds the transaction ring to
    /// the last 100, recomputes the rolling mean, records the hour-of-day,
    /// and updates the bounded device/IP/geo sets.
    pub fn record(
        &mut self,
        now: DateTime<Utc>,
        amount: Decimal,
        device_id: Option<&str>,
        ip: Option<&str>,
        geo: Option<&str>,
    ) {
        self.transactions.push_back((now, amount));
        while self.transactions.len() > TRANSACTION_RING_CAPACITY {
            self.transactions.pop_front();
        }
        let count = self.transactions.len() as u64;
        self.mean_amount = self.transactions.iter().map(|(_, a)| *a).sum::<Decimal>() / Decimal::from(count);
        self.typical_hours.insert(now.hour());

        if let Some(device_id) = device_id {
            if self.is_new_device(device_id) {
                self.known_devices.push_back(device_id.to_string());
                while self.known_devices.len() > DEVICE_RING_CAPACITY {
                    self.known_devices.pop_front();
                }
            }
        }
        if let Some(ip) = ip {
            if !self.known_ips.iter().any(|v| v == ip) {
                self.known_ips.push_back(ip.to_string());
                while self.known_ips.len() > IP_RING_CAPACITY {
                    self.known_ips.pop_front();
                }
            }
        }
        if let Some(geo) = geo {
            if self.is_new_geo(geo) {
                self.known_geos.push_back(geo.to_string());
                while self.known_geos.len() > GEO_RING_CAPACITY {
                    self.known_geos.pop_front();
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionAction {
    Allow,
    Flag,
    RequireConfirmation,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspicionAssessment {
    pub score: u32,
    pub action: SuspicionAction,
    pub reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_elapsed_windows_is_idempotent_within_window() {
        let mut tracker = SpendingTracker::new("u1".into());
        tracker.record_spend(Decimal::from(10), Utc::now());
        let now = Utc::now();
        tracker.reset_elapsed_windows(now);
        let after_first = tracker.daily_spent;
        tracker.reset_elapsed_windows(now);
        assert_eq!(tracker.daily_spent, after_first);
        assert_eq!(tracker.daily_spent, Decimal::from(10));
    }

    #[test]
    fn reset_elapsed_windows_clears_after_24h() {
        let mut tracker = SpendingTracker::new("u1".into());
        tracker.record_spend(Decimal::from(10), Utc::now());
        tracker.daily_window_start = Utc::now() - chrono::Duration::hours(25);
        tracker.reset_elapsed_windows(Utc::now());
        assert_eq!(tracker.daily_spent, Decimal::ZERO);
        assert_eq!(tracker.transactions_today, 0);
    }

    #[test]
    fn record_spend_tracks_average_and_largest() {
        let mut tracker = SpendingTracker::new("u1".into());
        let now = Utc::now();
        tracker.record_spend(Decimal::from(10), now);
        tracker.record_spend(Decimal::from(30), now);
        assert_eq!(tracker.largest_transaction, Decimal::from(30));
        assert_eq!(tracker.average_transaction_size, Decimal::from(20));
    }

    #[test]
    fn emergency_stop_trigger_then_resolve_round_trips() {
        let mut record = EmergencyStopRecord::inactive("u1".into());
        record.trigger("threshold exceeded".into(), Utc::now());
        assert!(record.active);
        record.resolve("admin".into(), Utc::now());
        assert!(!record.active);
        assert_eq!(record.resolved_by.as_deref(), Some("admin"));
    }

    #[test]
    fn significant_change_detects_large_increase_and_small_decrease() {
        let previous = sample_limits();
        let mut grown = previous.clone();
        grown.daily_limit = previous.daily_limit * Decimal::from(3);
        assert!(grown.differs_significantly_from(&previous));

        let mut shrunk = previous.clone();
        shrunk.daily_limit = previous.daily_limit / Decimal::from(3);
        assert!(shrunk.differs_significantly_from(&previous));

        let mut modest = previous.clone();
        modest.daily_limit = previous.daily_limit * Decimal::new(110, 2);
        assert!(!modest.differs_significantly_from(&previous));
    }

    #[test]
    fn validate_rejects_window_ratio_violations() {
        let mut limits = sample_limits();
        limits.weekly_limit = limits.daily_limit * Decimal::from(3);
        assert!(limits.validate().is_err());
    }

    fn sample_limits() -> BudgetLimits {
        BudgetLimits {
            user_id: "u1".into(),
            max_per_transaction: Decimal::from(200),
            daily_limit: Decimal::from(500),
            weekly_limit: Decimal::from(3500),
            monthly_limit: Decimal::from(14000),
            total_limit: Some(Decimal::from(10000)),
            emergency_stop_threshold: Decimal::from(8000),
            reserve_amount: Decimal::from(500),
            currency: "USD".into(),
        }
    }

    #[test]
    fn activity_pattern_tracks_novel_device_and_geo() {
        let mut pattern = ActivityPattern::new("u1".into());
        let now = Utc::now();
        assert!(pattern.is_new_device("phone-1"));
        pattern.record(now, Decimal::from(10), Some("phone-1"), Some("1.2.3.4"), Some("US-CA"));
        assert!(!pattern.is_new_device("phone-1"));
        assert!(pattern.is_new_geo("US-NY"));
    }
}

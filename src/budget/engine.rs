//! Budget/risk approval engine.
//! The core transactional guard: every proposed spend runs the full
//! pipeline below before a caller is told whether to proceed. Per-user
//! state mutation is serialized so two concurrent requests from the same
//! user cannot both observe a stale tracker and both pass a window cap.
//! The in-memory per-user map is a hot cache in front of `BudgetStore`;
//! every mutation that matters beyond process lifetime is written through.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::budget::model::{
    ActivityPattern, BudgetLimits, DeescalationRecord, EmergencyStopRecord, PendingLimitChange,
    SpendingTracker, SuspicionAction,
};
use crate::budget::scorer::{SuspicionInput, SuspicionScorer};
use crate::store::BudgetStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    RequiresConfirmation,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ApprovalResult {
    pub decision: ApprovalDecision,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
    pub suspicion_score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendKind {
    Buy,
    Sell,
}

pub struct SpendRequest {
    pub user_id: String,
    pub amount: Decimal,
    pub moment_id: Option<String>,
    pub strategy: Option<String>,
    pub kind: SpendKind,
    pub device_id: Option<String>,
    pub geo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetLimitsOutcome {
    Applied,
    PendingConfirmation,
}

/// Thresholds and defaults the engine needs beyond what's in a single
/// request; sourced from process configuration.
#[derive(Debug, Clone)]
pub struct BudgetEngineConfig {
    pub warning_threshold: Decimal,
    pub suspicious_hourly_max: u32,
    pub suspicious_daily_max: u32,
    pub suspicious_amount_ratio_threshold: Decimal,
    pub suspicious_rapid_fire_secs: i64,
    pub default_daily_cap: Decimal,
    pub default_weekly_cap: Decimal,
    pub default_monthly_cap: Decimal,
    pub default_total_budget: Decimal,
    pub default_max_per_item: Decimal,
    pub default_emergency_threshold: Decimal,
    pub default_reserve: Decimal,
    pub default_currency: String,
}

impl BudgetEngineConfig {
    fn default_limits(&self, user_id: &str) -> BudgetLimits {
        BudgetLimits {
            user_id: user_id.to_string(),
            max_per_transaction: self.default_max_per_item,
            daily_limit: self.default_daily_cap,
            weekly_limit: self.default_weekly_cap,
            monthly_limit: self.default_monthly_cap,
            total_limit: Some(self.default_total_budget),
            emergency_stop_threshold: self.default_emergency_threshold,
            reserve_amount: self.default_reserve,
            currency: self.default_currency.clone(),
        }
    }
}

#[derive(Default)]
struct UserState {
    limits: Option<BudgetLimits>,
    tracker: Option<SpendingTracker>,
    emergency_stop: Option<EmergencyStopRecord>,
    pattern: Option<ActivityPattern>,
    pending_limit_change: Option<PendingLimitChange>,
    deescalation: Option<DeescalationRecord>,
}

pub struct BudgetEngine {
    config: BudgetEngineConfig,
    store: Arc<dyn BudgetStore>,
    states: SyncMutex<HashMap<String, UserState>>,
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BudgetEngine {
    pub fn new(config: BudgetEngineConfig, store: Arc<dyn BudgetStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            states: SyncMutex::new(HashMap::new()),
            locks: SyncMutex::new(HashMap::new()),
        })
    }

    /// Validates against the data-model invariants; if the change is
    /// significant (any field more than doubles or less than halves),
    /// stashes it as a pending change requiring explicit confirmation
    /// instead of applying it immediately.
    pub async fn set_limits(&self, limits: BudgetLimits) -> Result<SetLimitsOutcome, String> {
        limits.validate()?;
        self.hydrate_user(&limits.user_id).await;
        let mut states = self.states.lock();
        let entry = states.entry(limits.user_id.clone()).or_default();
        let outcome = match &entry.limits {
            Some(previous) if limits.differs_significantly_from(previous) => {
                entry.pending_limit_change = Some(PendingLimitChange {
                    user_id: limits.user_id.clone(),
                    proposed: limits,
                    previous: previous.clone(),
                    created_at: Utc::now(),
                });
                SetLimitsOutcome::PendingConfirmation
            }
            _ => {
                entry.limits = Some(limits);
                SetLimitsOutcome::Applied
            }
        };
        if let (SetLimitsOutcome::Applied, Some(limits)) = (outcome, entry.limits.clone()) {
            drop(states);
            self.store.save_limits(&limits).await;
        }
        Ok(outcome)
    }

    /// Applies the pending change on `confirm = true`, discards it
    /// otherwise. Errors if there is no pending change or it has expired.
    pub async fn confirm_limit_change(&self, user_id: &str, confirm: bool) -> Result<(), String> {
        let pending = {
            let mut states = self.states.lock();
            let entry = states.get_mut(user_id).ok_or_else(|| "no pending limit change for this user".to_string())?;
            let pending = entry
                .pending_limit_change
                .take()
                .ok_or_else(|| "no pending limit change for this user".to_string())?;
            if pending.expired(Utc::now()) {
                return Err("pending limit change has expired".to_string());
            }
            if confirm {
                entry.limits = Some(pending.proposed.clone());
            }
            pending
        };
        if confirm {
            self.store.save_limits(&pending.proposed).await;
        }
        Ok(())
    }

    pub fn emergency_stop_status(&self, user_id: &str) -> Option<EmergencyStopRecord> {
        self.states.lock().get(user_id).and_then(|s| s.emergency_stop.clone())
    }

    pub async fn trigger_emergency_stop(&self, user_id: &str, reason: String) {
        let record = {
            let mut states = self.states.lock();
            let entry = states.entry(user_id.to_string()).or_default();
            let record = entry
                .emergency_stop
                .get_or_insert_with(|| EmergencyStopRecord::inactive(user_id.to_string()));
            record.trigger(reason, Utc::now());
            record.clone()
        };
        self.store.save_emergency_stop(&record).await;
    }

    pub async fn resolve_emergency_stop(&self, user_id: &str, resolved_by: String) -> Result<(), String> {
        self.hydrate_user(user_id).await;
        let record = {
            let mut states = self.states.lock();
            let entry = states.get_mut(user_id).ok_or_else(|| "no emergency-stop record for this user".to_string())?;
            let record = entry
                .emergency_stop
                .as_mut()
                .ok_or_else(|| "no emergency-stop record for this user".to_string())?;
            record.resolve(resolved_by, Utc::now());
            record.clone()
        };
        self.store.save_emergency_stop(&record).await;
        Ok(())
    }

    fn user_lock(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Loads limits/tracker/emergency-stop from the store into the hot
    /// cache on first contact for a user, creating default limits if the
    /// store has nothing either.
    async fn hydrate_user(&self, user_id: &str) {
        let needs_limits = !self.states.lock().get(user_id).map(|s| s.limits.is_some()).unwrap_or(false);
        if !needs_limits {
            return;
        }
        let limits = match self.store.load_limits(user_id).await {
            Some(limits) => limits,
            None => {
                let defaults = self.config.default_limits(user_id);
                self.store.save_limits(&defaults).await;
                defaults
            }
        };
        let tracker = self.store.load_tracker(user_id).await;
        let emergency_stop = self.store.load_emergency_stop(user_id).await;

        let mut states = self.states.lock();
        let entry = states.entry(user_id.to_string()).or_default();
        if entry.limits.is_none() {
            entry.limits = Some(limits);
        }
        if entry.tracker.is_none() {
            entry.tracker = tracker;
        }
        if entry.emergency_stop.is_none() {
            entry.emergency_stop = emergency_stop;
        }
    }

    /// Runs the full approval pipeline. Holds a per-user async lock for the
    /// duration so concurrent requests from one user are serialized; other
    /// users proceed independently.
    pub async fn evaluate(&self, request: SpendRequest) -> ApprovalResult {
        let lock = self.user_lock(&request.user_id);
        let _guard = lock.lock().await;
        self.hydrate_user(&request.user_id).await;
        let (result, tracker, emergency_stop, deescalated) = self.evaluate_locked(request);
        if let Some(tracker) = tracker {
            self.store.save_tracker(&tracker).await;
        }
        if let Some(emergency_stop) = emergency_stop {
            self.store.save_emergency_stop(&emergency_stop).await;
        }
        if let Some(limits) = deescalated {
            self.store.save_limits(&limits).await;
        }
        result
    }

    /// Returns the approval result plus whatever mutated state needs to be
    /// written through to the store: the tracker (if recorded), a newly
    /// triggered emergency-stop record, and the halved limits from a
    /// de-escalation.
    fn evaluate_locked(
        &self,
        request: SpendRequest,
    ) -> (ApprovalResult, Option<SpendingTracker>, Option<EmergencyStopRecord>, Option<BudgetLimits>) {
        let mut warnings = Vec::new();
        let now = Utc::now();

        let mut states = self.states.lock();
        let state = states.entry(request.user_id.clone()).or_default();

        if let Some(stop) = &state.emergency_stop {
            if stop.active {
                return (reject("emergency stop is active for this user", 0, warnings), None, None, None);
            }
        }

        let Some(limits) = state.limits.clone() else {
            return (reject("no budget limits configured for this user", 0, warnings), None, None, None);
        };

        // step 3: per-item cap
        if request.amount > limits.max_per_transaction {
            return (reject("amount exceeds the per-transaction limit", 100, warnings), None, None, None);
        }

        let tracker = state.tracker.get_or_insert_with(|| SpendingTracker::new(request.user_id.clone()));
        tracker.reset_elapsed_windows(now);

        // step 4: per-window caps
        let projected_daily = tracker.daily_spent + request.amount;
        if projected_daily > limits.daily_limit {
            return (reject("daily spending limit would be exceeded", 90, warnings), None, None, None);
        }
        if tracker.weekly_spent + request.amount > limits.weekly_limit {
            return (reject("weekly spending limit would be exceeded", 85, warnings), None, None, None);
        }
        if tracker.monthly_spent + request.amount > limits.monthly_limit {
            return (reject("monthly spending limit would be exceeded", 80, warnings), None, None, None);
        }
        if let Some(total_limit) = limits.total_limit {
            if tracker.total_spent + request.amount > total_limit {
                return (reject("lifetime spending limit would be exceeded", 95, warnings), None, None, None);
            }
        }

        // step 5: emergency threshold
        if tracker.total_spent + request.amount >= limits.emergency_stop_threshold {
            let reason = "cumulative spend crossed the emergency-stop threshold".to_string();
            let mut stop = state
                .emergency_stop
                .clone()
                .unwrap_or_else(|| EmergencyStopRecord::inactive(request.user_id.clone()));
            stop.trigger(reason.clone(), now);
            state.emergency_stop = Some(stop.clone());
            warn!(user_id = %request.user_id, "emergency stop triggered by cumulative spend");
            return (reject(&reason, 100, warnings), None, Some(stop), None);
        }

        // step 6: suspicious-activity scorer
        let pattern = state.pattern.get_or_insert_with(|| ActivityPattern::new(request.user_id.clone()));
        let hourly_tx_count = pattern.transactions_since(now, 60);
        let daily_tx_count = tracker.transactions_today;
        let input = SuspicionInput {
            amount: request.amount,
            now,
            hourly_tx_count,
            daily_tx_count,
            hourly_max: self.config.suspicious_hourly_max,
            daily_max: self.config.suspicious_daily_max,
            amount_ratio_threshold: self.config.suspicious_amount_ratio_threshold,
            rapid_fire_secs: self.config.suspicious_rapid_fire_secs,
            device_id: request.device_id.as_deref(),
            geo: request.geo.as_deref(),
            pattern,
        };
        let assessment = SuspicionScorer::assess(&input);

        let mut deescalated_limits = None;
        let decision = match assessment.action {
            SuspicionAction::Block => {
                let record = deescalate(state, now);
                deescalated_limits = record;
                ApprovalDecision::Rejected
            }
            SuspicionAction::RequireConfirmation => ApprovalDecision::RequiresConfirmation,
            SuspicionAction::Flag => {
                warnings.extend(assessment.reasons.iter().cloned());
                ApprovalDecision::Approved
            }
            SuspicionAction::Allow => ApprovalDecision::Approved,
        };

        if decision != ApprovalDecision::Approved {
            let reason = match decision {
                ApprovalDecision::Rejected => "suspicious-activity score exceeded the block threshold",
                ApprovalDecision::RequiresConfirmation => "suspicious-activity score requires explicit confirmation",
                ApprovalDecision::Approved => unreachable!(),
            };
            return (
                ApprovalResult {
                    decision,
                    reason: Some(reason.to_string()),
                    warnings,
                    suspicion_score: assessment.score,
                },
                None,
                None,
                deescalated_limits,
            );
        }

        // step 7: additional safety, terminal rejections gated on base risk
        let daily_remaining = limits.daily_limit - tracker.daily_spent;
        let base_risk_elevated = assessment.score >= 70;
        if base_risk_elevated && !daily_remaining.is_zero() && request.amount > daily_remaining * Decimal::new(50, 2) {
            return (
                reject_with_score("transaction would consume more than half the remaining daily budget under elevated risk", assessment.score, warnings),
                None,
                None,
                None,
            );
        }
        if base_risk_elevated && hourly_tx_count > 10 {
            return (
                reject_with_score("hourly transaction count exceeded under elevated risk", assessment.score, warnings),
                None,
                None,
                None,
            );
        }

        // step 8: warning-threshold utilisation
        push_utilisation_warnings(&mut warnings, &limits, tracker, projected_daily, &self.config.warning_threshold);

        // recording: only buy-type approvals mutate the tracker
        if request.kind == SpendKind::Buy {
            tracker.record_spend(request.amount, now);
            pattern.record(now, request.amount, request.device_id.as_deref(), None, request.geo.as_deref());
            info!(user_id = %request.user_id, %request.amount, "spend approved and recorded");
        } else {
            info!(user_id = %request.user_id, %request.amount, "spend approved, not recorded (not a buy)");
        }

        let recorded_tracker = if request.kind == SpendKind::Buy { Some(tracker.clone()) } else { None };

        (
            ApprovalResult { decision: ApprovalDecision::Approved, reason: None, warnings, suspicion_score: assessment.score },
            recorded_tracker,
            None,
            None,
        )
    }

    /// Called by the reset scheduler at minute granularity: zeroes elapsed
    /// windows for every known tracker and restores any de-escalation whose
    /// 24h window has lapsed.
    pub async fn run_scheduled_resets(&self, now: DateTime<Utc>) {
        let (trackers, restored_limits) = {
            let mut states = self.states.lock();
            let mut trackers = Vec::new();
            let mut restored_limits = Vec::new();
            for state in states.values_mut() {
                if let Some(tracker) = state.tracker.as_mut() {
                    tracker.reset_elapsed_windows(now);
                    trackers.push(tracker.clone());
                }
                if let Some(record) = state.deescalation.clone() {
                    if record.expired(now) {
                        if let Some(limits) = state.limits.as_mut() {
                            limits.daily_limit = record.original_daily_limit;
                            limits.max_per_transaction = record.original_max_per_transaction;
                            restored_limits.push(limits.clone());
                        }
                        state.deescalation = None;
                    }
                }
            }
            (trackers, restored_limits)
        };
        for tracker in &trackers {
            self.store.save_tracker(tracker).await;
        }
        for limits in &restored_limits {
            self.store.save_limits(limits).await;
        }
    }
}

/// Halves the user's daily and per-item limits for 24h, storing the
/// originals so `run_scheduled_resets` can restore them. A no-op (returns
/// `None`) if a de-escalation is already active, so repeated `Block`
/// verdicts inside the window don't keep halving.
fn deescalate(state: &mut UserState, now: DateTime<Utc>) -> Option<BudgetLimits> {
    if state.deescalation.is_some() {
        return None;
    }
    let limits = state.limits.as_mut()?;
    let record = DeescalationRecord {
        user_id: limits.user_id.clone(),
        original_daily_limit: limits.daily_limit,
        original_max_per_transaction: limits.max_per_transaction,
        applied_at: now,
    };
    limits.daily_limit /= Decimal::from(2);
    limits.max_per_transaction /= Decimal::from(2);
    state.deescalation = Some(record);
    Some(limits.clone())
}

fn push_utilisation_warnings(
    warnings: &mut Vec<String>,
    limits: &BudgetLimits,
    tracker: &SpendingTracker,
    projected_daily: Decimal,
    warning_threshold: &Decimal,
) {
    let windows: [(&str, Decimal, Decimal); 3] = [
        ("daily", projected_daily, limits.daily_limit),
        ("weekly", tracker.weekly_spent, limits.weekly_limit),
        ("monthly", tracker.monthly_spent, limits.monthly_limit),
    ];
    for (label, spent, cap) in windows {
        if !cap.is_zero() && spent / cap >= *warning_threshold {
            warnings.push(format!("{label} spending has crossed the warning threshold"));
        }
    }
    if let Some(total_limit) = limits.total_limit {
        if !total_limit.is_zero() && tracker.total_spent / total_limit >= *warning_threshold {
            warnings.push("total spending has crossed the warning threshold".to_string());
        }
    }
}

fn reject(reason: &str, score: u32, warnings: Vec<String>) -> ApprovalResult {
    ApprovalResult { decision: ApprovalDecision::Rejected, reason: Some(reason.to_string()), warnings, suspicion_score: score }
}

fn reject_with_score(reason: &str, score: u32, warnings: Vec<String>) -> ApprovalResult {
    reject(reason, score, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn engine() -> Arc<BudgetEngine> {
        BudgetEngine::new(test_config(), SqliteStore::open(":memory:").unwrap())
    }

    fn test_config() -> BudgetEngineConfig {
        BudgetEngineConfig {
            warning_threshold: Decimal::new(80, 2),
            suspicious_hourly_max: 10,
            suspicious_daily_max: 30,
            suspicious_amount_ratio_threshold: Decimal::from(3),
            suspicious_rapid_fire_secs: 5,
            default_daily_cap: Decimal::from(500),
            default_weekly_cap: Decimal::from(3500),
            default_monthly_cap: Decimal::from(14000),
            default_total_budget: Decimal::from(10000),
            default_max_per_item: Decimal::from(200),
            default_emergency_threshold: Decimal::from(8000),
            default_reserve: Decimal::ZERO,
            default_currency: "USD".to_string(),
        }
    }

    fn limits(user_id: &str) -> BudgetLimits {
        BudgetLimits {
            user_id: user_id.to_string(),
            max_per_transaction: Decimal::from(500),
            daily_limit: Decimal::from(1000),
            weekly_limit: Decimal::from(7000),
            monthly_limit: Decimal::from(28000),
            total_limit: None,
            emergency_stop_threshold: Decimal::from(900),
            reserve_amount: Decimal::ZERO,
            currency: "USD".to_string(),
        }
    }

    fn request(user_id: &str, amount: i64) -> SpendRequest {
        SpendRequest {
            user_id: user_id.to_string(),
            amount: Decimal::from(amount),
            moment_id: None,
            strategy: None,
            kind: SpendKind::Buy,
            device_id: None,
            geo: None,
        }
    }

    #[tokio::test]
    async fn within_limits_is_approved() {
        let engine = engine();
        engine.set_limits(limits("u1")).await.unwrap();
        let result = engine.evaluate(request("u1", 50)).await;
        assert_eq!(result.decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn exceeding_per_transaction_limit_is_rejected_with_risk_100() {
        let engine = engine();
        engine.set_limits(limits("u1")).await.unwrap();
        let result = engine.evaluate(request("u1", 600)).await;
        assert_eq!(result.decision, ApprovalDecision::Rejected);
        assert_eq!(result.suspicion_score, 100);
    }

    #[tokio::test]
    async fn daily_cap_rejects_once_exhausted_with_risk_90() {
        let engine = engine();
        engine.set_limits(limits("u1")).await.unwrap();
        for _ in 0..3 {
            let _ = engine.evaluate(request("u1", 300)).await;
        }
        let result = engine.evaluate(request("u1", 300)).await;
        assert_eq!(result.decision, ApprovalDecision::Rejected);
        assert_eq!(result.suspicion_score, 90);
    }

    #[tokio::test]
    async fn emergency_stop_blocks_all_spend_until_resolved() {
        let engine = engine();
        engine.set_limits(limits("u1")).await.unwrap();
        engine.trigger_emergency_stop("u1", "manual test trigger".into()).await;
        let result = engine.evaluate(request("u1", 10)).await;
        assert_eq!(result.decision, ApprovalDecision::Rejected);

        engine.resolve_emergency_stop("u1", "admin".into()).await.unwrap();
        let result = engine.evaluate(request("u1", 10)).await;
        assert_eq!(result.decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn crossing_emergency_threshold_trips_the_stop() {
        let engine = engine();
        let mut lim = limits("u1");
        lim.daily_limit = Decimal::from(1000);
        lim.emergency_stop_threshold = Decimal::from(400);
        engine.set_limits(lim).await.unwrap();

        let result = engine.evaluate(request("u1", 450)).await;
        assert_eq!(result.decision, ApprovalDecision::Rejected);
        assert!(engine.emergency_stop_status("u1").unwrap().active);
    }

    #[tokio::test]
    async fn block_verdict_halves_daily_and_per_item_limits() {
        let engine = engine();
        engine.set_limits(limits("u1")).await.unwrap();
        for i in 0..12 {
            let mut req = request("u1", 5);
            req.device_id = Some(format!("device-{i}"));
            let _ = engine.evaluate(req).await;
        }
        let mut req = request("u1", 5);
        req.device_id = Some("device-new".into());
        let _ = engine.evaluate(req).await;

        let stored = engine.states.lock().get("u1").unwrap().limits.clone().unwrap();
        assert!(stored.daily_limit < limits("u1").daily_limit);
    }

    #[tokio::test]
    async fn significant_limit_change_requires_confirmation() {
        let engine = engine();
        engine.set_limits(limits("u1")).await.unwrap();
        let mut raised = limits("u1");
        raised.daily_limit = limits("u1").daily_limit * Decimal::from(5);
        raised.weekly_limit = raised.daily_limit * Decimal::from(7);
        raised.monthly_limit = raised.weekly_limit * Decimal::from(4);
        let outcome = engine.set_limits(raised).await.unwrap();
        assert_eq!(outcome, SetLimitsOutcome::PendingConfirmation);

        let stored = engine.states.lock().get("u1").unwrap().limits.clone().unwrap();
        assert_eq!(stored.daily_limit, limits("u1").daily_limit);

        engine.confirm_limit_change("u1", true).await.unwrap();
        let stored = engine.states.lock().get("u1").unwrap().limits.clone().unwrap();
        assert_eq!(stored.daily_limit, limits("u1").daily_limit * Decimal::from(5));
    }
}

//! Suspicious-activity scorer.
//! A point-budget model: each risk factor contributes points, the total is
//! capped at 100 before thresholding (so a pile-up of factors never produces
//! an out-of-range score), then mapped to an action via fixed thresholds.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::budget::model::{ActivityPattern, SuspicionAction, SuspicionAssessment};

const THRESHOLD_FLAG: u32 = 30;
const THRESHOLD_CONFIRM: u32 = 60;
const THRESHOLD_BLOCK: u32 = 80;

/// Everything the scorer needs beyond the stored activity pattern: the
/// request itself, the counters the engine already has to hand, and the
/// configured thresholds.
pub struct SuspicionInput<'a> {
    pub amount: Decimal,
    pub now: DateTime<Utc>,
    pub hourly_tx_count: u32,
    pub daily_tx_count: u32,
    pub hourly_max: u32,
    pub daily_max: u32,
    pub amount_ratio_threshold: Decimal,
    pub rapid_fire_secs: i64,
    pub device_id: Option<&'a str>,
    pub geo: Option<&'a str>,
    pub pattern: &'a ActivityPattern,
}

pub struct SuspicionScorer;

impl SuspicionScorer {
    pub fn assess(input: &SuspicionInput) -> SuspicionAssessment {
        let mut score: u32 = 0;
        let mut reasons = Vec::new();

        if input.hourly_tx_count >= input.hourly_max {
            score += 30;
            reasons.push("hourly transaction count at or above the configured maximum".to_string());
        }
        if input.daily_tx_count >= input.daily_max {
            score += 40;
            reasons.push("daily transaction count at or above the configured maximum".to_string());
        }

        if !input.pattern.mean_amount.is_zero() {
            let ratio = input.amount / input.pattern.mean_amount;
            if ratio > input.amount_ratio_threshold {
                let points = (ratio * Decimal::from(5)).min(Decimal::from(25)).to_u32().unwrap_or(25);
                score += points;
                reasons.push("amount is far above the user's rolling average".to_string());
            }
        }

        if let Some(last) = input.pattern.last_transaction_at() {
            let seconds = input.now.signed_duration_since(last).num_seconds();
            if seconds < input.rapid_fire_secs {
                score += 20;
                reasons.push("transaction fired inside the rapid-fire window".to_string());
            }
        }

        let distance = input.pattern.hour_distance(input.now.hour());
        if distance > 3 {
            score += (distance * 2).min(15);
            reasons.push("current hour is far from the user's typical activity hours".to_string());
        }

        if let Some(geo) = input.geo {
            if input.pattern.is_new_geo(geo) {
                score += 10;
                reasons.push("transaction originates from a new geolocation".to_string());
                if input.pattern.known_geos.len() >= 5 {
                    score += 15;
                }
            }
        }
        if let Some(device_id) = input.device_id {
            if input.pattern.is_new_device(device_id) {
                score += 10;
                reasons.push("transaction originates from a new device".to_string());
                if input.pattern.known_devices.len() >= 2 {
                    score += 15;
                }
            }
        }

        let score = score.min(100);
        let action = action_for_score(score);

        SuspicionAssessment { score, action, reasons }
    }
}

fn action_for_score(score: u32) -> SuspicionAction {
    match score {
        s if s >= THRESHOLD_BLOCK => SuspicionAction::Block,
        s if s >= THRESHOLD_CONFIRM => SuspicionAction::RequireConfirmation,
        s if s >= THRESHOLD_FLAG => SuspicionAction::Flag,
        _ => SuspicionAction::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline<'a>(pattern: &'a ActivityPattern, now: DateTime<Utc>) -> SuspicionInput<'a> {
        SuspicionInput {
            amount: Decimal::from(10),
            now,
            hourly_tx_count: 0,
            daily_tx_count: 1,
            hourly_max: 10,
            daily_max: 30,
            amount_ratio_threshold: Decimal::from(3),
            rapid_fire_secs: 5,
            device_id: None,
            geo: None,
            pattern,
        }
    }

    #[test]
    fn quiet_pattern_is_allowed() {
        let pattern = ActivityPattern::new("u1".into());
        let assessment = SuspicionScorer::assess(&baseline(&pattern, Utc::now()));
        assert_eq!(assessment.action, SuspicionAction::Allow);
        assert_eq!(assessment.score, 0);
    }

    #[test]
    fn hourly_and_daily_velocity_add_expected_points() {
        let pattern = ActivityPattern::new("u1".into());
        let now = Utc::now();
        let mut input = baseline(&pattern, now);
        input.hourly_tx_count = 10;
        let hourly = SuspicionScorer::assess(&input);
        assert_eq!(hourly.score, 30);

        input.daily_tx_count = 30;
        let both = SuspicionScorer::assess(&input);
        assert_eq!(both.score, 70);
        assert_eq!(both.action, SuspicionAction::RequireConfirmation);
    }

    #[test]
    fn new_device_then_new_device_with_history_adds_bonus() {
        let now = Utc::now();
        let mut pattern = ActivityPattern::new("u1".into());
        pattern.known_devices.push_back("d1".into());
        pattern.known_devices.push_back("d2".into());
        let mut input = baseline(&pattern, now);
        input.device_id = Some("d3");
        let assessment = SuspicionScorer::assess(&input);
        assert_eq!(assessment.score, 25);
    }

    #[test]
    fn rapid_fire_within_threshold_adds_points() {
        let now = Utc::now();
        let mut pattern = ActivityPattern::new("u1".into());
        pattern.record(now - chrono::Duration::seconds(2), Decimal::from(10), None, None, None);
        let input = baseline(&pattern, now);
        let assessment = SuspicionScorer::assess(&input);
        assert_eq!(assessment.score, 20);
    }

    #[test]
    fn score_never_exceeds_one_hundred() {
        let now = Utc::now();
        let mut pattern = ActivityPattern::new("u1".into());
        pattern.record(now - chrono::Duration::seconds(1), Decimal::from(10), None, None, None);
        pattern.known_devices.push_back("d1".into());
        pattern.known_devices.push_back("d2".into());
        pattern.known_geos.push_back("g1".into());
        for i in 0..5 {
            pattern.known_geos.push_back(format!("g{i}"));
        }
        let mut input = baseline(&pattern, now);
        input.hourly_tx_count = 50;
        input.daily_tx_count = 50;
        input.amount = Decimal::from(1000);
        input.device_id = Some("new-device");
        input.geo = Some("new-geo");
        let assessment = SuspicionScorer::assess(&input);
        assert!(assessment.score <= 100);
        assert_eq!(assessment.action, SuspicionAction::Block);
    }

    #[test]
    fn threshold_boundaries_map_to_expected_actions() {
        assert_eq!(action_for_score(29), SuspicionAction::Allow);
        assert_eq!(action_for_score(30), SuspicionAction::Flag);
        assert_eq!(action_for_score(59), SuspicionAction::Flag);
        assert_eq!(action_for_score(60), SuspicionAction::RequireConfirmation);
        assert_eq!(action_for_score(79), SuspicionAction::RequireConfirmation);
        assert_eq!(action_for_score(80), SuspicionAction::Block);
    }
}

//! Budget/Risk Core: transactional spend approval with
//! suspicious-activity scoring and emergency-stop handling.

pub mod engine;
pub mod model;
pub mod scorer;

pub use engine::{
    ApprovalDecision, ApprovalResult, BudgetEngine, BudgetEngineConfig, SetLimitsOutcome,
    SpendKind, SpendRequest,
};
pub use model::{
    ActivityPattern, BudgetLimits, DeescalationRecord, EmergencyStopRecord, PendingLimitChange,
    SpendingTracker, SuspicionAction, SuspicionAssessment,
};
pub use scorer::{SuspicionInput, SuspicionScorer};

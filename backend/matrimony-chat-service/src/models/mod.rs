pub mod conversation;
pub mod message;
pub mod quota;
pub mod user;

pub use conversation::{Conversation, ConversationId};
pub use message::{
    DeliveryReceipt, DeliveryState, DeliveryUpdate, Message, MessageType, NewMessage, PageCursor,
    Transition,
};
pub use quota::{FailurePolicy, Feature, FeatureLimit, PlanLimits, QuotaDecision, QuotaWindow};
pub use user::{CurrentUser, Plan, ProfileSummary, Role};

use chrono::{DateTime, SubsecRound, Utc};

/// Current time truncated to the precision PostgreSQL stores, so cursors
/// handed to clients round-trip exactly through either store.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

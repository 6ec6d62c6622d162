pub mod authorization;
pub mod chat_service;
pub mod collaborators;
pub mod conversation_service;
pub mod delivery_tracker;
pub mod notification_bridge;
pub mod quota_ledger;

pub use authorization::{AccessPolicy, RoleAccessPolicy};
pub use chat_service::{ChatService, SendMessageRequest};
pub use conversation_service::{ConversationService, MessagePayload};
pub use delivery_tracker::{BulkReadResult, DeliveryTracker};
pub use notification_bridge::NotificationBridge;
pub use quota_ledger::QuotaLedger;

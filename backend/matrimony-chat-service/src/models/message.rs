//! Message entity and the per-recipient delivery state machine.
//!
//! Delivery state only moves forward: `Sending -> Sent -> Delivered -> Read`,
//! with `Failed` reachable only from `Sending` or `Sent`. Both stores apply
//! transitions through [`DeliveryState::transition_to`] inside their own
//! transaction so the rule lives in one place.

use super::conversation::ConversationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Voice,
    Image,
    File,
    Icebreaker,
}

impl MessageType {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "voice" => Some(Self::Voice),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "icebreaker" => Some(Self::Icebreaker),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::File => "file",
            Self::Icebreaker => "icebreaker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Result of asking the state machine to move a message to a target state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed to the contained value
    Applied(DeliveryState),
    /// Already at or past the target; the current state is kept
    NoOp(DeliveryState),
    /// The target is not reachable from the current state
    Invalid(DeliveryState),
}

impl DeliveryState {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Whether a message in this state is included in the recipient's unread counter.
    pub fn counts_as_unread(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }

    pub fn transition_to(self, target: DeliveryState) -> Transition {
        use DeliveryState::*;

        match (self, target) {
            (Sending, Sent) | (Sent, Delivered) | (Sent, Read) | (Delivered, Read) => {
                Transition::Applied(target)
            }
            (Sending | Sent, Failed) => Transition::Applied(Failed),

            (current, target) if current == target => Transition::NoOp(current),
            (Sent | Delivered | Read, Sending | Sent) => Transition::NoOp(self),
            (Read, Delivered) => Transition::NoOp(self),

            (current, _) => Transition::Invalid(current),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub user_id: Uuid,
    pub status: DeliveryState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub reply_to_id: Option<Uuid>,
    pub client_message_id: Option<String>,
    pub delivery_state: DeliveryState,
    pub delivery_receipts: Vec<DeliveryReceipt>,
}

impl Message {
    /// Who a receipt for `status` is attributed to. Sending and failing
    /// happen on the sender's side; delivery and reading on the recipient's.
    pub fn receipt_user(&self, status: DeliveryState) -> Uuid {
        match status {
            DeliveryState::Sending | DeliveryState::Sent | DeliveryState::Failed => self.sender_id,
            DeliveryState::Delivered | DeliveryState::Read => self.recipient_id,
        }
    }
}

/// Validated input for a message append
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub message_type: MessageType,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub client_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            message_type: self.message_type,
            content: self.content,
            created_at: self.created_at,
            edited_at: None,
            reply_to_id: self.reply_to_id,
            client_message_id: self.client_message_id,
            delivery_state: DeliveryState::Sent,
            delivery_receipts: vec![DeliveryReceipt {
                user_id: self.sender_id,
                status: DeliveryState::Sent,
                timestamp: self.created_at,
            }],
        }
    }
}

/// Keyset cursor for newest-first pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub before: DateTime<Utc>,
    pub before_id: Option<Uuid>,
}

impl PageCursor {
    /// True when a row at `(created_at, id)` sorts strictly after the cursor
    /// in `(created_at DESC, id DESC)` order.
    pub fn admits(&self, created_at: DateTime<Utc>, id: Uuid) -> bool {
        match self.before_id {
            Some(before_id) => {
                created_at < self.before || (created_at == self.before && id < before_id)
            }
            None => created_at < self.before,
        }
    }
}

/// Outcome of a single delivery transition, as stored
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryUpdate {
    pub message_id: Uuid,
    #[serde(skip)]
    pub conversation_id: ConversationId,
    #[serde(skip)]
    pub recipient_id: Uuid,
    pub state: DeliveryState,
    pub changed: bool,
    #[serde(skip)]
    pub rejected: bool,
}

impl DeliveryUpdate {
    pub fn from_transition(message: &Message, transition: Transition) -> Self {
        let (state, changed, rejected) = match transition {
            Transition::Applied(state) => (state, true, false),
            Transition::NoOp(state) => (state, false, false),
            Transition::Invalid(state) => (state, false, true),
        };
        Self {
            message_id: message.id,
            conversation_id: message.conversation_id.clone(),
            recipient_id: message.recipient_id,
            state,
            changed,
            rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryState::*;

    const ALL: [DeliveryState; 5] = [Sending, Sent, Delivered, Read, Failed];

    fn rank(state: DeliveryState) -> u8 {
        match state {
            Sending => 0,
            Sent => 1,
            Delivered => 2,
            Read => 3,
            Failed => 4,
        }
    }

    #[test]
    fn test_forward_transitions_apply() {
        assert_eq!(Sent.transition_to(Delivered), Transition::Applied(Delivered));
        assert_eq!(Sent.transition_to(Read), Transition::Applied(Read));
        assert_eq!(Delivered.transition_to(Read), Transition::Applied(Read));
        assert_eq!(Sending.transition_to(Failed), Transition::Applied(Failed));
        assert_eq!(Sent.transition_to(Failed), Transition::Applied(Failed));
    }

    #[test]
    fn test_late_delivery_after_read_is_noop() {
        assert_eq!(Read.transition_to(Delivered), Transition::NoOp(Read));
        assert_eq!(Read.transition_to(Read), Transition::NoOp(Read));
    }

    #[test]
    fn test_failed_and_sending_reject_delivery() {
        assert_eq!(Failed.transition_to(Delivered), Transition::Invalid(Failed));
        assert_eq!(Sending.transition_to(Delivered), Transition::Invalid(Sending));
        assert_eq!(Delivered.transition_to(Failed), Transition::Invalid(Delivered));
    }

    #[test]
    fn test_state_never_regresses() {
        for from in ALL {
            for to in ALL {
                if let Transition::Applied(next) = from.transition_to(to) {
                    assert!(
                        next == Failed || rank(next) > rank(from),
                        "{from} -> {to} regressed to {next}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_cursor_with_tie_break() {
        let t = Utc::now();
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        let cursor = PageCursor {
            before: t,
            before_id: Some(high),
        };

        assert!(cursor.admits(t, low));
        assert!(!cursor.admits(t, high));
        assert!(!cursor.admits(t + chrono::Duration::seconds(1), low));

        let plain = PageCursor {
            before: t,
            before_id: None,
        };
        assert!(!plain.admits(t, low));
    }

    #[test]
    fn test_receipt_user_follows_side_of_transition() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let message = NewMessage {
            id: Uuid::new_v4(),
            conversation_id: ConversationId::between(a, b).unwrap(),
            sender_id: a,
            recipient_id: b,
            message_type: MessageType::Text,
            content: "hi".into(),
            reply_to_id: None,
            client_message_id: None,
            created_at: Utc::now(),
        }
        .into_message();

        assert_eq!(message.receipt_user(Failed), a);
        assert_eq!(message.receipt_user(Sent), a);
        assert_eq!(message.receipt_user(Delivered), b);
        assert_eq!(message.receipt_user(Read), b);
    }
}

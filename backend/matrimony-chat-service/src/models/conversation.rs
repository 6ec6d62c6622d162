use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Deterministic 1:1 conversation id: both participant UUIDs, sorted, joined with `_`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Returns `None` when both sides are the same user.
    pub fn between(a: Uuid, b: Uuid) -> Option<Self> {
        if a == b {
            return None;
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Some(Self(format!("{}_{}", low, high)))
    }

    /// Parse an id received from a client, rejecting anything that is not
    /// the canonical form of two distinct, sorted UUIDs.
    pub fn parse(raw: &str) -> Option<Self> {
        let (left, right) = raw.split_once('_')?;
        let a = Uuid::parse_str(left).ok()?;
        let b = Uuid::parse_str(right).ok()?;
        let id = Self::between(a, b)?;
        (id.0 == raw).then_some(id)
    }

    pub fn participants(&self) -> Option<(Uuid, Uuid)> {
        let (left, right) = self.0.split_once('_')?;
        Some((Uuid::parse_str(left).ok()?, Uuid::parse_str(right).ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_ids: [Uuid; 2],
    pub last_message_id: Option<Uuid>,
    pub last_activity_at: DateTime<Utc>,
    pub unread_count: HashMap<Uuid, i64>,
    pub archived_by: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, a: Uuid, b: Uuid, now: DateTime<Utc>) -> Self {
        let participant_ids = if a < b { [a, b] } else { [b, a] };
        Self {
            id,
            participant_ids,
            last_message_id: None,
            last_activity_at: now,
            unread_count: participant_ids.iter().map(|p| (*p, 0)).collect(),
            archived_by: BTreeSet::new(),
            created_at: now,
        }
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participant_ids.contains(&user_id)
    }

    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participant_ids {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn unread_for(&self, user_id: Uuid) -> i64 {
        self.unread_count.get(&user_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(ConversationId::between(a, b), ConversationId::between(b, a));
    }

    #[test]
    fn test_self_conversation_is_rejected() {
        let a = Uuid::new_v4();
        assert!(ConversationId::between(a, a).is_none());
    }

    #[test]
    fn test_parse_accepts_only_canonical_ids() {
        let a = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let b = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        let id = ConversationId::between(a, b).unwrap();

        assert_eq!(ConversationId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(id.participants(), Some((a, b)));

        let reversed = format!("{}_{}", b, a);
        assert!(ConversationId::parse(&reversed).is_none());
        assert!(ConversationId::parse("not-a-conversation").is_none());
    }

    #[test]
    fn test_other_participant() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conv = Conversation::new(ConversationId::between(a, b).unwrap(), a, b, Utc::now());

        assert_eq!(conv.other_participant(a), Some(b));
        assert_eq!(conv.other_participant(b), Some(a));
        assert_eq!(conv.other_participant(Uuid::new_v4()), None);
        assert_eq!(conv.unread_for(a), 0);
    }
}

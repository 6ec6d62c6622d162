//! PostgreSQL store on deadpool-postgres.
//!
//! Atomicity per method:
//! - quota windows: `pg_advisory_xact_lock` on `user:feature`, then count and insert
//! - monthly counters: a single conditional upsert
//! - keyed consumes: the partial unique index on `usage_events.idempotency_key`
//! - appends: message insert, conversation touch and unread increment in one transaction
//! - delivery transitions: `SELECT ... FOR UPDATE` on the message row

use super::{AppendOutcome, MessageStore, StoreError, UsageStore, WindowedConsume};
use crate::models::{
    Conversation, ConversationId, DeliveryReceipt, DeliveryState, DeliveryUpdate, Feature,
    Message, MessageType, NewMessage, PageCursor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::{BTreeSet, HashMap};
use tokio_postgres::{GenericClient, Row};
use tracing::debug;
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, recipient_id, message_type, content, \
     created_at, edited_at, reply_to_id, client_message_id, delivery_state, delivery_receipts";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn message_from_row(row: &Row) -> Result<Message, StoreError> {
    let conversation_id: String = row.get("conversation_id");
    let message_type: String = row.get("message_type");
    let delivery_state: String = row.get("delivery_state");
    let receipts: serde_json::Value = row.get("delivery_receipts");

    Ok(Message {
        id: row.get("id"),
        conversation_id: ConversationId::parse(&conversation_id).ok_or_else(|| {
            StoreError::Backend(format!("invalid conversation id: {conversation_id}"))
        })?,
        sender_id: row.get("sender_id"),
        recipient_id: row.get("recipient_id"),
        message_type: MessageType::from_db(&message_type)
            .ok_or_else(|| StoreError::Backend(format!("invalid message type: {message_type}")))?,
        content: row.get("content"),
        created_at: row.get("created_at"),
        edited_at: row.get("edited_at"),
        reply_to_id: row.get("reply_to_id"),
        client_message_id: row.get("client_message_id"),
        delivery_state: DeliveryState::from_db(&delivery_state).ok_or_else(|| {
            StoreError::Backend(format!("invalid delivery state: {delivery_state}"))
        })?,
        delivery_receipts: serde_json::from_value::<Vec<DeliveryReceipt>>(receipts)
            .map_err(|e| StoreError::Backend(format!("invalid delivery receipts: {e}")))?,
    })
}

fn receipt_json(user_id: Uuid, status: DeliveryState, at: DateTime<Utc>) -> serde_json::Value {
    let receipt = DeliveryReceipt {
        user_id,
        status,
        timestamp: at,
    };
    serde_json::json!([receipt])
}

async fn load_conversation<C: GenericClient + Sync>(
    client: &C,
    id: &ConversationId,
) -> Result<Option<Conversation>, StoreError> {
    let Some(row) = client
        .query_opt(
            r#"
            SELECT participant_a, participant_b, last_message_id, last_activity_at, created_at
            FROM conversations
            WHERE id = $1
            "#,
            &[&id.as_str()],
        )
        .await?
    else {
        return Ok(None);
    };

    let participants = client
        .query(
            "SELECT user_id, unread_count, archived_at FROM conversation_participants WHERE conversation_id = $1",
            &[&id.as_str()],
        )
        .await?;

    let mut unread_count = HashMap::new();
    let mut archived_by = BTreeSet::new();
    for p in &participants {
        let user_id: Uuid = p.get("user_id");
        let unread: i32 = p.get("unread_count");
        let archived_at: Option<DateTime<Utc>> = p.get("archived_at");
        unread_count.insert(user_id, i64::from(unread));
        if archived_at.is_some() {
            archived_by.insert(user_id);
        }
    }

    Ok(Some(Conversation {
        id: id.clone(),
        participant_ids: [row.get("participant_a"), row.get("participant_b")],
        last_message_id: row.get("last_message_id"),
        last_activity_at: row.get("last_activity_at"),
        unread_count,
        archived_by,
        created_at: row.get("created_at"),
    }))
}

async fn find_by_client_id<C: GenericClient + Sync>(
    client: &C,
    sender_id: Uuid,
    client_message_id: &str,
) -> Result<Option<Message>, StoreError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = $1 AND client_message_id = $2"
    );
    client
        .query_opt(sql.as_str(), &[&sender_id, &client_message_id])
        .await?
        .map(|row| message_from_row(&row))
        .transpose()
}

/// Returns the number of rows written; 0 means the key was already recorded.
async fn insert_usage_event<C: GenericClient + Sync>(
    client: &C,
    user_id: Uuid,
    feature: Feature,
    now: DateTime<Utc>,
    idempotency_key: Option<&str>,
) -> Result<u64, StoreError> {
    let inserted = client
        .execute(
            r#"
            INSERT INTO usage_events (id, user_id, feature, occurred_at, idempotency_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, feature, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            "#,
            &[&Uuid::new_v4(), &user_id, &feature.as_str(), &now, &idempotency_key],
        )
        .await?;
    Ok(inserted)
}

#[async_trait]
impl MessageStore for PgStore {
    async fn get_or_create_conversation(
        &self,
        id: &ConversationId,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            r#"
            INSERT INTO conversations (id, participant_a, participant_b, last_activity_at, created_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
            &[&id.as_str(), &low, &high, &now],
        )
        .await?;
        tx.execute(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id)
            VALUES ($1, $2), ($1, $3)
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            "#,
            &[&id.as_str(), &low, &high],
        )
        .await?;

        let conversation = load_conversation(&*tx, id).await?.ok_or(StoreError::NotFound)?;
        tx.commit().await?;
        Ok(conversation)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let client = self.pool.get().await?;
        load_conversation(&**client, id).await
    }

    async fn append_message(&self, new: NewMessage) -> Result<AppendOutcome, StoreError> {
        let mut client = self.pool.get().await?;

        if let Some(client_id) = new.client_message_id.as_deref() {
            if let Some(existing) = find_by_client_id(&**client, new.sender_id, client_id).await? {
                return Ok(AppendOutcome {
                    message: existing,
                    created: false,
                });
            }
        }

        let tx = client.transaction().await?;
        let exists = tx
            .query_opt(
                "SELECT 1 FROM conversations WHERE id = $1 FOR UPDATE",
                &[&new.conversation_id.as_str()],
            )
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let message = new.into_message();
        let receipts = serde_json::to_value(&message.delivery_receipts)
            .map_err(|e| StoreError::Backend(format!("encode receipts: {e}")))?;

        let inserted = tx
            .execute(
                r#"
                INSERT INTO messages (
                    id, conversation_id, sender_id, recipient_id, message_type, content,
                    created_at, reply_to_id, client_message_id, delivery_state, delivery_receipts
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (sender_id, client_message_id) WHERE client_message_id IS NOT NULL
                DO NOTHING
                "#,
                &[
                    &message.id,
                    &message.conversation_id.as_str(),
                    &message.sender_id,
                    &message.recipient_id,
                    &message.message_type.to_db(),
                    &message.content,
                    &message.created_at,
                    &message.reply_to_id,
                    &message.client_message_id,
                    &message.delivery_state.to_db(),
                    &receipts,
                ],
            )
            .await?;

        if inserted == 0 {
            // A concurrent retry with the same client id won the insert
            tx.rollback().await?;
            let client_id = message.client_message_id.as_deref().unwrap_or_default();
            let existing = find_by_client_id(&**client, message.sender_id, client_id)
                .await?
                .ok_or_else(|| StoreError::Conflict("duplicate client message id".into()))?;
            return Ok(AppendOutcome {
                message: existing,
                created: false,
            });
        }

        tx.execute(
            "UPDATE conversations SET last_message_id = $2, last_activity_at = $3 WHERE id = $1",
            &[&message.conversation_id.as_str(), &message.id, &message.created_at],
        )
        .await?;
        tx.execute(
            r#"
            UPDATE conversation_participants
            SET unread_count = unread_count + 1, archived_at = NULL
            WHERE conversation_id = $1 AND user_id = $2
            "#,
            &[&message.conversation_id.as_str(), &message.recipient_id],
        )
        .await?;

        tx.commit().await?;
        Ok(AppendOutcome {
            message,
            created: true,
        })
    }

    async fn list_messages(
        &self,
        id: &ConversationId,
        limit: usize,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<Message>, StoreError> {
        let client = self.pool.get().await?;
        let before = cursor.map(|c| c.before);
        let before_id = cursor.and_then(|c| c.before_id);
        let limit = limit as i64;

        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
              AND (
                $2::timestamptz IS NULL
                OR created_at < $2
                OR ($3::uuid IS NOT NULL AND created_at = $2 AND id < $3)
              )
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        );

        let rows = client
            .query(sql.as_str(), &[&id.as_str(), &before, &before_id, &limit])
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        client
            .query_opt(sql.as_str(), &[&message_id])
            .await?
            .map(|row| message_from_row(&row))
            .transpose()
    }

    async fn find_client_message(
        &self,
        sender_id: Uuid,
        client_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let client = self.pool.get().await?;
        find_by_client_id(&**client, sender_id, client_message_id).await
    }

    async fn transition_message(
        &self,
        message_id: Uuid,
        target: DeliveryState,
        now: DateTime<Utc>,
    ) -> Result<DeliveryUpdate, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE");
        let row = tx
            .query_opt(sql.as_str(), &[&message_id])
            .await?
            .ok_or(StoreError::NotFound)?;
        let message = message_from_row(&row)?;

        let before = message.delivery_state;
        let update = DeliveryUpdate::from_transition(&message, before.transition_to(target));
        if !update.changed {
            tx.rollback().await?;
            return Ok(update);
        }

        tx.execute(
            r#"
            UPDATE messages
            SET delivery_state = $2, delivery_receipts = delivery_receipts || $3
            WHERE id = $1
            "#,
            &[
                &message_id,
                &update.state.to_db(),
                &receipt_json(message.receipt_user(update.state), update.state, now),
            ],
        )
        .await?;

        if before.counts_as_unread() && !update.state.counts_as_unread() {
            tx.execute(
                r#"
                UPDATE conversation_participants
                SET unread_count = GREATEST(unread_count - 1, 0)
                WHERE conversation_id = $1 AND user_id = $2
                "#,
                &[&message.conversation_id.as_str(), &message.recipient_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(update)
    }

    async fn mark_read_bulk(
        &self,
        id: &ConversationId,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Serializes with appends and single transitions touching this counter
        tx.query_opt(
            r#"
            SELECT unread_count FROM conversation_participants
            WHERE conversation_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
            &[&id.as_str(), &recipient_id],
        )
        .await?
        .ok_or(StoreError::NotFound)?;

        let updated = tx
            .execute(
                r#"
                UPDATE messages
                SET delivery_state = 'read', delivery_receipts = delivery_receipts || $3
                WHERE conversation_id = $1
                  AND recipient_id = $2
                  AND delivery_state IN ('sent', 'delivered')
                "#,
                &[
                    &id.as_str(),
                    &recipient_id,
                    &receipt_json(recipient_id, DeliveryState::Read, now),
                ],
            )
            .await?;

        tx.execute(
            "UPDATE conversation_participants SET unread_count = 0 WHERE conversation_id = $1 AND user_id = $2",
            &[&id.as_str(), &recipient_id],
        )
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn unread_counts(
        &self,
        user_id: Uuid,
    ) -> Result<HashMap<ConversationId, i64>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT conversation_id, unread_count FROM conversation_participants WHERE user_id = $1",
                &[&user_id],
            )
            .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("conversation_id");
            let unread: i32 = row.get("unread_count");
            let id = ConversationId::parse(&raw)
                .ok_or_else(|| StoreError::Backend(format!("invalid conversation id: {raw}")))?;
            counts.insert(id, i64::from(unread));
        }
        Ok(counts)
    }

    async fn archive_conversation(
        &self,
        id: &ConversationId,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE conversation_participants
                SET archived_at = COALESCE(archived_at, $3)
                WHERE conversation_id = $1 AND user_id = $2
                "#,
                &[&id.as_str(), &user_id, &now],
            )
            .await?;
        Ok(updated > 0)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn consume_windowed(
        &self,
        user_id: Uuid,
        feature: Feature,
        limit: u32,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<WindowedConsume, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let lock_key = format!("{}:{}", user_id, feature.as_str());

        tx.execute("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))", &[&lock_key])
            .await?;

        let row = tx
            .query_one(
                r#"
                SELECT COUNT(*) AS used, MIN(occurred_at) AS oldest
                FROM usage_events
                WHERE user_id = $1 AND feature = $2 AND occurred_at >= $3
                "#,
                &[&user_id, &feature.as_str(), &since],
            )
            .await?;
        let used: i64 = row.get("used");
        let oldest: Option<DateTime<Utc>> = row.get("oldest");

        if let Some(key) = idempotency_key {
            let replayed = tx
                .query_opt(
                    "SELECT 1 FROM usage_events WHERE user_id = $1 AND feature = $2 AND idempotency_key = $3",
                    &[&user_id, &feature.as_str(), &key],
                )
                .await?
                .is_some();
            if replayed {
                tx.rollback().await?;
                debug!(user_id = %user_id, feature = %feature, "usage already recorded for key");
                return Ok(WindowedConsume::Recorded {
                    used: used.max(0) as u32,
                });
            }
        }

        if used >= i64::from(limit) {
            tx.rollback().await?;
            return Ok(WindowedConsume::Full { oldest });
        }

        insert_usage_event(&*tx, user_id, feature, now, idempotency_key).await?;
        tx.commit().await?;

        Ok(WindowedConsume::Recorded {
            used: (used + 1) as u32,
        })
    }

    async fn consume_monthly(
        &self,
        user_id: Uuid,
        feature: Feature,
        limit: u32,
        month_key: &str,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<u32>, StoreError> {
        // The upsert below inserts count = 1 unconditionally for a fresh row
        if limit == 0 {
            return Ok(None);
        }

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);

        // Event first: a concurrent insert of the same key waits on the unique
        // index and then conflicts, so only one of them reaches the counter.
        if insert_usage_event(&*tx, user_id, feature, now, idempotency_key).await? == 0 {
            let row = tx
                .query_opt(
                    "SELECT count FROM monthly_usage_counters WHERE user_id = $1 AND feature = $2 AND month_key = $3",
                    &[&user_id, &feature.as_str(), &month_key],
                )
                .await?;
            tx.rollback().await?;
            debug!(user_id = %user_id, feature = %feature, "usage already recorded for key");
            return Ok(Some(row.map(|r| r.get::<_, i32>("count").max(0) as u32).unwrap_or(0)));
        }

        let row = tx
            .query_opt(
                r#"
                INSERT INTO monthly_usage_counters (user_id, feature, month_key, count, updated_at)
                VALUES ($1, $2, $3, 1, $5)
                ON CONFLICT (user_id, feature, month_key)
                DO UPDATE SET count = monthly_usage_counters.count + 1, updated_at = EXCLUDED.updated_at
                WHERE monthly_usage_counters.count < $4
                RETURNING count
                "#,
                &[&user_id, &feature.as_str(), &month_key, &limit, &now],
            )
            .await?;

        let Some(row) = row else {
            // Also drops the event inserted above
            tx.rollback().await?;
            return Ok(None);
        };
        let count: i32 = row.get("count");
        tx.commit().await?;

        Ok(Some(count.max(0) as u32))
    }

    async fn record_event(
        &self,
        user_id: Uuid,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        insert_usage_event(&**client, user_id, feature, now, None).await?;
        Ok(())
    }

    async fn count_events(
        &self,
        user_id: Uuid,
        feature: Feature,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS used, MIN(occurred_at) AS oldest
                FROM usage_events
                WHERE user_id = $1 AND feature = $2 AND occurred_at >= $3
                "#,
                &[&user_id, &feature.as_str(), &since],
            )
            .await?;
        let used: i64 = row.get("used");
        Ok((used.max(0) as u32, row.get("oldest")))
    }

    async fn monthly_count(
        &self,
        user_id: Uuid,
        feature: Feature,
        month_key: &str,
    ) -> Result<u32, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT count FROM monthly_usage_counters WHERE user_id = $1 AND feature = $2 AND month_key = $3",
                &[&user_id, &feature.as_str(), &month_key],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, i32>("count").max(0) as u32).unwrap_or(0))
    }
}

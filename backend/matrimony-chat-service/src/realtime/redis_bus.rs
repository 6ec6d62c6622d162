//! Cross-instance fan-out over Redis pub/sub.
//!
//! Every instance PSUBSCRIBEs to `conversation:*` and feeds what it hears into
//! its local registry, so a publish on any instance reaches subscribers on all
//! of them. Presence is a Redis set per `(conversation, user)` holding the ids
//! of open subscriptions, refreshed while they live and expiring with a TTL
//! if an instance dies without cleaning up.

use super::registry::{LocalRegistry, RegistryEntry};
use super::{PubSub, PubSubError, RealtimeEvent, Subscription, SubscriptionGuard};
use crate::models::ConversationId;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

const CHANNEL_PREFIX: &str = "conversation:";

fn channel_for_conversation(id: &ConversationId) -> String {
    format!("{CHANNEL_PREFIX}{id}")
}

fn presence_key(id: &ConversationId, user_id: Uuid) -> String {
    format!("presence:{id}:{user_id}")
}

pub struct RedisPubSub {
    publisher: ConnectionManager,
    local: LocalRegistry,
    presence_ttl: Duration,
    listener: JoinHandle<()>,
}

impl RedisPubSub {
    pub async fn connect(url: &str, presence_ttl: Duration) -> Result<Self, PubSubError> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let local = LocalRegistry::new();

        let listener = tokio::spawn(run_listener(client, local.clone()));

        Ok(Self {
            publisher,
            local,
            presence_ttl,
            listener,
        })
    }

    async fn touch_presence(
        conn: &mut ConnectionManager,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> redis::RedisResult<()> {
        redis::pipe()
            .cmd("SADD")
            .arg(key)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async::<_, ()>(conn)
            .await
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Keeps the presence entry alive and removes it on drop
struct PresenceEntry {
    _local: RegistryEntry,
    refresher: JoinHandle<()>,
    conn: ConnectionManager,
    key: String,
    member: String,
}

impl Drop for PresenceEntry {
    fn drop(&mut self) {
        self.refresher.abort();

        let mut conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        let member = std::mem::take(&mut self.member);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = conn.srem::<_, _, ()>(&key, &member).await {
                    debug!(error = %e, key = %key, "presence cleanup failed; entry will expire");
                }
            });
        }
    }
}

impl SubscriptionGuard for PresenceEntry {}

async fn run_listener(client: Client, registry: LocalRegistry) {
    loop {
        if let Err(e) = listen(&client, &registry).await {
            error!(error = %e, "redis pubsub listener failed; reconnecting");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[allow(deprecated)]
async fn listen(client: &Client, registry: &LocalRegistry) -> redis::RedisResult<()> {
    // PubSub requires a dedicated connection, not multiplexed
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;
    let mut stream = pubsub.on_message();

    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, channel = %channel, "undecodable pubsub payload");
                continue;
            }
        };

        let Some(conversation_id) = channel
            .strip_prefix(CHANNEL_PREFIX)
            .and_then(ConversationId::parse)
        else {
            continue;
        };

        match serde_json::from_str::<RealtimeEvent>(&payload) {
            Ok(event) => {
                registry.broadcast(&conversation_id, &event);
            }
            Err(e) => warn!(error = %e, channel = %channel, "malformed realtime event"),
        }
    }
    Ok(())
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(
        &self,
        conversation_id: &ConversationId,
        event: RealtimeEvent,
    ) -> Result<(), PubSubError> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.publisher.clone();

        if let Err(e) = conn
            .publish::<_, _, ()>(channel_for_conversation(conversation_id), payload)
            .await
        {
            // Same-instance subscribers still get the event
            warn!(error = %e, conversation_id = %conversation_id, "redis publish failed; delivering locally");
            self.local.broadcast(conversation_id, &event);
            return Err(e.into());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        user_id: Uuid,
    ) -> Result<Subscription, PubSubError> {
        let (id, receiver) = self.local.add_subscriber(conversation_id, user_id);
        let local = RegistryEntry {
            registry: self.local.clone(),
            conversation_id: conversation_id.clone(),
            id,
        };

        let key = presence_key(conversation_id, user_id);
        let member = id.to_string();
        let mut conn = self.publisher.clone();
        // On failure `local` drops here and unregisters the subscriber
        Self::touch_presence(&mut conn, &key, &member, self.presence_ttl).await?;

        let refresher = {
            let mut conn = conn.clone();
            let key = key.clone();
            let member = member.clone();
            let ttl = self.presence_ttl;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval((ttl / 2).max(Duration::from_secs(1)));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = Self::touch_presence(&mut conn, &key, &member, ttl).await {
                        warn!(error = %e, key = %key, "presence refresh failed");
                    }
                }
            })
        };

        let guard = PresenceEntry {
            _local: local,
            refresher,
            conn,
            key,
            member,
        };
        Ok(Subscription::new(id, receiver, Box::new(guard)))
    }

    async fn has_live_subscriber(&self, conversation_id: &ConversationId, user_id: Uuid) -> bool {
        if self.local.has_user(conversation_id, user_id) {
            return true;
        }

        let mut conn = self.publisher.clone();
        match conn
            .scard::<_, usize>(presence_key(conversation_id, user_id))
            .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                warn!(error = %e, "presence lookup failed; treating recipient as offline");
                false
            }
        }
    }

    fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        self.local.subscriber_count(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_and_presence_naming() {
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let conv = ConversationId::between(a, b).unwrap();

        let channel = channel_for_conversation(&conv);
        assert_eq!(
            channel.strip_prefix(CHANNEL_PREFIX).and_then(ConversationId::parse),
            Some(conv.clone())
        );
        assert_eq!(presence_key(&conv, a), format!("presence:{}:{}", conv, a));
    }
}

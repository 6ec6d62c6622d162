//! Notification escalation with a paused clock.

mod common;

use common::RecordingTransport;
use matrimony_chat_service::config::NotificationConfig;
use matrimony_chat_service::models::{
    utc_now, ConversationId, DeliveryState, Message, MessageType, NewMessage, ProfileSummary,
};
use matrimony_chat_service::realtime::{InMemoryPubSub, PubSub};
use matrimony_chat_service::services::collaborators::StaticProfiles;
use matrimony_chat_service::services::NotificationBridge;
use matrimony_chat_service::store::{MemoryStore, MessageStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Fixture {
    bridge: NotificationBridge,
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryPubSub>,
    profiles: Arc<StaticProfiles>,
    transport: Arc<RecordingTransport>,
    conversation_id: ConversationId,
    sender: Uuid,
    recipient: Uuid,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryPubSub::new());
    let profiles = Arc::new(StaticProfiles::new());
    let transport = Arc::new(RecordingTransport::default());
    let bridge = NotificationBridge::new(
        store.clone(),
        bus.clone(),
        profiles.clone(),
        transport.clone(),
        NotificationConfig {
            grace: Duration::from_secs(10),
            coalesce_window: Duration::from_secs(60),
            max_tracked_windows: 16,
        },
    );

    let (sender, recipient) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation_id = ConversationId::between(sender, recipient).unwrap();
    store
        .get_or_create_conversation(&conversation_id, sender, recipient, utc_now())
        .await
        .unwrap();

    Fixture {
        bridge,
        store,
        bus,
        profiles,
        transport,
        conversation_id,
        sender,
        recipient,
    }
}

impl Fixture {
    async fn persist(&self, content: &str) -> Message {
        self.store
            .append_message(NewMessage {
                id: Uuid::new_v4(),
                conversation_id: self.conversation_id.clone(),
                sender_id: self.sender,
                recipient_id: self.recipient,
                message_type: MessageType::Text,
                content: content.to_string(),
                reply_to_id: None,
                client_message_id: None,
                created_at: utc_now(),
            })
            .await
            .unwrap()
            .message
    }
}

#[tokio::test(start_paused = true)]
async fn test_unseen_message_notifies_after_grace() {
    let f = fixture().await;
    f.profiles.insert(ProfileSummary {
        id: f.sender,
        name: "Priya".into(),
        avatar_url: None,
    });

    let message = f.persist("Namaste! Would love to chat").await;
    f.bridge.on_message_persisted(&message).await.await.unwrap();

    let sent = f.transport.payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient_id, f.recipient);
    assert_eq!(sent[0].title, "Priya");
    assert_eq!(sent[0].body, "Namaste! Would love to chat");
    assert_eq!(sent[0].message_id, Some(message.id));
    assert_eq!(f.bridge.tracked_windows(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_sender_uses_fallback_name() {
    let f = fixture().await;
    let message = f.persist("hello").await;
    f.bridge.on_message_persisted(&message).await.await.unwrap();

    assert_eq!(f.transport.payloads()[0].title, "Someone");
}

#[tokio::test(start_paused = true)]
async fn test_live_recipient_is_not_notified() {
    let f = fixture().await;
    let _watching = f.bus.subscribe(&f.conversation_id, f.recipient).await.unwrap();

    let message = f.persist("you there?").await;
    f.bridge.on_message_persisted(&message).await.await.unwrap();

    assert!(f.transport.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recipient_live_at_publish_is_not_notified_after_leaving() {
    let f = fixture().await;
    let watching = f.bus.subscribe(&f.conversation_id, f.recipient).await.unwrap();

    let message = f.persist("saw this live").await;
    let pending = f.bridge.on_message_persisted(&message).await;

    // Closes the chat before the grace window ends
    tokio::time::sleep(Duration::from_secs(5)).await;
    drop(watching);
    assert!(!f.bus.has_live_subscriber(&f.conversation_id, f.recipient).await);

    pending.await.unwrap();
    assert!(f.transport.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_message_read_during_grace_is_not_notified() {
    let f = fixture().await;
    let message = f.persist("quick one").await;
    let pending = f.bridge.on_message_persisted(&message).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    let update = f
        .store
        .transition_message(message.id, DeliveryState::Read, utc_now())
        .await
        .unwrap();
    assert!(update.changed);

    pending.await.unwrap();
    assert!(f.transport.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_coalesced_into_one_summary() {
    let f = fixture().await;

    let first = f.persist("first").await;
    let owner = f.bridge.on_message_persisted(&first).await;

    // The first push has gone out and the window is open
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(f.transport.payloads().len(), 1);
    assert_eq!(f.bridge.tracked_windows(), 1);

    let second = f.persist("second").await;
    let third = f.persist("third").await;
    let followers = [
        f.bridge.on_message_persisted(&second).await,
        f.bridge.on_message_persisted(&third).await,
    ];

    for handle in followers {
        handle.await.unwrap();
    }
    owner.await.unwrap();

    let sent = f.transport.payloads();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body, "first");
    assert_eq!(sent[1].body, "2 new messages");
    assert_eq!(sent[1].unread_batch, 2);
    assert_eq!(sent[1].message_id, None);
    assert_eq!(f.bridge.tracked_windows(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_summary_dropped_when_recipient_caught_up() {
    let f = fixture().await;

    let first = f.persist("first").await;
    let owner = f.bridge.on_message_persisted(&first).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    let second = f.persist("second").await;
    f.bridge.on_message_persisted(&second).await.await.unwrap();

    // Recipient opens the conversation before the window closes
    f.store
        .mark_read_bulk(&f.conversation_id, f.recipient, utc_now())
        .await
        .unwrap();
    owner.await.unwrap();

    assert_eq!(f.transport.payloads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_summary_push_keeps_window_open() {
    let f = fixture().await;

    let one = f.persist("one").await;
    let owner = f.bridge.on_message_persisted(&one).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    let two = f.persist("two").await;
    let second = f.bridge.on_message_persisted(&two).await;

    // The first window ends at t=70 with a summary for "two"
    tokio::time::sleep(Duration::from_secs(51)).await;
    let three = f.persist("three").await;
    let third = f.bridge.on_message_persisted(&three).await;

    // "three" clears its grace at t=81, inside the window the summary opened
    tokio::time::sleep(Duration::from_secs(11)).await;
    let bodies: Vec<String> = f.transport.payloads().into_iter().map(|p| p.body).collect();
    assert_eq!(bodies, ["one", "1 new message"]);
    assert_eq!(f.bridge.tracked_windows(), 1);

    second.await.unwrap();
    third.await.unwrap();
    owner.await.unwrap();

    let sent = f.transport.payloads();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].body, "1 new message");
    assert_eq!(sent[2].unread_batch, 1);
    assert_eq!(f.bridge.tracked_windows(), 0);
}

//! Send, deliver and read through the service layer.

mod common;

use common::{harness, test_config, user};
use matrimony_chat_service::error::AppError;
use matrimony_chat_service::models::{DeliveryState, Feature, MessageType, Plan, QuotaDecision};
use matrimony_chat_service::realtime::{PubSub, RealtimeEvent};
use matrimony_chat_service::services::{MessagePayload, SendMessageRequest};

fn text(recipient_id: uuid::Uuid, content: &str) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id: None,
        recipient_id,
        payload: MessagePayload {
            message_type: MessageType::Text,
            content: content.to_string(),
            reply_to_id: None,
            client_message_id: None,
        },
    }
}

#[tokio::test]
async fn test_sent_delivered_bulk_read_then_late_delivery_is_noop() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Free), user(Plan::Free));

    let message = h.state.chat.send_message(&alice, text(bob.id, "hi bob")).await.unwrap();
    assert_eq!(message.delivery_state, DeliveryState::Sent);

    let delivered = h.state.delivery.mark_delivered(message.id, bob.id).await.unwrap();
    assert!(delivered.changed);
    assert_eq!(delivered.state, DeliveryState::Delivered);

    let bulk = h
        .state
        .delivery
        .mark_read_bulk(&message.conversation_id, &bob)
        .await
        .unwrap();
    assert_eq!(bulk.updated, 1);

    let counts = h.state.delivery.unread_counts(&bob, bob.id).await.unwrap();
    assert_eq!(counts.get(&message.conversation_id), Some(&0));

    let late = h.state.delivery.mark_delivered(message.id, bob.id).await.unwrap();
    assert!(!late.changed);
    assert_eq!(late.state, DeliveryState::Read);
}

#[tokio::test]
async fn test_unread_conservation() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Premium), user(Plan::Free));

    let mut conversation_id = None;
    for i in 0..7 {
        let message = h
            .state
            .chat
            .send_message(&alice, text(bob.id, &format!("message {i}")))
            .await
            .unwrap();
        conversation_id = Some(message.conversation_id);
    }
    let conversation_id = conversation_id.unwrap();

    let counts = h.state.delivery.unread_counts(&bob, bob.id).await.unwrap();
    assert_eq!(counts.get(&conversation_id), Some(&7));
    // The sender's own messages never count against them
    let counts = h.state.delivery.unread_counts(&alice, alice.id).await.unwrap();
    assert_eq!(counts.get(&conversation_id), Some(&0));

    let bulk = h
        .state
        .delivery
        .mark_read_bulk(&conversation_id, &bob)
        .await
        .unwrap();
    assert_eq!(bulk.updated, 7);
    let counts = h.state.delivery.unread_counts(&bob, bob.id).await.unwrap();
    assert_eq!(counts.get(&conversation_id), Some(&0));

    // Nothing left to read
    let again = h
        .state
        .delivery
        .mark_read_bulk(&conversation_id, &bob)
        .await
        .unwrap();
    assert_eq!(again.updated, 0);
}

#[tokio::test]
async fn test_send_publishes_to_live_subscribers() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Free), user(Plan::Free));
    let conversation = h.state.conversations.get_or_create(alice.id, bob.id).await.unwrap();

    let mut bob_stream = h.state.chat.subscribe(&bob, &conversation.id).await.unwrap();
    assert!(h.bus.has_live_subscriber(&conversation.id, bob.id).await);

    let sent = h.state.chat.send_message(&alice, text(bob.id, "are you there?")).await.unwrap();
    match bob_stream.recv().await {
        Some(RealtimeEvent::NewMessage { message }) => assert_eq!(message.id, sent.id),
        other => panic!("expected new_message, got {other:?}"),
    }

    h.state.delivery.mark_read(sent.id, bob.id).await.unwrap();
    match bob_stream.recv().await {
        Some(RealtimeEvent::MessageRead { message_id, reader_id, .. }) => {
            assert_eq!(message_id, Some(sent.id));
            assert_eq!(reader_id, bob.id);
        }
        other => panic!("expected message_read, got {other:?}"),
    }
}

#[tokio::test]
async fn test_free_quota_gates_sends_before_persisting() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Free), user(Plan::Free));

    for i in 0..50 {
        h.state
            .chat
            .send_message(&alice, text(bob.id, &format!("#{i}")))
            .await
            .unwrap();
    }
    let err = h
        .state
        .chat
        .send_message(&alice, text(bob.id, "one too many"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded { .. }));

    // Voice notes draw from their own allowance
    let mut voice = text(bob.id, "https://cdn.example/voice/1.ogg");
    voice.payload.message_type = MessageType::Voice;
    assert!(h.state.chat.send_message(&alice, voice).await.is_ok());

    let counts = h.state.delivery.unread_counts(&bob, bob.id).await.unwrap();
    assert_eq!(counts.values().sum::<i64>(), 51);
}

#[tokio::test]
async fn test_replayed_client_message_id_is_free() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Free), user(Plan::Free));

    let mut request = text(bob.id, "icebreaker!");
    request.payload.message_type = MessageType::Icebreaker;
    request.payload.client_message_id = Some("device-1:42".into());

    let first = h.state.chat.send_message(&alice, request.clone()).await.unwrap();
    for _ in 0..5 {
        let replay = h.state.chat.send_message(&alice, request.clone()).await.unwrap();
        assert_eq!(replay.id, first.id);
    }

    // Free plan allows 3 icebreakers; the replays consumed none
    let status = h
        .state
        .quota
        .peek(alice.id, Feature::IcebreakerSent, Plan::Free)
        .await
        .unwrap();
    assert_eq!(status, QuotaDecision::Allowed { remaining: Some(2) });
}

#[tokio::test]
async fn test_blocked_send_spends_no_quota() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Free), user(Plan::Free));
    h.safety.block(alice.id, bob.id);

    let err = h.state.chat.send_message(&alice, text(bob.id, "hello?")).await.unwrap_err();
    assert!(matches!(err, AppError::Blocked));

    let status = h
        .state
        .quota
        .peek(alice.id, Feature::MessageSent, Plan::Free)
        .await
        .unwrap();
    assert_eq!(status, QuotaDecision::Allowed { remaining: Some(50) });
}

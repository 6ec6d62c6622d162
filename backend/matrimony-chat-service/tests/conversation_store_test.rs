//! Conversation creation and message pagination.

mod common;

use chrono::Duration;
use common::{harness, test_config, user};
use matrimony_chat_service::models::{
    utc_now, ConversationId, MessageType, NewMessage, PageCursor, Plan,
};
use matrimony_chat_service::store::{MemoryStore, MessageStore};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn new_message(
    conversation_id: &ConversationId,
    sender_id: Uuid,
    recipient_id: Uuid,
    created_at: chrono::DateTime<chrono::Utc>,
) -> NewMessage {
    NewMessage {
        id: Uuid::new_v4(),
        conversation_id: conversation_id.clone(),
        sender_id,
        recipient_id,
        message_type: MessageType::Text,
        content: "hello".into(),
        reply_to_id: None,
        client_message_id: None,
        created_at,
    }
}

#[tokio::test]
async fn test_concurrent_get_or_create_yields_one_conversation() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let conversations = h.state.conversations.clone();
            // Half the callers pass the pair in the other order
            let (a, b) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
            tokio::spawn(async move { conversations.get_or_create(a, b).await.unwrap() })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut created = HashSet::new();
    for handle in handles {
        let conversation = handle.await.unwrap();
        ids.insert(conversation.id.clone());
        created.insert(conversation.created_at);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(created.len(), 1);

    let counts = h.store.unread_counts(alice).await.unwrap();
    assert_eq!(counts.len(), 1);
}

#[tokio::test]
async fn test_page_before_cursor_is_stable_under_new_inserts() {
    let store = Arc::new(MemoryStore::new());
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let id = ConversationId::between(alice, bob).unwrap();
    let start = utc_now() - Duration::minutes(10);
    store.get_or_create_conversation(&id, alice, bob, start).await.unwrap();

    for i in 0..20 {
        store
            .append_message(new_message(&id, alice, bob, start + Duration::seconds(i)))
            .await
            .unwrap();
    }

    let newest = store.list_messages(&id, 5, None).await.unwrap();
    assert_eq!(newest.len(), 5);
    let last = newest.last().unwrap();
    let cursor = PageCursor {
        before: last.created_at,
        before_id: Some(last.id),
    };

    let page_before = store.list_messages(&id, 5, Some(cursor)).await.unwrap();
    store
        .append_message(new_message(&id, bob, alice, utc_now()))
        .await
        .unwrap();
    let page_after = store.list_messages(&id, 5, Some(cursor)).await.unwrap();

    let ids = |page: &[matrimony_chat_service::models::Message]| {
        page.iter().map(|m| m.id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&page_before), ids(&page_after));
    assert!(page_after.iter().all(|m| m.created_at < cursor.before));
}

#[tokio::test]
async fn test_same_timestamp_pages_use_id_tie_break() {
    let store = MemoryStore::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let id = ConversationId::between(alice, bob).unwrap();
    let at = utc_now();
    store.get_or_create_conversation(&id, alice, bob, at).await.unwrap();

    for _ in 0..6 {
        store.append_message(new_message(&id, alice, bob, at)).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = store.list_messages(&id, 4, cursor).await.unwrap();
        if page.is_empty() {
            break;
        }
        let last = page.last().unwrap();
        cursor = Some(PageCursor {
            before: last.created_at,
            before_id: Some(last.id),
        });
        seen.extend(page.iter().map(|m| m.id));
    }

    assert_eq!(seen.len(), 6);
    let mut sorted = seen.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(seen, sorted, "newest-first order falls back to id DESC");
}

#[tokio::test]
async fn test_list_through_service_caps_limit() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::PremiumPlus), user(Plan::Free));
    let conversation = h.state.conversations.get_or_create(alice.id, bob.id).await.unwrap();

    for i in 0..120 {
        h.store
            .append_message(new_message(
                &conversation.id,
                alice.id,
                bob.id,
                utc_now() - Duration::seconds(200 - i),
            ))
            .await
            .unwrap();
    }

    let page = h
        .state
        .conversations
        .list_messages(&bob, &conversation.id, Some(500), None)
        .await
        .unwrap();
    assert_eq!(page.len(), 100);

    let default_page = h
        .state
        .conversations
        .list_messages(&bob, &conversation.id, None, None)
        .await
        .unwrap();
    assert_eq!(default_page.len(), 50);
}

#[tokio::test]
async fn test_archive_is_per_participant_and_undone_by_new_message() {
    let h = harness(test_config(&[]));
    let (alice, bob) = (user(Plan::Free), user(Plan::Free));
    let conversation = h.state.conversations.get_or_create(alice.id, bob.id).await.unwrap();

    h.state.conversations.archive(&bob, &conversation.id).await.unwrap();
    let archived = h.state.conversations.get(&conversation.id).await.unwrap();
    assert!(archived.archived_by.contains(&bob.id));
    assert!(!archived.archived_by.contains(&alice.id));

    h.store
        .append_message(new_message(&conversation.id, alice.id, bob.id, utc_now()))
        .await
        .unwrap();
    let reopened = h.state.conversations.get(&conversation.id).await.unwrap();
    assert!(reopened.archived_by.is_empty());

    let outsider = user(Plan::Free);
    assert!(h.state.conversations.archive(&outsider, &conversation.id).await.is_err());
}

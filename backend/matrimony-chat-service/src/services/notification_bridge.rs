//! Escalates unseen messages to push/email.
//!
//! Each persisted message gets a background task. A recipient who was watching
//! the conversation when the message was published, or is watching when the
//! grace window ends, is never notified; neither is one who has already read
//! the message.
//!
//! Notifications are coalesced per `(conversation, recipient)`: the first one
//! in a window goes out immediately and opens the window, later ones only bump
//! a counter. When the window ends its owner sends a single "N new messages"
//! summary, and a summary push starts a fresh window under the same owner, so
//! two pushes are always at least `coalesce_window` apart. The window closes
//! once it ends with nothing pending. The window map holds one entry per open
//! window and is capped by `max_tracked_windows`.

use crate::config::NotificationConfig;
use crate::metrics;
use crate::models::{ConversationId, Message, MessageType};
use crate::realtime::PubSub;
use crate::services::collaborators::{NotificationPayload, NotificationTransport, ProfileDirectory};
use crate::store::MessageStore;
use resilience::{with_retry, RetryConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

const FALLBACK_SENDER_NAME: &str = "Someone";
const PREVIEW_CHARS: usize = 80;

type WindowKey = (ConversationId, Uuid);

#[derive(Default)]
struct CoalescingWindow {
    // messages admitted since the last push
    pending: u32,
}

enum Admission {
    /// This task opened the window and must close it
    Owner(Instant),
    /// Counted into an open window
    Deferred,
    /// Map is full; send without coalescing
    Untracked,
}

#[derive(Clone)]
pub struct NotificationBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    store: Arc<dyn MessageStore>,
    pubsub: Arc<dyn PubSub>,
    profiles: Arc<dyn ProfileDirectory>,
    transport: Arc<dyn NotificationTransport>,
    config: NotificationConfig,
    retry: RetryConfig,
    windows: Mutex<HashMap<WindowKey, CoalescingWindow>>,
}

impl NotificationBridge {
    pub fn new(
        store: Arc<dyn MessageStore>,
        pubsub: Arc<dyn PubSub>,
        profiles: Arc<dyn ProfileDirectory>,
        transport: Arc<dyn NotificationTransport>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                pubsub,
                profiles,
                transport,
                config,
                retry: RetryConfig::notification(),
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Liveness at publish time is sampled before the task is spawned; the
    /// rest is fire-and-forget and the handle is only awaited by tests.
    pub async fn on_message_persisted(&self, message: &Message) -> JoinHandle<()> {
        let live_at_publish = self
            .inner
            .pubsub
            .has_live_subscriber(&message.conversation_id, message.recipient_id)
            .await;
        let inner = self.inner.clone();
        let message = message.clone();
        tokio::spawn(async move { inner.process(message, live_at_publish).await })
    }

    /// Open coalescing windows, for diagnostics.
    pub fn tracked_windows(&self) -> usize {
        self.inner.lock_windows().len()
    }
}

impl BridgeInner {
    fn lock_windows(&self) -> MutexGuard<'_, HashMap<WindowKey, CoalescingWindow>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn process(&self, message: Message, live_at_publish: bool) {
        let conversation_id = message.conversation_id.clone();
        let recipient_id = message.recipient_id;

        if live_at_publish {
            debug!(message_id = %message.id, "recipient was live at publish; no notification");
            metrics::record_notification("suppressed_live");
            return;
        }

        tokio::time::sleep(self.config.grace).await;

        if self.pubsub.has_live_subscriber(&conversation_id, recipient_id).await {
            debug!(message_id = %message.id, "recipient is live; no notification");
            metrics::record_notification("suppressed_live");
            return;
        }

        match self.store.get_message(message.id).await {
            Ok(Some(current)) if !current.delivery_state.counts_as_unread() => {
                debug!(message_id = %message.id, state = %current.delivery_state, "message seen; no notification");
                metrics::record_notification("suppressed_read");
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "could not re-check message state; notifying anyway");
            }
        }

        let key = (conversation_id.clone(), recipient_id);
        match self.admit(&key) {
            Admission::Deferred => {
                metrics::record_notification("deferred");
            }
            Admission::Untracked => {
                warn!(conversation_id = %conversation_id, "coalescing map full; sending uncoalesced");
                self.send_single(&message).await;
            }
            Admission::Owner(opened_at) => {
                self.send_single(&message).await;
                self.hold_window(&key, opened_at, message.sender_id).await;
            }
        }
    }

    fn admit(&self, key: &WindowKey) -> Admission {
        let mut windows = self.lock_windows();
        if let Some(window) = windows.get_mut(key) {
            window.pending += 1;
            return Admission::Deferred;
        }
        if windows.len() >= self.config.max_tracked_windows {
            return Admission::Untracked;
        }

        windows.insert(key.clone(), CoalescingWindow::default());
        Admission::Owner(Instant::now())
    }

    /// Runs window after window until one ends with nothing pending.
    async fn hold_window(&self, key: &WindowKey, opened_at: Instant, sender_id: Uuid) {
        let mut deadline = opened_at + self.config.coalesce_window;
        loop {
            tokio::time::sleep_until(deadline).await;

            let pending = {
                let mut windows = self.lock_windows();
                match windows.get_mut(key) {
                    Some(window) if window.pending > 0 => std::mem::take(&mut window.pending),
                    _ => {
                        windows.remove(key);
                        return;
                    }
                }
            };

            if self.send_summary(key, sender_id, pending).await {
                deadline = Instant::now() + self.config.coalesce_window;
            }
            // Nothing went out: the deadline has already passed, so the next
            // turn closes the window unless more messages arrived meanwhile.
        }
    }

    /// Returns whether a push was attempted.
    async fn send_summary(&self, key: &WindowKey, sender_id: Uuid, pending: u32) -> bool {
        let (conversation_id, recipient_id) = key;
        if self.pubsub.has_live_subscriber(conversation_id, *recipient_id).await {
            metrics::record_notification("suppressed_live");
            return false;
        }
        if let Ok(Some(conversation)) = self.store.get_conversation(conversation_id).await {
            if conversation.unread_for(*recipient_id) == 0 {
                metrics::record_notification("suppressed_read");
                return false;
            }
        }

        let payload = NotificationPayload {
            recipient_id: *recipient_id,
            conversation_id: conversation_id.clone(),
            title: self.sender_name(sender_id).await,
            body: summary_body(pending),
            message_id: None,
            unread_batch: pending,
        };
        self.deliver(payload, "batched").await;
        true
    }

    async fn send_single(&self, message: &Message) {
        let payload = NotificationPayload {
            recipient_id: message.recipient_id,
            conversation_id: message.conversation_id.clone(),
            title: self.sender_name(message.sender_id).await,
            body: preview(message),
            message_id: Some(message.id),
            unread_batch: 1,
        };
        self.deliver(payload, "sent").await;
    }

    async fn sender_name(&self, sender_id: Uuid) -> String {
        match self.profiles.profile_summary(sender_id).await {
            Ok(Some(profile)) if !profile.name.trim().is_empty() => profile.name,
            Ok(_) => FALLBACK_SENDER_NAME.to_string(),
            Err(e) => {
                debug!(sender_id = %sender_id, error = %e, "profile lookup failed; using fallback name");
                FALLBACK_SENDER_NAME.to_string()
            }
        }
    }

    async fn deliver(&self, payload: NotificationPayload, outcome: &str) {
        let recipient_id = payload.recipient_id;
        let result = with_retry(self.retry.clone(), || {
            self.transport.send(recipient_id, &payload)
        })
        .await;

        match result {
            Ok(()) => metrics::record_notification(outcome),
            Err(e) => {
                error!(
                    recipient_id = %recipient_id,
                    conversation_id = %payload.conversation_id,
                    error = %e,
                    "notification delivery failed"
                );
                metrics::record_notification("failed");
            }
        }
    }
}

fn summary_body(pending: u32) -> String {
    if pending == 1 {
        "1 new message".to_string()
    } else {
        format!("{pending} new messages")
    }
}

fn preview(message: &Message) -> String {
    match message.message_type {
        MessageType::Text => {
            let mut chars = message.content.chars();
            let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
            if chars.next().is_some() {
                format!("{head}...")
            } else {
                head
            }
        }
        MessageType::Voice => "sent you a voice message".to_string(),
        MessageType::Image => "sent you a photo".to_string(),
        MessageType::File => "sent you a file".to_string(),
        MessageType::Icebreaker => "sent you an icebreaker".to_string(),
    }
}

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use chrono::Utc;
use futures::StreamExt;
use shared::{
    domain::{MessageId, UserId},
    protocol::{PrivateMessagePayload, SystemEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    api::ChatApi,
    error::ConversationError,
    multiplexer::Multiplexer,
    reconcile::Timeline,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    MessagesChanged,
    /// The view should scroll to the newest message.
    ScrollToNewest,
    UnreadChanged(i64),
    Failure(String),
}

#[derive(Default)]
struct ConversationState {
    epoch: u64,
    with: Option<UserId>,
    messages: Timeline<PrivateMessagePayload>,
    draft: String,
    unread: i64,
}

struct ChatShared {
    api: Arc<dyn ChatApi>,
    me: UserId,
    state: Mutex<ConversationState>,
    next_sentinel: AtomicI64,
    events: broadcast::Sender<ConversationEvent>,
}

/// Private messaging with optimistic sends. At most one conversation is open;
/// messages for any other counterpart only move the unread counter.
pub struct Conversations {
    shared: Arc<ChatShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Conversations {
    pub fn new(api: Arc<dyn ChatApi>, me: UserId, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            shared: Arc::new(ChatShared {
                api,
                me,
                state: Mutex::new(ConversationState::default()),
                next_sentinel: AtomicI64::new(-1),
                events,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.shared.events.subscribe()
    }

    /// Routes private message frames from the system channel into this store.
    pub async fn attach(&self, multiplexer: &Multiplexer<SystemEvent>) {
        let mut messages = multiplexer
            .subscribe(|event: &SystemEvent| matches!(event, SystemEvent::PrivateMessage(_)))
            .await;
        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = messages.next().await {
                if let SystemEvent::PrivateMessage(message) = event {
                    shared.receive(message).await;
                }
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
    }

    pub async fn handle_message(&self, message: PrivateMessagePayload) {
        self.shared.receive(message).await;
    }

    pub async fn open(&self, with: UserId) -> Result<(), ConversationError> {
        {
            let mut state = self.shared.state.lock().await;
            state.epoch += 1;
            state.with = Some(with);
            state.messages.clear();
            state.draft.clear();
        }
        self.refresh().await?;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(error) = shared.api.mark_conversation_read(with).await {
                warn!(with = with.0, %error, "failed to mark conversation read");
            }
            shared.refresh_unread().await;
        });
        Ok(())
    }

    pub async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        state.epoch += 1;
        state.with = None;
        state.messages.clear();
    }

    /// Reloads the open conversation from the server, keeping unsent entries.
    /// A placeholder whose message already shows up in the history is dropped
    /// in favour of the stored copy.
    pub async fn refresh(&self) -> Result<(), ConversationError> {
        let (with, epoch) = {
            let state = self.shared.state.lock().await;
            (state.with.ok_or(ConversationError::NoConversation)?, state.epoch)
        };
        let history = self.shared.api.list_conversation(with).await?;

        let mut state = self.shared.state.lock().await;
        if state.epoch == epoch {
            let mut arrived: Vec<&str> = history
                .iter()
                .filter(|message| {
                    message.sender_id == self.shared.me
                        && !state.messages.contains(message.message_id)
                })
                .map(|message| message.content.as_str())
                .collect();
            state.messages.retain(|entry| {
                if !entry.message_id.is_sentinel() {
                    return true;
                }
                match arrived.iter().position(|content| *content == entry.content) {
                    Some(index) => {
                        arrived.swap_remove(index);
                        false
                    }
                    None => true,
                }
            });
            state.messages.replace_confirmed(history);
            let _ = self.shared.events.send(ConversationEvent::MessagesChanged);
        }
        Ok(())
    }

    pub async fn refresh_unread(&self) {
        self.shared.refresh_unread().await;
    }

    /// Appends the message locally under a placeholder id, then swaps in the
    /// server's copy. On failure the placeholder goes away and the draft is
    /// restored.
    pub async fn send(&self, content: &str) -> Result<PrivateMessagePayload, ConversationError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }
        let sentinel = MessageId(self.shared.next_sentinel.fetch_sub(1, Ordering::Relaxed));
        let (with, epoch) = {
            let mut state = self.shared.state.lock().await;
            let with = state.with.ok_or(ConversationError::NoConversation)?;
            state.messages.insert(PrivateMessagePayload {
                message_id: sentinel,
                sender_id: self.shared.me,
                receiver_id: with,
                content: content.to_string(),
                is_read: false,
                created_at: Utc::now(),
            });
            state.draft.clear();
            (with, state.epoch)
        };
        let _ = self.shared.events.send(ConversationEvent::MessagesChanged);
        let _ = self.shared.events.send(ConversationEvent::ScrollToNewest);

        let result = self.shared.api.send_private_message(with, content).await;

        let mut state = self.shared.state.lock().await;
        let current = state.epoch == epoch;
        match result {
            Ok(confirmed) => {
                if current {
                    state.messages.confirm(sentinel, confirmed.clone());
                    let _ = self.shared.events.send(ConversationEvent::MessagesChanged);
                }
                Ok(confirmed)
            }
            Err(error) => {
                warn!(with = with.0, %error, "private message not delivered");
                if current {
                    state.messages.remove(sentinel);
                    state.draft = content.to_string();
                    let _ = self.shared.events.send(ConversationEvent::MessagesChanged);
                }
                let _ = self
                    .shared
                    .events
                    .send(ConversationEvent::Failure(error.to_string()));
                Err(error.into())
            }
        }
    }

    pub async fn messages(&self) -> Vec<PrivateMessagePayload> {
        self.shared.state.lock().await.messages.to_vec()
    }

    pub async fn with(&self) -> Option<UserId> {
        self.shared.state.lock().await.with
    }

    pub async fn unread(&self) -> i64 {
        self.shared.state.lock().await.unread
    }

    pub async fn draft(&self) -> String {
        self.shared.state.lock().await.draft.clone()
    }

    pub async fn set_draft(&self, draft: impl Into<String>) {
        self.shared.state.lock().await.draft = draft.into();
    }
}

impl Drop for Conversations {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl ChatShared {
    async fn receive(self: &Arc<Self>, message: PrivateMessagePayload) {
        let counterpart = message.counterpart(self.me);
        let mut state = self.state.lock().await;
        if state.with == Some(counterpart) {
            if state.messages.insert(message.clone()) {
                let _ = self.events.send(ConversationEvent::MessagesChanged);
                let _ = self.events.send(ConversationEvent::ScrollToNewest);
            }
            if message.receiver_id == self.me && !message.is_read {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(error) = shared.api.mark_conversation_read(counterpart).await {
                        debug!(%error, "failed to mark incoming message read");
                    }
                });
            }
            return;
        }
        if message.receiver_id == self.me {
            state.unread += 1;
            let _ = self.events.send(ConversationEvent::UnreadChanged(state.unread));
        }
    }

    async fn refresh_unread(&self) {
        match self.api.unread_count().await {
            Ok(count) => {
                let mut state = self.state.lock().await;
                if state.unread != count {
                    state.unread = count;
                    let _ = self.events.send(ConversationEvent::UnreadChanged(count));
                }
            }
            Err(error) => warn!(%error, "failed to refresh unread count"),
        }
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;

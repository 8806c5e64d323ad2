use super::*;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::error::ClientError;
use shared::protocol::Envelope;

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CAROL: UserId = UserId(3);

#[derive(Default)]
struct FakeChat {
    history: Vec<PrivateMessagePayload>,
    next_id: i64,
    unread: i64,
    fail_send: bool,
    read_calls: Vec<UserId>,
}

#[derive(Default)]
struct FakeChatApi {
    inner: Mutex<FakeChat>,
    hold_send: Option<Arc<Notify>>,
}

fn message(id: i64, sender: UserId, receiver: UserId, content: &str) -> PrivateMessagePayload {
    PrivateMessagePayload {
        message_id: MessageId(id),
        sender_id: sender,
        receiver_id: receiver,
        content: content.into(),
        is_read: false,
        created_at: Utc::now(),
    }
}

impl FakeChatApi {
    fn new() -> Self {
        let api = Self::default();
        api.inner.try_lock().expect("fresh lock").next_id = 101;
        api
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn send_private_message(
        &self,
        receiver_id: UserId,
        content: &str,
    ) -> Result<PrivateMessagePayload, ClientError> {
        if let Some(gate) = &self.hold_send {
            gate.notified().await;
        }
        let mut inner = self.inner.lock().await;
        if inner.fail_send {
            return Err(ClientError::Api {
                status: 400,
                message: "receiver is unreachable".into(),
            });
        }
        let sent = message(inner.next_id, ALICE, receiver_id, content);
        inner.next_id += 1;
        inner.history.push(sent.clone());
        Ok(sent)
    }

    async fn list_conversation(
        &self,
        with_id: UserId,
    ) -> Result<Vec<PrivateMessagePayload>, ClientError> {
        Ok(self
            .inner
            .lock()
            .await
            .history
            .iter()
            .filter(|m| m.counterpart(ALICE) == with_id)
            .cloned()
            .collect())
    }

    async fn mark_conversation_read(&self, sender_id: UserId) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        inner.read_calls.push(sender_id);
        inner.unread = 0;
        Ok(())
    }

    async fn unread_count(&self) -> Result<i64, ClientError> {
        Ok(self.inner.lock().await.unread)
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn ids(messages: &[PrivateMessagePayload]) -> Vec<i64> {
    messages.iter().map(|m| m.message_id.0).collect()
}

#[tokio::test]
async fn optimistic_message_is_replaced_by_the_confirmed_one() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(FakeChatApi {
        hold_send: Some(gate.clone()),
        ..FakeChatApi::new()
    });
    let chat = Arc::new(Conversations::new(api.clone(), ALICE, 16));
    chat.open(BOB).await.expect("open");
    let mut events = chat.subscribe();

    let sending = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send("  hi bob ").await })
    };
    settle().await;

    let pending = chat.messages().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].message_id.is_sentinel());
    assert_eq!(pending[0].content, "hi bob");
    assert_eq!(
        events.recv().await.expect("event"),
        ConversationEvent::MessagesChanged
    );
    assert_eq!(
        events.recv().await.expect("event"),
        ConversationEvent::ScrollToNewest
    );

    gate.notify_one();
    let confirmed = sending.await.expect("join").expect("send");
    assert_eq!(confirmed.message_id, MessageId(101));
    assert_eq!(ids(&chat.messages().await), vec![101]);

    // The echo of our own message does not duplicate it.
    chat.handle_message(confirmed).await;
    assert_eq!(ids(&chat.messages().await), vec![101]);
}

#[tokio::test]
async fn refresh_during_a_send_keeps_a_single_copy() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(FakeChatApi {
        hold_send: Some(gate.clone()),
        ..FakeChatApi::new()
    });
    let chat = Arc::new(Conversations::new(api.clone(), ALICE, 16));
    chat.open(BOB).await.expect("open");

    let sending = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send("on my way").await })
    };
    settle().await;

    // Stored on the server while the reply is still in flight.
    api.inner
        .lock()
        .await
        .history
        .push(message(101, ALICE, BOB, "on my way"));
    chat.refresh().await.expect("refresh");
    assert_eq!(ids(&chat.messages().await), vec![101]);

    gate.notify_one();
    let confirmed = sending.await.expect("join").expect("send");
    assert_eq!(confirmed.message_id, MessageId(101));
    assert_eq!(ids(&chat.messages().await), vec![101]);
}

#[tokio::test]
async fn refresh_keeps_an_unsent_message_with_repeated_text() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(FakeChatApi {
        hold_send: Some(gate.clone()),
        ..FakeChatApi::new()
    });
    api.inner
        .lock()
        .await
        .history
        .push(message(50, ALICE, BOB, "ok"));
    let chat = Arc::new(Conversations::new(api.clone(), ALICE, 16));
    chat.open(BOB).await.expect("open");

    let sending = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send("ok").await })
    };
    settle().await;
    chat.refresh().await.expect("refresh");

    let messages = chat.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_id, MessageId(50));
    assert!(messages[1].message_id.is_sentinel());

    gate.notify_one();
    sending.await.expect("join").expect("send");
    assert_eq!(ids(&chat.messages().await), vec![50, 101]);
}

#[tokio::test]
async fn failed_send_removes_the_placeholder_and_restores_the_draft() {
    let api = Arc::new(FakeChatApi::new());
    api.inner.lock().await.fail_send = true;
    let chat = Conversations::new(api, ALICE, 16);
    chat.open(BOB).await.expect("open");
    chat.set_draft("see you at dawn").await;
    let mut events = chat.subscribe();

    let result = chat.send("see you at dawn").await;
    assert!(matches!(result, Err(ConversationError::Api(ClientError::Api { status: 400, .. }))));
    assert!(chat.messages().await.is_empty());
    assert_eq!(chat.draft().await, "see you at dawn");

    let mut failure = None;
    while let Ok(event) = events.try_recv() {
        if let ConversationEvent::Failure(message) = event {
            failure = Some(message);
        }
    }
    assert!(failure.expect("failure event").contains("receiver is unreachable"));
}

#[tokio::test]
async fn send_requires_text_and_an_open_conversation() {
    let chat = Conversations::new(Arc::new(FakeChatApi::new()), ALICE, 16);
    assert!(matches!(
        chat.send("hello").await,
        Err(ConversationError::NoConversation)
    ));
    chat.open(BOB).await.expect("open");
    assert!(matches!(
        chat.send("   ").await,
        Err(ConversationError::EmptyMessage)
    ));
    assert!(chat.messages().await.is_empty());
}

#[tokio::test]
async fn incoming_messages_append_or_count_as_unread() {
    let api = Arc::new(FakeChatApi::new());
    let chat = Conversations::new(api.clone(), ALICE, 16);
    chat.open(BOB).await.expect("open");
    settle().await;

    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<SystemEvent> = Multiplexer::new(None, rx);
    chat.attach(&mux).await;

    for event in [
        SystemEvent::PrivateMessage(message(7, BOB, ALICE, "from bob")),
        SystemEvent::PrivateMessage(message(8, CAROL, ALICE, "from carol")),
        SystemEvent::PrivateMessage(message(7, BOB, ALICE, "from bob")),
    ] {
        tx.send(Envelope::from_event(&event).expect("frame"))
            .expect("push");
    }
    settle().await;

    assert_eq!(ids(&chat.messages().await), vec![7]);
    assert_eq!(chat.unread().await, 1);
    assert!(api.inner.lock().await.read_calls.contains(&BOB));
}

#[tokio::test]
async fn opening_a_conversation_marks_it_read() {
    let api = Arc::new(FakeChatApi::new());
    {
        let mut inner = api.inner.lock().await;
        inner.unread = 4;
        inner.history = vec![
            message(2, BOB, ALICE, "second"),
            message(1, ALICE, BOB, "first"),
            message(3, CAROL, ALICE, "elsewhere"),
        ];
    }
    let chat = Conversations::new(api.clone(), ALICE, 16);
    chat.refresh_unread().await;
    assert_eq!(chat.unread().await, 4);

    chat.open(BOB).await.expect("open");
    assert_eq!(ids(&chat.messages().await), vec![1, 2]);
    settle().await;

    assert_eq!(api.inner.lock().await.read_calls, vec![BOB]);
    assert_eq!(chat.unread().await, 0);
}

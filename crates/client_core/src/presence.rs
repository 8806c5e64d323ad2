use std::sync::Arc;

use futures::StreamExt;
use shared::{
    domain::{NotificationId, UserId},
    protocol::{NotificationPayload, OnlineUser, SystemEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{api::SocialApi, error::RelayError, multiplexer::Multiplexer};

/// A notification as the list shows it.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEntry {
    pub notification: NotificationPayload,
    pub icon: &'static str,
}

impl From<NotificationPayload> for NotificationEntry {
    fn from(notification: NotificationPayload) -> Self {
        Self {
            icon: notification.kind.icon(),
            notification,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    OnlineChanged,
    NotificationsChanged,
    Failure(String),
}

#[derive(Default)]
struct RelayState {
    online: Vec<OnlineUser>,
    /// Newest first, unique by notification id.
    notifications: Vec<NotificationEntry>,
}

struct RelayShared {
    api: Arc<dyn SocialApi>,
    me: UserId,
    state: Mutex<RelayState>,
    events: broadcast::Sender<RelayEvent>,
}

/// Keeps the online roster and the notification list in step with the
/// system channel. The roster lists everyone online except `me`.
pub struct PresenceRelay {
    shared: Arc<RelayShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceRelay {
    pub fn new(api: Arc<dyn SocialApi>, me: UserId, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            shared: Arc::new(RelayShared {
                api,
                me,
                state: Mutex::new(RelayState::default()),
                events,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.shared.events.subscribe()
    }

    pub async fn load(&self) -> Result<(), RelayError> {
        let (online, notifications) = tokio::try_join!(
            self.shared.api.list_online_users(),
            self.shared.api.list_notifications(),
        )?;
        let mut state = self.shared.state.lock().await;
        state.online = self.shared.without_me(online);
        state.notifications = notifications.into_iter().map(NotificationEntry::from).collect();
        let _ = self.shared.events.send(RelayEvent::OnlineChanged);
        let _ = self.shared.events.send(RelayEvent::NotificationsChanged);
        Ok(())
    }

    /// Consumes every system frame. Private messages only refetch the
    /// notification list; the conversation store owns their content.
    pub async fn attach(&self, multiplexer: &Multiplexer<SystemEvent>) {
        let mut frames = multiplexer.subscribe_all().await;
        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = frames.next().await {
                shared.handle(event).await;
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
    }

    pub async fn handle_event(&self, event: SystemEvent) {
        self.shared.handle(event).await;
    }

    pub async fn online(&self) -> Vec<OnlineUser> {
        self.shared.state.lock().await.online.clone()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.shared
            .state
            .lock()
            .await
            .online
            .iter()
            .any(|user| user.user_id == user_id)
    }

    pub async fn notifications(&self) -> Vec<NotificationEntry> {
        self.shared.state.lock().await.notifications.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .await
            .notifications
            .iter()
            .filter(|entry| !entry.notification.is_read)
            .count()
    }

    pub async fn mark_read(&self, notification_id: NotificationId) -> Result<(), RelayError> {
        self.shared.api.mark_notification_read(notification_id).await?;
        self.shared.set_read(notification_id).await;
        Ok(())
    }

    /// Accepts the friend request a notification points at. The match is
    /// made on the requester, whose id the notification carries.
    pub async fn accept_from_notification(
        &self,
        notification: &NotificationPayload,
    ) -> Result<(), RelayError> {
        let requester = notification.related_id.ok_or(RelayError::RequestNotFound)?;
        let pending = self.shared.api.list_pending_requests().await?;
        let request = pending
            .iter()
            .find(|request| request.requester_id.0 == requester)
            .ok_or(RelayError::RequestNotFound)?;

        self.shared.api.accept_friend_request(request.request_id).await?;
        info!(request_id = request.request_id.0, requester, "friend request accepted");

        if let Err(error) = self
            .shared
            .api
            .mark_notification_read(notification.notification_id)
            .await
        {
            warn!(%error, "accepted request but could not mark notification read");
        } else {
            self.shared.set_read(notification.notification_id).await;
        }
        Ok(())
    }
}

impl Drop for PresenceRelay {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl RelayShared {
    async fn handle(&self, event: SystemEvent) {
        if event.is_presence() {
            self.refresh_online().await;
            return;
        }
        if let Some(notification) = event.notification() {
            let mut state = self.state.lock().await;
            let id = notification.notification_id;
            if state
                .notifications
                .iter()
                .any(|entry| entry.notification.notification_id == id)
            {
                debug!(notification_id = id.0, "notification already listed");
                return;
            }
            state
                .notifications
                .insert(0, NotificationEntry::from(notification.clone()));
            let _ = self.events.send(RelayEvent::NotificationsChanged);
            return;
        }
        // Crew changes and private messages carry no notification of their
        // own; the stored one is fetched.
        self.refresh_notifications().await;
    }

    async fn refresh_online(&self) {
        match self.api.list_online_users().await {
            Ok(online) => {
                self.state.lock().await.online = self.without_me(online);
                let _ = self.events.send(RelayEvent::OnlineChanged);
            }
            Err(error) => {
                warn!(%error, "failed to refresh online users");
                let _ = self.events.send(RelayEvent::Failure(error.to_string()));
            }
        }
    }

    fn without_me(&self, mut online: Vec<OnlineUser>) -> Vec<OnlineUser> {
        online.retain(|user| user.user_id != self.me);
        online
    }

    async fn refresh_notifications(&self) {
        match self.api.list_notifications().await {
            Ok(notifications) => {
                self.state.lock().await.notifications =
                    notifications.into_iter().map(NotificationEntry::from).collect();
                let _ = self.events.send(RelayEvent::NotificationsChanged);
            }
            Err(error) => {
                warn!(%error, "failed to refresh notifications");
                let _ = self.events.send(RelayEvent::Failure(error.to_string()));
            }
        }
    }

    async fn set_read(&self, notification_id: NotificationId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .notifications
            .iter_mut()
            .find(|entry| entry.notification.notification_id == notification_id)
        {
            entry.notification.is_read = true;
            let _ = self.events.send(RelayEvent::NotificationsChanged);
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;

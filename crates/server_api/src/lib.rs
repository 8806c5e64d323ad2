use shared::{
    domain::{MissionId, NotificationKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MissionEvent, NotificationPayload, SystemEvent},
};
use storage::{Storage, StoredNotification};

mod missions;
mod social;

pub use missions::{
    add_comment, clear_comments, create_mission, get_mission, join_mission, kick_member,
    leave_mission, list_comments, list_crew, transition_mission,
};
pub use social::{
    accept_friend_request, describe_users, list_conversation, list_notifications,
    list_pending_requests, mark_conversation_read, mark_notification_read, send_friend_request,
    send_private_message, unread_message_count,
};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// A frame the transport layer must push after a use case succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Mission(MissionId, MissionEvent),
    User(UserId, SystemEvent),
    Everyone(SystemEvent),
}

/// Result of a mutating use case: the confirmed entity plus the frames to fan out.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub deliveries: Vec<Delivery>,
}

impl<T> Outcome<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            deliveries: Vec::new(),
        }
    }

    fn deliver(mut self, delivery: Delivery) -> Self {
        self.deliveries.push(delivery);
        self
    }
}

async fn notify(
    ctx: &ApiContext,
    user_id: UserId,
    kind: NotificationKind,
    content: &str,
    related_id: Option<i64>,
) -> Result<NotificationPayload, ApiError> {
    let stored = ctx
        .storage
        .insert_notification(user_id, kind, content, related_id)
        .await
        .map_err(internal)?;
    Ok(notification_payload(stored))
}

fn notification_payload(stored: StoredNotification) -> NotificationPayload {
    NotificationPayload {
        notification_id: stored.notification_id,
        user_id: stored.user_id,
        kind: stored.kind,
        content: stored.content,
        related_id: stored.related_id,
        is_read: stored.is_read,
        created_at: stored.created_at,
    }
}

async fn display_name(ctx: &ApiContext, user_id: UserId) -> Result<String, ApiError> {
    Ok(ctx
        .storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .unwrap_or_else(|| format!("User {}", user_id.0)))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use shared::{
    domain::{FriendRequestId, NotificationId, NotificationKind, UserId},
    error::ApiError,
    protocol::{
        NotificationPayload, OnlineUser, PendingRequestSummary, PrivateMessagePayload,
        SendPrivateMessageRequest, SystemEvent,
    },
};
use storage::{FriendshipStatus, StoredFriendship, StoredPrivateMessage};

use crate::{display_name, internal, notification_payload, notify, ApiContext, Delivery, Outcome};

const MAX_MESSAGE_CHARS: usize = 4000;

pub async fn send_private_message(
    ctx: &ApiContext,
    sender_id: UserId,
    request: SendPrivateMessageRequest,
) -> Result<Outcome<PrivateMessagePayload>, ApiError> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message cannot be empty"));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::validation(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    if request.receiver_id == sender_id {
        return Err(ApiError::validation("cannot message yourself"));
    }
    ensure_user_exists(ctx, request.receiver_id).await?;

    let stored = ctx
        .storage
        .insert_private_message(sender_id, request.receiver_id, content)
        .await
        .map_err(internal)?;

    let sender_name = display_name(ctx, sender_id).await?;
    notify(
        ctx,
        request.receiver_id,
        NotificationKind::PrivateMessage,
        &format!("{sender_name}: \"{content}\""),
        Some(sender_id.0),
    )
    .await?;

    let payload = private_message_payload(stored);
    Ok(Outcome::new(payload.clone()).deliver(Delivery::User(
        payload.receiver_id,
        SystemEvent::PrivateMessage(payload),
    )))
}

pub async fn list_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    with_id: UserId,
) -> Result<Vec<PrivateMessagePayload>, ApiError> {
    let messages = ctx
        .storage
        .list_conversation(user_id, with_id)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(private_message_payload).collect())
}

pub async fn unread_message_count(ctx: &ApiContext, user_id: UserId) -> Result<i64, ApiError> {
    ctx.storage
        .unread_message_count(user_id)
        .await
        .map_err(internal)
}

pub async fn mark_conversation_read(
    ctx: &ApiContext,
    user_id: UserId,
    sender_id: UserId,
) -> Result<u64, ApiError> {
    ctx.storage
        .mark_conversation_read(user_id, sender_id)
        .await
        .map_err(internal)
}

pub async fn send_friend_request(
    ctx: &ApiContext,
    requester_id: UserId,
    receiver_id: UserId,
) -> Result<Outcome<PendingRequestSummary>, ApiError> {
    if requester_id == receiver_id {
        return Err(ApiError::validation("cannot add yourself as friend"));
    }
    ensure_user_exists(ctx, receiver_id).await?;
    if ctx
        .storage
        .find_friendship(requester_id, receiver_id)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::conflict("friendship already exists or pending"));
    }

    let request_id = ctx
        .storage
        .create_friend_request(requester_id, receiver_id)
        .await
        .map_err(internal)?;
    let stored = load_friendship(ctx, request_id).await?;

    let notification = notify(
        ctx,
        receiver_id,
        NotificationKind::FriendRequest,
        &format!("{} sent you a friend request", stored.requester_username),
        Some(requester_id.0),
    )
    .await?;

    let mut outcome = Outcome::new(pending_summary(stored));
    if let Some(event) = SystemEvent::from_notification(notification) {
        outcome = outcome.deliver(Delivery::User(receiver_id, event));
    }
    Ok(outcome)
}

pub async fn list_pending_requests(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<PendingRequestSummary>, ApiError> {
    let pending = ctx
        .storage
        .list_pending_requests(user_id)
        .await
        .map_err(internal)?;
    Ok(pending.into_iter().map(pending_summary).collect())
}

pub async fn accept_friend_request(
    ctx: &ApiContext,
    user_id: UserId,
    request_id: FriendRequestId,
) -> Result<Outcome<()>, ApiError> {
    let friendship = load_friendship(ctx, request_id).await?;
    if friendship.receiver_id != user_id {
        return Err(ApiError::forbidden("you are not the receiver of this request"));
    }
    if friendship.status != FriendshipStatus::Pending
        || !ctx
            .storage
            .accept_friend_request(request_id)
            .await
            .map_err(internal)?
    {
        return Err(ApiError::conflict("request already processed"));
    }

    let name = display_name(ctx, user_id).await?;
    let notification = notify(
        ctx,
        friendship.requester_id,
        NotificationKind::FriendAccepted,
        &format!("{name} accepted your friend request"),
        Some(user_id.0),
    )
    .await?;

    let mut outcome = Outcome::new(());
    if let Some(event) = SystemEvent::from_notification(notification) {
        outcome = outcome.deliver(Delivery::User(friendship.requester_id, event));
    }
    Ok(outcome)
}

pub async fn list_notifications(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<NotificationPayload>, ApiError> {
    let notifications = ctx
        .storage
        .list_notifications(user_id)
        .await
        .map_err(internal)?;
    Ok(notifications.into_iter().map(notification_payload).collect())
}

pub async fn mark_notification_read(
    ctx: &ApiContext,
    user_id: UserId,
    notification_id: NotificationId,
) -> Result<(), ApiError> {
    if !ctx
        .storage
        .mark_notification_read(user_id, notification_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("notification not found"));
    }
    Ok(())
}

/// Resolve display names for the ids currently connected to the hub.
pub async fn describe_users(
    ctx: &ApiContext,
    user_ids: &[UserId],
) -> Result<Vec<OnlineUser>, ApiError> {
    let mut users = Vec::with_capacity(user_ids.len());
    for &user_id in user_ids {
        if let Some(display_name) = ctx
            .storage
            .username_for_user(user_id)
            .await
            .map_err(internal)?
        {
            users.push(OnlineUser {
                user_id,
                display_name,
            });
        }
    }
    users.sort_by_key(|user| user.user_id);
    Ok(users)
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    ctx.storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| ApiError::not_found("user not found"))
}

async fn load_friendship(
    ctx: &ApiContext,
    request_id: FriendRequestId,
) -> Result<StoredFriendship, ApiError> {
    ctx.storage
        .load_friendship(request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("friend request not found"))
}

fn pending_summary(stored: StoredFriendship) -> PendingRequestSummary {
    PendingRequestSummary {
        request_id: stored.request_id,
        requester_id: stored.requester_id,
        requester_name: stored.requester_username,
        created_at: stored.created_at,
    }
}

fn private_message_payload(stored: StoredPrivateMessage) -> PrivateMessagePayload {
    PrivateMessagePayload {
        message_id: stored.message_id,
        sender_id: stored.sender_id,
        receiver_id: stored.receiver_id,
        content: stored.content,
        is_read: stored.is_read,
        created_at: stored.created_at,
    }
}

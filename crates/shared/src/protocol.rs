use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    CommentId, FriendRequestId, MessageId, MissionId, MissionStatus, NotificationId,
    NotificationKind, UserId,
};

/// Raw `{ "type": ..., "data": ... }` frame as it travels over a websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A frame family with a closed set of recognized `type` values.
pub trait WireEvent: Serialize + DeserializeOwned {
    const KINDS: &'static [&'static str];

    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<E> {
    Event(E),
    /// A well-formed frame whose `type` this family does not know.
    Unknown(String),
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Malformed)
    }

    pub fn decode<E: WireEvent>(self) -> Result<Decoded<E>, FrameError> {
        if !E::KINDS.contains(&self.kind.as_str()) {
            return Ok(Decoded::Unknown(self.kind));
        }
        let kind = self.kind.clone();
        let value = serde_json::to_value(&self).map_err(FrameError::Malformed)?;
        serde_json::from_value(value)
            .map(Decoded::Event)
            .map_err(|source| FrameError::Payload { kind, source })
    }

    pub fn from_event<E: WireEvent>(event: &E) -> Result<Self, FrameError> {
        let value = serde_json::to_value(event).map_err(FrameError::Malformed)?;
        serde_json::from_value(value).map_err(FrameError::Malformed)
    }

    pub fn to_text(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Malformed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSummary {
    pub mission_id: MissionId,
    pub name: String,
    pub status: MissionStatus,
    pub chief_id: UserId,
    pub chief_display_name: String,
    pub crew_count: i64,
    pub max_crew: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrewMemberSummary {
    pub mission_id: MissionId,
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub comment_id: CommentId,
    pub mission_id: MissionId,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_display_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl PrivateMessagePayload {
    /// The other participant of the conversation, seen from `me`.
    pub fn counterpart(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<i64>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequestSummary {
    pub request_id: FriendRequestId,
    pub requester_id: UserId,
    pub requester_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrewChange {
    pub mission_id: MissionId,
    pub mission_name: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCleared {
    pub mission_id: MissionId,
    /// Highest comment id removed by the clear; `None` when the chat was already empty.
    #[serde(default)]
    pub cleared_through: Option<CommentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub mission_id: MissionId,
    pub status: MissionStatus,
}

/// Frames carried on a mission-scoped channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MissionEvent {
    NewComment(CommentPayload),
    ClearChat(ChatCleared),
    NewCrewJoined(CrewChange),
    CrewLeft(CrewChange),
    MissionStatusChanged(StatusChanged),
}

impl MissionEvent {
    pub fn mission_id(&self) -> MissionId {
        match self {
            MissionEvent::NewComment(comment) => comment.mission_id,
            MissionEvent::ClearChat(cleared) => cleared.mission_id,
            MissionEvent::NewCrewJoined(change) | MissionEvent::CrewLeft(change) => {
                change.mission_id
            }
            MissionEvent::MissionStatusChanged(changed) => changed.mission_id,
        }
    }
}

impl WireEvent for MissionEvent {
    const KINDS: &'static [&'static str] = &[
        "new_comment",
        "clear_chat",
        "new_crew_joined",
        "crew_left",
        "mission_status_changed",
    ];

    fn kind(&self) -> &'static str {
        match self {
            MissionEvent::NewComment(_) => "new_comment",
            MissionEvent::ClearChat(_) => "clear_chat",
            MissionEvent::NewCrewJoined(_) => "new_crew_joined",
            MissionEvent::CrewLeft(_) => "crew_left",
            MissionEvent::MissionStatusChanged(_) => "mission_status_changed",
        }
    }
}

/// Frames carried on the system-wide (per user) channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SystemEvent {
    FriendRequest(NotificationPayload),
    FriendAccepted(NotificationPayload),
    MissionStarted(NotificationPayload),
    MissionCompleted(NotificationPayload),
    MissionFailed(NotificationPayload),
    NewCrewJoined(CrewChange),
    KickedFromMission(NotificationPayload),
    NewChatMessage(NotificationPayload),
    MissionDeleted(NotificationPayload),
    CrewLeft(CrewChange),
    PrivateMessage(PrivateMessagePayload),
    AgentOnline(PresenceChange),
    AgentOffline(PresenceChange),
}

impl SystemEvent {
    /// Wrap a stored notification in the frame matching its kind. Kinds whose
    /// frame carries a different payload are not pushed this way.
    pub fn from_notification(notification: NotificationPayload) -> Option<Self> {
        let event = match notification.kind {
            NotificationKind::FriendRequest => SystemEvent::FriendRequest(notification),
            NotificationKind::FriendAccepted => SystemEvent::FriendAccepted(notification),
            NotificationKind::MissionStarted => SystemEvent::MissionStarted(notification),
            NotificationKind::MissionCompleted => SystemEvent::MissionCompleted(notification),
            NotificationKind::MissionFailed => SystemEvent::MissionFailed(notification),
            NotificationKind::KickedFromMission => SystemEvent::KickedFromMission(notification),
            NotificationKind::NewChatMessage => SystemEvent::NewChatMessage(notification),
            NotificationKind::MissionDeleted => SystemEvent::MissionDeleted(notification),
            NotificationKind::NewCrewJoined
            | NotificationKind::CrewLeft
            | NotificationKind::PrivateMessage => return None,
        };
        Some(event)
    }

    pub fn notification(&self) -> Option<&NotificationPayload> {
        match self {
            SystemEvent::FriendRequest(n)
            | SystemEvent::FriendAccepted(n)
            | SystemEvent::MissionStarted(n)
            | SystemEvent::MissionCompleted(n)
            | SystemEvent::MissionFailed(n)
            | SystemEvent::KickedFromMission(n)
            | SystemEvent::NewChatMessage(n)
            | SystemEvent::MissionDeleted(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            SystemEvent::AgentOnline(_) | SystemEvent::AgentOffline(_)
        )
    }
}

impl WireEvent for SystemEvent {
    const KINDS: &'static [&'static str] = &[
        "friend_request",
        "friend_accepted",
        "mission_started",
        "mission_completed",
        "mission_failed",
        "new_crew_joined",
        "kicked_from_mission",
        "new_chat_message",
        "mission_deleted",
        "crew_left",
        "private_message",
        "agent_online",
        "agent_offline",
    ];

    fn kind(&self) -> &'static str {
        match self {
            SystemEvent::FriendRequest(_) => "friend_request",
            SystemEvent::FriendAccepted(_) => "friend_accepted",
            SystemEvent::MissionStarted(_) => "mission_started",
            SystemEvent::MissionCompleted(_) => "mission_completed",
            SystemEvent::MissionFailed(_) => "mission_failed",
            SystemEvent::NewCrewJoined(_) => "new_crew_joined",
            SystemEvent::KickedFromMission(_) => "kicked_from_mission",
            SystemEvent::NewChatMessage(_) => "new_chat_message",
            SystemEvent::MissionDeleted(_) => "mission_deleted",
            SystemEvent::CrewLeft(_) => "crew_left",
            SystemEvent::PrivateMessage(_) => "private_message",
            SystemEvent::AgentOnline(_) => "agent_online",
            SystemEvent::AgentOffline(_) => "agent_offline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMissionRequest {
    pub name: String,
    #[serde(default)]
    pub max_crew: Option<i64>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddCommentRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPrivateMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestCreate {
    pub receiver_id: UserId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: i64,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;

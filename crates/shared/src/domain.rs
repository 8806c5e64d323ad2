use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MissionId);
id_newtype!(CommentId);
id_newtype!(MessageId);
id_newtype!(NotificationId);
id_newtype!(FriendRequestId);

impl MessageId {
    /// Server ids are always positive; anything else marks a local optimistic entry.
    pub fn is_sentinel(self) -> bool {
        self.0 <= 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Open,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Complete,
    Fail,
    Kick,
    ClearChat,
}

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionStatus::Completed | MissionStatus::Failed)
    }

    /// Transition table shared by the authoritative server and the client mirror.
    /// Returns the resulting status, or `None` if the action is illegal here.
    pub fn apply(self, action: LifecycleAction) -> Option<MissionStatus> {
        use LifecycleAction::*;
        use MissionStatus::*;

        match (self, action) {
            (Open, Start) => Some(InProgress),
            (InProgress, Complete) => Some(Completed),
            (InProgress, Fail) => Some(Failed),
            (Open | InProgress, Kick) => Some(self),
            (Open | InProgress, ClearChat) => Some(self),
            _ => None,
        }
    }

    /// Whether a mirrored status may be replaced by `next`. Terminal states are
    /// absorbing and no status ever moves backwards.
    pub fn can_advance_to(self, next: MissionStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            MissionStatus::Open => true,
            MissionStatus::InProgress => next.is_terminal(),
            MissionStatus::Completed | MissionStatus::Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MissionStatus::Open => "open",
            MissionStatus::InProgress => "in_progress",
            MissionStatus::Completed => "completed",
            MissionStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(MissionStatus::Open),
            "in_progress" => Some(MissionStatus::InProgress),
            "completed" => Some(MissionStatus::Completed),
            "failed" => Some(MissionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FriendRequest,
    FriendAccepted,
    MissionStarted,
    MissionCompleted,
    MissionFailed,
    NewCrewJoined,
    KickedFromMission,
    NewChatMessage,
    MissionDeleted,
    CrewLeft,
    PrivateMessage,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 11] = [
        NotificationKind::FriendRequest,
        NotificationKind::FriendAccepted,
        NotificationKind::MissionStarted,
        NotificationKind::MissionCompleted,
        NotificationKind::MissionFailed,
        NotificationKind::NewCrewJoined,
        NotificationKind::KickedFromMission,
        NotificationKind::NewChatMessage,
        NotificationKind::MissionDeleted,
        NotificationKind::CrewLeft,
        NotificationKind::PrivateMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::FriendRequest => "friend_request",
            NotificationKind::FriendAccepted => "friend_accepted",
            NotificationKind::MissionStarted => "mission_started",
            NotificationKind::MissionCompleted => "mission_completed",
            NotificationKind::MissionFailed => "mission_failed",
            NotificationKind::NewCrewJoined => "new_crew_joined",
            NotificationKind::KickedFromMission => "kicked_from_mission",
            NotificationKind::NewChatMessage => "new_chat_message",
            NotificationKind::MissionDeleted => "mission_deleted",
            NotificationKind::CrewLeft => "crew_left",
            NotificationKind::PrivateMessage => "private_message",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// Icon name the notification list renders for this kind.
    pub fn icon(self) -> &'static str {
        match self {
            NotificationKind::FriendRequest => "person_add",
            NotificationKind::FriendAccepted => "check_circle",
            NotificationKind::MissionStarted => "play_circle",
            NotificationKind::MissionCompleted => "check_circle",
            NotificationKind::MissionFailed => "cancel",
            NotificationKind::NewCrewJoined => "person_add",
            NotificationKind::KickedFromMission => "person_remove",
            NotificationKind::NewChatMessage => "chat",
            NotificationKind::MissionDeleted => "delete_sweep",
            NotificationKind::CrewLeft => "exit_to_app",
            NotificationKind::PrivateMessage => "person_pin",
        }
    }
}

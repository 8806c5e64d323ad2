use shared::{
    domain::{LifecycleAction, MissionStatus, UserId},
    protocol::FrameError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotReady,
    #[error("server url must start with http://, https://, ws:// or wss://: {0}")]
    InvalidUrl(String),
    #[error("failed to connect websocket {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameError),
}

/// Failure of a request/response call. Status and message are passed through
/// untouched; callers only show them.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no mission is open")]
    NoMission,
    #[error("only the mission chief can do this")]
    NotChief,
    #[error("mission is already {0}")]
    Terminal(MissionStatus),
    #[error("cannot {action:?} while the mission is {status}")]
    IllegalTransition {
        action: LifecycleAction,
        status: MissionStatus,
    },
    #[error("a start countdown is already running")]
    CountdownActive,
    #[error("the chief cannot be kicked")]
    CannotKickChief,
    #[error("user {0} is not in the crew")]
    NotInCrew(UserId),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Api(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("no conversation is open")]
    NoConversation,
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error(transparent)]
    Api(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Request not found or already processed")]
    RequestNotFound,
    #[error(transparent)]
    Api(#[from] ClientError),
}

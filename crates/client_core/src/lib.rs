use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{
    domain::{MissionId, UserId},
    protocol::SystemEvent,
};
use tracing::info;

pub mod api;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod error;
pub mod lifecycle;
pub mod multiplexer;
pub mod presence;
pub mod reconcile;

pub use api::{ChatApi, HttpApi, MissionApi, SocialApi};
pub use channel::{ChannelScope, ChannelState, SessionChannel};
pub use config::{load_client_settings, ClientSettings};
pub use conversation::{ConversationEvent, Conversations};
pub use error::{ChannelError, ClientError, ConversationError, LifecycleError, RelayError};
pub use lifecycle::{MissionSession, MissionSnapshot, SessionEvent};
pub use multiplexer::{Multiplexer, Subscription};
pub use presence::{NotificationEntry, PresenceRelay, RelayEvent};
pub use reconcile::{Keyed, Timeline};

/// A signed-in user: the REST client, the per-user system channel and the
/// stores that channel feeds. At most one mission is open at a time.
pub struct CrewClient {
    api: Arc<HttpApi>,
    system: Multiplexer<SystemEvent>,
    conversations: Conversations,
    presence: PresenceRelay,
    mission: MissionSession,
}

impl CrewClient {
    pub async fn connect(settings: &ClientSettings, username: &str) -> Result<Self> {
        let api = Arc::new(
            HttpApi::login(settings.server_url.as_str(), username)
                .await
                .with_context(|| format!("failed to log in as {username}"))?,
        );
        let me = api.user_id();
        let system = Multiplexer::connect_system(api.server_url(), me)
            .await
            .context("failed to open system channel")?;

        let conversations = Conversations::new(api.clone(), me, settings.event_buffer);
        conversations.attach(&system).await;
        let presence = PresenceRelay::new(api.clone(), me, settings.event_buffer);
        presence.attach(&system).await;
        presence
            .load()
            .await
            .context("failed to load presence and notifications")?;
        conversations.refresh_unread().await;

        let mission = MissionSession::new(api.clone(), me, settings);
        info!(user_id = me.0, server = api.server_url(), "client connected");
        Ok(Self {
            api,
            system,
            conversations,
            presence,
            mission,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.api.user_id()
    }

    pub fn api(&self) -> &HttpApi {
        &self.api
    }

    pub fn conversations(&self) -> &Conversations {
        &self.conversations
    }

    pub fn presence(&self) -> &PresenceRelay {
        &self.presence
    }

    pub fn mission(&self) -> &MissionSession {
        &self.mission
    }

    /// Opens `mission_id`, tearing down the previously open mission first.
    pub async fn open_mission(&self, mission_id: MissionId) -> Result<(), LifecycleError> {
        self.mission.connect(self.api.server_url(), mission_id).await
    }

    pub async fn shutdown(&self) {
        self.mission.teardown().await;
        self.system.close().await;
        info!(user_id = self.user_id().0, "client shut down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

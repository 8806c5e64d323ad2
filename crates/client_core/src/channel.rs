use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use shared::{
    domain::{MissionId, UserId},
    protocol::Envelope,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

/// What a channel is bound to: one mission, or the system-wide feed of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScope {
    Mission(MissionId),
    System(UserId),
}

impl ChannelScope {
    pub fn url(&self, server_url: &str) -> Result<String, ChannelError> {
        let server_url = server_url.trim_end_matches('/');
        let base = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
            server_url.to_string()
        } else {
            return Err(ChannelError::InvalidUrl(server_url.to_string()));
        };
        Ok(match self {
            ChannelScope::Mission(mission_id) => format!("{base}/ws/missions/{}", mission_id.0),
            ChannelScope::System(user_id) => format!("{base}/ws?user_id={}", user_id.0),
        })
    }
}

/// Inbound frames of one open channel. Ends when the connection goes away;
/// a reopened channel hands out a new one and nothing is replayed.
pub type FrameReceiver = mpsc::UnboundedReceiver<Envelope>;

/// One websocket connection bound to a [`ChannelScope`].
pub struct SessionChannel {
    scope: ChannelScope,
    state: Arc<watch::Sender<ChannelState>>,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl SessionChannel {
    pub async fn open(
        server_url: &str,
        scope: ChannelScope,
    ) -> Result<(Self, FrameReceiver), ChannelError> {
        let url = scope.url(server_url)?;
        let state = Arc::new(watch::channel(ChannelState::Connecting).0);

        let (ws_stream, _) = connect_async(&url).await.map_err(|source| {
            warn!(%url, error = %source, "websocket connect failed");
            ChannelError::Connect {
                url: url.clone(),
                source,
            }
        })?;
        state.send_replace(ChannelState::Open);
        info!(%url, "channel open");

        let (ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(write_frames(ws_writer, outbound_rx, Arc::clone(&state)));

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let reader_state = Arc::clone(&state);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Envelope::parse(&text) {
                        Ok(envelope) => {
                            let _ = frames_tx.send(envelope);
                        }
                        Err(error) => warn!(%error, "dropping malformed frame"),
                    },
                    Ok(Message::Close(_)) => {
                        advance(&reader_state, ChannelState::Closing);
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "websocket receive failed");
                        advance(&reader_state, ChannelState::Error);
                        return;
                    }
                }
            }
            advance(&reader_state, ChannelState::Closed);
            debug!("channel reader finished");
        });

        Ok((
            Self {
                scope,
                state,
                outbound,
                reader,
            },
            frames_rx,
        ))
    }

    pub fn scope(&self) -> ChannelScope {
        self.scope
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Transmits one frame. Only an OPEN channel accepts frames; nothing is
    /// queued for later.
    pub fn send(&self, kind: &str, data: serde_json::Value) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotReady);
        }
        let text = Envelope::new(kind, data).to_text()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    pub fn close(&self) {
        match self.state() {
            ChannelState::Closed => return,
            ChannelState::Error => {}
            _ => advance(&self.state, ChannelState::Closing),
        }
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
        self.state.send_replace(ChannelState::Closed);
        info!(scope = ?self.scope, "channel closed");
    }
}

/// Drains queued frames into the socket. A failed write moves the channel to
/// ERROR so `send` stops accepting frames.
async fn write_frames<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    state: Arc<watch::Sender<ChannelState>>,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(error) = writer.send(msg).await {
            warn!(%error, "websocket send failed");
            advance(&state, ChannelState::Error);
            break;
        }
        if closing {
            break;
        }
    }
}

/// CLOSED is final for a connection; late updates from the reader are ignored.
fn advance(state: &watch::Sender<ChannelState>, next: ChannelState) {
    state.send_if_modified(|current| {
        if *current == ChannelState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;

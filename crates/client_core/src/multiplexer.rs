use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use shared::{
    domain::{MissionId, UserId},
    protocol::{Decoded, MissionEvent, SystemEvent, WireEvent},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::{
    channel::{ChannelScope, FrameReceiver, SessionChannel},
    error::ChannelError,
};

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

struct Subscriber<E> {
    predicate: Predicate<E>,
    tx: mpsc::UnboundedSender<E>,
}

/// Lazy sequence of events matching one subscription.
pub type Subscription<E> = UnboundedReceiverStream<E>;

/// Classifies the frames of one channel into typed events and fans each one
/// out to every subscription whose predicate accepts it.
pub struct Multiplexer<E> {
    channel: Option<SessionChannel>,
    subscribers: Arc<Mutex<Vec<Subscriber<E>>>>,
    pump: JoinHandle<()>,
}

impl Multiplexer<MissionEvent> {
    pub async fn connect_mission(server_url: &str, mission_id: MissionId) -> Result<Self, ChannelError> {
        let (channel, frames) = SessionChannel::open(server_url, ChannelScope::Mission(mission_id)).await?;
        Ok(Self::new(Some(channel), frames))
    }
}

impl Multiplexer<SystemEvent> {
    pub async fn connect_system(server_url: &str, user_id: UserId) -> Result<Self, ChannelError> {
        let (channel, frames) = SessionChannel::open(server_url, ChannelScope::System(user_id)).await?;
        Ok(Self::new(Some(channel), frames))
    }
}

impl<E> Multiplexer<E>
where
    E: WireEvent + Clone + Send + 'static,
{
    /// Builds a multiplexer over an existing frame source. Without a channel
    /// every `send` fails with [`ChannelError::NotReady`].
    pub fn new(channel: Option<SessionChannel>, frames: FrameReceiver) -> Self {
        let subscribers: Arc<Mutex<Vec<Subscriber<E>>>> = Arc::new(Mutex::new(Vec::new()));
        let pump = tokio::spawn(pump_frames(frames, Arc::clone(&subscribers)));
        Self {
            channel,
            subscribers,
            pump,
        }
    }

    pub async fn subscribe<F>(&self, predicate: F) -> Subscription<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(Subscriber {
            predicate: Box::new(predicate),
            tx,
        });
        UnboundedReceiverStream::new(rx)
    }

    pub async fn subscribe_all(&self) -> Subscription<E> {
        self.subscribe(|_| true).await
    }

    pub fn send(&self, kind: &str, data: serde_json::Value) -> Result<(), ChannelError> {
        match &self.channel {
            Some(channel) => channel.send(kind, data),
            None => Err(ChannelError::NotReady),
        }
    }

    pub fn channel(&self) -> Option<&SessionChannel> {
        self.channel.as_ref()
    }

    /// Closes the channel and ends every subscription.
    pub async fn close(&self) {
        if let Some(channel) = &self.channel {
            channel.close();
        }
        self.pump.abort();
        self.subscribers.lock().await.clear();
    }
}

impl<E> Drop for Multiplexer<E> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_frames<E>(mut frames: FrameReceiver, subscribers: Arc<Mutex<Vec<Subscriber<E>>>>)
where
    E: WireEvent + Clone + Send + 'static,
{
    while let Some(envelope) = frames.recv().await {
        let event = match envelope.decode::<E>() {
            Ok(Decoded::Event(event)) => event,
            Ok(Decoded::Unknown(kind)) => {
                debug!(%kind, "ignoring unknown frame type");
                continue;
            }
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                continue;
            }
        };

        let mut guard = subscribers.lock().await;
        guard.retain(|subscriber| deliver(subscriber, &event));
    }
    debug!("frame source ended");
    subscribers.lock().await.clear();
}

/// Returns false when the subscriber is gone or its predicate panicked; it is
/// then dropped without affecting the others.
fn deliver<E: WireEvent + Clone>(subscriber: &Subscriber<E>, event: &E) -> bool {
    if subscriber.tx.is_closed() {
        return false;
    }
    match catch_unwind(AssertUnwindSafe(|| (subscriber.predicate)(event))) {
        Ok(true) => subscriber.tx.send(event.clone()).is_ok(),
        Ok(false) => true,
        Err(_) => {
            warn!(kind = event.kind(), "subscriber predicate panicked, unsubscribing");
            false
        }
    }
}

#[cfg(test)]
#[path = "tests/multiplexer_tests.rs"]
mod tests;

use std::collections::HashMap;

use server_api::Delivery;
use shared::{
    domain::{MissionId, UserId},
    protocol::{Envelope, MissionEvent, SystemEvent, WireEvent},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Routes encoded frames to the sockets currently attached to a mission or a
/// user. Frames are only delivered to live receivers; nothing is queued for
/// later connections.
pub(crate) struct Hub {
    capacity: usize,
    missions: Mutex<HashMap<MissionId, broadcast::Sender<String>>>,
    users: Mutex<HashMap<UserId, UserSlot>>,
}

struct UserSlot {
    sender: broadcast::Sender<String>,
    sockets: usize,
}

/// Handle returned by [`Hub::connect_user`].
pub(crate) struct UserConnection {
    pub(crate) receiver: broadcast::Receiver<String>,
    pub(crate) first: bool,
}

impl Hub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            missions: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn subscribe_mission(&self, mission_id: MissionId) -> broadcast::Receiver<String> {
        let mut missions = self.missions.lock().await;
        missions
            .entry(mission_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops the mission channel once no socket listens to it anymore.
    pub(crate) async fn release_mission(&self, mission_id: MissionId) {
        let mut missions = self.missions.lock().await;
        if missions
            .get(&mission_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            missions.remove(&mission_id);
            debug!(mission_id = mission_id.0, "mission channel pruned");
        }
    }

    pub(crate) async fn connect_user(&self, user_id: UserId) -> UserConnection {
        let mut users = self.users.lock().await;
        let slot = users.entry(user_id).or_insert_with(|| UserSlot {
            sender: broadcast::channel(self.capacity).0,
            sockets: 0,
        });
        slot.sockets += 1;
        UserConnection {
            receiver: slot.sender.subscribe(),
            first: slot.sockets == 1,
        }
    }

    /// Returns true when the user's last socket went away.
    pub(crate) async fn disconnect_user(&self, user_id: UserId) -> bool {
        let mut users = self.users.lock().await;
        let Some(slot) = users.get_mut(&user_id) else {
            return false;
        };
        slot.sockets = slot.sockets.saturating_sub(1);
        if slot.sockets == 0 {
            users.remove(&user_id);
            return true;
        }
        false
    }

    pub(crate) async fn online_users(&self) -> Vec<UserId> {
        let users = self.users.lock().await;
        let mut online: Vec<UserId> = users.keys().copied().collect();
        online.sort();
        online
    }

    pub(crate) async fn broadcast_mission(&self, mission_id: MissionId, event: &MissionEvent) {
        let Some(text) = encode(event) else {
            return;
        };
        let missions = self.missions.lock().await;
        if let Some(sender) = missions.get(&mission_id) {
            let _ = sender.send(text);
        }
    }

    pub(crate) async fn notify_user(&self, user_id: UserId, event: &SystemEvent) {
        let Some(text) = encode(event) else {
            return;
        };
        let users = self.users.lock().await;
        if let Some(slot) = users.get(&user_id) {
            let _ = slot.sender.send(text);
        }
    }

    pub(crate) async fn broadcast_all(&self, event: &SystemEvent) {
        let Some(text) = encode(event) else {
            return;
        };
        let users = self.users.lock().await;
        for slot in users.values() {
            let _ = slot.sender.send(text.clone());
        }
    }

    pub(crate) async fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Mission(mission_id, event) => {
                    self.broadcast_mission(mission_id, &event).await
                }
                Delivery::User(user_id, event) => self.notify_user(user_id, &event).await,
                Delivery::Everyone(event) => self.broadcast_all(&event).await,
            }
        }
    }
}

fn encode<E: WireEvent>(event: &E) -> Option<String> {
    match Envelope::from_event(event).and_then(|envelope| envelope.to_text()) {
        Ok(text) => Some(text),
        Err(error) => {
            warn!(kind = event.kind(), %error, "failed to encode frame");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;

use super::*;
use chrono::Utc;
use shared::{
    domain::CommentId,
    protocol::{CommentPayload, PresenceChange},
};

fn comment(mission_id: MissionId, id: i64) -> MissionEvent {
    MissionEvent::NewComment(CommentPayload {
        comment_id: CommentId(id),
        mission_id,
        author_id: UserId(1),
        author_display_name: None,
        content: format!("comment {id}"),
        created_at: Utc::now(),
    })
}

#[tokio::test]
async fn mission_frames_only_reach_that_mission() {
    let hub = Hub::new(8);
    let mut first = hub.subscribe_mission(MissionId(1)).await;
    let mut second = hub.subscribe_mission(MissionId(2)).await;

    hub.broadcast_mission(MissionId(1), &comment(MissionId(1), 10))
        .await;

    let text = first.recv().await.expect("frame");
    let envelope = Envelope::parse(&text).expect("envelope");
    assert_eq!(envelope.kind, "new_comment");
    assert!(second.try_recv().is_err());
}

#[tokio::test]
async fn frames_without_listeners_are_dropped() {
    let hub = Hub::new(8);
    hub.broadcast_mission(MissionId(7), &comment(MissionId(7), 1))
        .await;
    let mut late = hub.subscribe_mission(MissionId(7)).await;
    assert!(late.try_recv().is_err());
}

#[tokio::test]
async fn release_prunes_idle_mission_channels() {
    let hub = Hub::new(8);
    let receiver = hub.subscribe_mission(MissionId(3)).await;
    hub.release_mission(MissionId(3)).await;
    assert!(hub.missions.lock().await.contains_key(&MissionId(3)));

    drop(receiver);
    hub.release_mission(MissionId(3)).await;
    assert!(!hub.missions.lock().await.contains_key(&MissionId(3)));
}

#[tokio::test]
async fn user_is_offline_only_after_last_socket() {
    let hub = Hub::new(8);
    let first = hub.connect_user(UserId(5)).await;
    let second = hub.connect_user(UserId(5)).await;
    assert!(first.first);
    assert!(!second.first);
    assert_eq!(hub.online_users().await, vec![UserId(5)]);

    assert!(!hub.disconnect_user(UserId(5)).await);
    assert_eq!(hub.online_users().await, vec![UserId(5)]);
    assert!(hub.disconnect_user(UserId(5)).await);
    assert!(hub.online_users().await.is_empty());
}

#[tokio::test]
async fn broadcast_all_reaches_every_connected_user() {
    let hub = Hub::new(8);
    let mut alice = hub.connect_user(UserId(1)).await.receiver;
    let mut bob = hub.connect_user(UserId(2)).await.receiver;

    hub.broadcast_all(&SystemEvent::AgentOnline(PresenceChange { user_id: UserId(3) }))
        .await;

    for receiver in [&mut alice, &mut bob] {
        let text = receiver.recv().await.expect("frame");
        assert_eq!(Envelope::parse(&text).expect("envelope").kind, "agent_online");
    }
}

#[tokio::test]
async fn dispatch_routes_user_deliveries() {
    let hub = Hub::new(8);
    let mut alice = hub.connect_user(UserId(1)).await.receiver;
    let mut bob = hub.connect_user(UserId(2)).await.receiver;

    hub.dispatch(vec![Delivery::User(
        UserId(2),
        SystemEvent::AgentOffline(PresenceChange { user_id: UserId(9) }),
    )])
    .await;

    let text = bob.recv().await.expect("frame");
    assert_eq!(Envelope::parse(&text).expect("envelope").kind, "agent_offline");
    assert!(alice.try_recv().is_err());
}

use super::*;
use chrono::Utc;
use futures::StreamExt;
use shared::{
    domain::CommentId,
    protocol::{ChatCleared, CommentPayload, Envelope},
};
use std::time::Duration;

fn comment_frame(id: i64) -> Envelope {
    Envelope::from_event(&MissionEvent::NewComment(CommentPayload {
        comment_id: CommentId(id),
        mission_id: MissionId(1),
        author_id: UserId(1),
        author_display_name: None,
        content: format!("c{id}"),
        created_at: Utc::now(),
    }))
    .expect("frame")
}

fn clear_frame() -> Envelope {
    Envelope::from_event(&MissionEvent::ClearChat(ChatCleared {
        mission_id: MissionId(1),
        cleared_through: None,
    }))
    .expect("frame")
}

async fn next<E>(subscription: &mut Subscription<E>) -> E {
    tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("event in time")
        .expect("subscription open")
}

fn comment_id(event: &MissionEvent) -> i64 {
    match event {
        MissionEvent::NewComment(comment) => comment.comment_id.0,
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn every_subscriber_sees_every_matching_event_in_order() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<MissionEvent> = Multiplexer::new(None, rx);
    let mut first = mux.subscribe_all().await;
    let mut second = mux.subscribe_all().await;

    for id in 1..=3 {
        tx.send(comment_frame(id)).expect("send");
    }

    for subscription in [&mut first, &mut second] {
        let ids = vec![
            comment_id(&next(subscription).await),
            comment_id(&next(subscription).await),
            comment_id(&next(subscription).await),
        ];
        assert_eq!(ids, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn predicate_filters_by_kind() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<MissionEvent> = Multiplexer::new(None, rx);
    let mut clears = mux
        .subscribe(|event| matches!(event, MissionEvent::ClearChat(_)))
        .await;

    tx.send(comment_frame(1)).expect("send");
    tx.send(clear_frame()).expect("send");

    assert!(matches!(next(&mut clears).await, MissionEvent::ClearChat(_)));
}

#[tokio::test]
async fn unknown_and_bad_frames_are_skipped() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<MissionEvent> = Multiplexer::new(None, rx);
    let mut all = mux.subscribe_all().await;

    tx.send(Envelope::new("friend_request", serde_json::json!({})))
        .expect("send");
    tx.send(Envelope::new("new_comment", serde_json::json!({ "oops": true })))
        .expect("send");
    tx.send(comment_frame(9)).expect("send");

    assert_eq!(comment_id(&next(&mut all).await), 9);
}

#[tokio::test]
async fn dropped_subscriber_does_not_block_others() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<MissionEvent> = Multiplexer::new(None, rx);
    let gone = mux.subscribe_all().await;
    let mut alive = mux.subscribe_all().await;
    drop(gone);

    tx.send(comment_frame(1)).expect("send");
    tx.send(comment_frame(2)).expect("send");

    assert_eq!(comment_id(&next(&mut alive).await), 1);
    assert_eq!(comment_id(&next(&mut alive).await), 2);
}

#[tokio::test]
async fn panicking_predicate_is_isolated() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<MissionEvent> = Multiplexer::new(None, rx);
    let mut broken = mux.subscribe(|_| panic!("bad predicate")).await;
    let mut healthy = mux.subscribe_all().await;

    tx.send(comment_frame(1)).expect("send");
    tx.send(comment_frame(2)).expect("send");

    assert_eq!(comment_id(&next(&mut healthy).await), 1);
    assert_eq!(comment_id(&next(&mut healthy).await), 2);
    let ended = tokio::time::timeout(Duration::from_secs(5), broken.next())
        .await
        .expect("broken subscription resolves");
    assert!(ended.is_none());
}

#[tokio::test]
async fn send_without_channel_is_not_ready() {
    let (_tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<SystemEvent> = Multiplexer::new(None, rx);
    assert!(matches!(
        mux.send("ping", serde_json::Value::Null),
        Err(ChannelError::NotReady)
    ));
}

#[tokio::test]
async fn subscriptions_end_with_the_frame_source() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux: Multiplexer<MissionEvent> = Multiplexer::new(None, rx);
    let mut all = mux.subscribe_all().await;
    drop(tx);

    let ended = tokio::time::timeout(Duration::from_secs(5), all.next())
        .await
        .expect("resolves");
    assert!(ended.is_none());
}

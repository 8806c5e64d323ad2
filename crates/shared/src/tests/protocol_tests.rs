use super::*;
use chrono::TimeZone;

fn sample_comment(id: i64) -> CommentPayload {
    CommentPayload {
        comment_id: CommentId(id),
        mission_id: MissionId(42),
        author_id: UserId(3),
        author_display_name: Some("rook".into()),
        content: "gear up".into(),
        created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
    }
}

#[test]
fn mission_event_serializes_as_type_data_envelope() {
    let event = MissionEvent::ClearChat(ChatCleared {
        mission_id: MissionId(42),
        cleared_through: Some(CommentId(9)),
    });
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "clear_chat");
    assert_eq!(value["data"]["mission_id"], 42);
    assert_eq!(value["data"]["cleared_through"], 9);
}

#[test]
fn decodes_known_frame() {
    let text = serde_json::to_string(&MissionEvent::NewComment(sample_comment(5))).expect("json");
    let decoded = Envelope::parse(&text)
        .expect("envelope")
        .decode::<MissionEvent>()
        .expect("decode");
    assert_eq!(decoded, Decoded::Event(MissionEvent::NewComment(sample_comment(5))));
}

#[test]
fn unknown_type_is_not_an_error() {
    let decoded = Envelope::parse(r#"{"type":"mission_renamed","data":{"name":"x"}}"#)
        .expect("envelope")
        .decode::<MissionEvent>()
        .expect("decode");
    assert_eq!(decoded, Decoded::Unknown("mission_renamed".into()));
}

#[test]
fn system_kinds_are_unknown_on_mission_channel() {
    let decoded = Envelope::parse(r#"{"type":"agent_online","data":{"user_id":1}}"#)
        .expect("envelope")
        .decode::<MissionEvent>()
        .expect("decode");
    assert!(matches!(decoded, Decoded::Unknown(kind) if kind == "agent_online"));
}

#[test]
fn known_type_with_bad_payload_is_rejected() {
    let err = Envelope::parse(r#"{"type":"new_comment","data":{"content":7}}"#)
        .expect("envelope")
        .decode::<MissionEvent>()
        .expect_err("payload should be rejected");
    assert!(matches!(err, FrameError::Payload { kind, .. } if kind == "new_comment"));
}

#[test]
fn non_json_text_is_malformed() {
    assert!(matches!(
        Envelope::parse("not json"),
        Err(FrameError::Malformed(_))
    ));
}

#[test]
fn clear_chat_without_watermark_defaults_to_none() {
    let decoded = Envelope::parse(r#"{"type":"clear_chat","data":{"mission_id":42}}"#)
        .expect("envelope")
        .decode::<MissionEvent>()
        .expect("decode");
    assert_eq!(
        decoded,
        Decoded::Event(MissionEvent::ClearChat(ChatCleared {
            mission_id: MissionId(42),
            cleared_through: None,
        }))
    );
}

#[test]
fn every_system_kind_is_listed() {
    for kind in NotificationKind::ALL {
        assert!(SystemEvent::KINDS.contains(&kind.as_str()), "{kind:?} missing");
    }
    assert!(SystemEvent::KINDS.contains(&"agent_online"));
    assert!(SystemEvent::KINDS.contains(&"agent_offline"));
}

#[test]
fn kind_matches_serialized_tag() {
    let event = SystemEvent::AgentOffline(PresenceChange { user_id: UserId(8) });
    let envelope = Envelope::from_event(&event).expect("envelope");
    assert_eq!(envelope.kind, event.kind());
    assert!(event.is_presence());
}

#[test]
fn notification_wraps_in_matching_frame() {
    let notification = NotificationPayload {
        notification_id: NotificationId(1),
        user_id: UserId(2),
        kind: NotificationKind::KickedFromMission,
        content: "you were kicked".into(),
        related_id: Some(42),
        is_read: false,
        created_at: Utc::now(),
    };
    let event = SystemEvent::from_notification(notification.clone()).expect("frame");
    assert_eq!(event.kind(), "kicked_from_mission");
    assert_eq!(event.notification(), Some(&notification));

    let mut private = notification;
    private.kind = NotificationKind::PrivateMessage;
    assert!(SystemEvent::from_notification(private).is_none());
}

use super::*;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::MessageId,
    protocol::{
        Envelope, LoginResponse, NotificationPayload, OnlineUser, PresenceChange,
        PrivateMessagePayload, UnreadCount,
    },
};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn handle_login() -> Json<LoginResponse> {
    Json(LoginResponse { user_id: 1 })
}

async fn handle_online(Query(q): Query<UserQuery>) -> Json<Vec<OnlineUser>> {
    Json(vec![
        OnlineUser {
            user_id: UserId(q.user_id),
            display_name: "ada".into(),
        },
        OnlineUser {
            user_id: UserId(2),
            display_name: "grace".into(),
        },
    ])
}

async fn handle_notifications() -> Json<Vec<NotificationPayload>> {
    Json(Vec::new())
}

async fn handle_unread() -> Json<UnreadCount> {
    Json(UnreadCount { count: 2 })
}

async fn handle_ws(ws: WebSocketUpgrade, Query(q): Query<UserQuery>) -> Response {
    ws.on_upgrade(move |socket| push_frames(socket, q.user_id))
}

async fn push_frames(mut socket: WebSocket, user_id: i64) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frames = [
        SystemEvent::AgentOnline(PresenceChange {
            user_id: UserId(user_id),
        }),
        SystemEvent::PrivateMessage(PrivateMessagePayload {
            message_id: MessageId(40),
            sender_id: UserId(2),
            receiver_id: UserId(user_id),
            content: "ping".into(),
            is_read: false,
            created_at: Utc::now(),
        }),
    ];
    for frame in frames {
        let text = Envelope::from_event(&frame)
            .and_then(|envelope| envelope.to_text())
            .expect("encode frame");
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_server() -> String {
    let app = Router::new()
        .route("/login", post(handle_login))
        .route("/users/online", get(handle_online))
        .route("/notifications", get(handle_notifications))
        .route("/messages/unread", get(handle_unread))
        .route("/ws", get(handle_ws));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn connect_wires_the_system_channel_into_every_store() {
    let server_url = spawn_server().await;
    let settings = ClientSettings {
        server_url,
        ..ClientSettings::default()
    };

    let client = CrewClient::connect(&settings, "ada").await.expect("connect");
    assert_eq!(client.user_id(), UserId(1));
    assert!(client.presence().is_online(UserId(2)).await);
    assert!(!client.presence().is_online(UserId(1)).await);
    assert_eq!(client.conversations().unread().await, 2);

    let mut unread = client.conversations().unread().await;
    for _ in 0..50 {
        if unread == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        unread = client.conversations().unread().await;
    }
    assert_eq!(unread, 3);

    assert!(client.mission().snapshot().await.mission.is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn connect_fails_without_a_server() {
    let settings = ClientSettings {
        server_url: "http://127.0.0.1:9".into(),
        ..ClientSettings::default()
    };
    let error = CrewClient::connect(&settings, "ada")
        .await
        .err()
        .expect("connect should fail");
    assert!(error.to_string().contains("failed to log in as ada"));
}

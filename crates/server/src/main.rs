use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{
    accept_friend_request, add_comment, clear_comments, create_mission, describe_users,
    get_mission, join_mission, kick_member, leave_mission, list_comments, list_conversation,
    list_crew, list_notifications, list_pending_requests, mark_conversation_read,
    mark_notification_read, send_friend_request, send_private_message, transition_mission,
    unread_message_count, ApiContext,
};
use shared::{
    domain::{FriendRequestId, LifecycleAction, MissionId, NotificationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddCommentRequest, ChatCleared, CommentPayload, CreateMissionRequest, CrewMemberSummary,
        Envelope, FriendRequestCreate, LoginRequest, LoginResponse, MissionSummary,
        NotificationPayload, OnlineUser, PendingRequestSummary, PresenceChange,
        PrivateMessagePayload, SendPrivateMessageRequest, SystemEvent, UnreadCount,
    },
};
use storage::Storage;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod hub;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use hub::Hub;

const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        hub: Arc::new(Hub::new(settings.channel_capacity)),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/missions", post(http_create_mission))
        .route("/missions/:mission_id", get(http_get_mission))
        .route("/missions/:mission_id/crew", get(http_list_crew))
        .route("/missions/:mission_id/crew/:member_id", delete(http_kick_member))
        .route("/missions/:mission_id/join", post(http_join_mission))
        .route("/missions/:mission_id/leave", post(http_leave_mission))
        .route("/missions/:mission_id/start", post(http_start_mission))
        .route("/missions/:mission_id/complete", post(http_complete_mission))
        .route("/missions/:mission_id/fail", post(http_fail_mission))
        .route(
            "/missions/:mission_id/comments",
            get(http_list_comments)
                .post(http_add_comment)
                .delete(http_clear_comments),
        )
        .route("/messages", post(http_send_private_message))
        .route("/messages/conversation/:with_id", get(http_list_conversation))
        .route("/messages/unread", get(http_unread_count))
        .route("/messages/read/:sender_id", post(http_mark_conversation_read))
        .route("/friends/requests", post(http_send_friend_request))
        .route("/friends/requests/pending", get(http_list_pending_requests))
        .route(
            "/friends/requests/:request_id/accept",
            post(http_accept_friend_request),
        )
        .route("/users/online", get(http_online_users))
        .route("/notifications", get(http_list_notifications))
        .route(
            "/notifications/:notification_id/read",
            post(http_mark_notification_read),
        )
        .route("/ws", get(system_ws_handler))
        .route("/ws/missions/:mission_id", get(mission_ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn reject(error: ApiError) -> HttpError {
    let status = StatusCode::from_u16(error.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::validation("username cannot be empty")));
    }
    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    info!(user_id = user_id.0, "user logged in");
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_create_mission(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<CreateMissionRequest>,
) -> Result<Json<MissionSummary>, HttpError> {
    let mission = create_mission(&state.api, UserId(q.user_id), req)
        .await
        .map_err(reject)?;
    Ok(Json(mission))
}

async fn http_get_mission(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
) -> Result<Json<MissionSummary>, HttpError> {
    let mission = get_mission(&state.api, MissionId(mission_id))
        .await
        .map_err(reject)?;
    Ok(Json(mission))
}

async fn http_list_crew(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
) -> Result<Json<Vec<CrewMemberSummary>>, HttpError> {
    let crew = list_crew(&state.api, MissionId(mission_id))
        .await
        .map_err(reject)?;
    Ok(Json(crew))
}

async fn http_kick_member(
    State(state): State<Arc<AppState>>,
    Path((mission_id, member_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
) -> Result<Json<MissionSummary>, HttpError> {
    let outcome = kick_member(
        &state.api,
        UserId(q.user_id),
        MissionId(mission_id),
        UserId(member_id),
    )
    .await
    .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_join_mission(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<MissionSummary>, HttpError> {
    let outcome = join_mission(&state.api, UserId(q.user_id), MissionId(mission_id))
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_leave_mission(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<MissionSummary>, HttpError> {
    let outcome = leave_mission(&state.api, UserId(q.user_id), MissionId(mission_id))
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_start_mission(
    state: State<Arc<AppState>>,
    mission_id: Path<i64>,
    q: Query<UserQuery>,
) -> Result<Json<MissionSummary>, HttpError> {
    transition(state, mission_id, q, LifecycleAction::Start).await
}

async fn http_complete_mission(
    state: State<Arc<AppState>>,
    mission_id: Path<i64>,
    q: Query<UserQuery>,
) -> Result<Json<MissionSummary>, HttpError> {
    transition(state, mission_id, q, LifecycleAction::Complete).await
}

async fn http_fail_mission(
    state: State<Arc<AppState>>,
    mission_id: Path<i64>,
    q: Query<UserQuery>,
) -> Result<Json<MissionSummary>, HttpError> {
    transition(state, mission_id, q, LifecycleAction::Fail).await
}

async fn transition(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
    Query(q): Query<UserQuery>,
    action: LifecycleAction,
) -> Result<Json<MissionSummary>, HttpError> {
    let outcome = transition_mission(&state.api, UserId(q.user_id), MissionId(mission_id), action)
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_list_comments(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
) -> Result<Json<Vec<CommentPayload>>, HttpError> {
    let comments = list_comments(&state.api, MissionId(mission_id))
        .await
        .map_err(reject)?;
    Ok(Json(comments))
}

async fn http_add_comment(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<AddCommentRequest>,
) -> Result<Json<CommentPayload>, HttpError> {
    let outcome = add_comment(
        &state.api,
        UserId(q.user_id),
        MissionId(mission_id),
        &req.content,
    )
    .await
    .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_clear_comments(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ChatCleared>, HttpError> {
    let outcome = clear_comments(&state.api, UserId(q.user_id), MissionId(mission_id))
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_send_private_message(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<SendPrivateMessageRequest>,
) -> Result<Json<PrivateMessagePayload>, HttpError> {
    let outcome = send_private_message(&state.api, UserId(q.user_id), req)
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_list_conversation(
    State(state): State<Arc<AppState>>,
    Path(with_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<PrivateMessagePayload>>, HttpError> {
    let messages = list_conversation(&state.api, UserId(q.user_id), UserId(with_id))
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_unread_count(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadCount>, HttpError> {
    let count = unread_message_count(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(UnreadCount { count }))
}

async fn http_mark_conversation_read(
    State(state): State<Arc<AppState>>,
    Path(sender_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    mark_conversation_read(&state.api, UserId(q.user_id), UserId(sender_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_send_friend_request(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<FriendRequestCreate>,
) -> Result<Json<PendingRequestSummary>, HttpError> {
    let outcome = send_friend_request(&state.api, UserId(q.user_id), req.receiver_id)
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(Json(outcome.value))
}

async fn http_list_pending_requests(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<PendingRequestSummary>>, HttpError> {
    let pending = list_pending_requests(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(pending))
}

async fn http_accept_friend_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    let outcome = accept_friend_request(&state.api, UserId(q.user_id), FriendRequestId(request_id))
        .await
        .map_err(reject)?;
    state.hub.dispatch(outcome.deliveries).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_online_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OnlineUser>>, HttpError> {
    let online = state.hub.online_users().await;
    let users = describe_users(&state.api, &online).await.map_err(reject)?;
    Ok(Json(users))
}

async fn http_list_notifications(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<NotificationPayload>>, HttpError> {
    let notifications = list_notifications(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(notifications))
}

async fn http_mark_notification_read(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    mark_notification_read(
        &state.api,
        UserId(q.user_id),
        NotificationId(notification_id),
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mission_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<i64>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| mission_connection(state, socket, MissionId(mission_id)))
}

async fn mission_connection(state: Arc<AppState>, socket: WebSocket, mission_id: MissionId) {
    let frames = state.hub.subscribe_mission(mission_id).await;
    info!(mission_id = mission_id.0, "mission socket connected");

    pump_socket(socket, frames).await;

    state.hub.release_mission(mission_id).await;
    info!(mission_id = mission_id.0, "mission socket closed");
}

async fn system_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| system_connection(state, socket, UserId(q.user_id)))
}

async fn system_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let connection = state.hub.connect_user(user_id).await;
    if connection.first {
        info!(user_id = user_id.0, "agent online");
        state
            .hub
            .broadcast_all(&SystemEvent::AgentOnline(PresenceChange { user_id }))
            .await;
    }

    pump_socket(socket, connection.receiver).await;

    if state.hub.disconnect_user(user_id).await {
        info!(user_id = user_id.0, "agent offline");
        state
            .hub
            .broadcast_all(&SystemEvent::AgentOffline(PresenceChange { user_id }))
            .await;
    }
}

/// Forwards hub frames to the socket until either side goes away. Inbound
/// frames are read only to notice the close; `ping` is accepted silently.
/// A socket that falls behind the hub is closed with `AGAIN` instead of
/// skipping frames, so the client reconnects and refetches.
async fn pump_socket(socket: WebSocket, mut frames: broadcast::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            let text = match frames.recv().await {
                Ok(text) => text,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "socket lagged behind, closing");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AGAIN,
                            reason: "lagged".into(),
                        })))
                        .await;
                    break;
                }
                Err(RecvError::Closed) => break,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let read_frames = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match Envelope::parse(&text) {
                    Ok(envelope) if envelope.kind == "ping" => {}
                    Ok(envelope) => debug!(kind = %envelope.kind, "ignoring inbound frame"),
                    Err(error) => debug!(%error, "ignoring malformed inbound frame"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => {}
        _ = read_frames => send_task.abort(),
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

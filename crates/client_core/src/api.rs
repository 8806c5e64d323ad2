use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{FriendRequestId, MissionId, NotificationId, UserId},
    error::ApiError,
    protocol::{
        AddCommentRequest, ChatCleared, CommentPayload, CreateMissionRequest, CrewMemberSummary,
        FriendRequestCreate, LoginRequest, LoginResponse, MissionSummary, NotificationPayload,
        OnlineUser, PendingRequestSummary, PrivateMessagePayload, SendPrivateMessageRequest,
        UnreadCount,
    },
};

use crate::error::ClientError;

#[async_trait]
pub trait MissionApi: Send + Sync {
    async fn get_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError>;
    async fn list_crew(&self, mission_id: MissionId) -> Result<Vec<CrewMemberSummary>, ClientError>;
    async fn list_comments(&self, mission_id: MissionId) -> Result<Vec<CommentPayload>, ClientError>;
    async fn add_comment(
        &self,
        mission_id: MissionId,
        content: &str,
    ) -> Result<CommentPayload, ClientError>;
    async fn clear_comments(&self, mission_id: MissionId) -> Result<ChatCleared, ClientError>;
    async fn kick_member(
        &self,
        mission_id: MissionId,
        member_id: UserId,
    ) -> Result<MissionSummary, ClientError>;
    async fn start_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError>;
    async fn complete_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError>;
    async fn fail_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError>;
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_private_message(
        &self,
        receiver_id: UserId,
        content: &str,
    ) -> Result<PrivateMessagePayload, ClientError>;
    async fn list_conversation(
        &self,
        with_id: UserId,
    ) -> Result<Vec<PrivateMessagePayload>, ClientError>;
    async fn mark_conversation_read(&self, sender_id: UserId) -> Result<(), ClientError>;
    async fn unread_count(&self) -> Result<i64, ClientError>;
}

#[async_trait]
pub trait SocialApi: Send + Sync {
    async fn list_online_users(&self) -> Result<Vec<OnlineUser>, ClientError>;
    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, ClientError>;
    async fn mark_notification_read(&self, notification_id: NotificationId)
        -> Result<(), ClientError>;
    async fn list_pending_requests(&self) -> Result<Vec<PendingRequestSummary>, ClientError>;
    async fn accept_friend_request(&self, request_id: FriendRequestId) -> Result<(), ClientError>;
    async fn send_friend_request(
        &self,
        receiver_id: UserId,
    ) -> Result<PendingRequestSummary, ClientError>;
}

/// reqwest-backed implementation of every API trait, acting as one user.
#[derive(Clone)]
pub struct HttpApi {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl HttpApi {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user_id,
        }
    }

    pub async fn login(server_url: impl Into<String>, username: &str) -> Result<Self, ClientError> {
        let http = Client::new();
        let server_url = server_url.into().trim_end_matches('/').to_string();
        let response: LoginResponse = decode(
            http.post(format!("{server_url}/login"))
                .json(&LoginRequest {
                    username: username.to_string(),
                })
                .send()
                .await?,
        )
        .await?;
        Ok(Self {
            http,
            server_url,
            user_id: UserId(response.user_id),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn create_mission(
        &self,
        request: &CreateMissionRequest,
    ) -> Result<MissionSummary, ClientError> {
        self.fetch(self.post("/missions").json(request)).await
    }

    pub async fn join_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        self.fetch(self.post(&format!("/missions/{}/join", mission_id.0)))
            .await
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", self.server_url))
            .query(&[("user_id", self.user_id.0)])
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.server_url))
            .query(&[("user_id", self.user_id.0)])
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.http
            .delete(format!("{}{path}", self.server_url))
            .query(&[("user_id", self.user_id.0)])
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        decode(request.send().await?).await
    }

    async fn execute(&self, request: RequestBuilder) -> Result<(), ClientError> {
        check(request.send().await?).await.map(|_| ())
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|error| error.message)
        .unwrap_or(body);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json().await?)
}

#[async_trait]
impl MissionApi for HttpApi {
    async fn get_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        self.fetch(self.get(&format!("/missions/{}", mission_id.0)))
            .await
    }

    async fn list_crew(&self, mission_id: MissionId) -> Result<Vec<CrewMemberSummary>, ClientError> {
        self.fetch(self.get(&format!("/missions/{}/crew", mission_id.0)))
            .await
    }

    async fn list_comments(&self, mission_id: MissionId) -> Result<Vec<CommentPayload>, ClientError> {
        self.fetch(self.get(&format!("/missions/{}/comments", mission_id.0)))
            .await
    }

    async fn add_comment(
        &self,
        mission_id: MissionId,
        content: &str,
    ) -> Result<CommentPayload, ClientError> {
        self.fetch(
            self.post(&format!("/missions/{}/comments", mission_id.0))
                .json(&AddCommentRequest {
                    content: content.to_string(),
                }),
        )
        .await
    }

    async fn clear_comments(&self, mission_id: MissionId) -> Result<ChatCleared, ClientError> {
        self.fetch(self.delete(&format!("/missions/{}/comments", mission_id.0)))
            .await
    }

    async fn kick_member(
        &self,
        mission_id: MissionId,
        member_id: UserId,
    ) -> Result<MissionSummary, ClientError> {
        self.fetch(self.delete(&format!(
            "/missions/{}/crew/{}",
            mission_id.0, member_id.0
        )))
        .await
    }

    async fn start_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        self.fetch(self.post(&format!("/missions/{}/start", mission_id.0)))
            .await
    }

    async fn complete_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        self.fetch(self.post(&format!("/missions/{}/complete", mission_id.0)))
            .await
    }

    async fn fail_mission(&self, mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        self.fetch(self.post(&format!("/missions/{}/fail", mission_id.0)))
            .await
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn send_private_message(
        &self,
        receiver_id: UserId,
        content: &str,
    ) -> Result<PrivateMessagePayload, ClientError> {
        self.fetch(self.post("/messages").json(&SendPrivateMessageRequest {
            receiver_id,
            content: content.to_string(),
        }))
        .await
    }

    async fn list_conversation(
        &self,
        with_id: UserId,
    ) -> Result<Vec<PrivateMessagePayload>, ClientError> {
        self.fetch(self.get(&format!("/messages/conversation/{}", with_id.0)))
            .await
    }

    async fn mark_conversation_read(&self, sender_id: UserId) -> Result<(), ClientError> {
        self.execute(self.post(&format!("/messages/read/{}", sender_id.0)))
            .await
    }

    async fn unread_count(&self) -> Result<i64, ClientError> {
        let unread: UnreadCount = self.fetch(self.get("/messages/unread")).await?;
        Ok(unread.count)
    }
}

#[async_trait]
impl SocialApi for HttpApi {
    async fn list_online_users(&self) -> Result<Vec<OnlineUser>, ClientError> {
        self.fetch(self.get("/users/online")).await
    }

    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, ClientError> {
        self.fetch(self.get("/notifications")).await
    }

    async fn mark_notification_read(
        &self,
        notification_id: NotificationId,
    ) -> Result<(), ClientError> {
        self.execute(self.post(&format!("/notifications/{}/read", notification_id.0)))
            .await
    }

    async fn list_pending_requests(&self) -> Result<Vec<PendingRequestSummary>, ClientError> {
        self.fetch(self.get("/friends/requests/pending")).await
    }

    async fn accept_friend_request(&self, request_id: FriendRequestId) -> Result<(), ClientError> {
        self.execute(self.post(&format!("/friends/requests/{}/accept", request_id.0)))
            .await
    }

    async fn send_friend_request(
        &self,
        receiver_id: UserId,
    ) -> Result<PendingRequestSummary, ClientError> {
        self.fetch(
            self.post("/friends/requests")
                .json(&FriendRequestCreate { receiver_id }),
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    CommentId, FriendRequestId, MessageId, MissionId, MissionStatus, NotificationId,
    NotificationKind, UserId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMission {
    pub mission_id: MissionId,
    pub name: String,
    pub status: MissionStatus,
    pub chief_id: UserId,
    pub chief_username: String,
    pub crew_count: i64,
    pub max_crew: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredCrewMember {
    pub mission_id: MissionId,
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct StoredComment {
    pub comment_id: CommentId,
    pub mission_id: MissionId,
    pub author_id: UserId,
    pub author_username: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredPrivateMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendshipStatus {
    Pending,
    Accepted,
}

impl FriendshipStatus {
    fn as_str(self) -> &'static str {
        match self {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Accepted => "accepted",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(FriendshipStatus::Pending),
            "accepted" => Ok(FriendshipStatus::Accepted),
            other => Err(anyhow!("unknown friendship status '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredFriendship {
    pub request_id: FriendRequestId,
    pub requester_id: UserId,
    pub requester_username: String,
    pub receiver_id: UserId,
    pub status: FriendshipStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub notification_id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub content: String,
    pub related_id: Option<i64>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

const MISSION_COLUMNS: &str = "SELECT m.id, m.name, m.status, m.chief_id, u.username, m.max_crew, m.scheduled_at,
        (SELECT COUNT(*) FROM crew_members c WHERE c.mission_id = m.id) AS crew_count
     FROM missions m
     INNER JOIN users u ON u.id = m.chief_id";

const FRIENDSHIP_COLUMNS: &str =
    "SELECT f.id, f.requester_id, u.username, f.receiver_id, f.status, f.created_at
     FROM friendships f
     INNER JOIN users u ON u.id = f.requester_id";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn create_mission(
        &self,
        chief_id: UserId,
        name: &str,
        max_crew: i64,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<MissionId> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO missions (name, status, chief_id, max_crew, scheduled_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(MissionStatus::Open.as_str())
        .bind(chief_id.0)
        .bind(max_crew)
        .bind(scheduled_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(MissionId(rec.get::<i64, _>(0)))
    }

    pub async fn load_mission(&self, mission_id: MissionId) -> Result<Option<StoredMission>> {
        let row = sqlx::query(&format!("{MISSION_COLUMNS} WHERE m.id = ?"))
            .bind(mission_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| mission_from_row(&r)).transpose()
    }

    /// Writes `next` only if the stored status is still `expected`; returns
    /// whether the row changed.
    pub async fn update_mission_status(
        &self,
        mission_id: MissionId,
        expected: MissionStatus,
        next: MissionStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE missions SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(next.as_str())
                .bind(Utc::now())
                .bind(mission_id.0)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_crew(&self, mission_id: MissionId) -> Result<Vec<StoredCrewMember>> {
        let rows = sqlx::query(
            "SELECT c.mission_id, c.user_id, u.username
             FROM crew_members c
             INNER JOIN users u ON u.id = c.user_id
             WHERE c.mission_id = ?
             ORDER BY c.joined_at, c.user_id",
        )
        .bind(mission_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredCrewMember {
                mission_id: MissionId(r.get::<i64, _>(0)),
                user_id: UserId(r.get::<i64, _>(1)),
                username: r.get::<String, _>(2),
            })
            .collect())
    }

    pub async fn is_crew_member(&self, mission_id: MissionId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM crew_members WHERE mission_id = ? AND user_id = ?")
            .bind(mission_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Inserts the member only while the mission is open and still has room;
    /// returns whether a row was added.
    pub async fn add_crew_member(&self, mission_id: MissionId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO crew_members (mission_id, user_id, joined_at)
             SELECT ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM missions WHERE id = ? AND status = 'open')
               AND (SELECT COUNT(*) FROM crew_members WHERE mission_id = ?)
                 < (SELECT max_crew FROM missions WHERE id = ?)",
        )
        .bind(mission_id.0)
        .bind(user_id.0)
        .bind(Utc::now())
        .bind(mission_id.0)
        .bind(mission_id.0)
        .bind(mission_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_crew_member(&self, mission_id: MissionId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM crew_members WHERE mission_id = ? AND user_id = ?")
            .bind(mission_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Inserts the comment only while the mission is open or in progress;
    /// `None` means the mission had already finished (or is gone).
    pub async fn insert_comment(
        &self,
        mission_id: MissionId,
        author_id: UserId,
        content: &str,
    ) -> Result<Option<StoredComment>> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO comments (mission_id, author_id, content, created_at)
             SELECT ?, ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM missions WHERE id = ? AND status IN ('open', 'in_progress')
             )
             RETURNING id",
        )
        .bind(mission_id.0)
        .bind(author_id.0)
        .bind(content)
        .bind(created_at)
        .bind(mission_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(rec) = rec else {
            return Ok(None);
        };
        Ok(Some(StoredComment {
            comment_id: CommentId(rec.get::<i64, _>(0)),
            mission_id,
            author_id,
            author_username: self.username_for_user(author_id).await?,
            content: content.to_string(),
            created_at,
        }))
    }

    pub async fn list_comments(&self, mission_id: MissionId) -> Result<Vec<StoredComment>> {
        let rows = sqlx::query(
            "SELECT c.id, c.mission_id, c.author_id, u.username, c.content, c.created_at
             FROM comments c
             LEFT JOIN users u ON u.id = c.author_id
             WHERE c.mission_id = ?
             ORDER BY c.id ASC",
        )
        .bind(mission_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredComment {
                comment_id: CommentId(r.get::<i64, _>(0)),
                mission_id: MissionId(r.get::<i64, _>(1)),
                author_id: UserId(r.get::<i64, _>(2)),
                author_username: r.get::<Option<String>, _>(3),
                content: r.get::<String, _>(4),
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    /// Deletes every comment of the mission and returns the highest id removed.
    pub async fn clear_comments(&self, mission_id: MissionId) -> Result<Option<CommentId>> {
        let mut tx = self.pool.begin().await?;
        let highest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM comments WHERE mission_id = ?")
                .bind(mission_id.0)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM comments WHERE mission_id = ?")
            .bind(mission_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(highest.map(CommentId))
    }

    pub async fn insert_private_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<StoredPrivateMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO private_messages (sender_id, receiver_id, content, is_read, created_at)
             VALUES (?, ?, ?, 0, ?) RETURNING id",
        )
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .bind(content)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredPrivateMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            sender_id,
            receiver_id,
            content: content.to_string(),
            is_read: false,
            created_at,
        })
    }

    pub async fn list_conversation(
        &self,
        me: UserId,
        other: UserId,
    ) -> Result<Vec<StoredPrivateMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, content, is_read, created_at
             FROM private_messages
             WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
             ORDER BY id ASC",
        )
        .bind(me.0)
        .bind(other.0)
        .bind(other.0)
        .bind(me.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(private_message_from_row).collect())
    }

    pub async fn unread_message_count(&self, receiver_id: UserId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM private_messages WHERE receiver_id = ? AND is_read = 0",
        )
        .bind(receiver_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_conversation_read(&self, receiver_id: UserId, sender_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE private_messages SET is_read = 1
             WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(receiver_id.0)
        .bind(sender_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Friendship between the two users in either direction.
    pub async fn find_friendship(&self, a: UserId, b: UserId) -> Result<Option<StoredFriendship>> {
        let row = sqlx::query(&format!(
            "{FRIENDSHIP_COLUMNS}
             WHERE (f.requester_id = ? AND f.receiver_id = ?) OR (f.requester_id = ? AND f.receiver_id = ?)"
        ))
        .bind(a.0)
        .bind(b.0)
        .bind(b.0)
        .bind(a.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| friendship_from_row(&r)).transpose()
    }

    pub async fn load_friendship(
        &self,
        request_id: FriendRequestId,
    ) -> Result<Option<StoredFriendship>> {
        let row = sqlx::query(&format!("{FRIENDSHIP_COLUMNS} WHERE f.id = ?"))
            .bind(request_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| friendship_from_row(&r)).transpose()
    }

    pub async fn create_friend_request(
        &self,
        requester_id: UserId,
        receiver_id: UserId,
    ) -> Result<FriendRequestId> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO friendships (requester_id, receiver_id, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(requester_id.0)
        .bind(receiver_id.0)
        .bind(FriendshipStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(FriendRequestId(rec.get::<i64, _>(0)))
    }

    /// Moves a pending request to accepted; returns false if it was not pending.
    pub async fn accept_friend_request(&self, request_id: FriendRequestId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE friendships SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(FriendshipStatus::Accepted.as_str())
        .bind(Utc::now())
        .bind(request_id.0)
        .bind(FriendshipStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_pending_requests(&self, receiver_id: UserId) -> Result<Vec<StoredFriendship>> {
        let rows = sqlx::query(&format!(
            "{FRIENDSHIP_COLUMNS} WHERE f.receiver_id = ? AND f.status = ? ORDER BY f.id ASC"
        ))
        .bind(receiver_id.0)
        .bind(FriendshipStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(friendship_from_row).collect()
    }

    pub async fn insert_notification(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        content: &str,
        related_id: Option<i64>,
    ) -> Result<StoredNotification> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO notifications (user_id, kind, content, related_id, is_read, created_at)
             VALUES (?, ?, ?, ?, 0, ?) RETURNING id",
        )
        .bind(user_id.0)
        .bind(kind.as_str())
        .bind(content)
        .bind(related_id)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredNotification {
            notification_id: NotificationId(rec.get::<i64, _>(0)),
            user_id,
            kind,
            content: content.to_string(),
            related_id,
            is_read: false,
            created_at,
        })
    }

    pub async fn list_notifications(&self, user_id: UserId) -> Result<Vec<StoredNotification>> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, content, related_id, is_read, created_at
             FROM notifications
             WHERE user_id = ?
             ORDER BY id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    /// Marks one notification read. Read flags only ever go from 0 to 1.
    pub async fn mark_notification_read(
        &self,
        user_id: UserId,
        notification_id: NotificationId,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
                .bind(notification_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn mission_from_row(r: &SqliteRow) -> Result<StoredMission> {
    let raw_status = r.get::<String, _>(2);
    let status = MissionStatus::parse(&raw_status)
        .ok_or_else(|| anyhow!("unknown mission status '{raw_status}'"))?;
    Ok(StoredMission {
        mission_id: MissionId(r.get::<i64, _>(0)),
        name: r.get::<String, _>(1),
        status,
        chief_id: UserId(r.get::<i64, _>(3)),
        chief_username: r.get::<String, _>(4),
        max_crew: r.get::<i64, _>(5),
        scheduled_at: r.get::<Option<DateTime<Utc>>, _>(6),
        crew_count: r.get::<i64, _>(7),
    })
}

fn private_message_from_row(r: &SqliteRow) -> StoredPrivateMessage {
    StoredPrivateMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        sender_id: UserId(r.get::<i64, _>(1)),
        receiver_id: UserId(r.get::<i64, _>(2)),
        content: r.get::<String, _>(3),
        is_read: r.get::<bool, _>(4),
        created_at: r.get::<DateTime<Utc>, _>(5),
    }
}

fn friendship_from_row(r: &SqliteRow) -> Result<StoredFriendship> {
    Ok(StoredFriendship {
        request_id: FriendRequestId(r.get::<i64, _>(0)),
        requester_id: UserId(r.get::<i64, _>(1)),
        requester_username: r.get::<String, _>(2),
        receiver_id: UserId(r.get::<i64, _>(3)),
        status: FriendshipStatus::parse(&r.get::<String, _>(4))?,
        created_at: r.get::<DateTime<Utc>, _>(5),
    })
}

fn notification_from_row(r: &SqliteRow) -> Result<StoredNotification> {
    let raw_kind = r.get::<String, _>(2);
    let kind = NotificationKind::parse(&raw_kind)
        .ok_or_else(|| anyhow!("unknown notification kind '{raw_kind}'"))?;
    Ok(StoredNotification {
        notification_id: NotificationId(r.get::<i64, _>(0)),
        user_id: UserId(r.get::<i64, _>(1)),
        kind,
        content: r.get::<String, _>(3),
        related_id: r.get::<Option<i64>, _>(4),
        is_read: r.get::<bool, _>(5),
        created_at: r.get::<DateTime<Utc>, _>(6),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

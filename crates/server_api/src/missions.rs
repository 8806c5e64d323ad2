use shared::{
    domain::{LifecycleAction, MissionId, MissionStatus, NotificationKind, UserId},
    error::ApiError,
    protocol::{
        ChatCleared, CommentPayload, CreateMissionRequest, CrewChange, CrewMemberSummary,
        MissionEvent, MissionSummary, StatusChanged, SystemEvent,
    },
};
use storage::{StoredComment, StoredMission};
use tracing::info;

use crate::{display_name, internal, notify, ApiContext, Delivery, Outcome};

const DEFAULT_MAX_CREW: i64 = 5;
const MAX_COMMENT_CHARS: usize = 2000;

pub async fn create_mission(
    ctx: &ApiContext,
    chief_id: UserId,
    request: CreateMissionRequest,
) -> Result<MissionSummary, ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("mission name cannot be empty"));
    }
    let max_crew = request.max_crew.unwrap_or(DEFAULT_MAX_CREW);
    if max_crew < 1 {
        return Err(ApiError::validation("max_crew must be at least 1"));
    }
    let mission_id = ctx
        .storage
        .create_mission(chief_id, name, max_crew, request.scheduled_at)
        .await
        .map_err(internal)?;
    info!(mission_id = mission_id.0, chief_id = chief_id.0, "mission created");
    get_mission(ctx, mission_id).await
}

pub async fn get_mission(ctx: &ApiContext, mission_id: MissionId) -> Result<MissionSummary, ApiError> {
    load_mission(ctx, mission_id).await.map(mission_summary)
}

pub async fn list_crew(
    ctx: &ApiContext,
    mission_id: MissionId,
) -> Result<Vec<CrewMemberSummary>, ApiError> {
    load_mission(ctx, mission_id).await?;
    let crew = ctx.storage.list_crew(mission_id).await.map_err(internal)?;
    Ok(crew
        .into_iter()
        .map(|member| CrewMemberSummary {
            mission_id: member.mission_id,
            user_id: member.user_id,
            display_name: member.username,
        })
        .collect())
}

pub async fn list_comments(
    ctx: &ApiContext,
    mission_id: MissionId,
) -> Result<Vec<CommentPayload>, ApiError> {
    load_mission(ctx, mission_id).await?;
    let comments = ctx
        .storage
        .list_comments(mission_id)
        .await
        .map_err(internal)?;
    Ok(comments.into_iter().map(comment_payload).collect())
}

pub async fn join_mission(
    ctx: &ApiContext,
    user_id: UserId,
    mission_id: MissionId,
) -> Result<Outcome<MissionSummary>, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    if mission.status != MissionStatus::Open {
        return Err(ApiError::conflict(format!(
            "mission is {}, crew can only join while open",
            mission.status
        )));
    }
    if mission.chief_id == user_id {
        return Err(ApiError::validation("the chief is not part of the crew roster"));
    }
    if ctx
        .storage
        .is_crew_member(mission_id, user_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::conflict("already a crew member"));
    }
    if !ctx
        .storage
        .add_crew_member(mission_id, user_id)
        .await
        .map_err(internal)?
    {
        let current = load_mission(ctx, mission_id).await?;
        if current.status != MissionStatus::Open {
            return Err(ApiError::conflict(format!(
                "mission is {}, crew can only join while open",
                current.status
            )));
        }
        return Err(ApiError::conflict("mission crew is full"));
    }

    let name = display_name(ctx, user_id).await?;
    notify(
        ctx,
        mission.chief_id,
        NotificationKind::NewCrewJoined,
        &format!("{name} joined {}", mission.name),
        Some(mission_id.0),
    )
    .await?;

    let change = CrewChange {
        mission_id,
        mission_name: mission.name.clone(),
        user_id,
    };
    let summary = get_mission(ctx, mission_id).await?;
    Ok(Outcome::new(summary)
        .deliver(Delivery::Mission(
            mission_id,
            MissionEvent::NewCrewJoined(change.clone()),
        ))
        .deliver(Delivery::Everyone(SystemEvent::NewCrewJoined(change))))
}

pub async fn leave_mission(
    ctx: &ApiContext,
    user_id: UserId,
    mission_id: MissionId,
) -> Result<Outcome<MissionSummary>, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    if mission.status.is_terminal() {
        return Err(ApiError::conflict(format!("mission is {}", mission.status)));
    }
    if !ctx
        .storage
        .remove_crew_member(mission_id, user_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("not a crew member"));
    }

    let name = display_name(ctx, user_id).await?;
    notify(
        ctx,
        mission.chief_id,
        NotificationKind::CrewLeft,
        &format!("{name} left {}", mission.name),
        Some(mission_id.0),
    )
    .await?;

    let change = CrewChange {
        mission_id,
        mission_name: mission.name.clone(),
        user_id,
    };
    let summary = get_mission(ctx, mission_id).await?;
    Ok(Outcome::new(summary)
        .deliver(Delivery::Mission(
            mission_id,
            MissionEvent::CrewLeft(change.clone()),
        ))
        .deliver(Delivery::Everyone(SystemEvent::CrewLeft(change))))
}

pub async fn kick_member(
    ctx: &ApiContext,
    actor_id: UserId,
    mission_id: MissionId,
    member_id: UserId,
) -> Result<Outcome<MissionSummary>, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    ensure_chief(&mission, actor_id)?;
    ensure_allowed(&mission, LifecycleAction::Kick)?;
    if member_id == mission.chief_id {
        return Err(ApiError::validation("the chief cannot be kicked"));
    }
    if !ctx
        .storage
        .remove_crew_member(mission_id, member_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("member is not in the crew"));
    }
    info!(
        mission_id = mission_id.0,
        member_id = member_id.0,
        "crew member kicked"
    );

    let notification = notify(
        ctx,
        member_id,
        NotificationKind::KickedFromMission,
        &format!("You were removed from {}", mission.name),
        Some(mission_id.0),
    )
    .await?;

    let summary = get_mission(ctx, mission_id).await?;
    let mut outcome = Outcome::new(summary).deliver(Delivery::Mission(
        mission_id,
        MissionEvent::CrewLeft(CrewChange {
            mission_id,
            mission_name: mission.name.clone(),
            user_id: member_id,
        }),
    ));
    if let Some(event) = SystemEvent::from_notification(notification) {
        outcome = outcome.deliver(Delivery::User(member_id, event));
    }
    Ok(outcome)
}

/// Start, complete or fail a mission on behalf of its chief.
pub async fn transition_mission(
    ctx: &ApiContext,
    actor_id: UserId,
    mission_id: MissionId,
    action: LifecycleAction,
) -> Result<Outcome<MissionSummary>, ApiError> {
    let kind = match action {
        LifecycleAction::Start => NotificationKind::MissionStarted,
        LifecycleAction::Complete => NotificationKind::MissionCompleted,
        LifecycleAction::Fail => NotificationKind::MissionFailed,
        LifecycleAction::Kick | LifecycleAction::ClearChat => {
            return Err(ApiError::validation(format!(
                "{action:?} is not a status transition"
            )))
        }
    };

    let mission = load_mission(ctx, mission_id).await?;
    ensure_chief(&mission, actor_id)?;
    let next = ensure_allowed(&mission, action)?;
    if !ctx
        .storage
        .update_mission_status(mission_id, mission.status, next)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::conflict("mission status changed concurrently"));
    }
    info!(
        mission_id = mission_id.0,
        from = %mission.status,
        to = %next,
        "mission status changed"
    );

    let summary = get_mission(ctx, mission_id).await?;
    let mut outcome = Outcome::new(summary).deliver(Delivery::Mission(
        mission_id,
        MissionEvent::MissionStatusChanged(StatusChanged {
            mission_id,
            status: next,
        }),
    ));

    let content = match next {
        MissionStatus::InProgress => format!("{} has started", mission.name),
        MissionStatus::Completed => format!("{} was completed", mission.name),
        _ => format!("{} has failed", mission.name),
    };
    let crew = ctx.storage.list_crew(mission_id).await.map_err(internal)?;
    for member in crew {
        let notification = notify(ctx, member.user_id, kind, &content, Some(mission_id.0)).await?;
        if let Some(event) = SystemEvent::from_notification(notification) {
            outcome = outcome.deliver(Delivery::User(member.user_id, event));
        }
    }
    Ok(outcome)
}

pub async fn add_comment(
    ctx: &ApiContext,
    author_id: UserId,
    mission_id: MissionId,
    content: &str,
) -> Result<Outcome<CommentPayload>, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("comment cannot be empty"));
    }
    if content.chars().count() > MAX_COMMENT_CHARS {
        return Err(ApiError::validation(format!(
            "comment exceeds {MAX_COMMENT_CHARS} characters"
        )));
    }
    let mission = load_mission(ctx, mission_id).await?;
    if mission.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "mission is {}, chat is closed",
            mission.status
        )));
    }
    let is_member = mission.chief_id == author_id
        || ctx
            .storage
            .is_crew_member(mission_id, author_id)
            .await
            .map_err(internal)?;
    if !is_member {
        return Err(ApiError::forbidden("only the crew can comment"));
    }

    let stored = ctx
        .storage
        .insert_comment(mission_id, author_id, content)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::conflict("mission has finished, chat is closed"))?;
    let payload = comment_payload(stored);
    Ok(Outcome::new(payload.clone()).deliver(Delivery::Mission(
        mission_id,
        MissionEvent::NewComment(payload),
    )))
}

pub async fn clear_comments(
    ctx: &ApiContext,
    actor_id: UserId,
    mission_id: MissionId,
) -> Result<Outcome<ChatCleared>, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    ensure_chief(&mission, actor_id)?;
    ensure_allowed(&mission, LifecycleAction::ClearChat)?;
    let cleared_through = ctx
        .storage
        .clear_comments(mission_id)
        .await
        .map_err(internal)?;
    let cleared = ChatCleared {
        mission_id,
        cleared_through,
    };
    Ok(Outcome::new(cleared.clone()).deliver(Delivery::Mission(
        mission_id,
        MissionEvent::ClearChat(cleared),
    )))
}

async fn load_mission(ctx: &ApiContext, mission_id: MissionId) -> Result<StoredMission, ApiError> {
    ctx.storage
        .load_mission(mission_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("mission not found"))
}

fn ensure_chief(mission: &StoredMission, actor_id: UserId) -> Result<(), ApiError> {
    if mission.chief_id != actor_id {
        return Err(ApiError::forbidden("only the mission chief can do this"));
    }
    Ok(())
}

fn ensure_allowed(
    mission: &StoredMission,
    action: LifecycleAction,
) -> Result<MissionStatus, ApiError> {
    mission.status.apply(action).ok_or_else(|| {
        ApiError::conflict(format!(
            "cannot {action:?} a mission that is {}",
            mission.status
        ))
    })
}

fn mission_summary(mission: StoredMission) -> MissionSummary {
    MissionSummary {
        mission_id: mission.mission_id,
        name: mission.name,
        status: mission.status,
        chief_id: mission.chief_id,
        chief_display_name: mission.chief_username,
        crew_count: mission.crew_count,
        max_crew: mission.max_crew,
        scheduled_at: mission.scheduled_at,
    }
}

fn comment_payload(stored: StoredComment) -> CommentPayload {
    CommentPayload {
        comment_id: stored.comment_id,
        mission_id: stored.mission_id,
        author_id: stored.author_id,
        author_display_name: stored.author_username,
        content: stored.content,
        created_at: stored.created_at,
    }
}

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{
    domain::{CommentId, LifecycleAction, MissionId, MissionStatus, UserId},
    protocol::{CommentPayload, CrewMemberSummary, MissionEvent, MissionSummary},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::MissionApi,
    config::ClientSettings,
    error::{ClientError, LifecycleError},
    multiplexer::Multiplexer,
    reconcile::Timeline,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Loaded(MissionId),
    Countdown(u32),
    CountdownCancelled,
    StatusChanged(MissionStatus),
    CrewChanged,
    CommentsChanged,
    /// Toast-style message for a rejected or failed request.
    Failure(String),
}

#[derive(Debug, Clone, Default)]
pub struct MissionSnapshot {
    pub mission: Option<MissionSummary>,
    pub crew: Vec<CrewMemberSummary>,
    pub comments: Vec<CommentPayload>,
    pub cleared_through: Option<CommentId>,
    pub countdown: Option<u32>,
}

#[derive(Default)]
struct MissionState {
    /// Bumped on every open/teardown so results of older sessions are discarded.
    epoch: u64,
    mission_id: Option<MissionId>,
    mission: Option<MissionSummary>,
    crew: Vec<CrewMemberSummary>,
    comments: Timeline<CommentPayload>,
    cleared_through: Option<CommentId>,
    countdown: Option<u32>,
}

impl MissionState {
    fn is_current(&self, epoch: u64, mission_id: MissionId) -> bool {
        self.epoch == epoch && self.mission_id == Some(mission_id)
    }

    /// Takes a server summary without ever moving the status backwards.
    /// Returns the new status when it changed.
    fn merge_summary(&mut self, mut summary: MissionSummary) -> Option<MissionStatus> {
        let Some(current) = self.mission.as_ref() else {
            let status = summary.status;
            self.mission = Some(summary);
            return Some(status);
        };
        let previous = current.status;
        if !previous.can_advance_to(summary.status) {
            debug!(
                from = %previous,
                to = %summary.status,
                "ignoring stale mission status"
            );
            summary.status = previous;
        }
        let next = summary.status;
        self.mission = Some(summary);
        (next != previous).then_some(next)
    }

    fn apply_clear(&mut self, cleared_through: Option<CommentId>) {
        match cleared_through {
            Some(watermark) => {
                self.cleared_through = self.cleared_through.max(Some(watermark));
                self.comments
                    .retain(|comment| comment.comment_id > watermark);
            }
            None => self.comments.clear(),
        }
    }

    fn is_suppressed(&self, comment_id: CommentId) -> bool {
        self.cleared_through
            .is_some_and(|watermark| comment_id <= watermark)
    }
}

struct Shared {
    api: Arc<dyn MissionApi>,
    me: UserId,
    countdown_ticks: u32,
    tick_interval: Duration,
    state: Mutex<MissionState>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct SessionTasks {
    multiplexer: Option<Multiplexer<MissionEvent>>,
    pump: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
}

/// Client-side mirror of the one mission this client has open. The server
/// is the authority: lifecycle changes are applied only after it confirms.
pub struct MissionSession {
    shared: Arc<Shared>,
    tasks: Mutex<SessionTasks>,
}

impl MissionSession {
    pub fn new(api: Arc<dyn MissionApi>, me: UserId, settings: &ClientSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                api,
                me,
                countdown_ticks: settings.countdown_ticks,
                tick_interval: settings.tick_interval,
                state: Mutex::new(MissionState::default()),
                events,
            }),
            tasks: Mutex::new(SessionTasks::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn snapshot(&self) -> MissionSnapshot {
        let state = self.shared.state.lock().await;
        MissionSnapshot {
            mission: state.mission.clone(),
            crew: state.crew.clone(),
            comments: state.comments.to_vec(),
            cleared_through: state.cleared_through,
            countdown: state.countdown,
        }
    }

    pub async fn connect(&self, server_url: &str, mission_id: MissionId) -> Result<(), LifecycleError> {
        let multiplexer = Multiplexer::connect_mission(server_url, mission_id).await?;
        self.open(mission_id, multiplexer).await
    }

    /// Binds the session to `mission_id`, replacing whatever was open before.
    /// Mission, crew and comments are refetched before any frame is applied.
    pub async fn open(
        &self,
        mission_id: MissionId,
        multiplexer: Multiplexer<MissionEvent>,
    ) -> Result<(), LifecycleError> {
        self.teardown().await;

        let mut tasks = self.tasks.lock().await;
        let epoch = {
            let mut state = self.shared.state.lock().await;
            state.mission_id = Some(mission_id);
            state.epoch
        };

        let mut subscription = multiplexer
            .subscribe(move |event: &MissionEvent| event.mission_id() == mission_id)
            .await;

        if let Err(error) = self.shared.refetch(mission_id, epoch).await {
            warn!(mission_id = mission_id.0, %error, "mission refetch failed");
            multiplexer.close().await;
            let _ = self.shared.events.send(SessionEvent::Failure(error.to_string()));
            return Err(error.into());
        }
        info!(mission_id = mission_id.0, "mission session open");
        let _ = self.shared.events.send(SessionEvent::Loaded(mission_id));

        let shared = Arc::clone(&self.shared);
        tasks.pump = Some(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                shared.apply_event(epoch, mission_id, event).await;
            }
            debug!(mission_id = mission_id.0, "mission event stream ended");
        }));
        tasks.multiplexer = Some(multiplexer);
        Ok(())
    }

    /// Stops the countdown, the event pump and the channel, and forgets the
    /// mission. Nothing started by the old session touches state afterwards.
    pub async fn teardown(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(countdown) = tasks.countdown.take() {
            if !countdown.is_finished() {
                countdown.abort();
                info!("mission start countdown cancelled");
                let _ = self.shared.events.send(SessionEvent::CountdownCancelled);
            }
        }
        if let Some(pump) = tasks.pump.take() {
            pump.abort();
        }
        if let Some(multiplexer) = tasks.multiplexer.take() {
            multiplexer.close().await;
        }

        let mut state = self.shared.state.lock().await;
        let epoch = state.epoch + 1;
        *state = MissionState {
            epoch,
            ..MissionState::default()
        };
    }

    /// Begins the start countdown; the start request is only sent once it
    /// reaches zero.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut tasks = self.tasks.lock().await;
        if tasks
            .countdown
            .as_ref()
            .is_some_and(|countdown| !countdown.is_finished())
        {
            return Err(LifecycleError::CountdownActive);
        }
        let (mission_id, epoch) = self.shared.authorize(LifecycleAction::Start).await?;

        let shared = Arc::clone(&self.shared);
        tasks.countdown = Some(tokio::spawn(async move {
            shared.run_countdown(mission_id, epoch).await;
        }));
        Ok(())
    }

    pub async fn complete(&self) -> Result<(), LifecycleError> {
        let (mission_id, epoch) = self.shared.authorize(LifecycleAction::Complete).await?;
        let result = self.shared.api.complete_mission(mission_id).await;
        self.shared.finish_transition(mission_id, epoch, result).await
    }

    pub async fn fail(&self) -> Result<(), LifecycleError> {
        let (mission_id, epoch) = self.shared.authorize(LifecycleAction::Fail).await?;
        let result = self.shared.api.fail_mission(mission_id).await;
        self.shared.finish_transition(mission_id, epoch, result).await
    }

    pub async fn kick(&self, member_id: UserId) -> Result<(), LifecycleError> {
        let (mission_id, epoch) = {
            let state = self.shared.state.lock().await;
            let mission = state.mission.as_ref().ok_or(LifecycleError::NoMission)?;
            self.shared.check(mission, LifecycleAction::Kick)?;
            if member_id == mission.chief_id {
                return Err(LifecycleError::CannotKickChief);
            }
            if !state.crew.iter().any(|member| member.user_id == member_id) {
                return Err(LifecycleError::NotInCrew(member_id));
            }
            (mission.mission_id, state.epoch)
        };

        let summary = self
            .shared
            .api
            .kick_member(mission_id, member_id)
            .await
            .map_err(|error| self.shared.report(error))?;

        let mut state = self.shared.state.lock().await;
        if !state.is_current(epoch, mission_id) {
            return Ok(());
        }
        let before = state.crew.len();
        state.crew.retain(|member| member.user_id != member_id);
        if state.crew.len() < before {
            if let Some(mission) = state.mission.as_mut() {
                mission.crew_count = summary.crew_count.max(0);
            }
            info!(mission_id = mission_id.0, member_id = member_id.0, "crew member kicked");
            let _ = self.shared.events.send(SessionEvent::CrewChanged);
        }
        Ok(())
    }

    pub async fn clear_chat(&self) -> Result<(), LifecycleError> {
        let (mission_id, epoch) = self.shared.authorize(LifecycleAction::ClearChat).await?;
        let cleared = self
            .shared
            .api
            .clear_comments(mission_id)
            .await
            .map_err(|error| self.shared.report(error))?;

        let mut state = self.shared.state.lock().await;
        if state.is_current(epoch, mission_id) {
            state.apply_clear(cleared.cleared_through);
            let _ = self.shared.events.send(SessionEvent::CommentsChanged);
        }
        Ok(())
    }

    /// Posts a comment. The confirmed comment is inserted by id, so the echo
    /// arriving on the channel is not applied a second time.
    pub async fn post_comment(&self, content: &str) -> Result<CommentPayload, LifecycleError> {
        let (mission_id, epoch) = {
            let state = self.shared.state.lock().await;
            let mission = state.mission.as_ref().ok_or(LifecycleError::NoMission)?;
            if mission.status.is_terminal() {
                return Err(LifecycleError::Terminal(mission.status));
            }
            (mission.mission_id, state.epoch)
        };
        let comment = self
            .shared
            .api
            .add_comment(mission_id, content)
            .await
            .map_err(|error| self.shared.report(error))?;

        let mut state = self.shared.state.lock().await;
        if state.is_current(epoch, mission_id)
            && !state.is_suppressed(comment.comment_id)
            && state.comments.insert(comment.clone())
        {
            let _ = self.shared.events.send(SessionEvent::CommentsChanged);
        }
        Ok(comment)
    }
}

impl Drop for MissionSession {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(countdown) = tasks.countdown.take() {
            countdown.abort();
        }
        if let Some(pump) = tasks.pump.take() {
            pump.abort();
        }
        if let Some(channel) = tasks.multiplexer.as_ref().and_then(|m| m.channel()) {
            channel.close();
        }
    }
}

impl Shared {
    fn check(&self, mission: &MissionSummary, action: LifecycleAction) -> Result<MissionStatus, LifecycleError> {
        if mission.chief_id != self.me {
            return Err(LifecycleError::NotChief);
        }
        if mission.status.is_terminal() {
            return Err(LifecycleError::Terminal(mission.status));
        }
        mission
            .status
            .apply(action)
            .ok_or(LifecycleError::IllegalTransition {
                action,
                status: mission.status,
            })
    }

    async fn authorize(&self, action: LifecycleAction) -> Result<(MissionId, u64), LifecycleError> {
        let state = self.state.lock().await;
        let mission = state.mission.as_ref().ok_or(LifecycleError::NoMission)?;
        self.check(mission, action)?;
        Ok((mission.mission_id, state.epoch))
    }

    fn report(&self, error: ClientError) -> LifecycleError {
        warn!(%error, "mission request rejected");
        let _ = self.events.send(SessionEvent::Failure(error.to_string()));
        LifecycleError::Api(error)
    }

    async fn refetch(&self, mission_id: MissionId, epoch: u64) -> Result<(), ClientError> {
        let (mission, crew, comments) = tokio::try_join!(
            self.api.get_mission(mission_id),
            self.api.list_crew(mission_id),
            self.api.list_comments(mission_id),
        )?;

        let mut state = self.state.lock().await;
        if !state.is_current(epoch, mission_id) {
            return Ok(());
        }
        state.mission = Some(mission);
        state.crew = crew;
        let watermark = state.cleared_through;
        state.comments.replace_confirmed(
            comments
                .into_iter()
                .filter(|comment| watermark.map_or(true, |w| comment.comment_id > w)),
        );
        Ok(())
    }

    async fn refresh_crew(&self, mission_id: MissionId, epoch: u64) {
        let fetched = tokio::try_join!(self.api.get_mission(mission_id), self.api.list_crew(mission_id));
        let (mission, crew) = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(mission_id = mission_id.0, %error, "crew refetch failed");
                return;
            }
        };
        let mut state = self.state.lock().await;
        if !state.is_current(epoch, mission_id) {
            return;
        }
        state.crew = crew;
        if let Some(status) = state.merge_summary(mission) {
            let _ = self.events.send(SessionEvent::StatusChanged(status));
        }
        let _ = self.events.send(SessionEvent::CrewChanged);
    }

    async fn apply_event(&self, epoch: u64, mission_id: MissionId, event: MissionEvent) {
        match event {
            MissionEvent::NewComment(comment) => {
                let mut state = self.state.lock().await;
                if !state.is_current(epoch, mission_id) {
                    return;
                }
                if state.is_suppressed(comment.comment_id) {
                    debug!(comment_id = comment.comment_id.0, "dropping comment removed by clear");
                    return;
                }
                if state.comments.insert(comment) {
                    let _ = self.events.send(SessionEvent::CommentsChanged);
                }
            }
            MissionEvent::ClearChat(cleared) => {
                let mut state = self.state.lock().await;
                if !state.is_current(epoch, mission_id) {
                    return;
                }
                state.apply_clear(cleared.cleared_through);
                let _ = self.events.send(SessionEvent::CommentsChanged);
            }
            MissionEvent::NewCrewJoined(_) | MissionEvent::CrewLeft(_) => {
                self.refresh_crew(mission_id, epoch).await;
            }
            MissionEvent::MissionStatusChanged(changed) => {
                let mut state = self.state.lock().await;
                if !state.is_current(epoch, mission_id) {
                    return;
                }
                let Some(mission) = state.mission.as_mut() else {
                    return;
                };
                if mission.status == changed.status {
                    return;
                }
                if !mission.status.can_advance_to(changed.status) {
                    debug!(
                        from = %mission.status,
                        to = %changed.status,
                        "ignoring status frame that would move backwards"
                    );
                    return;
                }
                mission.status = changed.status;
                let _ = self.events.send(SessionEvent::StatusChanged(changed.status));
            }
        }
    }

    /// Publishes one countdown tick. Returns false once the session moved on
    /// or the mission is no longer startable.
    async fn tick(&self, mission_id: MissionId, epoch: u64, remaining: Option<u32>) -> bool {
        let mut state = self.state.lock().await;
        if !state.is_current(epoch, mission_id) {
            return false;
        }
        let startable = state
            .mission
            .as_ref()
            .is_some_and(|mission| mission.status == MissionStatus::Open);
        state.countdown = remaining.filter(|_| startable);
        if !startable {
            return false;
        }
        if let Some(tick) = remaining {
            let _ = self.events.send(SessionEvent::Countdown(tick));
        }
        true
    }

    async fn run_countdown(&self, mission_id: MissionId, epoch: u64) {
        for remaining in (1..=self.countdown_ticks).rev() {
            if !self.tick(mission_id, epoch, Some(remaining)).await {
                let _ = self.events.send(SessionEvent::CountdownCancelled);
                return;
            }
            tokio::time::sleep(self.tick_interval).await;
        }
        if !self.tick(mission_id, epoch, None).await {
            let _ = self.events.send(SessionEvent::CountdownCancelled);
            return;
        }

        let result = self.api.start_mission(mission_id).await;
        let _ = self.finish_transition(mission_id, epoch, result).await;
    }

    async fn finish_transition(
        &self,
        mission_id: MissionId,
        epoch: u64,
        result: Result<MissionSummary, ClientError>,
    ) -> Result<(), LifecycleError> {
        let confirmed = result.map_err(|error| self.report(error))?;
        let summary = match self.api.get_mission(mission_id).await {
            Ok(fresh) => fresh,
            Err(error) => {
                warn!(mission_id = mission_id.0, %error, "mission reload failed, using confirmed state");
                confirmed
            }
        };

        let mut state = self.state.lock().await;
        if !state.is_current(epoch, mission_id) {
            return Ok(());
        }
        if let Some(status) = state.merge_summary(summary) {
            info!(mission_id = mission_id.0, %status, "mission status confirmed");
            let _ = self.events.send(SessionEvent::StatusChanged(status));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;

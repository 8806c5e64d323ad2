use super::*;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::CommentId,
    protocol::{ChatCleared, CrewChange, Envelope, StatusChanged},
};
use tokio::sync::mpsc;

const CHIEF: UserId = UserId(1);
const MISSION: MissionId = MissionId(42);

struct FakeMission {
    mission: MissionSummary,
    crew: Vec<CrewMemberSummary>,
    comments: Vec<CommentPayload>,
    start_calls: usize,
    kick_calls: usize,
    reject_start: bool,
}

struct FakeMissionApi {
    inner: Mutex<FakeMission>,
}

fn member(id: i64) -> CrewMemberSummary {
    CrewMemberSummary {
        mission_id: MISSION,
        user_id: UserId(id),
        display_name: format!("agent {id}"),
    }
}

fn comment(id: i64) -> CommentPayload {
    CommentPayload {
        comment_id: CommentId(id),
        mission_id: MISSION,
        author_id: UserId(2),
        author_display_name: Some("agent 2".into()),
        content: format!("comment {id}"),
        created_at: Utc::now(),
    }
}

impl FakeMissionApi {
    fn new(comments: Vec<CommentPayload>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeMission {
                mission: MissionSummary {
                    mission_id: MISSION,
                    name: "night raid".into(),
                    status: MissionStatus::Open,
                    chief_id: CHIEF,
                    chief_display_name: "chief".into(),
                    crew_count: 3,
                    max_crew: 5,
                    scheduled_at: None,
                },
                crew: vec![member(2), member(3), member(4)],
                comments,
                start_calls: 0,
                kick_calls: 0,
                reject_start: false,
            }),
        })
    }

    fn transition(inner: &mut FakeMission, action: LifecycleAction) -> Result<MissionSummary, ClientError> {
        match inner.mission.status.apply(action) {
            Some(next) => {
                inner.mission.status = next;
                Ok(inner.mission.clone())
            }
            None => Err(ClientError::Api {
                status: 409,
                message: format!("cannot {action:?} a mission that is {}", inner.mission.status),
            }),
        }
    }
}

#[async_trait]
impl MissionApi for FakeMissionApi {
    async fn get_mission(&self, _mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        Ok(self.inner.lock().await.mission.clone())
    }

    async fn list_crew(&self, _mission_id: MissionId) -> Result<Vec<CrewMemberSummary>, ClientError> {
        Ok(self.inner.lock().await.crew.clone())
    }

    async fn list_comments(&self, _mission_id: MissionId) -> Result<Vec<CommentPayload>, ClientError> {
        Ok(self.inner.lock().await.comments.clone())
    }

    async fn add_comment(
        &self,
        _mission_id: MissionId,
        content: &str,
    ) -> Result<CommentPayload, ClientError> {
        let mut inner = self.inner.lock().await;
        let next = inner
            .comments
            .iter()
            .map(|c| c.comment_id.0)
            .max()
            .unwrap_or(0)
            + 1;
        let mut created = comment(next);
        created.content = content.to_string();
        inner.comments.push(created.clone());
        Ok(created)
    }

    async fn clear_comments(&self, mission_id: MissionId) -> Result<ChatCleared, ClientError> {
        let mut inner = self.inner.lock().await;
        let cleared_through = inner.comments.iter().map(|c| c.comment_id).max();
        inner.comments.clear();
        Ok(ChatCleared {
            mission_id,
            cleared_through,
        })
    }

    async fn kick_member(
        &self,
        _mission_id: MissionId,
        member_id: UserId,
    ) -> Result<MissionSummary, ClientError> {
        let mut inner = self.inner.lock().await;
        inner.kick_calls += 1;
        let before = inner.crew.len();
        inner.crew.retain(|m| m.user_id != member_id);
        if inner.crew.len() == before {
            return Err(ClientError::Api {
                status: 404,
                message: "not in crew".into(),
            });
        }
        inner.mission.crew_count -= 1;
        Ok(inner.mission.clone())
    }

    async fn start_mission(&self, _mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        let mut inner = self.inner.lock().await;
        inner.start_calls += 1;
        if inner.reject_start {
            return Err(ClientError::Api {
                status: 409,
                message: "mission is locked".into(),
            });
        }
        Self::transition(&mut inner, LifecycleAction::Start)
    }

    async fn complete_mission(&self, _mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        Self::transition(&mut *self.inner.lock().await, LifecycleAction::Complete)
    }

    async fn fail_mission(&self, _mission_id: MissionId) -> Result<MissionSummary, ClientError> {
        Self::transition(&mut *self.inner.lock().await, LifecycleAction::Fail)
    }
}

struct Harness {
    api: Arc<FakeMissionApi>,
    session: MissionSession,
    frames: mpsc::UnboundedSender<Envelope>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    async fn open(api: Arc<FakeMissionApi>, me: UserId) -> Self {
        let session = MissionSession::new(api.clone(), me, &ClientSettings::default());
        let (frames, rx) = mpsc::unbounded_channel();
        session
            .open(MISSION, Multiplexer::new(None, rx))
            .await
            .expect("open session");
        let events = session.subscribe();
        Self {
            api,
            session,
            frames,
            events,
        }
    }

    fn push(&self, event: MissionEvent) {
        self.frames
            .send(Envelope::from_event(&event).expect("frame"))
            .expect("push frame");
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    async fn comment_ids(&self) -> Vec<i64> {
        self.session
            .snapshot()
            .await
            .comments
            .iter()
            .map(|c| c.comment_id.0)
            .collect()
    }
}

/// Lets every spawned task run until the runtime is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn countdown_runs_before_the_start_request() {
    let mut h = Harness::open(FakeMissionApi::new(Vec::new()), CHIEF).await;

    h.session.start().await.expect("start");
    for expected in (1..=5).rev() {
        assert_eq!(h.next_event().await, SessionEvent::Countdown(expected));
        assert_eq!(h.api.inner.lock().await.start_calls, 0);
    }
    assert_eq!(
        h.next_event().await,
        SessionEvent::StatusChanged(MissionStatus::InProgress)
    );

    assert_eq!(h.api.inner.lock().await.start_calls, 1);
    let snapshot = h.session.snapshot().await;
    assert_eq!(
        snapshot.mission.expect("mission").status,
        MissionStatus::InProgress
    );
    assert_eq!(snapshot.countdown, None);
}

#[tokio::test(start_paused = true)]
async fn teardown_during_countdown_sends_nothing() {
    let mut h = Harness::open(FakeMissionApi::new(Vec::new()), CHIEF).await;

    h.session.start().await.expect("start");
    assert_eq!(h.next_event().await, SessionEvent::Countdown(5));
    h.session.teardown().await;
    assert_eq!(h.next_event().await, SessionEvent::CountdownCancelled);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.api.inner.lock().await.start_calls, 0);
    assert!(h.session.snapshot().await.mission.is_none());
}

#[tokio::test(start_paused = true)]
async fn only_the_chief_can_start_and_only_once() {
    let crew = Harness::open(FakeMissionApi::new(Vec::new()), UserId(2)).await;
    assert!(matches!(
        crew.session.start().await,
        Err(LifecycleError::NotChief)
    ));

    let chief = Harness::open(FakeMissionApi::new(Vec::new()), CHIEF).await;
    chief.session.start().await.expect("first start");
    assert!(matches!(
        chief.session.start().await,
        Err(LifecycleError::CountdownActive)
    ));
    assert!(matches!(
        chief.session.complete().await,
        Err(LifecycleError::IllegalTransition {
            action: LifecycleAction::Complete,
            status: MissionStatus::Open,
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn rejected_start_keeps_state_and_reports_failure() {
    let api = FakeMissionApi::new(Vec::new());
    api.inner.lock().await.reject_start = true;
    let mut h = Harness::open(api, CHIEF).await;

    h.session.start().await.expect("start");
    loop {
        match h.next_event().await {
            SessionEvent::Countdown(_) => continue,
            SessionEvent::Failure(message) => {
                assert!(message.contains("mission is locked"), "{message}");
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.mission.expect("mission").status, MissionStatus::Open);
    assert_eq!(h.api.inner.lock().await.start_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn kick_decrements_once_and_is_idempotent() {
    let h = Harness::open(FakeMissionApi::new(Vec::new()), CHIEF).await;

    h.session.kick(UserId(2)).await.expect("kick");
    h.push(MissionEvent::CrewLeft(CrewChange {
        mission_id: MISSION,
        mission_name: "night raid".into(),
        user_id: UserId(2),
    }));
    settle().await;

    assert!(matches!(
        h.session.kick(UserId(2)).await,
        Err(LifecycleError::NotInCrew(UserId(2)))
    ));
    assert!(matches!(
        h.session.kick(CHIEF).await,
        Err(LifecycleError::CannotKickChief)
    ));

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.mission.expect("mission").crew_count, 2);
    let crew: Vec<i64> = snapshot.crew.iter().map(|m| m.user_id.0).collect();
    assert_eq!(crew, vec![3, 4]);
    assert_eq!(h.api.inner.lock().await.kick_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn clear_watermark_drops_comments_already_in_flight() {
    let h = Harness::open(FakeMissionApi::new((1..=3).map(comment).collect()), CHIEF).await;
    assert_eq!(h.comment_ids().await, vec![1, 2, 3]);

    h.session.clear_chat().await.expect("clear");
    assert_eq!(h.session.snapshot().await.cleared_through, Some(CommentId(3)));

    h.push(MissionEvent::NewComment(comment(3)));
    h.push(MissionEvent::NewComment(comment(4)));
    settle().await;
    assert_eq!(h.comment_ids().await, vec![4]);

    // An empty-chat clear from the server has no watermark and removes everything local.
    h.push(MissionEvent::ClearChat(ChatCleared {
        mission_id: MISSION,
        cleared_through: None,
    }));
    settle().await;
    assert!(h.comment_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_frames_never_move_backwards() {
    let h = Harness::open(FakeMissionApi::new(Vec::new()), CHIEF).await;

    h.push(MissionEvent::MissionStatusChanged(StatusChanged {
        mission_id: MISSION,
        status: MissionStatus::Completed,
    }));
    h.push(MissionEvent::MissionStatusChanged(StatusChanged {
        mission_id: MISSION,
        status: MissionStatus::InProgress,
    }));
    settle().await;

    let snapshot = h.session.snapshot().await;
    assert_eq!(
        snapshot.mission.expect("mission").status,
        MissionStatus::Completed
    );
    assert!(matches!(
        h.session.start().await,
        Err(LifecycleError::Terminal(MissionStatus::Completed))
    ));
    assert!(matches!(
        h.session.post_comment("too late").await,
        Err(LifecycleError::Terminal(MissionStatus::Completed))
    ));
}

#[tokio::test(start_paused = true)]
async fn echoes_of_known_comments_are_not_duplicated() {
    let h = Harness::open(FakeMissionApi::new((1..=2).map(comment).collect()), CHIEF).await;

    h.push(MissionEvent::NewComment(comment(2)));
    let posted = h.session.post_comment("on my way").await.expect("post");
    assert_eq!(posted.comment_id, CommentId(3));
    h.push(MissionEvent::NewComment(posted));
    settle().await;

    assert_eq!(h.comment_ids().await, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn frames_for_another_mission_are_ignored() {
    let h = Harness::open(FakeMissionApi::new(Vec::new()), CHIEF).await;

    let mut stray = comment(9);
    stray.mission_id = MissionId(7);
    h.push(MissionEvent::NewComment(stray));
    settle().await;

    assert!(h.comment_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn complete_applies_the_reloaded_status() {
    let api = FakeMissionApi::new(Vec::new());
    api.inner.lock().await.mission.status = MissionStatus::InProgress;
    let mut h = Harness::open(api, CHIEF).await;

    h.session.complete().await.expect("complete");
    assert_eq!(
        h.next_event().await,
        SessionEvent::StatusChanged(MissionStatus::Completed)
    );
    assert!(matches!(
        h.session.fail().await,
        Err(LifecycleError::Terminal(MissionStatus::Completed))
    ));
}

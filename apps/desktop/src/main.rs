use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_client_settings, ConversationEvent, CrewClient, RelayEvent, SessionEvent,
};
use shared::{
    domain::{MissionId, MissionStatus, NotificationId, UserId},
    protocol::CreateMissionRequest,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the server url from client.toml / CREW_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a mission with yourself as chief.
    Create {
        name: String,
        #[arg(long)]
        max_crew: Option<i64>,
    },
    Join {
        mission_id: i64,
    },
    /// Follow a mission's status, crew and comments until interrupted.
    WatchMission {
        mission_id: i64,
    },
    /// Run the start countdown and wait for the server to confirm.
    StartMission {
        mission_id: i64,
    },
    Complete {
        mission_id: i64,
    },
    Fail {
        mission_id: i64,
    },
    Kick {
        mission_id: i64,
        member_id: i64,
    },
    Comment {
        mission_id: i64,
        text: String,
    },
    ClearChat {
        mission_id: i64,
    },
    /// Send a private message.
    Message {
        to: i64,
        text: String,
    },
    /// Follow online users, notifications and private messages until interrupted.
    WatchPresence,
    /// Accept the friend request a notification refers to.
    Accept {
        notification_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_client_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }

    let client = CrewClient::connect(&settings, &args.username).await?;
    println!("Logged in as user_id={}", client.user_id());

    let result = run(&client, args.command).await;
    client.shutdown().await;
    result
}

async fn run(client: &CrewClient, command: Command) -> Result<()> {
    match command {
        Command::Create { name, max_crew } => {
            let mission = client
                .api()
                .create_mission(&CreateMissionRequest {
                    name,
                    max_crew,
                    scheduled_at: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&mission)?);
        }
        Command::Join { mission_id } => {
            let mission = client.api().join_mission(MissionId(mission_id)).await?;
            println!("{}", serde_json::to_string_pretty(&mission)?);
        }
        Command::WatchMission { mission_id } => {
            client.open_mission(MissionId(mission_id)).await?;
            print_mission(client).await;
            let events = client.mission().subscribe();
            tokio::select! {
                _ = follow_mission(client, events) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Command::StartMission { mission_id } => {
            client.open_mission(MissionId(mission_id)).await?;
            let mut events = client.mission().subscribe();
            client.mission().start().await?;
            loop {
                match recv(&mut events).await {
                    Some(SessionEvent::Countdown(remaining)) => println!("Starting in {remaining}..."),
                    Some(SessionEvent::StatusChanged(MissionStatus::InProgress)) => {
                        println!("Mission started");
                        break;
                    }
                    Some(SessionEvent::Failure(message)) => bail!(message),
                    Some(SessionEvent::CountdownCancelled) => bail!("countdown cancelled"),
                    Some(_) => {}
                    None => bail!("mission session closed"),
                }
            }
        }
        Command::Complete { mission_id } => {
            client.open_mission(MissionId(mission_id)).await?;
            client.mission().complete().await?;
            print_mission(client).await;
        }
        Command::Fail { mission_id } => {
            client.open_mission(MissionId(mission_id)).await?;
            client.mission().fail().await?;
            print_mission(client).await;
        }
        Command::Kick {
            mission_id,
            member_id,
        } => {
            client.open_mission(MissionId(mission_id)).await?;
            client.mission().kick(UserId(member_id)).await?;
            print_mission(client).await;
        }
        Command::Comment { mission_id, text } => {
            client.open_mission(MissionId(mission_id)).await?;
            let comment = client.mission().post_comment(&text).await?;
            println!("Posted comment #{}", comment.comment_id);
        }
        Command::ClearChat { mission_id } => {
            client.open_mission(MissionId(mission_id)).await?;
            client.mission().clear_chat().await?;
            println!("Chat cleared");
        }
        Command::Message { to, text } => {
            let conversations = client.conversations();
            conversations.open(UserId(to)).await?;
            let sent = conversations.send(&text).await?;
            println!("Sent message #{}", sent.message_id);
        }
        Command::WatchPresence => {
            print_presence(client).await;
            let relay_events = client.presence().subscribe();
            let chat_events = client.conversations().subscribe();
            tokio::select! {
                _ = follow_presence(client, relay_events, chat_events) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Command::Accept { notification_id } => {
            let id = NotificationId(notification_id);
            let entry = client
                .presence()
                .notifications()
                .await
                .into_iter()
                .find(|entry| entry.notification.notification_id == id)
                .with_context(|| format!("no notification #{notification_id}"))?;
            client
                .presence()
                .accept_from_notification(&entry.notification)
                .await?;
            println!("Friend request accepted");
        }
    }
    Ok(())
}

/// Next event, skipping over any the receiver fell behind on.
async fn recv<T: Clone>(events: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn follow_mission(client: &CrewClient, mut events: broadcast::Receiver<SessionEvent>) {
    while let Some(event) = recv(&mut events).await {
        match event {
            SessionEvent::Countdown(remaining) => println!("Starting in {remaining}..."),
            SessionEvent::Failure(message) => eprintln!("error: {message}"),
            SessionEvent::CommentsChanged | SessionEvent::CrewChanged | SessionEvent::StatusChanged(_) => {
                print_mission(client).await
            }
            SessionEvent::Loaded(_) | SessionEvent::CountdownCancelled => {}
        }
    }
}

async fn follow_presence(
    client: &CrewClient,
    mut relay_events: broadcast::Receiver<RelayEvent>,
    mut chat_events: broadcast::Receiver<ConversationEvent>,
) {
    loop {
        tokio::select! {
            event = recv(&mut relay_events) => match event {
                Some(RelayEvent::Failure(message)) => eprintln!("error: {message}"),
                Some(_) => print_presence(client).await,
                None => return,
            },
            event = recv(&mut chat_events) => match event {
                Some(ConversationEvent::UnreadChanged(count)) => println!("Unread messages: {count}"),
                Some(_) => {}
                None => return,
            },
        }
    }
}

async fn print_mission(client: &CrewClient) {
    let snapshot = client.mission().snapshot().await;
    let Some(mission) = snapshot.mission else {
        println!("No mission open");
        return;
    };
    println!(
        "#{} {} [{}] chief={} crew {}/{}",
        mission.mission_id,
        mission.name,
        mission.status,
        mission.chief_display_name,
        mission.crew_count,
        mission.max_crew
    );
    for member in &snapshot.crew {
        println!("  crew: {} ({})", member.display_name, member.user_id);
    }
    for comment in &snapshot.comments {
        let author = comment
            .author_display_name
            .clone()
            .unwrap_or_else(|| format!("User {}", comment.author_id));
        println!("  [{}] {author}: {}", comment.comment_id, comment.content);
    }
}

async fn print_presence(client: &CrewClient) {
    let online = client.presence().online().await;
    let names: Vec<&str> = online.iter().map(|user| user.display_name.as_str()).collect();
    println!("Online ({}): {}", online.len(), names.join(", "));
    for entry in client.presence().notifications().await {
        let marker = if entry.notification.is_read { " " } else { "*" };
        println!(
            "{marker} #{} [{}] {}",
            entry.notification.notification_id, entry.icon, entry.notification.content
        );
    }
}

mod auth;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use roomlink_session::{
    init_logging,
    loopback::{LoopbackAudio, LoopbackMediaDevices, LoopbackRoom, LoopbackSfu},
    signaling::WebSocketConnector,
    Config, LocalUser, MediaBackends, ResolutionTier, Session, SessionEvent, TelemetrySnapshot,
};

/// Headless meeting participant
#[derive(Parser, Debug)]
#[command(name = "roomlink", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "ROOMLINK_CONFIG")]
    config: Option<String>,

    /// Meeting to join
    #[arg(short, long)]
    meeting: String,

    /// Login name
    #[arg(short, long)]
    user: String,

    #[arg(short, long, env = "ROOMLINK_PASSWORD")]
    password: String,

    /// Signaling endpoint, overrides `signaling.url`
    #[arg(long)]
    url: Option<String>,

    /// Initial resolution tier (180p, 360p, 480p, 720p)
    #[arg(long)]
    resolution: Option<ResolutionTier>,

    /// Join an in-process room together with a synthetic second participant
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        config.signaling.url = url;
    }
    if let Some(tier) = cli.resolution {
        config.media.default_resolution = tier;
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    init_logging(&config.logging)?;
    info!("RoomLink starting...");

    // 3. Authenticate
    let Some(local_user) = auth::find_user(&cli.user, &cli.password) else {
        return Err(anyhow::anyhow!("Invalid credentials for user {}", cli.user));
    };

    // 4. Wire platform backends
    let (backends, room) = if cli.demo {
        info!("Demo mode: using an in-process room");
        let room = LoopbackRoom::new();
        (room.backends(), Some(room))
    } else {
        info!("Signaling endpoint: {}", config.signaling.url);
        let backends = MediaBackends {
            devices: Arc::new(LoopbackMediaDevices::standard()),
            audio: Arc::new(LoopbackAudio::new()),
            sfu: Arc::new(LoopbackSfu::new()),
            signaling: Arc::new(WebSocketConnector::new(config.signaling.url.clone())),
        };
        (backends, None)
    };

    let companion = match &room {
        Some(room) => Some(spawn_companion(&config, room, &cli.meeting, &local_user).await?),
        None => None,
    };

    // 5. Join
    let session = Session::new(config, backends);
    let mut events = session.events();
    let mut telemetry = session.telemetry();

    session.join(cli.meeting.as_str(), local_user).await?;
    info!(
        meeting_id = %cli.meeting,
        peers = session.peers().len(),
        "Joined meeting"
    );

    // 6. Report until interrupted or torn down
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving meeting");
                break Ok(());
            }
            changed = telemetry.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = telemetry.borrow_and_update().clone();
                log_telemetry(&snapshot);
            }
            event = events.recv() => match event {
                Ok(event) => {
                    log_event(&event);
                    if event.is_fatal() {
                        break Err(anyhow::anyhow!("Session terminated"));
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {skipped} session events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    // 7. Leave
    session.leave().await?;
    if let Some(companion) = companion {
        companion.leave().await?;
    }
    info!("RoomLink stopped");
    result
}

/// Join the demo room as another user so there is a remote peer to receive
async fn spawn_companion(
    config: &Config,
    room: &LoopbackRoom,
    meeting: &str,
    local_user: &LocalUser,
) -> Result<Session> {
    let login = if local_user.user_id.as_str() == "bb" { "cc" } else { "bb" };
    let Some(user) = auth::find_user(login, login) else {
        return Err(anyhow::anyhow!("Demo user {login} is not configured"));
    };

    let companion = Session::new(config.clone(), room.backends());
    companion.join(meeting, user).await?;
    info!(user_id = login, "Demo participant joined");
    Ok(companion)
}

fn log_telemetry(snapshot: &TelemetrySnapshot) {
    let outbound = &snapshot.outbound;
    info!(
        video_kbps = %outbound.video.bitrate_kbps,
        video_loss = %outbound.video.loss_percent,
        audio_kbps = %outbound.audio.bitrate_kbps,
        audio_loss = %outbound.audio.loss_percent,
        rtt_ms = %outbound.rtt_ms,
        "Outbound"
    );
    for (peer_id, peer) in &snapshot.peers {
        info!(
            peer_id = %peer_id,
            video_kbps = %peer.video.bitrate_kbps,
            video_loss = %peer.video.loss_percent,
            audio_kbps = %peer.audio.bitrate_kbps,
            audio_loss = %peer.audio.loss_percent,
            rtt_ms = %peer.rtt_ms,
            "Inbound"
        );
    }
}

fn log_event(event: &SessionEvent) {
    match serde_json::to_string(event) {
        Ok(json) if event.is_fatal() => warn!(event = %json, "Session event"),
        Ok(json) => info!(event = %json, "Session event"),
        Err(e) => warn!("Failed to encode session event: {e}"),
    }
}

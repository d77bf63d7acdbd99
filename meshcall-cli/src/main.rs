//! Meshcall CLI: scripted call flows over the simulated capability seams
//!
//! Runs the session manager against in-process peers so the lifecycle,
//! negotiation traffic, and teardown can be watched from a terminal
//! without real devices or a signaling server.

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshcall_core::engine::{IceCandidate, SessionDescription};
use meshcall_core::prelude::*;
use meshcall_core::sim::{SimEngine, SimMediaDevices, SimMediaFailure, SimSignaling, SimStream};
use meshcall_core::types::{CallTarget, ChatId, MediaKind, PeerId, UserId};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter
    #[arg(long, env = "MESHCALL_LOG", default_value = "meshcall=info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scripted one-to-one call against a simulated callee
    Direct {
        /// Callee name
        #[arg(default_value = "bob")]
        peer: String,

        /// Request video
        #[arg(long)]
        video: bool,

        /// Simulate a busy camera to show the audio-only fallback
        #[arg(long)]
        camera_busy: bool,
    },

    /// Scripted group call with simulated participants joining and leaving
    Group {
        /// Room name
        #[arg(default_value = "demo-room")]
        room: String,

        /// Number of simulated participants
        #[arg(long, default_value = "3")]
        peers: usize,
    },
}

struct Stage {
    engine: Arc<SimEngine>,
    signaling: Arc<SimSignaling>,
    manager: Arc<CallSessionManager>,
}

fn stage(camera_busy: bool) -> Stage {
    let engine = Arc::new(SimEngine::new());
    let devices = Arc::new(SimMediaDevices::new());
    if camera_busy {
        devices.fail_video_with(SimMediaFailure::DeviceBusy);
    }
    let signaling = Arc::new(SimSignaling::new());
    let manager = CallSessionManager::new(
        engine.clone(),
        devices,
        signaling.clone(),
        SessionConfig::default(),
    );
    Stage {
        engine,
        signaling,
        manager,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(cli.log).init();

    match cli.command {
        Commands::Direct {
            peer,
            video,
            camera_busy,
        } => run_direct(&peer, video, camera_busy).await,
        Commands::Group { room, peers } => run_group(&room, peers).await,
    }
}

fn print_outbound(stage: &Stage) -> Result<()> {
    for message in stage.signaling.take_sent() {
        println!("  -> {}", serde_json::to_string(&message)?);
    }
    Ok(())
}

fn print_snapshot(stage: &Stage) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&stage.manager.snapshot())?);
    Ok(())
}

fn drain_events(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        println!("  event: {event:?}");
    }
}

async fn run_direct(peer: &str, video: bool, camera_busy: bool) -> Result<()> {
    let stage = stage(camera_busy);
    let mut events = stage.manager.subscribe_events();

    println!("== calling {peer} ==");
    stage
        .manager
        .start_call(
            CallTarget::Direct {
                user_id: UserId::new(peer),
                chat_id: ChatId::new(format!("dm-{peer}")),
            },
            MediaKind::from_is_video(video),
        )
        .await?;
    print_outbound(&stage)?;
    drain_events(&mut events);

    println!("== {peer} answers ==");
    let peer_socket = PeerId::new(format!("{peer}-sock"));
    stage
        .manager
        .handle_signaling(SignalingEvent::Answered {
            responder_socket_id: peer_socket.clone(),
            answer: SessionDescription::answer("v=0 scripted-answer"),
        })
        .await?;
    stage
        .manager
        .handle_signaling(SignalingEvent::IceCandidate {
            from: peer_socket.clone(),
            candidate: IceCandidate::new("candidate:1 1 udp 2122260223 192.0.2.1 54400"),
        })
        .await?;
    if let Some(conn) = stage.engine.connection(0) {
        conn.emit_local_candidate(IceCandidate::new("candidate:2 1 udp 2122260223 192.0.2.2 54401"));
        let mic = Arc::new(SimStream::audio_only(format!("{peer}-mic")));
        mic.set_level(0.4);
        conn.emit_remote_track(mic);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_outbound(&stage)?;
    drain_events(&mut events);
    print_snapshot(&stage)?;

    println!("== mute, then hang up ==");
    stage.manager.toggle_mute().await;
    stage.manager.end_call().await?;
    print_outbound(&stage)?;
    drain_events(&mut events);
    print_snapshot(&stage)?;
    Ok(())
}

async fn run_group(room: &str, peers: usize) -> Result<()> {
    let stage = stage(false);
    let mut events = stage.manager.subscribe_events();

    println!("== starting group call in {room} ==");
    stage
        .manager
        .start_call(
            CallTarget::Group {
                chat_id: ChatId::new(room),
            },
            MediaKind::Audio,
        )
        .await?;
    print_outbound(&stage)?;

    for i in 0..peers {
        let name = format!("peer-{i}");
        println!("== {name} joins ==");
        stage
            .manager
            .handle_signaling(SignalingEvent::PeerJoined {
                peer_id: UserId::new(&name),
                peer_socket_id: PeerId::new(format!("{name}-sock")),
                peer_name: name.clone(),
                peer_avatar: None,
            })
            .await?;
        if let Some(conn) = stage.engine.connection(i) {
            let mic = Arc::new(SimStream::audio_only(format!("{name}-mic")));
            mic.set_level(if i == 0 { 0.6 } else { 0.0 });
            conn.emit_remote_track(mic);
        }
        print_outbound(&stage)?;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    drain_events(&mut events);

    let speakers = stage.manager.active_speakers().borrow().clone();
    println!("active speakers: {speakers:?}");
    print_snapshot(&stage)?;

    if peers > 0 {
        println!("== peer-0 leaves ==");
        stage
            .manager
            .handle_signaling(SignalingEvent::PeerLeft {
                peer_socket_id: PeerId::new("peer-0-sock"),
            })
            .await?;
        drain_events(&mut events);
        print_snapshot(&stage)?;
    }

    println!("== leaving the room ==");
    stage.manager.end_call().await?;
    print_outbound(&stage)?;
    drain_events(&mut events);
    print_snapshot(&stage)?;
    Ok(())
}

//! Mesh node binary entry point
//!
//! Joins one room on a signaling relay and keeps a full mesh of WebRTC
//! connections with every other participant in the call.
//!
//! # Usage
//!
//! ```bash
//! # Join room "pairing" and start a call right away
//! cargo run --bin mesh-node -- \
//!   --signaling-url ws://localhost:3001/signal \
//!   --room pairing
//!
//! # Listen only: answer invitations but never acquire media
//! cargo run --bin mesh-node -- --room pairing --no-media
//!
//! # Add a TURN relay and a config file
//! cargo run --bin mesh-node -- \
//!   --room pairing \
//!   --config ./mesh.toml \
//!   --turn-servers turn:relay.example.com:3478:user:secret
//! ```

use anyhow::Context;
use clap::Parser;
use coderoom_mesh::signaling::websocket::room_url;
use coderoom_mesh::{
    CallEvent, LocalMedia, MeshConfig, MeshDeps, PeerId, RoomCallCoordinator, StaticIceConfig,
    TurnServerConfig, WebSocketSignaling,
};
use coderoom_mesh::transport::WebRtcTransportFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Collaborative code room mesh node
///
/// Connects to the room's signaling relay and maintains one WebRTC
/// connection per call participant.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling relay URL
    #[arg(
        long,
        default_value = "ws://localhost:3001/signal",
        env = "MESH_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Room to join
    #[arg(long, env = "MESH_ROOM")]
    room: String,

    /// Participant ID (random UUID when omitted)
    #[arg(long, env = "MESH_PEER_ID")]
    peer_id: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "MESH_CONFIG")]
    config: Option<PathBuf>,

    /// STUN servers (comma-separated); replaces the configured list
    #[arg(long, value_delimiter = ',', env = "MESH_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "MESH_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Order VP9 first when negotiating video
    #[arg(long, default_value_t = false, env = "MESH_PREFER_VP9")]
    prefer_vp9: bool,

    /// Do not start a call on join; only answer invitations
    #[arg(long, default_value_t = false, env = "MESH_NO_MEDIA")]
    no_media: bool,
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

/// Build the mesh configuration: file (or defaults), then CLI overrides
fn build_config_from_args(args: &Args) -> anyhow::Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if !args.stun_servers.is_empty() {
        config = config.with_stun_servers(args.stun_servers.clone());
    }

    let turn_servers = args
        .turn_servers
        .iter()
        .map(|s| parse_turn_server(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse TURN server: {}", e))?;
    for turn in &turn_servers {
        info!("Adding TURN server: {} (user: {})", turn.url, turn.username);
    }

    let prefer_vp9 = config.prefer_vp9 || args.prefer_vp9;
    config = config
        .with_turn_servers(turn_servers)
        .with_prefer_vp9(prefer_vp9);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = build_config_from_args(&args)?;
    let local_id = PeerId::from(
        args.peer_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        peer_id = %local_id,
        room = %args.room,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        prefer_vp9 = config.prefer_vp9,
        "Mesh node starting"
    );

    let url = room_url(&args.signaling_url, &args.room, &local_id)?;
    let (signaling, inbound) = WebSocketSignaling::connect(&url).await?;

    let deps = MeshDeps {
        local_id,
        room_id: args.room.clone(),
        ice: Arc::new(StaticIceConfig::from_config(&config)),
        config,
        signaling: Arc::new(signaling),
        media: Arc::new(LocalMedia::new()),
        transports: Arc::new(WebRtcTransportFactory::new()?),
    };
    let (coordinator, handle, mut call_events) = RoomCallCoordinator::new(deps)?;
    let mesh = tokio::spawn(coordinator.run(inbound));

    if !args.no_media {
        handle.start_call()?;
    }

    loop {
        tokio::select! {
            event = call_events.recv() => match event {
                Some(CallEvent::IncomingCall { peer_id, user_name }) => {
                    info!(
                        "Incoming call from {} ({}); accepting",
                        peer_id,
                        user_name.as_deref().unwrap_or("unknown")
                    );
                    handle.accept_call(peer_id)?;
                }
                Some(CallEvent::StreamUpdated(stream)) => info!(
                    peer_id = %stream.peer_id,
                    kind = ?stream.kind,
                    audio = stream.has_audio(),
                    video = stream.has_video(),
                    "Remote stream updated"
                ),
                Some(CallEvent::StreamRemoved { peer_id, kind }) => {
                    info!(peer_id = %peer_id, kind = ?kind, "Remote stream removed")
                }
                Some(CallEvent::Notice(notice)) => warn!("{}", notice),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, leaving call");
                // Loop may already have stopped with the relay
                let _ = handle.leave_call();
                let _ = handle.shutdown();
                break;
            }
        }
    }

    mesh.await??;
    info!("Mesh node stopped");
    Ok(())
}

fn init_tracing() {
    // RUST_LOG overrides the default filter
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

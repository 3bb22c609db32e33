use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

mod config;
mod state;
mod store;
mod tcp;
mod udp;

use config::ServerConfig;
use state::ServerState;
use store::UserStore;

#[derive(Parser)]
#[command(name = "voicehub-server", about = "voicehub voice relay server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// TCP control port, overrides config
    #[arg(long)]
    control_port: Option<u16>,

    /// UDP voice port, overrides config
    #[arg(long)]
    voice_port: Option<u16>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Path to the user database, overrides config
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicehub_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str::<ServerConfig>(&content)?
    } else {
        ServerConfig::default()
    };

    // CLI overrides
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.voice_port {
        config.voice_port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    info!("voicehub server starting");
    info!(
        host = %config.host,
        control_port = config.control_port,
        voice_port = config.voice_port,
        db = %config.db_path,
    );

    let store = UserStore::open(Path::new(&config.db_path))?;
    let state = Arc::new(ServerState::new(store, config.voice_port));

    // Bind the control listener first; if the voice bind fails below,
    // the early return drops the listener before the process exits.
    let control_listener =
        TcpListener::bind(format!("{}:{}", config.host, config.control_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind control port {}:{}",
                    config.host, config.control_port
                )
            })?;
    info!(
        "control listener bound on {}:{}",
        config.host, config.control_port
    );

    // Voice socket with enlarged buffers to absorb datagram bursts.
    let voice_socket = {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create voice socket")?;
        let _ = sock.set_recv_buffer_size(1024 * 1024);
        let _ = sock.set_send_buffer_size(1024 * 1024);
        let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.voice_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid voice address {}:{}",
                    config.host, config.voice_port
                )
            })?;
        sock.bind(&addr.into()).with_context(|| {
            format!(
                "failed to bind voice port {}:{}",
                config.host, config.voice_port
            )
        })?;
        sock.set_nonblocking(true)
            .context("failed to set non-blocking")?;
        let std_sock: std::net::UdpSocket = sock.into();
        Arc::new(UdpSocket::from_std(std_sock).context("failed to wrap voice socket in tokio")?)
    };
    info!(
        "voice socket bound on {}:{}",
        config.host, config.voice_port
    );

    let udp_state = state.clone();
    let udp_sock = voice_socket.clone();
    tokio::spawn(async move {
        udp::run_voice_loop(udp_sock, udp_state).await;
    });

    info!("server ready, accepting connections");

    loop {
        let (stream, _) = match control_listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("control accept error: {}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            tcp::handle_connection(stream, state).await;
        });
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use voicecopilot_core::{config::AssistantConfig, routes, state::AppState};

/// Voice coding assistant core — dev control server.
///
/// Exposes a health check and a local WebSocket endpoint so a development
/// harness can exercise the session lifecycle without a real editor host.
/// Embedding hosts should use the library API (`ExtensionController`)
/// directly rather than this binary.
#[derive(Parser, Debug)]
#[command(name = "voicecopilot-core")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("loading configuration from {}", config_path.display());
        AssistantConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        AssistantConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    let address = config.address();
    let state = Arc::new(AppState::new(config));
    let app = routes::router(state);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("invalid server address '{}': {}", address, e))?;

    info!("dev control server listening on http://{socket_addr}");
    let listener = TcpListener::bind(&socket_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

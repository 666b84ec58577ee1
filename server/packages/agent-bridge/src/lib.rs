//! Bridges a coding-agent CLI's stream-json stdout into an ordered stream of
//! text deltas, tool-call lifecycle events, heartbeats and a final `done`.

use std::net::SocketAddr;

pub mod app;
pub mod blocks;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod heartbeat;
pub mod launch;
pub mod lifecycle;
pub mod process;
pub mod session;
pub mod wire;

pub use app::{build_router, AppState};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use launch::{PermissionMode, Role, StreamRequest, StreamSettings, Turn};
pub use process::{BridgeSession, BridgeStream, CancelHandle};
pub use wire::{OutwardChunk, Usage, WireFormat};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub bridge: BridgeConfig,
}

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState::new(config.bridge);
    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "agent-bridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    let cancelled = state.streams.cancel_all();
    tracing::info!(cancelled, "shutting down, cancelled active streams");
}

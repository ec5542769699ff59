mod supervisor;

use anyhow::Context;
use md_api::state::ApiState;
use md_dhcp::{DhcpConfig, DhcpServer, DhcpState, SharedDhcpState};
use signal_hook::consts::signal::SIGHUP;
use signal_hook_tokio::Signals;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use supervisor::{supervise, RestartPolicy};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "minidhcp.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,minidhcp=debug,md_dhcp=debug".into()),
        )
        .init();

    info!("Starting minidhcp...");

    let config_path = PathBuf::from(
        std::env::var("MINIDHCP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = DhcpConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let rest_port = config.rest_port;

    let state = DhcpState::from_config(config).context("failed to set up DHCP pools")?;
    for pool in state.store.pools() {
        info!(
            "  Pool {}: {}-{} ({}s)",
            pool.role,
            pool.start,
            pool.stop,
            pool.lease_time.as_secs()
        );
    }
    info!("  Leases: {} loaded from {}", state.store.len(), state.store.path().display());
    let dhcp_state: SharedDhcpState = Arc::new(RwLock::new(state));

    // ── DHCP server ────────────────────────────────────────────────────

    let server = DhcpServer::start(dhcp_state.clone())
        .await
        .context("failed to start DHCP server")?;

    // ── API server ─────────────────────────────────────────────────────

    let api_router = md_api::build_router(ApiState {
        dhcp: dhcp_state.clone(),
        config_path: config_path.clone(),
    });

    supervise("api", RestartPolicy::API, move || {
        let router = api_router.clone();
        async move {
            let addr: SocketAddr = format!("[::]:{}", rest_port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Admin API listening on {}", addr);
            axum::serve(listener, router).await?;
            Ok(())
        }
    });

    // ── SIGHUP handler ─────────────────────────────────────────────────

    {
        let dhcp_state = dhcp_state.clone();
        supervise("sighup", RestartPolicy::SIGNALS, move || {
            handle_sighup(config_path.clone(), dhcp_state.clone())
        });
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                info!("Shutting down...");
                shutdown.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signals: {}", e),
        }
    });

    info!("minidhcp started successfully");

    server.wait().await
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn handle_sighup(config_path: PathBuf, dhcp_state: SharedDhcpState) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading config...");
            if let Err(e) = reload(&config_path, &dhcp_state).await {
                error!("Failed to reload DHCP config: {:#}", e);
            }
        }
    }

    Ok(())
}

/// Re-read the config file and swap in pools built from it. Interface and
/// port changes need a restart.
async fn reload(config_path: &Path, dhcp_state: &SharedDhcpState) -> anyhow::Result<()> {
    let config = DhcpConfig::load(config_path)?;
    dhcp_state.write().await.reconfigure(config)?;
    info!("DHCP config reloaded");
    Ok(())
}

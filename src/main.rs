use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use giftcard_bridge::anycards::AnycardTaskHooks;
use giftcard_bridge::config::BridgeConfig;
use giftcard_bridge::store::{Database, LibSqlBackend};
use giftcard_bridge::supervisor::{RedeemAllSupervisor, spawn_redeem_all_loop};
use giftcard_bridge::tasks::DispatchQueue;
use giftcard_bridge::tasks::api::bridge_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BridgeConfig::from_env().context("Invalid bridge configuration")?;

    eprintln!("Gift-card bridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Task API: http://0.0.0.0:{}/api/tasks", config.port);
    eprintln!("   Task WS: ws://0.0.0.0:{}/ws/tasks", config.port);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Dispatch queue ───────────────────────────────────────────────────
    let hooks = Arc::new(AnycardTaskHooks::new(Arc::clone(&db)));
    let queue = DispatchQueue::with_hooks(Arc::clone(&db), hooks);

    // ── Redeem-all supervisor ────────────────────────────────────────────
    let supervisor = RedeemAllSupervisor::from_config(Arc::clone(&db), config.supervisor.clone());
    let (supervisor_handle, supervisor_shutdown) = spawn_redeem_all_loop(Arc::clone(&supervisor));
    eprintln!(
        "   Redeem-all: every {}s, launcher {}",
        supervisor.interval().as_secs(),
        if config.supervisor.browser_cmd.is_some() {
            "configured"
        } else {
            "not configured"
        }
    );

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = bridge_router(queue, supervisor, config.auth.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Bridge server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    supervisor_shutdown.store(true, Ordering::Relaxed);
    supervisor_handle.abort();
    tracing::info!("Bridge server stopped");
    Ok(())
}

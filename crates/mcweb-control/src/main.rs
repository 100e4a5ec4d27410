use std::{net::SocketAddr, sync::Arc};

use mcweb_control::{
    api,
    config::ControlConfig,
    identity::{self, IdentityMap},
    state::AppState,
};
use mcweb_core::Supervisor;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Bad configuration stops us before anything binds or spawns.
    let cfg = ControlConfig::from_env().inspect_err(|e| {
        tracing::error!(error = %e, "refusing to start");
    })?;
    let users = identity::load_user_ids(&cfg.user_ids)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "refusing to start"))?;
    tracing::info!(users = users.len(), "loaded allowed users");

    let identity = Arc::new(IdentityMap::load(users, cfg.datastore.clone()).await?);
    identity.clone().spawn_flusher();

    let supervisor = Arc::new(Supervisor::new(cfg.supervisor.clone()).await);
    let state = AppState {
        supervisor,
        identity: identity.clone(),
    };

    let app = api::router(state);
    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    tracing::info!(%addr, "mcweb-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    identity.flush().await?;
    Ok(())
}

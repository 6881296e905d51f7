use std::sync::Arc;

use anyhow::Context;

use tagtrail_api::app::{build_app, services::AppServices};
use tagtrail_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tagtrail_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(AppServices::from_config(&config).await?);

    let worker = services.reconciler.clone().spawn();
    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(services))
        .await
        .context("server error")?;

    worker.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal(services: Arc<AppServices>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    services.close_streams();
}

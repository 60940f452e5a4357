use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use tokenmill_api::app::{AppServices, build_app};
use tokenmill_infra::AppConfig;
use tokenmill_infra::jobs::HttpGenerationClient;
use tokenmill_observability::{LogConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let format = LogFormat::parse(&config.log_format)
        .ok_or_else(|| {
            anyhow!(
                "TOKENMILL_LOG_FORMAT must be json or pretty, got {:?}",
                config.log_format
            )
        })?;
    tokenmill_observability::init(&LogConfig {
        format,
        ..LogConfig::default()
    });

    if config.jwt_secret == AppConfig::default().jwt_secret {
        warn!("TOKENMILL_JWT_SECRET not set; using insecure dev default");
    }
    info!(config = ?config, "starting tokenmill");

    let services = Arc::new(AppServices::from_config(&config).await?);

    let generator =
        HttpGenerationClient::new(config.generator_url.clone(), config.generator_timeout)
        .context("failed to build generation client")?;
    let workers = services
        .worker_pool(Arc::new(generator))
        .spawn(config.worker_config());
    let reaper = services.reaper(config.reaper_config()).spawn();

    let app = build_app(services, &config.jwt_secret);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("http server stopped; draining workers");
    workers.shutdown().await;
    reaper.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

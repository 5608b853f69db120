use anyhow::Context;

use offerdesk_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    offerdesk_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });

    let (backends, relay) = offerdesk_api::app::services::build_backends(&config).await?;
    let (services, tasks) = offerdesk_api::app::services::start(&config, backends, relay);
    let app = offerdesk_api::app::build_app(jwt_secret, services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    tasks.shutdown().await;
    Ok(())
}

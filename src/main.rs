use dotenv::dotenv;
use std::sync::Arc;
use streamchat::auth::JwtAuthGate;
use streamchat::config::AppConfig;
use streamchat::upstream::HyperUpstream;
use streamchat::{web, AppState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    info!(
        "Proxying chat completions to {} (provider={}, model={})",
        config.upstream.base_url, config.upstream.provider_name, config.upstream.model
    );

    let auth_gate = Arc::new(JwtAuthGate::new(config.jwt_secret.as_bytes()));
    let upstream = Arc::new(HyperUpstream::new(
        config.upstream.clone(),
        config.request_timeout,
        config.stream_chunk_timeout,
    ));
    let app_state = Arc::new(AppState::new(
        auth_gate,
        upstream,
        config.upstream.model.clone(),
    ));

    let app = web::router(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    info!("Listening on {}", config.bind_address);
    axum::serve(listener, app).await?;

    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod app;
mod auth;
mod http;
mod ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neomagi_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path > NEOMAGI_CONFIG env > ~/.neomagi/neomagi.toml
    let config_path = std::env::var("NEOMAGI_CONFIG").ok();
    let config = neomagi_core::config::NeoMagiConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            neomagi_core::config::NeoMagiConfig::default()
        });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config));
    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("NeoMagi gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

use std::path::PathBuf;

use market_feed::api::create_router;
use market_feed::config::CONFIG_ENV;
use market_feed::transport::WsTransport;
use market_feed::{Channel, ConnectOptions, FeedConfig, FeedEngine};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = market_feed::SERVICE_VERSION, "Starting Market Feed service");

    let path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| "market-feed.json".to_string())
        .into();
    let config = FeedConfig::load(&path).inspect_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Failed to load config");
    })?;

    let (feed, link) = FeedEngine::spawn(config.clone())?;
    tokio::spawn(WsTransport::new(config.ranger_url.clone(), config.auth_token.clone()).run(link));

    for stream in &config.streams {
        let (market, channel) = Channel::parse_stream(stream)?;
        feed.subscribe(&market, [channel]).await?;
    }
    feed.connect(ConnectOptions {
        authenticated: config.auth_token.is_some(),
    })
    .await?;

    let app = create_router(feed.clone());
    let listener = TcpListener::bind(&config.listen_addr).await.inspect_err(|e| {
        tracing::error!(addr = %config.listen_addr, error = %e, "Failed to bind");
    })?;

    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    feed.shutdown().await?;
    tracing::info!("Market Feed service stopped");
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use book_stream::config::ServiceConfig;
use book_stream::ingestion::FeedIngestor;
use book_stream::server;
use book_stream::service::StreamService;
use book_stream::source::{run_poller, JsonRpcBookSource};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env().context("loading configuration")?;
    tracing::info!(
        version = book_stream::SERVICE_VERSION,
        bind = %config.bind,
        instruments = config.feed.instruments.len(),
        drop_policy = ?config.ws.drop_policy,
        "Starting book-stream service"
    );

    let service = Arc::new(StreamService::new(config.ws.clone()));

    match &config.feed.venue_url {
        Some(url) => {
            let ingestor = Arc::new(
                FeedIngestor::new(Arc::clone(&service))
                    .with_allow_list(config.feed.instruments.iter().cloned()),
            );
            let source = Arc::new(
                JsonRpcBookSource::new(url.clone(), config.feed.request_timeout)
                    .context("building venue HTTP client")?,
            );
            tracing::info!(venue = %url, "Polling venue order books");
            tokio::spawn(run_poller(
                source,
                ingestor,
                config.feed.instruments.clone(),
                config.feed.poll_interval,
            ));
        }
        None => tracing::warn!("No venue URL configured; cache stays empty until fed"),
    }

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    server::serve(listener, service).await?;

    Ok(())
}

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedwatch::bus::EventBus;
use feedwatch::cache::FeedCache;
use feedwatch::config::Config;
use feedwatch::dispatcher::Dispatcher;
use feedwatch::fetcher::Fetcher;
use feedwatch::pipeline::FeedPipeline;
use feedwatch::poller::{Poller, SeedList};
use feedwatch::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedwatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("FEEDWATCH_CONFIG").unwrap_or_else(|_| "feedwatch.toml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!(
        "Loaded configuration from {} ({} static feeds)",
        config_path,
        config.feeds.len()
    );

    // A cache that cannot be opened is fatal
    let cache = FeedCache::new(&config.cache_url).await?;
    cache.initialize().await?;
    info!("Feed cache initialized");

    let bus = EventBus::new();
    spawn_event_logger(&bus);

    let fetcher = Fetcher::new(config.fetch_timeout())?;
    let pipeline = FeedPipeline::new(cache.clone(), fetcher, bus.clone(), config.max_age());
    let poller = Poller::new(
        Dispatcher::new(Arc::new(pipeline)),
        SeedList {
            feeds: config.feeds.clone(),
            file: config.seed_file.clone(),
        },
        config.poll_frequency(),
        config.max_concurrency,
    );
    let poller = poller.spawn();

    let state = Arc::new(AppState {
        cache,
        poller: poller.control(),
    });
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Status endpoint on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(tokio::signal::ctrl_c()))
        .await?;

    poller.stop().await;
    Ok(())
}

/// Resolve once `signal` fires. If the handler cannot be installed the server
/// keeps running instead of shutting down on the spot.
async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Log every message published on the bus.
fn spawn_event_logger(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => info!(
                    topic = %message.topic,
                    title = %message.body.title,
                    link = %message.body.link,
                    "New entry"
                ),
                Err(RecvError::Lagged(missed)) => warn!("Event logger missed {} messages", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_triggers_shutdown() {
        let waited = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_shutdown(async { Ok(()) }),
        )
        .await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_signal_failure_keeps_serving() {
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            wait_for_shutdown(async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler"))
            }),
        )
        .await;
        assert!(waited.is_err());
    }
}

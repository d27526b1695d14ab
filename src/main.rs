use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use floorcast::config::AppConfig;
use floorcast::hub::EventBroadcaster;
use floorcast::relay::StreamRegistry;
use floorcast::server::{self, AppState};
use floorcast::source::FfmpegLauncher;
use floorcast::watch::{
    ListenWatcher, PgChangeFeed, PgLogTail, PollWatcher, WatchStrategy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    tracing::info!(max_connections = config.db_max_connections, "Database pool ready");

    let registry = Arc::new(StreamRegistry::with_config(
        Box::new(FfmpegLauncher::new(config.decoder.clone())),
        config.relay.clone(),
    ));
    let hub = Arc::new(EventBroadcaster::new());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    match config.strategy {
        WatchStrategy::Listen => {
            let tail = PgLogTail::new(pool.clone(), config.watch.clone())?;
            let watcher = ListenWatcher::new(Box::new(tail), config.watch.clone(), events_tx);
            tokio::spawn(watcher.run());
        }
        WatchStrategy::Poll => {
            let feed = PgChangeFeed::new(pool.clone(), config.watch.clone())?;
            let watcher = PollWatcher::new(Box::new(feed), config.watch.clone(), events_tx);
            tokio::spawn(watcher.run());
        }
    }
    tracing::info!(strategy = ?config.strategy, table = %config.watch.table, "Change watcher started");

    // Forward detected changes to the dashboard sockets
    let publisher_hub = hub.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            publisher_hub.publish(&event).await;
        }
    });

    // A bind failure is the one startup condition worth dying for
    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Relay server listening");
    server::serve(listener, AppState { registry, hub }).await?;

    Ok(())
}

//! Volume-surge bot entry point
//!
//! 1. Loads configuration and the streaming API key
//! 2. Restores persisted positions
//! 3. Opens the connection pool over the instrument universe
//! 4. Routes market data through the trading engine until Ctrl+C

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use surge_bot::adapters::coinbase::{ConnectionContext, ConnectionPool};
use surge_bot::adapters::shared::TlsWsConnector;
use surge_bot::adapters::{AuthTokenManager, Es256Signer, ExchangeClient, PaperExchangeClient};
use surge_bot::config::{self, logging};
use surge_bot::core::{
    dispatch_task, event_log_task, priority_task, spawn_store_writer, ChannelBundle, EventBus,
    JsonFileStore, MemoryStore, PositionManager, PositionStore, PriorityScheduler, SystemClock,
    TickerCache, TradingEngine, TradingStateController, VolumeSurgeDetector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenvy::dotenv().ok();
    logging::init_logging();

    info!("[ENGINE] Surge bot starting");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let config = config::load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        batch_size = config.ingestion.batch_size,
        capital = config.strategy.capital,
        auto_entry = config.entry.enabled,
        "[CONFIG] Loaded"
    );

    // Missing or malformed key material is fatal before anything connects
    let signer = Es256Signer::from_env(&config.auth).context("loading streaming API key")?;

    let channels = ChannelBundle::new(config.ingestion.event_channel_capacity);
    let cancel = channels.shutdown.clone();
    let clock = Arc::new(SystemClock);

    let auth = Arc::new(AuthTokenManager::new(Arc::new(signer), clock.clone(), &config.auth));
    auth.current_token().await.context("signing first streaming token")?;
    let refresh_handle = Arc::clone(&auth).spawn_refresh_task(cancel.child_token());

    let cache = Arc::new(TickerCache::new());
    let instrument_list: Vec<&str> = config.instruments.iter().map(String::as_str).collect();
    let client = Arc::new(PaperExchangeClient::new(cache.clone()).with_instruments(&instrument_list));
    warn!("[PAPER] Orders are simulated against the ticker cache");

    let universe: Vec<String> = if config.instruments.is_empty() {
        client
            .fetch_all_instruments()
            .await?
            .into_iter()
            .filter(|i| i.tradable)
            .map(|i| i.id)
            .collect()
    } else {
        config.instruments.clone()
    };
    if universe.is_empty() {
        anyhow::bail!("no instruments to monitor");
    }

    let positions = Arc::new(
        PositionManager::new(config.strategy.clone(), clock.clone())
            .with_archive_limit(config.store.archive_limit),
    );
    let state = Arc::new(TradingStateController::new(PriorityScheduler::new(
        channels.priority_tx.clone(),
    )));
    let bus = EventBus::default();
    let log_handle = tokio::spawn(event_log_task(bus.subscribe(), cancel.child_token()));

    let engine = Arc::new(TradingEngine::new(
        client,
        positions,
        state,
        cache.clone(),
        bus,
        config.entry.clone(),
    ));

    let store: Arc<dyn PositionStore> = match &config.store.path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let stored = store.load().await.context("loading stored positions")?;
    engine.restore(stored);
    let store_handle = spawn_store_writer(
        store,
        engine.store_updates(),
        &config.store,
        cancel.child_token(),
    );

    let ctx = ConnectionContext {
        config: Arc::new(config.ingestion.clone()),
        auth,
        cache,
        detector: Arc::new(VolumeSurgeDetector::new(&config.surge)),
        connector: Arc::new(TlsWsConnector),
        events: channels.market_tx.clone(),
    };
    let mut pool = ConnectionPool::new(ctx, cancel.child_token());
    let opened = pool.initialize(&universe, config.ingestion.batch_size).await;
    info!(instruments = universe.len(), connections = opened, "[POOL] Ingestion started");

    let health_handle = pool.spawn_health_task();
    let router_handle = tokio::spawn(priority_task(
        channels.priority_rx,
        pool.router(),
        cancel.child_token(),
    ));
    let dispatch_handle = tokio::spawn(dispatch_task(
        channels.market_rx,
        Arc::clone(&engine),
        cancel.child_token(),
    ));
    drop(channels.market_tx);

    match signal::ctrl_c().await {
        Ok(()) => info!("[SHUTDOWN] Graceful shutdown initiated"),
        Err(e) => error!(error = %e, "[SHUTDOWN] Failed to listen for Ctrl+C, shutting down"),
    }

    cancel.cancel();
    pool.shutdown().await;
    for (name, handle) in [
        ("health", health_handle),
        ("router", router_handle),
        ("refresh", refresh_handle),
        ("store", store_handle),
        ("event_log", log_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "[SHUTDOWN] Task ended abnormally");
        }
    }
    match dispatch_handle.await {
        Ok(stats) => info!(
            tickers = stats.tickers,
            exits = stats.exits_started,
            "[SHUTDOWN] Dispatcher drained"
        ),
        Err(e) => warn!(error = %e, "[SHUTDOWN] Dispatcher ended abnormally"),
    }

    info!(
        open_positions = engine.positions().open_count(),
        realized_pnl = engine.positions().realized_pnl(),
        "[SHUTDOWN] Clean exit"
    );
    Ok(())
}

//! End-to-end trading cycle over the in-memory streaming endpoint
//!
//! Frames pushed by a fake exchange session flow through the connection pool,
//! the ticker cache and the dispatcher into the engine, which trades against
//! the paper venue:
//! 1. Subscription handshake (liveness first, then market data)
//! 2. Entry and priority elevation of the held instrument
//! 3. Trailing exit after the minimum hold, then release
//! 4. Persistence of the closed position
//! 5. Surge-driven entry
//!
//! # Running the tests
//! ```bash
//! cargo test --test full_cycle
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use surge_bot::adapters::coinbase::{AuthError, ConnectionContext, ConnectionPool, TokenSigner};
use surge_bot::adapters::shared::{MemoryConnector, MemorySession};
use surge_bot::adapters::{AuthTokenManager, PaperExchangeClient};
use surge_bot::config::{
    AuthConfig, EntryPolicyConfig, IngestionConfig, StoreConfig, StrategyConfig, SurgeConfig,
};
use surge_bot::core::{
    dispatch_task, priority_task, spawn_store_writer, EngineEvent, EventBus, ExitReason,
    ManualClock, MemoryStore, PositionManager, PositionStatus, PriorityScheduler, SystemClock,
    TickerCache, TradingEngine, TradingState, TradingStateController, VolumeSurgeDetector,
};

const MIN: u64 = 60_000;
const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Harness
// =============================================================================

/// Signs opaque tokens; the memory endpoint never verifies them
#[derive(Debug, Default)]
struct StaticSigner;

impl TokenSigner for StaticSigner {
    fn sign(&self, issued_at_secs: u64, expires_at_secs: u64, nonce: &str) -> Result<String, AuthError> {
        Ok(format!("test-{}-{}-{}", issued_at_secs, expires_at_secs, nonce))
    }
}

struct Harness {
    engine: Arc<TradingEngine>,
    client: Arc<PaperExchangeClient>,
    cache: Arc<TickerCache>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    sessions: mpsc::UnboundedReceiver<MemorySession>,
    events: broadcast::Receiver<EngineEvent>,
    pool: ConnectionPool,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start(instruments: &[&str], entry: EntryPolicyConfig) -> Self {
        let cancel = CancellationToken::new();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = Arc::new(TickerCache::new());
        let client = Arc::new(PaperExchangeClient::new(cache.clone()));

        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (market_tx, market_rx) = mpsc::channel(1_024);

        let bus = EventBus::default();
        let events = bus.subscribe();
        let engine = Arc::new(TradingEngine::new(
            client.clone(),
            Arc::new(PositionManager::new(StrategyConfig::default(), clock.clone())),
            Arc::new(TradingStateController::new(PriorityScheduler::new(priority_tx))),
            cache.clone(),
            bus,
            entry,
        ));

        let store = Arc::new(MemoryStore::new());
        let store_config = StoreConfig {
            path: None,
            retry_attempts: 3,
            retry_delay_ms: 10,
            ..StoreConfig::default()
        };
        let store_handle = spawn_store_writer(
            store.clone(),
            engine.store_updates(),
            &store_config,
            cancel.child_token(),
        );

        let (connector, sessions) = MemoryConnector::new();
        let auth = Arc::new(AuthTokenManager::new(
            Arc::new(StaticSigner),
            Arc::new(SystemClock),
            &AuthConfig::default(),
        ));
        let ingestion = IngestionConfig {
            ws_url: "ws://memory".to_string(),
            subscribe_delay_ms: 5,
            connection_stagger_ms: 1,
            reconnect_jitter_ms: 0,
            ..IngestionConfig::default()
        };
        let ctx = ConnectionContext {
            config: Arc::new(ingestion),
            auth,
            cache: cache.clone(),
            detector: Arc::new(VolumeSurgeDetector::new(&SurgeConfig::default())),
            connector,
            events: market_tx,
        };

        let ids: Vec<String> = instruments.iter().map(|s| s.to_string()).collect();
        let mut pool = ConnectionPool::new(ctx, cancel.child_token());
        assert_eq!(pool.initialize(&ids, 50).await, 1);

        let router = tokio::spawn(priority_task(priority_rx, pool.router(), cancel.child_token()));
        let dispatch_engine = engine.clone();
        let dispatch_cancel = cancel.child_token();
        let dispatcher = tokio::spawn(async move {
            dispatch_task(market_rx, dispatch_engine, dispatch_cancel).await;
        });

        Self {
            engine,
            client,
            cache,
            clock,
            store,
            sessions,
            events,
            pool,
            cancel,
            tasks: vec![store_handle, router, dispatcher],
        }
    }

    async fn session(&mut self) -> MemorySession {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("connection dialed")
            .expect("connector alive")
    }

    /// Wait for the next engine event of interest, skipping ticker and health noise
    async fn next_event(&mut self) -> EngineEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(EngineEvent::Ticker(_)) | Ok(EngineEvent::ConnectionHealth(_)) => continue,
                    Ok(event) => return event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event bus closed: {}", e),
                }
            }
        })
        .await
        .expect("engine event")
    }

    async fn stop(mut self) {
        self.cancel.cancel();
        self.pool.shutdown().await;
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

async fn next_json(session: &mut MemorySession) -> Value {
    let text = tokio::time::timeout(WAIT, session.next_text())
        .await
        .expect("client frame in time")
        .expect("client frame");
    serde_json::from_str(&text).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}

fn ticker_frame(sequence: u64, id: &str, price: f64, bid: f64, high: f64) -> String {
    json!({
        "channel": "ticker_batch",
        "timestamp": "2024-05-01T12:00:00Z",
        "sequence_num": sequence,
        "events": [{
            "type": "update",
            "tickers": [{
                "type": "ticker",
                "product_id": id,
                "price": price.to_string(),
                "best_bid": bid.to_string(),
                "best_ask": price.to_string(),
                "high_24_h": high.to_string(),
                "low_24_h": (price * 0.8).to_string(),
                "volume_24_h": "1000000"
            }]
        }]
    })
    .to_string()
}

fn trades_frame(sequence: u64, id: &str, sizes: &[f64]) -> String {
    let trades: Vec<Value> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| {
            json!({
                "trade_id": format!("{}-{}", sequence, i),
                "product_id": id,
                "price": "0.085",
                "size": size.to_string(),
                "side": "BUY",
                "time": "2024-05-01T12:00:00Z"
            })
        })
        .collect();
    json!({
        "channel": "market_trades",
        "timestamp": "2024-05-01T12:00:00Z",
        "sequence_num": sequence,
        "events": [{"type": "update", "trades": trades}]
    })
    .to_string()
}

async fn expect_handshake(session: &mut MemorySession) {
    let channels: Vec<String> = [
        next_json(session).await,
        next_json(session).await,
        next_json(session).await,
    ]
    .iter()
    .map(|frame| {
        assert_eq!(frame["type"], "subscribe");
        assert!(frame["jwt"].as_str().unwrap().starts_with("test-"));
        frame["channel"].as_str().unwrap().to_string()
    })
    .collect();
    assert_eq!(channels, vec!["heartbeats", "ticker_batch", "market_trades"]);
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_entry_trailing_exit_and_persistence() {
    let mut h = Harness::start(&["DOGE-USD", "BTC-USD"], EntryPolicyConfig::default()).await;
    let mut session = h.session().await;
    expect_handshake(&mut session).await;

    session.send_text(ticker_frame(1, "DOGE-USD", 0.085, 0.085, 0.1));
    let cache = h.cache.clone();
    wait_until(|| cache.last_price("DOGE-USD") == Some(0.085)).await;

    let position = h.engine.enter("DOGE-USD", 10.0).await.unwrap();
    assert!((position.quantity - 117.647_058_82).abs() < 1e-8);
    assert!(matches!(h.next_event().await, EngineEvent::PositionOpened(_)));
    assert!(matches!(h.next_event().await, EngineEvent::TradingStateChanged(_)));
    assert_eq!(h.engine.trading_state().state(), TradingState::Active);

    // The held instrument gets the real-time channel on its own connection
    let elevate = next_json(&mut session).await;
    assert_eq!(elevate["type"], "subscribe");
    assert_eq!(elevate["channel"], "ticker");
    assert_eq!(elevate["product_ids"], json!(["DOGE-USD"]));

    session.send_text(ticker_frame(2, "DOGE-USD", 0.095, 0.095, 0.1));
    let engine = h.engine.clone();
    wait_until(|| {
        engine
            .positions()
            .get("DOGE-USD")
            .map(|p| p.peak_price == 0.095)
            .unwrap_or(false)
    })
    .await;

    // Below the trailing exit but still inside the minimum hold: nothing happens
    session.send_text(ticker_frame(3, "DOGE-USD", 0.0930, 0.0929, 0.1));
    session.send_text(ticker_frame(4, "DOGE-USD", 0.0931, 0.0930, 0.1));
    let cache = h.cache.clone();
    wait_until(|| cache.last_sequence("DOGE-USD") == Some(4)).await;
    assert!(h.engine.positions().has_open("DOGE-USD"));

    h.clock.advance_ms(6 * MIN);
    session.send_text(ticker_frame(5, "DOGE-USD", 0.092574, 0.093, 0.1));

    let (closed, pnl) = match h.next_event().await {
        EngineEvent::PositionClosed { position, pnl } => (position, pnl),
        other => panic!("expected close, got {:?}", other),
    };
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(pnl.reason, ExitReason::TrailingStop);
    assert_eq!(pnl.exit_price, 0.093);
    assert!((pnl.pnl_pct - 8.32).abs() < 0.05);
    assert!(matches!(h.next_event().await, EngineEvent::TradingStateChanged(_)));
    assert_eq!(h.engine.trading_state().state(), TradingState::Idle);

    let release = next_json(&mut session).await;
    assert_eq!(release["type"], "unsubscribe");
    assert_eq!(release["channel"], "ticker");
    assert_eq!(release["product_ids"], json!(["DOGE-USD"]));

    // Exactly one buy and one sell reached the venue
    assert_eq!(h.client.orders().len(), 2);

    let store = h.store.clone();
    wait_until(|| store.snapshot().closed.len() == 1).await;
    assert!(h.store.snapshot().open.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_volume_surge_opens_position_when_enabled() {
    let entry = EntryPolicyConfig {
        enabled: true,
        quote_amount: 10.0,
        ..EntryPolicyConfig::default()
    };
    let mut h = Harness::start(&["DOGE-USD"], entry).await;
    let mut session = h.session().await;
    expect_handshake(&mut session).await;

    // 15% below the 24h high
    session.send_text(ticker_frame(1, "DOGE-USD", 0.085, 0.085, 0.1));
    let cache = h.cache.clone();
    wait_until(|| cache.last_price("DOGE-USD").is_some()).await;

    session.send_text(trades_frame(2, "DOGE-USD", &[10.0]));
    session.send_text(trades_frame(3, "DOGE-USD", &[100.0]));

    match h.next_event().await {
        EngineEvent::VolumeSurge(alert) => {
            assert_eq!(alert.instrument_id, "DOGE-USD");
            assert!(alert.ratio > 3.0);
        }
        other => panic!("expected surge, got {:?}", other),
    }
    match h.next_event().await {
        EngineEvent::PositionOpened(position) => assert_eq!(position.instrument_id, "DOGE-USD"),
        other => panic!("expected entry, got {:?}", other),
    }
    assert_eq!(h.client.orders().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_surge_without_entry_policy_only_notifies() {
    let mut h = Harness::start(&["DOGE-USD"], EntryPolicyConfig::default()).await;
    let mut session = h.session().await;
    expect_handshake(&mut session).await;

    session.send_text(ticker_frame(1, "DOGE-USD", 0.085, 0.085, 0.1));
    session.send_text(trades_frame(2, "DOGE-USD", &[10.0]));
    session.send_text(trades_frame(3, "DOGE-USD", &[100.0]));

    assert!(matches!(h.next_event().await, EngineEvent::VolumeSurge(_)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.client.orders().is_empty());
    assert_eq!(h.engine.positions().open_count(), 0);

    h.stop().await;
}

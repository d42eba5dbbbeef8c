//! Runtime task loops
//!
//! - `dispatch_task`: consumes [`MarketEvent`]s from every connection and
//!   feeds the engine (tick evaluation, surge policy, health)
//! - `priority_task`: forwards [`PriorityCommand`]s from the trading state to
//!   the connection pool
//!
//! Both stop on the shared cancellation token.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::coinbase::PriorityRouter;

use super::channels::MarketEvent;
use super::engine::TradingEngine;
use super::events::EngineEvent;
use super::trading_state::PriorityCommand;

/// Counters reported when the dispatcher stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub tickers: u64,
    pub trades: u64,
    pub surges: u64,
    pub exits_started: u64,
}

/// Route market events to the engine until cancelled or every sender is gone.
///
/// Tick evaluation is synchronous; exit orders and surge entries run on
/// their own tasks so the dispatcher never waits on the exchange.
pub async fn dispatch_task(
    mut market_rx: mpsc::Receiver<MarketEvent>,
    engine: Arc<TradingEngine>,
    cancel: CancellationToken,
) -> DispatchStats {
    info!("[ENGINE] Dispatcher started");
    let mut stats = DispatchStats::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = market_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            MarketEvent::Ticker(snapshot) => {
                stats.tickers += 1;
                if engine.on_ticker(&snapshot).is_some() {
                    stats.exits_started += 1;
                }
                engine.bus().publish(EngineEvent::Ticker(snapshot));
            }
            MarketEvent::Trade(trade) => {
                stats.trades += 1;
                debug!(instrument = %trade.instrument_id, size = trade.size, "[ENGINE] Trade");
            }
            MarketEvent::Surge(alert) => {
                stats.surges += 1;
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.on_surge(alert).await;
                });
            }
            MarketEvent::Health(connection) => engine.on_health(connection),
        }
    }

    info!(
        tickers = stats.tickers,
        trades = stats.trades,
        surges = stats.surges,
        exits_started = stats.exits_started,
        "[ENGINE] Dispatcher stopped"
    );
    stats
}

/// Forward priority commands to the owning connections until cancelled.
pub async fn priority_task(
    mut priority_rx: mpsc::UnboundedReceiver<PriorityCommand>,
    router: PriorityRouter,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = priority_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let addressed = router.route(command.clone());
        debug!(command = ?command, connections = addressed, "[STATE] Priority command routed");
    }
    debug!("[STATE] Priority task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::paper::PaperExchangeClient;
    use crate::config::{EntryPolicyConfig, StrategyConfig};
    use crate::core::events::EventBus;
    use crate::core::position_manager::PositionManager;
    use crate::core::ticker_cache::TickerCache;
    use crate::core::trading_state::{PriorityScheduler, TradingStateController};
    use crate::core::types::{SystemClock, TickerSnapshot};

    fn engine() -> (Arc<TradingEngine>, Arc<TickerCache>) {
        let cache = Arc::new(TickerCache::new());
        let (priority_tx, _priority_rx) = mpsc::unbounded_channel();
        let engine = TradingEngine::new(
            Arc::new(PaperExchangeClient::new(cache.clone())),
            Arc::new(PositionManager::new(StrategyConfig::default(), Arc::new(SystemClock))),
            Arc::new(TradingStateController::new(PriorityScheduler::new(priority_tx))),
            cache.clone(),
            EventBus::default(),
            EntryPolicyConfig::default(),
        );
        (Arc::new(engine), cache)
    }

    fn snapshot(id: &str, price: f64, sequence: u64) -> TickerSnapshot {
        TickerSnapshot {
            instrument_id: id.to_string(),
            price,
            bid: price,
            ask: price,
            high_24h: price,
            low_24h: price,
            volume_24h: 1.0,
            sequence,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_dispatch_evaluates_ticks_and_stops_when_senders_drop() {
        let (engine, cache) = engine();
        cache.apply(snapshot("BTC-USD", 100.0, 1));
        engine.enter("BTC-USD", 10.0).await.unwrap();
        let mut bus_rx = engine.bus().subscribe();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(dispatch_task(rx, engine.clone(), CancellationToken::new()));

        tx.send(MarketEvent::Ticker(snapshot("BTC-USD", 101.0, 2))).await.unwrap();
        // Far below the stop loss
        tx.send(MarketEvent::Ticker(snapshot("BTC-USD", 80.0, 3))).await.unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.tickers, 2);
        assert_eq!(stats.exits_started, 1);
        assert!(matches!(bus_rx.recv().await.unwrap(), EngineEvent::Ticker(_)));
    }

    #[tokio::test]
    async fn test_dispatch_stops_on_cancel() {
        let (engine, _cache) = engine();
        let (_tx, rx) = mpsc::channel::<MarketEvent>(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_task(rx, engine, cancel.clone()));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), DispatchStats::default());
    }

    #[tokio::test]
    async fn test_priority_task_drains_until_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(priority_task(rx, PriorityRouter::default(), CancellationToken::new()));
        tx.send(PriorityCommand::Elevate(vec!["BTC-USD".to_string()])).unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}

//! One streaming connection serving a fixed batch of instruments.
//!
//! The task dials, subscribes, reads and reconnects until its cancellation
//! token fires. Per session:
//!
//! 1. the cache's sequence floor for the batch is reset (sequence numbers are
//!    scoped to a socket)
//! 2. subscribe frames go out one at a time from a paced queue, liveness
//!    channel first, while inbound frames keep being read
//! 3. an auth-rejection frame refreshes the token and re-queues the full
//!    subscription set on the same socket
//! 4. a rate-limit frame doubles the pacing (capped) and re-queues
//! 5. silence longer than `stale_after_secs` drops the session
//! 6. an undecodable message is counted and dropped, the session continues
//!
//! A dial that does not complete within `connect_timeout_secs` counts as a
//! failed attempt. Dropped sessions and failed dials go through exponential
//! backoff; a successful dial resets it.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::errors::ExchangeError;
use crate::adapters::shared::{Backoff, FrameSink, FrameStream, ReconnectConfig, WsConnector};
use crate::adapters::types::{ConnectionHealth, ConnectionState};
use crate::config::IngestionConfig;
use crate::core::channels::MarketEvent;
use crate::core::ticker_cache::{CacheUpdate, TickerCache};
use crate::core::volume::VolumeSurgeDetector;

use super::auth::AuthTokenManager;
use super::types::{parse_frame, InboundFrame, SubscribeFrame, SubscriptionAction};

/// Instruction from the pool to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Add the real-time channel for these instruments
    Elevate(Vec<String>),
    /// Remove the real-time channel for these instruments
    Release(Vec<String>),
    /// Re-send the whole subscription set
    Resubscribe,
}

/// Dependencies shared by every connection of a pool
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<IngestionConfig>,
    pub auth: Arc<AuthTokenManager>,
    pub cache: Arc<TickerCache>,
    pub detector: Arc<VolumeSurgeDetector>,
    pub connector: Arc<dyn WsConnector>,
    pub events: mpsc::Sender<MarketEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outbound {
    action: SubscriptionAction,
    channel: String,
    product_ids: Vec<String>,
}

impl Outbound {
    fn subscribe(channel: &str, product_ids: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            channel: channel.to_string(),
            product_ids,
        }
    }

    fn unsubscribe(channel: &str, product_ids: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            channel: channel.to_string(),
            product_ids,
        }
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(String),
    /// Nobody is consuming market events any more
    Downstream,
}

enum FrameOutcome {
    Continue,
    /// The exchange answered with an error frame
    Rejected(ExchangeError),
    DownstreamClosed,
}

pub struct Connection {
    id: usize,
    instruments: Vec<String>,
    ctx: ConnectionContext,
    health: Arc<ConnectionHealth>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    cancel: CancellationToken,
    elevated: BTreeSet<String>,
}

impl Connection {
    pub fn new(
        id: usize,
        instruments: Vec<String>,
        ctx: ConnectionContext,
        health: Arc<ConnectionHealth>,
        commands: mpsc::UnboundedReceiver<ConnectionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            instruments,
            ctx,
            health,
            commands,
            cancel,
            elevated: BTreeSet::new(),
        }
    }

    /// Connect/serve/reconnect until cancelled.
    pub async fn run(mut self) {
        let config = self.ctx.config.clone();
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let mut backoff = Backoff::new(ReconnectConfig {
            base_delay_ms: config.reconnect_base_ms,
            max_delay_ms: config.reconnect_max_ms,
            jitter_ms: config.reconnect_jitter_ms,
        });

        info!(
            connection_id = self.id,
            instruments = self.instruments.len(),
            "[POOL] Connection task started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let dial = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = timeout(connect_timeout, self.ctx.connector.connect(&config.ws_url)) => {
                    result.unwrap_or_else(|_| {
                        Err(ExchangeError::NetworkTimeout(connect_timeout.as_millis() as u64))
                    })
                }
            };

            match dial {
                Ok((sink, stream)) => {
                    backoff.reset();
                    self.health.reconnect_attempts.store(0, Ordering::Relaxed);
                    self.health.current_backoff_ms.store(0, Ordering::Relaxed);
                    self.health.set_state(ConnectionState::Connected);
                    self.ctx.cache.reset_sequences(&self.instruments);
                    self.publish_health();
                    info!(connection_id = self.id, "[POOL] Connected");

                    match self.run_session(sink, stream).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Downstream => {
                            warn!(connection_id = self.id, "[POOL] Event consumer gone, stopping");
                            break;
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(connection_id = self.id, reason = %reason, "[POOL] Session dropped");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        connection_id = self.id,
                        error = %e,
                        attempt = backoff.attempts() + 1,
                        "[POOL] Connect failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            self.health
                .reconnect_attempts
                .store(backoff.attempts() as u64, Ordering::Relaxed);
            self.health
                .current_backoff_ms
                .store(delay.as_millis() as u64, Ordering::Relaxed);
            self.health.set_state(ConnectionState::Reconnecting);
            self.publish_health();
            info!(
                connection_id = self.id,
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "[POOL] Reconnect scheduled"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.health.set_state(ConnectionState::Disconnected);
        self.publish_health();
        info!(connection_id = self.id, "[POOL] Connection task stopped");
    }

    async fn run_session(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
        let config = self.ctx.config.clone();
        let max_send_delay = Duration::from_millis(config.max_subscribe_delay_ms);
        let stale_after = Duration::from_secs(config.stale_after_secs);

        let mut outbound = self.subscription_plan();
        let mut send_delay = Duration::from_millis(config.subscribe_delay_ms);
        let mut next_send = Instant::now();
        let mut last_inbound = Instant::now();
        let mut last_sequence: Option<u64> = None;

        loop {
            let has_outbound = !outbound.is_empty();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Cancelled;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.apply_command(command, &mut outbound),
                        None => {
                            let _ = sink.close().await;
                            return SessionEnd::Cancelled;
                        }
                    }
                }

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(text)) => text,
                        Some(Err(ExchangeError::InvalidResponse(reason))) => {
                            last_inbound = Instant::now();
                            self.health.touch();
                            self.health.record_malformed();
                            warn!(connection_id = self.id, reason = %reason, "[POOL] Undecodable message dropped");
                            continue;
                        }
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        None => return SessionEnd::Dropped("stream ended".to_string()),
                    };
                    last_inbound = Instant::now();
                    self.health.touch();

                    match self.handle_frame(&text, &mut last_sequence).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Rejected(ExchangeError::AuthenticationFailed(_)) => {
                            if let Err(e) = self.ctx.auth.force_refresh().await {
                                warn!(connection_id = self.id, error = %e, "[AUTH] Refresh after rejection failed");
                            }
                            outbound = self.subscription_plan();
                            next_send = Instant::now();
                        }
                        FrameOutcome::Rejected(ExchangeError::RateLimited(_)) => {
                            send_delay = (send_delay * 2)
                                .max(Duration::from_millis(1))
                                .min(max_send_delay);
                            outbound = self.subscription_plan();
                            next_send = Instant::now() + send_delay;
                            warn!(
                                connection_id = self.id,
                                send_delay_ms = send_delay.as_millis() as u64,
                                "[POOL] Rate limited, subscribe pacing increased"
                            );
                        }
                        FrameOutcome::Rejected(_) => {}
                        FrameOutcome::DownstreamClosed => return SessionEnd::Downstream,
                    }
                }

                _ = sleep_until(next_send), if has_outbound => {
                    if let Some(item) = outbound.pop_front() {
                        match self.ctx.auth.current_token().await {
                            Ok(token) => {
                                let frame = SubscribeFrame {
                                    action: item.action,
                                    channel: &item.channel,
                                    product_ids: &item.product_ids,
                                    jwt: &token.value,
                                };
                                match frame.to_json() {
                                    Ok(text) => {
                                        if let Err(e) = sink.send(text).await {
                                            return SessionEnd::Dropped(e.to_string());
                                        }
                                        debug!(
                                            connection_id = self.id,
                                            channel = %item.channel,
                                            action = ?item.action,
                                            products = item.product_ids.len(),
                                            "[POOL] Subscription frame sent"
                                        );
                                    }
                                    Err(e) => {
                                        warn!(connection_id = self.id, error = %e, "[POOL] Frame encoding failed");
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(connection_id = self.id, error = %e, "[AUTH] No token, subscription deferred");
                                outbound.push_front(item);
                            }
                        }
                        next_send = Instant::now() + send_delay;
                    }
                }

                _ = sleep_until(last_inbound + stale_after) => {
                    return SessionEnd::Dropped(format!(
                        "no inbound frame for {}s",
                        stale_after.as_secs()
                    ));
                }
            }
        }
    }

    async fn handle_frame(&mut self, text: &str, last_sequence: &mut Option<u64>) -> FrameOutcome {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.health.record_malformed();
                warn!(connection_id = self.id, error = %e, "[POOL] Malformed frame dropped");
                return FrameOutcome::Continue;
            }
        };

        if let Some(sequence) = frame.sequence() {
            match *last_sequence {
                Some(last) if sequence > last + 1 => {
                    self.health.record_gap();
                    warn!(
                        connection_id = self.id,
                        expected = last + 1,
                        received = sequence,
                        "[POOL] Sequence gap"
                    );
                }
                Some(last) if sequence <= last => {
                    debug!(connection_id = self.id, last, received = sequence, "[POOL] Stale frame");
                }
                _ => {}
            }
            *last_sequence = Some(last_sequence.map_or(sequence, |last| last.max(sequence)));
        }

        match frame {
            InboundFrame::Tickers {
                snapshots, rejected, ..
            } => {
                if rejected > 0 {
                    self.health
                        .malformed_messages
                        .fetch_add(rejected as u64, Ordering::Relaxed);
                    debug!(connection_id = self.id, rejected, "[POOL] Invalid tickers dropped");
                }
                for snapshot in snapshots {
                    match self.ctx.cache.apply(snapshot.clone()) {
                        CacheUpdate::Accepted { .. } => {
                            if self.emit(MarketEvent::Ticker(snapshot)).await.is_err() {
                                return FrameOutcome::DownstreamClosed;
                            }
                        }
                        CacheUpdate::Rejected { last_sequence } => {
                            debug!(
                                instrument = %snapshot.instrument_id,
                                sequence = snapshot.sequence,
                                last_sequence,
                                "[POOL] Out-of-order ticker dropped"
                            );
                        }
                    }
                }
            }
            InboundFrame::Trades { trades, rejected, .. } => {
                if rejected > 0 {
                    self.health
                        .malformed_messages
                        .fetch_add(rejected as u64, Ordering::Relaxed);
                }
                for trade in trades {
                    let alert =
                        self.ctx
                            .detector
                            .on_trade(&trade.instrument_id, trade.size, trade.timestamp_ms);
                    if self.emit(MarketEvent::Trade(trade)).await.is_err() {
                        return FrameOutcome::DownstreamClosed;
                    }
                    if let Some(alert) = alert {
                        if self.emit(MarketEvent::Surge(alert)).await.is_err() {
                            return FrameOutcome::DownstreamClosed;
                        }
                    }
                }
            }
            InboundFrame::Heartbeat { counter, .. } => {
                debug!(connection_id = self.id, counter, "[POOL] Heartbeat");
            }
            InboundFrame::Subscriptions { channels, .. } => {
                debug!(connection_id = self.id, channels = ?channels.keys().collect::<Vec<_>>(), "[POOL] Subscriptions confirmed");
            }
            InboundFrame::Error { kind, message } => {
                let error = kind.into_error(message);
                warn!(connection_id = self.id, error = %error, "[POOL] Exchange error frame");
                return FrameOutcome::Rejected(error);
            }
        }

        FrameOutcome::Continue
    }

    fn apply_command(&mut self, command: ConnectionCommand, outbound: &mut VecDeque<Outbound>) {
        let channel = self.ctx.config.priority_channel.clone();
        match command {
            ConnectionCommand::Elevate(ids) => {
                let fresh: Vec<String> = ids
                    .into_iter()
                    .filter(|id| self.instruments.contains(id) && self.elevated.insert(id.clone()))
                    .collect();
                if !fresh.is_empty() {
                    info!(connection_id = self.id, instruments = ?fresh, "[POOL] Elevating");
                    outbound.push_back(Outbound::subscribe(&channel, fresh));
                }
            }
            ConnectionCommand::Release(ids) => {
                let released: Vec<String> = ids
                    .into_iter()
                    .filter(|id| self.elevated.remove(id))
                    .collect();
                if !released.is_empty() {
                    info!(connection_id = self.id, instruments = ?released, "[POOL] Releasing");
                    outbound.push_back(Outbound::unsubscribe(&channel, released));
                }
            }
            ConnectionCommand::Resubscribe => {
                *outbound = self.subscription_plan();
            }
        }
        self.health
            .elevated_count
            .store(self.elevated.len() as u64, Ordering::Relaxed);
    }

    /// Liveness channel first, then market data for the batch, then the
    /// real-time channel for elevated instruments.
    fn subscription_plan(&self) -> VecDeque<Outbound> {
        let config = &self.ctx.config;
        let mut plan = VecDeque::new();
        plan.push_back(Outbound::subscribe(&config.heartbeat_channel, Vec::new()));
        plan.push_back(Outbound::subscribe(&config.ticker_channel, self.instruments.clone()));
        plan.push_back(Outbound::subscribe(&config.trades_channel, self.instruments.clone()));
        if !self.elevated.is_empty() {
            plan.push_back(Outbound::subscribe(
                &config.priority_channel,
                self.elevated.iter().cloned().collect(),
            ));
        }
        plan
    }

    async fn emit(&self, event: MarketEvent) -> Result<(), ()> {
        self.ctx.events.send(event).await.map_err(|_| ())
    }

    fn publish_health(&self) {
        let stats = self.health.snapshot(self.id, self.instruments.len());
        let _ = self.ctx.events.try_send(MarketEvent::Health(stats));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::coinbase::auth::CountingSigner;
    use crate::adapters::shared::{MemoryConnector, MemorySession};
    use crate::config::{AuthConfig, SurgeConfig};
    use crate::core::types::SystemClock;
    use serde_json::{json, Value};
    use tokio::task::JoinHandle;

    pub(crate) fn test_ingestion_config() -> IngestionConfig {
        IngestionConfig {
            ws_url: "ws://memory".to_string(),
            subscribe_delay_ms: 10,
            max_subscribe_delay_ms: 1_000,
            connection_stagger_ms: 5,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_ms: 0,
            stale_after_secs: 300,
            ..IngestionConfig::default()
        }
    }

    pub(crate) fn test_context(
        config: IngestionConfig,
    ) -> (
        ConnectionContext,
        Arc<MemoryConnector>,
        mpsc::UnboundedReceiver<MemorySession>,
        mpsc::Receiver<MarketEvent>,
        Arc<CountingSigner>,
    ) {
        let (connector, sessions) = MemoryConnector::new();
        let signer = Arc::new(CountingSigner::default());
        let auth = Arc::new(AuthTokenManager::new(
            signer.clone(),
            Arc::new(SystemClock),
            &AuthConfig::default(),
        ));
        let (events_tx, events_rx) = mpsc::channel(1_024);
        let ctx = ConnectionContext {
            config: Arc::new(config),
            auth,
            cache: Arc::new(TickerCache::new()),
            detector: Arc::new(VolumeSurgeDetector::new(&SurgeConfig::default())),
            connector: connector.clone(),
            events: events_tx,
        };
        (ctx, connector, sessions, events_rx, signer)
    }

    pub(crate) fn ticker_frame(sequence: u64, tickers: &[(&str, f64)]) -> String {
        let tickers: Vec<Value> = tickers
            .iter()
            .map(|(id, price)| {
                json!({
                    "type": "ticker",
                    "product_id": id,
                    "price": price.to_string(),
                    "best_bid": price.to_string(),
                    "best_ask": price.to_string(),
                    "high_24_h": (price * 1.2).to_string(),
                    "low_24_h": (price * 0.8).to_string(),
                    "volume_24_h": "1000"
                })
            })
            .collect();
        json!({
            "channel": "ticker_batch",
            "timestamp": "2024-05-01T12:00:00Z",
            "sequence_num": sequence,
            "events": [{"type": "update", "tickers": tickers}]
        })
        .to_string()
    }

    pub(crate) fn trades_frame(sequence: u64, id: &str, sizes: &[f64]) -> String {
        let trades: Vec<Value> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                json!({
                    "trade_id": i.to_string(),
                    "product_id": id,
                    "price": "1.0",
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

    /// Next non-health event
    pub(crate) async fn next_market(rx: &mut mpsc::Receiver<MarketEvent>) -> MarketEvent {
        loop {
            match rx.recv().await {
                Some(MarketEvent::Health(_)) => continue,
                Some(event) => return event,
                None => panic!("event channel closed"),
            }
        }
    }

    pub(crate) async fn next_json(session: &mut MemorySession) -> Value {
        let text = session.next_text().await.expect("client frame");
        serde_json::from_str(&text).unwrap()
    }

    struct Harness {
        sessions: mpsc::UnboundedReceiver<MemorySession>,
        events: mpsc::Receiver<MarketEvent>,
        commands: mpsc::UnboundedSender<ConnectionCommand>,
        cancel: CancellationToken,
        health: Arc<ConnectionHealth>,
        cache: Arc<TickerCache>,
        signer: Arc<CountingSigner>,
        handle: JoinHandle<()>,
    }

    fn spawn(instruments: &[&str], config: IngestionConfig) -> Harness {
        let (ctx, _connector, sessions, events, signer) = test_context(config);
        let cache = ctx.cache.clone();
        let health = ConnectionHealth::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let connection = Connection::new(
            0,
            instruments.iter().map(|s| s.to_string()).collect(),
            ctx,
            health.clone(),
            commands_rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(connection.run());
        Harness {
            sessions,
            events,
            commands,
            cancel,
            health,
            cache,
            signer,
            handle,
        }
    }

    /// Read the three initial subscribe frames
    async fn drain_plan(session: &mut MemorySession) -> Vec<Value> {
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(next_json(session).await);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_first_then_paced_market_data() {
        let mut h = spawn(&["BTC-USD", "ETH-USD"], test_ingestion_config());
        let mut session = h.sessions.recv().await.unwrap();

        let start = Instant::now();
        let hb = next_json(&mut session).await;
        assert_eq!(hb["type"], "subscribe");
        assert_eq!(hb["channel"], "heartbeats");
        assert!(hb["jwt"].as_str().unwrap().starts_with("token-"));

        let ticker = next_json(&mut session).await;
        let after_ticker = Instant::now();
        assert_eq!(ticker["channel"], "ticker_batch");
        assert_eq!(ticker["product_ids"], json!(["BTC-USD", "ETH-USD"]));

        let trades = next_json(&mut session).await;
        assert_eq!(trades["channel"], "market_trades");
        assert!(Instant::now() - after_ticker >= Duration::from_millis(10));
        assert!(after_ticker - start >= Duration::from_millis(10));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tickers_update_cache_and_duplicates_are_dropped() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let session = h.sessions.recv().await.unwrap();

        session.send_text(ticker_frame(1, &[("BTC-USD", 100.0)]));
        match next_market(&mut h.events).await {
            MarketEvent::Ticker(s) => assert_eq!(s.price, 100.0),
            other => panic!("unexpected {:?}", other),
        }

        // Duplicate sequence: dropped. Gap 1 -> 5: counted, processed.
        session.send_text(ticker_frame(1, &[("BTC-USD", 999.0)]));
        session.send_text(ticker_frame(5, &[("BTC-USD", 101.0)]));
        match next_market(&mut h.events).await {
            MarketEvent::Ticker(s) => assert_eq!(s.price, 101.0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.cache.last_price("BTC-USD"), Some(101.0));
        assert_eq!(h.health.sequence_gaps.load(Ordering::Relaxed), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_does_not_end_session() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let session = h.sessions.recv().await.unwrap();

        session.send_text("{garbage");
        session.send_text(r#"{"channel":"level2","sequence_num":1,"events":[]}"#);
        session.send_text(ticker_frame(2, &[("BTC-USD", 50.0)]));

        assert!(matches!(next_market(&mut h.events).await, MarketEvent::Ticker(_)));
        assert_eq!(h.health.malformed_messages.load(Ordering::Relaxed), 2);
        assert!(h.sessions.try_recv().is_err());

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_message_is_dropped_not_reconnected() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let session = h.sessions.recv().await.unwrap();

        session.send_undecodable("non-UTF8 frame");
        session.send_text(ticker_frame(1, &[("BTC-USD", 42.0)]));

        match next_market(&mut h.events).await {
            MarketEvent::Ticker(s) => assert_eq!(s.price, 42.0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.health.malformed_messages.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.sessions.try_recv().is_err(), "no reconnect expected");
        assert!(!session.is_client_closed());
        assert_eq!(h.health.state(), ConnectionState::Connected);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_dial_times_out_into_backoff() {
        let mut config = test_ingestion_config();
        config.connect_timeout_secs = 2;
        let (ctx, connector, mut sessions, _events, _signer) = test_context(config);
        connector.set_stall(true);
        let health = ConnectionHealth::new();
        let (_commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let connection = Connection::new(
            0,
            vec!["BTC-USD".to_string()],
            ctx,
            health.clone(),
            commands_rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(connection.run());

        // 2s timeout, then the 1s base backoff before the second dial
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let attempts = connector.attempt_times();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(3));
        assert_eq!(health.state(), ConnectionState::Reconnecting);
        assert_eq!(health.reconnect_attempts.load(Ordering::Relaxed), 1);

        connector.set_stall(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sessions.try_recv().is_ok());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_frame_keeps_session() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let mut session = h.sessions.recv().await.unwrap();
        drain_plan(&mut session).await;

        session.send_text(r#"{"type":"error","message":"unknown product"}"#);
        session.send_text(ticker_frame(1, &[("BTC-USD", 7.0)]));
        assert!(matches!(next_market(&mut h.events).await, MarketEvent::Ticker(_)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(session.try_next_text().is_none(), "no resubscribe expected");
        assert!(h.sessions.try_recv().is_err());

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_refreshes_and_resubscribes_same_socket() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let mut session = h.sessions.recv().await.unwrap();
        let first = drain_plan(&mut session).await;
        let calls_before = h.signer.calls.load(Ordering::SeqCst);

        session.send_text(r#"{"type":"error","message":"authentication failure"}"#);
        let again = drain_plan(&mut session).await;

        assert_eq!(again[0]["channel"], "heartbeats");
        assert_eq!(again[1]["channel"], "ticker_batch");
        assert_ne!(again[0]["jwt"], first[0]["jwt"]);
        assert!(h.signer.calls.load(Ordering::SeqCst) > calls_before);
        assert!(h.sessions.try_recv().is_err(), "no reconnect expected");

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_slows_pacing_and_keeps_all_batches() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let mut session = h.sessions.recv().await.unwrap();
        drain_plan(&mut session).await;

        session.send_text(r#"{"type":"error","message":"rate limit exceeded"}"#);
        let t0 = Instant::now();
        let frames = drain_plan(&mut session).await;
        let channels: Vec<&str> = frames.iter().map(|f| f["channel"].as_str().unwrap()).collect();
        assert_eq!(channels, vec!["heartbeats", "ticker_batch", "market_trades"]);
        // Doubled 10ms pacing before each of the three frames
        assert!(Instant::now() - t0 >= Duration::from_millis(60));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_elevate_and_release_only_own_instruments() {
        let mut h = spawn(&["BTC-USD", "ETH-USD"], test_ingestion_config());
        let mut session = h.sessions.recv().await.unwrap();
        drain_plan(&mut session).await;

        h.commands
            .send(ConnectionCommand::Elevate(vec!["ETH-USD".to_string(), "SOL-USD".to_string()]))
            .unwrap();
        let frame = next_json(&mut session).await;
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["channel"], "ticker");
        assert_eq!(frame["product_ids"], json!(["ETH-USD"]));
        assert_eq!(h.health.elevated_count.load(Ordering::Relaxed), 1);

        h.commands
            .send(ConnectionCommand::Release(vec!["ETH-USD".to_string()]))
            .unwrap();
        let frame = next_json(&mut session).await;
        assert_eq!(frame["type"], "unsubscribe");
        assert_eq!(frame["product_ids"], json!(["ETH-USD"]));
        assert_eq!(h.health.elevated_count.load(Ordering::Relaxed), 0);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_sequence_floor_and_keeps_elevation() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let mut session = h.sessions.recv().await.unwrap();
        drain_plan(&mut session).await;
        h.commands
            .send(ConnectionCommand::Elevate(vec!["BTC-USD".to_string()]))
            .unwrap();
        next_json(&mut session).await;

        session.send_text(ticker_frame(100, &[("BTC-USD", 10.0)]));
        next_market(&mut h.events).await;
        session.close();

        let mut session = h.sessions.recv().await.unwrap();
        let frames: Vec<Value> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(next_json(&mut session).await);
            }
            v
        };
        assert_eq!(frames[3]["channel"], "ticker");

        session.send_text(ticker_frame(1, &[("BTC-USD", 11.0)]));
        match next_market(&mut h.events).await {
            MarketEvent::Ticker(s) => assert_eq!(s.sequence, 1),
            other => panic!("unexpected {:?}", other),
        }

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_torn_down() {
        let mut config = test_ingestion_config();
        config.stale_after_secs = 5;
        let mut h = spawn(&["BTC-USD"], config);
        let first = h.sessions.recv().await.unwrap();

        let t0 = Instant::now();
        let _second = h.sessions.recv().await.unwrap();
        // 5s silence + 1s backoff
        assert!(Instant::now() - t0 >= Duration::from_secs(6));
        assert!(first.is_client_closed());

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trades_feed_detector_and_emit_surge() {
        let mut h = spawn(&["DOGE-USD"], test_ingestion_config());
        let session = h.sessions.recv().await.unwrap();

        session.send_text(trades_frame(1, "DOGE-USD", &[10.0]));
        session.send_text(trades_frame(2, "DOGE-USD", &[100.0]));

        let mut saw_surge = false;
        for _ in 0..3 {
            if let MarketEvent::Surge(alert) = next_market(&mut h.events).await {
                assert_eq!(alert.instrument_id, "DOGE-USD");
                assert!(alert.ratio > 3.0);
                saw_surge = true;
            }
        }
        assert!(saw_surge);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_socket_and_reports_disconnected() {
        let mut h = spawn(&["BTC-USD"], test_ingestion_config());
        let session = h.sessions.recv().await.unwrap();
        h.cancel.cancel();
        h.handle.await.unwrap();
        assert!(session.is_client_closed());
        assert_eq!(h.health.state(), ConnectionState::Disconnected);
    }
}

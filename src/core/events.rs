//! Engine event surface
//!
//! Everything notification and persistence collaborators consume flows through
//! one typed [`EngineEvent`] enum published on an [`EventBus`] (tokio
//! broadcast). A slow subscriber lags and loses old events; it never blocks
//! the publisher.
//!
//! # Event Types
//!
//! - **Ticker**: snapshot accepted by the cache (debug level only)
//! - **VolumeSurge**: window volume crossed the surge threshold
//! - **PositionOpened** / **PositionClosed**: lifecycle with full P&L on close
//! - **PositionUpdated**: mode change (hibernate/resume) or restore
//! - **ExitFailed**: exit order rejected or unfilled; automation re-armed
//! - **ConnectionHealth**: per-connection stats
//! - **TradingStateChanged**: IDLE / ACTIVE / MULTI_ACTIVE transitions

use std::fmt;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::types::{ConnectionState, ConnectionStats};

use super::position::{PnlBreakdown, Position};
use super::trading_state::StateTransition;
use super::types::TickerSnapshot;
use super::volume::SurgeAlert;

/// Default broadcast buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// Event kind, used as the `event_type` log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEventType {
    Ticker,
    VolumeSurge,
    PositionOpened,
    PositionUpdated,
    PositionClosed,
    ExitFailed,
    ConnectionHealth,
    TradingStateChanged,
}

impl fmt::Display for EngineEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEventType::Ticker => write!(f, "TICKER"),
            EngineEventType::VolumeSurge => write!(f, "VOLUME_SURGE"),
            EngineEventType::PositionOpened => write!(f, "POSITION_OPENED"),
            EngineEventType::PositionUpdated => write!(f, "POSITION_UPDATED"),
            EngineEventType::PositionClosed => write!(f, "POSITION_CLOSED"),
            EngineEventType::ExitFailed => write!(f, "EXIT_FAILED"),
            EngineEventType::ConnectionHealth => write!(f, "CONNECTION_HEALTH"),
            EngineEventType::TradingStateChanged => write!(f, "TRADING_STATE_CHANGED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Ticker(TickerSnapshot),
    VolumeSurge(SurgeAlert),
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed { position: Position, pnl: PnlBreakdown },
    ExitFailed { instrument_id: String, reason: String },
    ConnectionHealth(ConnectionStats),
    TradingStateChanged(StateTransition),
}

impl EngineEvent {
    pub fn event_type(&self) -> EngineEventType {
        match self {
            EngineEvent::Ticker(_) => EngineEventType::Ticker,
            EngineEvent::VolumeSurge(_) => EngineEventType::VolumeSurge,
            EngineEvent::PositionOpened(_) => EngineEventType::PositionOpened,
            EngineEvent::PositionUpdated(_) => EngineEventType::PositionUpdated,
            EngineEvent::PositionClosed { .. } => EngineEventType::PositionClosed,
            EngineEvent::ExitFailed { .. } => EngineEventType::ExitFailed,
            EngineEvent::ConnectionHealth(_) => EngineEventType::ConnectionHealth,
            EngineEvent::TradingStateChanged(_) => EngineEventType::TradingStateChanged,
        }
    }

    /// True for events that change what should be persisted
    pub fn touches_positions(&self) -> bool {
        matches!(
            self,
            EngineEvent::PositionOpened(_)
                | EngineEvent::PositionUpdated(_)
                | EngineEvent::PositionClosed { .. }
        )
    }
}

/// Fan-out of engine events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Log an engine event using structured tracing fields
///
/// Tickers and healthy connection reports go to DEBUG, everything else to INFO
/// (WARN for failed exits and unhealthy connections).
pub fn log_event(event: &EngineEvent) {
    let event_type = event.event_type().to_string();

    match event {
        EngineEvent::Ticker(s) => {
            debug!(
                event_type = %event_type,
                instrument = %s.instrument_id,
                price = s.price,
                sequence = s.sequence,
                ""
            );
        }
        EngineEvent::VolumeSurge(alert) => {
            info!(
                event_type = %event_type,
                instrument = %alert.instrument_id,
                window_volume = alert.window_volume,
                historical_average = alert.historical_average,
                ratio = %format!("{:.2}", alert.ratio),
                threshold = alert.threshold,
                "[SURGE] Volume surge"
            );
        }
        EngineEvent::PositionOpened(p) => {
            info!(
                event_type = %event_type,
                instrument = %p.instrument_id,
                position_id = %p.id,
                entry_price = p.entry_price,
                quantity = p.quantity,
                cost_basis = p.cost_basis,
                min_exit = p.min_exit_price,
                stop_loss = p.stop_loss_price,
                "[POSITION] Opened"
            );
        }
        EngineEvent::PositionUpdated(p) => {
            info!(
                event_type = %event_type,
                instrument = %p.instrument_id,
                mode = p.mode.name(),
                peak = p.peak_price,
                trailing_exit = p.trailing_exit_price,
                "[POSITION] Updated"
            );
        }
        EngineEvent::PositionClosed { position, pnl } => {
            info!(
                event_type = %event_type,
                instrument = %position.instrument_id,
                position_id = %position.id,
                reason = %pnl.reason,
                entry_price = position.entry_price,
                exit_price = pnl.exit_price,
                net_proceeds = pnl.net_proceeds,
                realized_pnl = pnl.realized_pnl,
                pnl_pct = %format!("{:.2}%", pnl.pnl_pct),
                hold_secs = pnl.hold_ms / 1_000,
                "[POSITION] Closed"
            );
        }
        EngineEvent::ExitFailed { instrument_id, reason } => {
            warn!(
                event_type = %event_type,
                instrument = %instrument_id,
                reason = %reason,
                "[POSITION] Exit failed"
            );
        }
        EngineEvent::ConnectionHealth(stats) => {
            if stats.state == ConnectionState::Connected {
                debug!(
                    event_type = %event_type,
                    connection_id = stats.connection_id,
                    messages = stats.messages_received,
                    gaps = stats.sequence_gaps,
                    malformed = stats.malformed_messages,
                    ""
                );
            } else {
                warn!(
                    event_type = %event_type,
                    connection_id = stats.connection_id,
                    state = ?stats.state,
                    reconnect_attempts = stats.reconnect_attempts,
                    backoff_ms = stats.current_backoff_ms,
                    "[POOL] Connection unhealthy"
                );
            }
        }
        EngineEvent::TradingStateChanged(t) => {
            info!(
                event_type = %event_type,
                previous = %t.previous,
                current = %t.current,
                open = ?t.open_instruments,
                "[STATE] Transition"
            );
        }
    }
}

/// Compact one-line summary: `[TAG] key=value ...`
pub fn compact_line(event: &EngineEvent) -> String {
    match event {
        EngineEvent::Ticker(s) => format!("[TICKER] {} price={} seq={}", s.instrument_id, s.price, s.sequence),
        EngineEvent::VolumeSurge(a) => {
            format!("[SURGE] {} ratio={:.2} volume={:.4}", a.instrument_id, a.ratio, a.window_volume)
        }
        EngineEvent::PositionOpened(p) => {
            format!("[ENTRY] {} price={} qty={}", p.instrument_id, p.entry_price, p.quantity)
        }
        EngineEvent::PositionUpdated(p) => format!("[UPDATE] {} mode={}", p.instrument_id, p.mode.name()),
        EngineEvent::PositionClosed { position, pnl } => format!(
            "[EXIT] {} reason={} pnl={:.4} ({:.2}%)",
            position.instrument_id, pnl.reason, pnl.realized_pnl, pnl.pnl_pct
        ),
        EngineEvent::ExitFailed { instrument_id, reason } => {
            format!("[EXIT_FAILED] {} {}", instrument_id, reason)
        }
        EngineEvent::ConnectionHealth(s) => format!(
            "[HEALTH] conn={} state={:?} msgs={}",
            s.connection_id, s.state, s.messages_received
        ),
        EngineEvent::TradingStateChanged(t) => format!("[STATE] {} -> {}", t.previous, t.current),
    }
}

/// Log every event from the bus until cancelled.
pub async fn event_log_task(mut rx: broadcast::Receiver<EngineEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "[ENGINE] Event log lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("[ENGINE] Event log task stopped");
}

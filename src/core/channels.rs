//! Channel bundle for inter-task communication
//!
//! - connections -> dispatcher: [`MarketEvent`] (bounded)
//! - trading state -> connection pool: [`PriorityCommand`] (unbounded, low volume)
//! - main -> every task: shutdown via a root [`CancellationToken`]

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::types::ConnectionStats;

use super::trading_state::PriorityCommand;
use super::types::{TickerSnapshot, TradeEvent};
use super::volume::SurgeAlert;

/// Default channel capacity for bounded channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4_096;

/// Normalized output of the ingestion layer
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    /// Snapshot accepted by the ticker cache
    Ticker(TickerSnapshot),
    Trade(TradeEvent),
    Surge(SurgeAlert),
    Health(ConnectionStats),
}

/// Bundle of all inter-task communication channels
#[derive(Debug)]
pub struct ChannelBundle {
    /// Connections -> dispatcher
    pub market_tx: mpsc::Sender<MarketEvent>,
    pub market_rx: mpsc::Receiver<MarketEvent>,

    /// PriorityScheduler -> connection pool router
    pub priority_tx: mpsc::UnboundedSender<PriorityCommand>,
    pub priority_rx: mpsc::UnboundedReceiver<PriorityCommand>,

    /// Process-wide shutdown
    pub shutdown: CancellationToken,
}

impl ChannelBundle {
    pub fn new(capacity: usize) -> Self {
        let (market_tx, market_rx) = mpsc::channel(capacity);
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();

        Self {
            market_tx,
            market_rx,
            priority_tx,
            priority_rx,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

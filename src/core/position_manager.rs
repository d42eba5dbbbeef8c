//! Owner of all positions.
//!
//! Open positions live in a sharded map keyed by instrument. Every mutation of
//! a position (tick evaluation, manual mode change, close) happens while
//! holding that instrument's shard entry, so a manual command can never
//! interleave with a tick evaluation on the same position. Different
//! instruments never contend.
//!
//! Closed positions go to a bounded archive; the oldest are evicted once it
//! holds `archive_limit` entries. Realized P&L keeps counting evicted ones.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StrategyConfig;

use super::position::{ExitReason, PnlBreakdown, Position, PositionError};
use super::types::{Clock, TickerSnapshot};

/// Exit decision produced synchronously from a tick
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub instrument_id: String,
    pub position_id: Uuid,
    pub reason: ExitReason,
    /// Price that triggered the rule
    pub trigger_price: f64,
    /// Price the exit order should be placed at
    pub order_price: f64,
    pub quantity: f64,
    pub detected_at_ms: u64,
}

/// Result of feeding one tick to a position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickEvaluation {
    /// The tick set a new peak (and possibly raised the trailing exit)
    pub peak_raised: bool,
    pub exit: Option<ExitSignal>,
}

/// Closed archive kept in memory
pub const DEFAULT_ARCHIVE_LIMIT: usize = 500;

#[derive(Debug, Default)]
struct Archive {
    positions: VecDeque<Position>,
    /// Over every position ever archived, evicted ones included
    realized_pnl: f64,
}

impl Archive {
    fn push(&mut self, position: Position, limit: usize) {
        if let Some(closed) = &position.closed {
            self.realized_pnl += closed.pnl.realized_pnl;
        }
        self.positions.push_back(position);
        while self.positions.len() > limit {
            self.positions.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct PositionManager {
    strategy: StrategyConfig,
    open: DashMap<String, Position>,
    closed: Mutex<Archive>,
    archive_limit: usize,
    clock: Arc<dyn Clock>,
}

impl PositionManager {
    pub fn new(strategy: StrategyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategy,
            open: DashMap::new(),
            closed: Mutex::new(Archive::default()),
            archive_limit: DEFAULT_ARCHIVE_LIMIT,
            clock,
        }
    }

    /// Keep at most `limit` closed positions in memory (and in snapshots)
    pub fn with_archive_limit(mut self, limit: usize) -> Self {
        self.archive_limit = limit;
        self
    }

    pub fn strategy(&self) -> &StrategyConfig {
        &self.strategy
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Create a position from a confirmed buy fill.
    ///
    /// Rejected when the instrument already has an open position.
    pub fn open_position(
        &self,
        instrument_id: &str,
        entry_price: f64,
        quote_spent: f64,
        available_capital: f64,
    ) -> Result<Position, PositionError> {
        match self.open.entry(instrument_id.to_string()) {
            Entry::Occupied(_) => Err(PositionError::AlreadyOpen(instrument_id.to_string())),
            Entry::Vacant(slot) => {
                let position = Position::open(
                    instrument_id,
                    entry_price,
                    quote_spent,
                    self.clock.now_ms(),
                    &self.strategy,
                    available_capital,
                )?;
                info!(
                    instrument = %instrument_id,
                    entry_price = position.entry_price,
                    quantity = position.quantity,
                    cost_basis = position.cost_basis,
                    min_exit = position.min_exit_price,
                    stop_loss = position.stop_loss_price,
                    "[POSITION] Opened"
                );
                slot.insert(position.clone());
                Ok(position)
            }
        }
    }

    /// Evaluate a tick against the instrument's position, if any.
    ///
    /// Never blocks on I/O; the returned signal is acted on by the caller.
    pub fn evaluate_tick(&self, snapshot: &TickerSnapshot) -> Option<ExitSignal> {
        self.evaluate(snapshot).exit
    }

    /// Like [`evaluate_tick`](Self::evaluate_tick), also reporting whether
    /// the tick moved the peak.
    pub fn evaluate(&self, snapshot: &TickerSnapshot) -> TickEvaluation {
        let now_ms = self.clock.now_ms();
        let Some(mut position) = self.open.get_mut(&snapshot.instrument_id) else {
            return TickEvaluation::default();
        };
        let peak_before = position.peak_price;
        let reason = position.on_price(snapshot.price, now_ms);
        let peak_raised = position.peak_price > peak_before;
        let Some(reason) = reason else {
            return TickEvaluation {
                peak_raised,
                exit: None,
            };
        };

        debug!(
            instrument = %snapshot.instrument_id,
            price = snapshot.price,
            peak = position.peak_price,
            trailing_exit = position.trailing_exit_price,
            reason = %reason,
            "[POSITION] Exit triggered"
        );

        TickEvaluation {
            peak_raised,
            exit: Some(ExitSignal {
                instrument_id: position.instrument_id.clone(),
                position_id: position.id,
                reason,
                trigger_price: snapshot.price,
                order_price: snapshot.exit_price(),
                quantity: position.quantity,
                detected_at_ms: now_ms,
            }),
        }
    }

    /// Exit order failed or did not fill; re-arm evaluation.
    pub fn abort_exit(&self, instrument_id: &str) {
        if let Some(mut position) = self.open.get_mut(instrument_id) {
            position.abort_exit();
            warn!(instrument = %instrument_id, "[POSITION] Exit aborted, automation re-armed");
        }
    }

    /// Close the open position at `exit_price` and archive it.
    pub fn complete_exit(
        &self,
        instrument_id: &str,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<(Position, PnlBreakdown), PositionError> {
        let now_ms = self.clock.now_ms();
        let pnl = {
            let mut position = self
                .open
                .get_mut(instrument_id)
                .ok_or_else(|| PositionError::NotOpen(instrument_id.to_string()))?;
            position.close(exit_price, now_ms, reason)?
        };

        let (_, position) = self
            .open
            .remove(instrument_id)
            .ok_or_else(|| PositionError::NotOpen(instrument_id.to_string()))?;

        info!(
            instrument = %instrument_id,
            reason = %reason,
            exit_price,
            net_proceeds = pnl.net_proceeds,
            realized_pnl = pnl.realized_pnl,
            pnl_pct = pnl.pnl_pct,
            hold_ms = pnl.hold_ms,
            "[POSITION] Closed"
        );

        self.closed.lock().push(position.clone(), self.archive_limit);
        Ok((position, pnl))
    }

    pub fn hibernate(&self, instrument_id: &str, order_id: Option<String>) -> Result<(), PositionError> {
        let mut position = self.get_open_mut(instrument_id)?;
        position.hibernate(order_id)?;
        info!(instrument = %instrument_id, "[POSITION] Hibernating");
        Ok(())
    }

    pub fn set_manual_order(&self, instrument_id: &str, order_id: String) -> Result<(), PositionError> {
        let mut position = self.get_open_mut(instrument_id)?;
        position.set_manual_order(order_id)
    }

    /// Back to automated control. Returns the manual order id, if one was attached.
    pub fn resume(&self, instrument_id: &str) -> Result<Option<String>, PositionError> {
        let mut position = self.get_open_mut(instrument_id)?;
        let order_id = position.resume()?;
        info!(
            instrument = %instrument_id,
            peak = position.peak_price,
            trailing_exit = position.trailing_exit_price,
            "[POSITION] Resumed automation"
        );
        Ok(order_id)
    }

    /// Re-adopt positions loaded from storage. Closed entries go to the
    /// archive; duplicates of an already-open instrument are skipped.
    pub fn restore(&self, open: Vec<Position>, closed: Vec<Position>) -> usize {
        let mut restored = 0;
        let mut archived = closed;
        for position in open {
            if !position.is_open() {
                archived.push(position);
                continue;
            }
            match self.open.entry(position.instrument_id.clone()) {
                Entry::Occupied(_) => {
                    warn!(instrument = %position.instrument_id, "[POSITION] Duplicate stored position skipped");
                }
                Entry::Vacant(slot) => {
                    slot.insert(position);
                    restored += 1;
                }
            }
        }
        archived.sort_by_key(|p| p.closed.as_ref().map_or(0, |c| c.exit_time_ms));
        let mut archive = self.closed.lock();
        for position in archived {
            archive.push(position, self.archive_limit);
        }
        restored
    }

    pub fn get(&self, instrument_id: &str) -> Option<Position> {
        self.open.get(instrument_id).map(|p| p.clone())
    }

    pub fn has_open(&self, instrument_id: &str) -> bool {
        self.open.contains_key(instrument_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn open_instruments(&self) -> BTreeSet<String> {
        self.open.iter().map(|e| e.key().clone()).collect()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.iter().map(|e| e.value().clone()).collect()
    }

    /// Archived positions, oldest first
    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed.lock().positions.iter().cloned().collect()
    }

    /// Capital tied up in open positions (fee-inclusive)
    pub fn committed_capital(&self) -> f64 {
        self.open.iter().map(|e| e.value().cost_basis).sum()
    }

    /// Sum of realized P&L over archived positions
    pub fn realized_pnl(&self) -> f64 {
        self.closed.lock().realized_pnl
    }

    fn get_open_mut(
        &self,
        instrument_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Position>, PositionError> {
        self.open
            .get_mut(instrument_id)
            .ok_or_else(|| PositionError::NotOpen(instrument_id.to_string()))
    }
}

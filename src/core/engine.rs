//! Trading engine: turns decisions into orders.
//!
//! # Architecture
//! - Entries: market buy for a quote amount, never retried. Capital (and, for
//!   surge entries, an open-position slot) is reserved before the order goes
//!   out and released once the entry settles, so concurrent entries cannot
//!   overcommit. A confirmed fill always becomes a tracked position; a failed
//!   buy is returned to the caller.
//! - Exits: every tick goes through [`PositionManager::evaluate_tick`]
//!   synchronously. A resulting [`ExitSignal`] becomes a marketable limit sell
//!   placed on a spawned task so the tick path never waits on I/O. A sell that
//!   fails or does not fill clears the pending flag; the next tick decides again.
//! - Manual override: a user limit sell hibernates the position until it is
//!   cancelled (automation resumes) or fills (position closes as manual).
//! - After every open/close the trading state is recomputed, which drives
//!   subscription priority, and the position snapshot is handed to the store
//!   writer without waiting for it. A tick that raises a peak is persisted the
//!   same way so a restart never restores a lower trailing exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::errors::ExchangeError;
use crate::adapters::traits::ExchangeClient;
use crate::adapters::types::{ConnectionStats, OrderResponse};
use crate::config::{EntryPolicyConfig, TimeoutExit};

use super::events::{EngineEvent, EventBus};
use super::position::{ExitReason, PnlBreakdown, Position, PositionError};
use super::position_manager::{ExitSignal, PositionManager, TickEvaluation};
use super::store::StoredPositions;
use super::ticker_cache::TickerCache;
use super::trading_state::TradingStateController;
use super::types::TickerSnapshot;
use super::volume::SurgeAlert;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    #[error("Order for {0} was not filled")]
    NotFilled(String),

    #[error("Entry already in flight for {0}")]
    EntryInFlight(String),

    #[error("Open position limit of {0} reached")]
    PositionLimit(usize),
}

/// What happened to an exit attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed(PnlBreakdown),
    /// Sell failed or did not fill; the position stays open and automated
    Aborted(String),
}

/// Releases an in-flight entry's reservation when dropped
struct EntryGuard<'a> {
    entering: &'a Mutex<HashMap<String, f64>>,
    instrument_id: String,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.entering.lock().remove(&self.instrument_id);
    }
}

pub struct TradingEngine {
    client: Arc<dyn ExchangeClient>,
    positions: Arc<PositionManager>,
    state: Arc<TradingStateController>,
    cache: Arc<TickerCache>,
    bus: EventBus,
    entry: EntryPolicyConfig,
    snapshots: watch::Sender<StoredPositions>,
    /// In-flight entries and the capital each one reserved
    entering: Mutex<HashMap<String, f64>>,
}

impl TradingEngine {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        positions: Arc<PositionManager>,
        state: Arc<TradingStateController>,
        cache: Arc<TickerCache>,
        bus: EventBus,
        entry: EntryPolicyConfig,
    ) -> Self {
        let (snapshots, _) = watch::channel(StoredPositions::default());
        Self {
            client,
            positions,
            state,
            cache,
            bus,
            entry,
            snapshots,
            entering: Mutex::new(HashMap::new()),
        }
    }

    pub fn positions(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    pub fn trading_state(&self) -> &Arc<TradingStateController> {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Receiver of position snapshots for the store writer
    pub fn store_updates(&self) -> watch::Receiver<StoredPositions> {
        self.snapshots.subscribe()
    }

    /// Quote capital neither committed to open positions nor reserved by
    /// entries in flight
    pub fn available_capital(&self) -> f64 {
        let reserved: f64 = self.entering.lock().values().sum();
        self.unreserved_capital(reserved)
    }

    /// Open positions plus entries in flight
    pub fn open_count(&self) -> usize {
        self.positions.open_count() + self.entering.lock().len()
    }

    fn unreserved_capital(&self, reserved: f64) -> f64 {
        (self.positions.strategy().capital - self.positions.committed_capital() - reserved).max(0.0)
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Buy `quote_amount` of `instrument_id` at market and open a position on
    /// the fill.
    pub async fn enter(&self, instrument_id: &str, quote_amount: f64) -> Result<Position, EngineError> {
        self.enter_within(instrument_id, quote_amount, None).await
    }

    async fn enter_within(
        &self,
        instrument_id: &str,
        quote_amount: f64,
        position_limit: Option<usize>,
    ) -> Result<Position, EngineError> {
        let entry_fee_rate = self.positions.strategy().entry_fee_pct / 100.0;
        let required = quote_amount * (1.0 + entry_fee_rate);
        let _guard = self.claim_entry(instrument_id, required, position_limit)?;

        let started = Instant::now();
        let fill = self.client.place_market_buy(instrument_id, quote_amount).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !fill.is_filled() || fill.filled_quantity <= 0.0 || fill.avg_price <= 0.0 {
            warn!(
                instrument = %instrument_id,
                order_id = %fill.order_id,
                status = ?fill.status,
                "[ENGINE] Market buy not filled"
            );
            return Err(EngineError::NotFilled(instrument_id.to_string()));
        }

        let spent = if fill.filled_value > 0.0 {
            fill.filled_value
        } else {
            fill.avg_price * fill.filled_quantity
        };
        // The coins are bought: track them whatever the fill cost
        let position = self
            .positions
            .open_position(instrument_id, fill.avg_price, spent, f64::INFINITY)?;
        if position.cost_basis > required {
            warn!(
                instrument = %instrument_id,
                reserved = required,
                cost_basis = position.cost_basis,
                "[ENGINE] Fill cost more than reserved"
            );
        }

        info!(
            instrument = %instrument_id,
            order_id = %fill.order_id,
            price = fill.avg_price,
            latency_ms,
            "[ENGINE] Entry filled"
        );

        self.bus.publish(EngineEvent::PositionOpened(position.clone()));
        self.after_position_change();
        Ok(position)
    }

    /// Reserve `required` capital (and a position slot under `position_limit`)
    /// for an entry on `instrument_id`. All checks and the reservation happen
    /// under one lock.
    fn claim_entry(
        &self,
        instrument_id: &str,
        required: f64,
        position_limit: Option<usize>,
    ) -> Result<EntryGuard<'_>, EngineError> {
        let mut entering = self.entering.lock();
        if entering.contains_key(instrument_id) {
            return Err(EngineError::EntryInFlight(instrument_id.to_string()));
        }
        if self.positions.has_open(instrument_id) {
            return Err(PositionError::AlreadyOpen(instrument_id.to_string()).into());
        }
        if let Some(limit) = position_limit {
            if self.positions.open_count() + entering.len() >= limit {
                return Err(EngineError::PositionLimit(limit));
            }
        }
        let available = self.unreserved_capital(entering.values().sum());
        if required > available {
            return Err(PositionError::InsufficientCapital { required, available }.into());
        }
        entering.insert(instrument_id.to_string(), required);
        drop(entering);

        Ok(EntryGuard {
            entering: &self.entering,
            instrument_id: instrument_id.to_string(),
        })
    }

    /// Entry policy for a surge alert. `Err` carries why it was skipped.
    pub fn entry_decision(&self, alert: &SurgeAlert) -> Result<(), String> {
        if !self.entry.enabled {
            return Err("automatic entry disabled".to_string());
        }
        if self.positions.has_open(&alert.instrument_id) {
            return Err("position already open".to_string());
        }
        let open = self.open_count();
        if open >= self.entry.max_open_positions {
            return Err(format!("{} positions already open or entering", open));
        }
        if alert.ratio < self.entry.min_surge_ratio {
            return Err(format!("surge ratio {:.2} below {:.2}", alert.ratio, self.entry.min_surge_ratio));
        }
        let snapshot = self
            .cache
            .get(&alert.instrument_id)
            .ok_or_else(|| "no ticker yet".to_string())?;
        let dip = snapshot.drop_from_high_pct();
        if dip < self.entry.min_dip_pct {
            return Err(format!("{:.2}% below 24h high, need {:.2}%", dip, self.entry.min_dip_pct));
        }
        Ok(())
    }

    /// Publish the alert and enter when the policy allows it.
    pub async fn on_surge(&self, alert: SurgeAlert) -> Option<Result<Position, EngineError>> {
        self.bus.publish(EngineEvent::VolumeSurge(alert.clone()));

        match self.entry_decision(&alert) {
            Ok(()) => {
                info!(
                    instrument = %alert.instrument_id,
                    ratio = alert.ratio,
                    quote_amount = self.entry.quote_amount,
                    "[ENGINE] Surge entry"
                );
                let result = self
                    .enter_within(
                        &alert.instrument_id,
                        self.entry.quote_amount,
                        Some(self.entry.max_open_positions),
                    )
                    .await;
                if let Err(e) = &result {
                    warn!(instrument = %alert.instrument_id, error = %e, "[ENGINE] Surge entry failed");
                }
                Some(result)
            }
            Err(skip) => {
                if self.entry.enabled {
                    info!(instrument = %alert.instrument_id, reason = %skip, "[ENGINE] Surge entry skipped");
                }
                None
            }
        }
    }

    // =========================================================================
    // Exit
    // =========================================================================

    /// Evaluate a tick; when an exit fires, execute it on a spawned task.
    pub fn on_ticker(self: &Arc<Self>, snapshot: &TickerSnapshot) -> Option<JoinHandle<ExitOutcome>> {
        let TickEvaluation { peak_raised, exit } = self.positions.evaluate(snapshot);
        if peak_raised {
            self.persist();
        }
        let signal = exit?;
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move { engine.execute_exit(signal).await }))
    }

    /// Place the exit sell for a signal and settle the position.
    pub async fn execute_exit(&self, signal: ExitSignal) -> ExitOutcome {
        let instrument = signal.instrument_id.clone();
        let price = match (signal.reason, self.positions.strategy().timeout_exit) {
            (ExitReason::MaxHoldTimeout, TimeoutExit::LastPrice) => signal.trigger_price,
            _ => signal.order_price,
        };

        info!(
            instrument = %instrument,
            reason = %signal.reason,
            trigger_price = signal.trigger_price,
            order_price = price,
            quantity = signal.quantity,
            "[ENGINE] Placing exit"
        );

        let started = Instant::now();
        let response = self
            .client
            .place_limit_sell(&instrument, price, signal.quantity)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(order) if order.is_filled() => {
                let fill_price = if order.avg_price > 0.0 { order.avg_price } else { price };
                match self.settle(&instrument, fill_price, signal.reason) {
                    Ok(pnl) => {
                        info!(instrument = %instrument, order_id = %order.order_id, latency_ms, "[ENGINE] Exit filled");
                        ExitOutcome::Closed(pnl)
                    }
                    Err(e) => self.abort(&instrument, format!("settlement failed: {}", e)),
                }
            }
            Ok(order) => {
                if let Err(e) = self.client.cancel_order(&order.order_id).await {
                    warn!(instrument = %instrument, order_id = %order.order_id, error = %e, "[ENGINE] Cancel of unfilled exit failed");
                }
                self.abort(&instrument, format!("exit order {} not filled ({:?})", order.order_id, order.status))
            }
            Err(e) => self.abort(&instrument, e.to_string()),
        }
    }

    fn abort(&self, instrument_id: &str, reason: String) -> ExitOutcome {
        self.positions.abort_exit(instrument_id);
        self.bus.publish(EngineEvent::ExitFailed {
            instrument_id: instrument_id.to_string(),
            reason: reason.clone(),
        });
        ExitOutcome::Aborted(reason)
    }

    fn settle(&self, instrument_id: &str, price: f64, reason: ExitReason) -> Result<PnlBreakdown, PositionError> {
        let (position, pnl) = self.positions.complete_exit(instrument_id, price, reason)?;
        self.bus.publish(EngineEvent::PositionClosed {
            position,
            pnl: pnl.clone(),
        });
        self.after_position_change();
        Ok(pnl)
    }

    // =========================================================================
    // Manual override
    // =========================================================================

    /// Place a user limit sell for the whole position and hibernate it.
    ///
    /// If the order fills on placement the position closes as manual. If the
    /// exchange rejects it, automation resumes.
    pub async fn place_manual_limit(&self, instrument_id: &str, price: f64) -> Result<OrderResponse, EngineError> {
        self.positions.hibernate(instrument_id, None)?;
        let quantity = self
            .positions
            .get(instrument_id)
            .map(|p| p.quantity)
            .ok_or_else(|| PositionError::NotOpen(instrument_id.to_string()))?;

        let order = match self.client.place_limit_sell(instrument_id, price, quantity).await {
            Ok(order) => order,
            Err(e) => {
                warn!(instrument = %instrument_id, error = %e, "[ENGINE] Manual limit rejected, resuming automation");
                if let Err(resume_err) = self.positions.resume(instrument_id) {
                    warn!(instrument = %instrument_id, error = %resume_err, "[ENGINE] Resume failed");
                }
                return Err(e.into());
            }
        };

        if order.is_filled() {
            let fill_price = if order.avg_price > 0.0 { order.avg_price } else { price };
            self.settle(instrument_id, fill_price, ExitReason::Manual)?;
            return Ok(order);
        }

        self.positions.set_manual_order(instrument_id, order.order_id.clone())?;
        info!(instrument = %instrument_id, order_id = %order.order_id, price, "[ENGINE] Manual limit placed");
        if let Some(position) = self.positions.get(instrument_id) {
            self.bus.publish(EngineEvent::PositionUpdated(position));
        }
        self.persist();
        Ok(order)
    }

    /// Cancel the user's limit order and resume automation.
    ///
    /// If the cancel is rejected the position goes back to hibernation with
    /// the same order.
    pub async fn cancel_manual_limit(&self, instrument_id: &str) -> Result<(), EngineError> {
        let order_id = self.positions.resume(instrument_id)?;

        if let Some(order_id) = &order_id {
            if let Err(e) = self.client.cancel_order(order_id).await {
                warn!(instrument = %instrument_id, order_id = %order_id, error = %e, "[ENGINE] Manual cancel rejected");
                self.positions.hibernate(instrument_id, Some(order_id.clone()))?;
                return Err(e.into());
            }
        }

        info!(instrument = %instrument_id, order_id = ?order_id, "[ENGINE] Manual limit cancelled");
        if let Some(position) = self.positions.get(instrument_id) {
            self.bus.publish(EngineEvent::PositionUpdated(position));
        }
        self.persist();
        Ok(())
    }

    /// The user's limit order filled at `price`.
    pub fn on_manual_fill(&self, instrument_id: &str, price: f64) -> Result<PnlBreakdown, EngineError> {
        Ok(self.settle(instrument_id, price, ExitReason::Manual)?)
    }

    // =========================================================================
    // State, persistence, health
    // =========================================================================

    /// Adopt stored positions at startup. Returns how many open positions
    /// were restored.
    pub fn restore(&self, stored: StoredPositions) -> usize {
        let restored = self.positions.restore(stored.open, stored.closed);
        for position in self.positions.open_positions() {
            self.bus.publish(EngineEvent::PositionUpdated(position));
        }
        info!(restored, "[ENGINE] Positions restored");
        self.after_position_change();
        restored
    }

    pub fn on_health(&self, stats: ConnectionStats) {
        self.bus.publish(EngineEvent::ConnectionHealth(stats));
    }

    fn after_position_change(&self) {
        if let Some(transition) = self.state.recompute(self.positions.open_instruments()) {
            self.bus.publish(EngineEvent::TradingStateChanged(transition));
        }
        self.persist();
    }

    fn persist(&self) {
        self.snapshots.send_replace(StoredPositions {
            open: self.positions.open_positions(),
            closed: self.positions.closed_positions(),
            saved_at_ms: self.positions.now_ms(),
        });
    }
}

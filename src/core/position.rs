//! Position state machine
//!
//! A [`Position`] is `Open` in one of two [`PositionMode`]s and ends `Closed`.
//! All price levels are derived once at entry from the strategy parameters;
//! only the peak and the trailing-exit price move afterwards, and the
//! trailing-exit price only ever moves up.
//!
//! Exit evaluation order on every tick (first match wins):
//! 1. price <= stop-loss (active regardless of hold time)
//! 2. price >= target
//! 3. price <= trailing-exit (with [`TrailingArming::PeakAtFloor`], only once
//!    the peak has reached the trailing floor)
//! 4. hold time >= maximum hold
//!
//! Checks 2-4 only run after the minimum hold time. Nothing is evaluated while
//! hibernating or while an exit order is already in flight.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{StrategyConfig, TrailingArming, TrailingFloor};

/// Quantities are floored to this many decimals
const QUANTITY_DECIMALS: i32 = 8;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Position already open for {0}")]
    AlreadyOpen(String),

    #[error("No open position for {0}")]
    NotOpen(String),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Insufficient capital: required {required:.8}, available {available:.8}")]
    InsufficientCapital { required: f64, available: f64 },

    #[error("Invalid transition for {instrument}: {from} -> {to}")]
    InvalidTransition {
        instrument: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Exit already pending for {0}")]
    ExitPending(String),
}

// =============================================================================
// Enums
// =============================================================================

/// Who is in control of an open position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PositionMode {
    /// Exit rules are evaluated on every tick
    Automated,
    /// A manual limit order owns the exit; automation is suspended
    Hibernating { order_id: Option<String> },
}

impl PositionMode {
    pub fn name(&self) -> &'static str {
        match self {
            PositionMode::Automated => "automated",
            PositionMode::Hibernating { .. } => "hibernating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position was (or is being) closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TargetProfit,
    TrailingStop,
    MaxHoldTimeout,
    /// Filled by a user-placed order
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop loss"),
            ExitReason::TargetProfit => write!(f, "target profit"),
            ExitReason::TrailingStop => write!(f, "trailing stop"),
            ExitReason::MaxHoldTimeout => write!(f, "max hold timeout"),
            ExitReason::Manual => write!(f, "manual"),
        }
    }
}

// =============================================================================
// P&L
// =============================================================================

/// Realized result of a closed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub exit_price: f64,
    pub quantity: f64,
    /// exit_price * quantity
    pub gross_proceeds: f64,
    pub exit_fee: f64,
    pub net_proceeds: f64,
    pub cost_basis: f64,
    /// net_proceeds - cost_basis
    pub realized_pnl: f64,
    /// realized_pnl / cost_basis * 100
    pub pnl_pct: f64,
    pub hold_ms: u64,
    pub reason: ExitReason,
}

/// Terminal data recorded on close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedInfo {
    pub exit_time_ms: u64,
    pub pnl: PnlBreakdown,
}

// =============================================================================
// Position
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument_id: String,
    pub entry_price: f64,
    pub quantity: f64,
    /// Quote amount spent on the fill
    pub quote_spent: f64,
    /// quote_spent including the entry fee
    pub cost_basis: f64,
    pub mode: PositionMode,
    pub status: PositionStatus,
    pub peak_price: f64,
    pub trailing_exit_price: f64,
    pub stop_loss_price: f64,
    /// Exit price that recovers round-trip fees
    pub break_even_price: f64,
    /// Break-even plus the minimum profit target
    pub min_exit_price: f64,
    pub target_price: f64,
    pub entry_time_ms: u64,
    pub min_hold_ms: u64,
    pub max_hold_ms: u64,
    exit_fee_rate: f64,
    trailing_rate: f64,
    trailing_floor: TrailingFloor,
    #[serde(default)]
    trailing_arming: TrailingArming,
    #[serde(default)]
    pub closed: Option<ClosedInfo>,
    #[serde(skip)]
    exit_pending: bool,
}

impl Position {
    /// Build a position from a confirmed buy fill.
    ///
    /// `available_capital` bounds the fee-inclusive cost basis.
    pub fn open(
        instrument_id: &str,
        entry_price: f64,
        quote_spent: f64,
        entry_time_ms: u64,
        strategy: &StrategyConfig,
        available_capital: f64,
    ) -> Result<Self, PositionError> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(PositionError::InvalidEntry(format!(
                "entry price must be positive (got {})",
                entry_price
            )));
        }
        if !quote_spent.is_finite() || quote_spent <= 0.0 {
            return Err(PositionError::InvalidEntry(format!(
                "spent amount must be positive (got {})",
                quote_spent
            )));
        }

        let entry_fee_rate = strategy.entry_fee_pct / 100.0;
        let exit_fee_rate = strategy.exit_fee_pct / 100.0;

        let quantity = floor_to_decimals(quote_spent / entry_price, QUANTITY_DECIMALS);
        if quantity <= 0.0 {
            return Err(PositionError::InvalidEntry(format!(
                "quantity rounds to zero ({} at {})",
                quote_spent, entry_price
            )));
        }

        let cost_basis = quote_spent * (1.0 + entry_fee_rate);
        if cost_basis > available_capital {
            return Err(PositionError::InsufficientCapital {
                required: cost_basis,
                available: available_capital,
            });
        }

        let break_even_price = entry_price * (1.0 + entry_fee_rate) / (1.0 - exit_fee_rate);
        let min_exit_price = break_even_price * (1.0 + strategy.min_profit_pct / 100.0);
        let target_price = break_even_price * (1.0 + strategy.take_profit_pct / 100.0);
        let stop_loss_price = entry_price * (1.0 - strategy.stop_loss_pct / 100.0);

        let mut position = Self {
            id: Uuid::new_v4(),
            instrument_id: instrument_id.to_string(),
            entry_price,
            quantity,
            quote_spent,
            cost_basis,
            mode: PositionMode::Automated,
            status: PositionStatus::Open,
            peak_price: entry_price,
            trailing_exit_price: 0.0,
            stop_loss_price,
            break_even_price,
            min_exit_price,
            target_price,
            entry_time_ms,
            min_hold_ms: strategy.min_hold_secs * 1_000,
            max_hold_ms: strategy.max_hold_secs * 1_000,
            exit_fee_rate,
            trailing_rate: strategy.trailing_pct / 100.0,
            trailing_floor: strategy.trailing_floor,
            trailing_arming: strategy.trailing_arming,
            closed: None,
            exit_pending: false,
        };
        position.trailing_exit_price = position.floor_price();
        Ok(position)
    }

    /// Lowest level the trailing exit can take
    pub fn floor_price(&self) -> f64 {
        match self.trailing_floor {
            TrailingFloor::MinimumExit => self.min_exit_price,
            TrailingFloor::BreakEven => self.break_even_price,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn is_automated(&self) -> bool {
        self.mode == PositionMode::Automated
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_pending
    }

    pub fn held_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entry_time_ms)
    }

    /// Whether the trailing-exit rule is live (hold time aside)
    pub fn trailing_armed(&self) -> bool {
        match self.trailing_arming {
            TrailingArming::AfterMinHold => true,
            TrailingArming::PeakAtFloor => self.peak_price >= self.floor_price(),
        }
    }

    /// Feed one price tick. Returns the exit reason when a rule fires and
    /// marks the exit as pending; later ticks are ignored until the exit
    /// completes or is aborted.
    pub fn on_price(&mut self, price: f64, now_ms: u64) -> Option<ExitReason> {
        if !self.is_open() || !self.is_automated() || self.exit_pending {
            return None;
        }
        if !price.is_finite() || price <= 0.0 {
            return None;
        }

        if price > self.peak_price {
            self.peak_price = price;
            let candidate = (self.peak_price * (1.0 - self.trailing_rate)).max(self.floor_price());
            if candidate > self.trailing_exit_price {
                self.trailing_exit_price = candidate;
            }
        }

        let reason = self.exit_reason(price, now_ms)?;
        self.exit_pending = true;
        Some(reason)
    }

    fn exit_reason(&self, price: f64, now_ms: u64) -> Option<ExitReason> {
        if price <= self.stop_loss_price {
            return Some(ExitReason::StopLoss);
        }

        let held = self.held_ms(now_ms);
        if held < self.min_hold_ms {
            return None;
        }

        if price >= self.target_price {
            return Some(ExitReason::TargetProfit);
        }
        if self.trailing_armed() && price <= self.trailing_exit_price {
            return Some(ExitReason::TrailingStop);
        }
        if held >= self.max_hold_ms {
            return Some(ExitReason::MaxHoldTimeout);
        }
        None
    }

    /// The exit order did not fill; automation resumes on the next tick.
    pub fn abort_exit(&mut self) {
        self.exit_pending = false;
    }

    /// Hand control to a manual limit order.
    pub fn hibernate(&mut self, order_id: Option<String>) -> Result<(), PositionError> {
        self.ensure_open()?;
        if self.exit_pending {
            return Err(PositionError::ExitPending(self.instrument_id.clone()));
        }
        match self.mode {
            PositionMode::Automated => {
                self.mode = PositionMode::Hibernating { order_id };
                Ok(())
            }
            PositionMode::Hibernating { .. } => Err(self.invalid("hibernating")),
        }
    }

    /// Attach the exchange id of the manual order once it is known.
    pub fn set_manual_order(&mut self, order_id: String) -> Result<(), PositionError> {
        self.ensure_open()?;
        if let PositionMode::Hibernating { order_id: slot } = &mut self.mode {
            *slot = Some(order_id);
            return Ok(());
        }
        Err(self.invalid("hibernating"))
    }

    /// Return to automated control, keeping peak and trailing state.
    /// Yields the manual order id, if any.
    pub fn resume(&mut self) -> Result<Option<String>, PositionError> {
        self.ensure_open()?;
        match std::mem::replace(&mut self.mode, PositionMode::Automated) {
            PositionMode::Hibernating { order_id } => Ok(order_id),
            PositionMode::Automated => Err(self.invalid("automated")),
        }
    }

    /// Close at `exit_price` and compute realized P&L.
    pub fn close(
        &mut self,
        exit_price: f64,
        now_ms: u64,
        reason: ExitReason,
    ) -> Result<PnlBreakdown, PositionError> {
        self.ensure_open()?;
        if !exit_price.is_finite() || exit_price <= 0.0 {
            return Err(PositionError::InvalidEntry(format!(
                "exit price must be positive (got {})",
                exit_price
            )));
        }

        let gross_proceeds = exit_price * self.quantity;
        let exit_fee = gross_proceeds * self.exit_fee_rate;
        let net_proceeds = gross_proceeds - exit_fee;
        let realized_pnl = net_proceeds - self.cost_basis;

        let pnl = PnlBreakdown {
            exit_price,
            quantity: self.quantity,
            gross_proceeds,
            exit_fee,
            net_proceeds,
            cost_basis: self.cost_basis,
            realized_pnl,
            pnl_pct: realized_pnl / self.cost_basis * 100.0,
            hold_ms: self.held_ms(now_ms),
            reason,
        };

        self.status = PositionStatus::Closed;
        self.exit_pending = false;
        self.closed = Some(ClosedInfo {
            exit_time_ms: now_ms,
            pnl: pnl.clone(),
        });
        Ok(pnl)
    }

    fn ensure_open(&self) -> Result<(), PositionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PositionError::NotOpen(self.instrument_id.clone()))
        }
    }

    fn invalid(&self, to: &'static str) -> PositionError {
        PositionError::InvalidTransition {
            instrument: self.instrument_id.clone(),
            from: self.mode.name(),
            to,
        }
    }
}

fn floor_to_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).floor() / factor
}

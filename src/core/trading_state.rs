//! Coarse trading state and subscription priority.
//!
//! [`TradingStateController::recompute`] is called after every position
//! creation or close with the set of instruments backing open positions. It
//! derives [`TradingState`] and hands the set to the [`PriorityScheduler`],
//! which diffs it against what is currently elevated and emits
//! [`PriorityCommand`]s toward the connection pool.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingState {
    Idle,
    Active,
    MultiActive,
}

impl TradingState {
    pub fn from_open_count(count: usize) -> Self {
        match count {
            0 => TradingState::Idle,
            1 => TradingState::Active,
            _ => TradingState::MultiActive,
        }
    }
}

impl fmt::Display for TradingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingState::Idle => write!(f, "IDLE"),
            TradingState::Active => write!(f, "ACTIVE"),
            TradingState::MultiActive => write!(f, "MULTI_ACTIVE"),
        }
    }
}

/// Instruction to the ingestion layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityCommand {
    /// Add real-time delivery for these instruments
    Elevate(Vec<String>),
    /// Drop real-time delivery for these instruments
    Release(Vec<String>),
}

/// Result of a recompute that changed something
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: TradingState,
    pub current: TradingState,
    pub open_instruments: BTreeSet<String>,
    pub elevated: Vec<String>,
    pub released: Vec<String>,
}

// =============================================================================
// PriorityScheduler
// =============================================================================

#[derive(Debug)]
pub struct PriorityScheduler {
    tx: mpsc::UnboundedSender<PriorityCommand>,
    elevated: Mutex<BTreeSet<String>>,
}

impl PriorityScheduler {
    pub fn new(tx: mpsc::UnboundedSender<PriorityCommand>) -> Self {
        Self {
            tx,
            elevated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make `desired` the elevated set. Returns `(elevated, released)`.
    pub fn apply(&self, desired: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
        let mut current = self.elevated.lock();
        let to_elevate: Vec<String> = desired.difference(&current).cloned().collect();
        let to_release: Vec<String> = current.difference(desired).cloned().collect();

        if !to_release.is_empty() {
            self.send(PriorityCommand::Release(to_release.clone()));
        }
        if !to_elevate.is_empty() {
            self.send(PriorityCommand::Elevate(to_elevate.clone()));
        }

        *current = desired.clone();
        (to_elevate, to_release)
    }

    pub fn elevated(&self) -> BTreeSet<String> {
        self.elevated.lock().clone()
    }

    pub fn is_elevated(&self, instrument_id: &str) -> bool {
        self.elevated.lock().contains(instrument_id)
    }

    fn send(&self, command: PriorityCommand) {
        if self.tx.send(command).is_err() {
            warn!("[STATE] Priority channel closed, command dropped");
        }
    }
}

// =============================================================================
// TradingStateController
// =============================================================================

#[derive(Debug)]
pub struct TradingStateController {
    scheduler: PriorityScheduler,
    state: Mutex<(TradingState, BTreeSet<String>)>,
}

impl TradingStateController {
    pub fn new(scheduler: PriorityScheduler) -> Self {
        Self {
            scheduler,
            state: Mutex::new((TradingState::Idle, BTreeSet::new())),
        }
    }

    /// Derive state from the open set and reconcile elevation.
    ///
    /// Returns `None` when neither the state nor the instrument set changed.
    pub fn recompute(&self, open_instruments: BTreeSet<String>) -> Option<StateTransition> {
        let mut guard = self.state.lock();
        let previous = guard.0;
        let current = TradingState::from_open_count(open_instruments.len());

        if previous == current && guard.1 == open_instruments {
            return None;
        }

        let (elevated, released) = self.scheduler.apply(&open_instruments);
        *guard = (current, open_instruments.clone());

        info!(
            previous = %previous,
            current = %current,
            open = open_instruments.len(),
            elevated = ?elevated,
            released = ?released,
            "[STATE] Trading state recomputed"
        );

        Some(StateTransition {
            previous,
            current,
            open_instruments,
            elevated,
            released,
        })
    }

    pub fn state(&self) -> TradingState {
        self.state.lock().0
    }

    pub fn open_instruments(&self) -> BTreeSet<String> {
        self.state.lock().1.clone()
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }
}

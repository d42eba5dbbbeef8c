//! Core module - ticker cache, surge detection, positions, trading state, engine
//!
//! This module uses **explicit re-exports** instead of glob exports (`pub use module::*`)
//! to keep the public API visible in one place.
//!
//! ## Usage
//! Prefer importing from `crate::core`:
//! ```ignore
//! use crate::core::{TickerCache, PositionManager, TradingEngine};
//! ```

pub mod channels;
pub mod engine;
pub mod events;
pub mod position;
pub mod position_manager;
pub mod runtime;
pub mod store;
pub mod ticker_cache;
pub mod trading_state;
pub mod types;
pub mod volume;

pub use channels::{ChannelBundle, MarketEvent, DEFAULT_CHANNEL_CAPACITY};

pub use engine::{EngineError, ExitOutcome, TradingEngine};

pub use events::{
    compact_line, event_log_task, log_event, EngineEvent, EngineEventType, EventBus,
    DEFAULT_EVENT_CAPACITY,
};

pub use position::{
    ClosedInfo, ExitReason, PnlBreakdown, Position, PositionError, PositionMode, PositionStatus,
};

pub use position_manager::{ExitSignal, PositionManager, TickEvaluation, DEFAULT_ARCHIVE_LIMIT};

pub use runtime::{dispatch_task, priority_task, DispatchStats};

pub use store::{
    spawn_store_writer, JsonFileStore, MemoryStore, PositionStore, StoreError, StoredPositions,
};

pub use ticker_cache::{CacheUpdate, TickerCache};

pub use trading_state::{
    PriorityCommand, PriorityScheduler, StateTransition, TradingState, TradingStateController,
};

pub use types::{
    current_time_ms, Clock, ManualClock, SystemClock, TickerSnapshot, TradeEvent, TradeSide,
};

pub use volume::{SurgeAlert, VolumeSurgeDetector};

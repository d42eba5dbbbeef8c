//! Core data types for the ingestion and trading pipeline.
//!
//! Every inbound payload is normalized into one of these fixed shapes at the
//! ingestion boundary; nothing downstream deals with optional wire fields.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// =============================================================================
// Ticker Snapshot
// =============================================================================

/// Last-known normalized market state for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    /// Instrument identifier (e.g. "BTC-USD")
    pub instrument_id: String,
    /// Last traded price
    pub price: f64,
    /// Best bid
    pub bid: f64,
    /// Best ask
    pub ask: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    /// Exchange sequence number of the frame carrying this snapshot
    pub sequence: u64,
    /// Exchange timestamp in Unix milliseconds
    pub timestamp_ms: u64,
}

impl TickerSnapshot {
    /// Price to sell into: best bid when the book is populated, last price otherwise.
    pub fn exit_price(&self) -> f64 {
        if self.bid > 0.0 {
            self.bid
        } else {
            self.price
        }
    }

    /// Percentage distance of the last price below the 24h high (0 when at or above it).
    pub fn drop_from_high_pct(&self) -> f64 {
        if self.high_24h <= 0.0 || self.price >= self.high_24h {
            return 0.0;
        }
        (self.high_24h - self.price) / self.high_24h * 100.0
    }
}

// =============================================================================
// Trade Event
// =============================================================================

/// Aggressor side of a public trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub instrument_id: String,
    pub trade_id: String,
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub timestamp_ms: u64,
}

// =============================================================================
// Clock
// =============================================================================

/// Source of wall-clock milliseconds.
///
/// Position hold times and token lifetimes read time through this trait so
/// they can be driven deterministically.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by `SystemTime`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// Manually advanced clock for replays and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Current Unix time in milliseconds
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(price: f64, bid: f64, high: f64) -> TickerSnapshot {
        TickerSnapshot {
            instrument_id: "DOGE-USD".to_string(),
            price,
            bid,
            ask: price,
            high_24h: high,
            low_24h: 0.0,
            volume_24h: 0.0,
            sequence: 1,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_exit_price_prefers_bid() {
        assert_eq!(snapshot(0.093, 0.0929, 0.1).exit_price(), 0.0929);
        assert_eq!(snapshot(0.093, 0.0, 0.1).exit_price(), 0.093);
    }

    #[test]
    fn test_drop_from_high_pct() {
        let s = snapshot(90.0, 89.0, 100.0);
        assert!((s.drop_from_high_pct() - 10.0).abs() < 1e-9);
        assert_eq!(snapshot(110.0, 109.0, 100.0).drop_from_high_pct(), 0.0);
        assert_eq!(snapshot(10.0, 9.0, 0.0).drop_from_high_pct(), 0.0);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_is_positive() {
        assert!(SystemClock.now_ms() > 0);
    }
}

//! Core data types for exchange adapters
//!
//! Connection health tracking for the streaming side and order/instrument
//! shapes returned by the [`ExchangeClient`](super::traits::ExchangeClient).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::core::types::current_time_ms;

// =============================================================================
// Connection Health Types
// =============================================================================

/// Connection state for WebSocket health monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Socket open and subscriptions being served
    Connected,
    /// Not connected and not trying (initial, or after shutdown)
    #[default]
    Disconnected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connected => 0,
            ConnectionState::Disconnected => 1,
            ConnectionState::Reconnecting => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connection_id: usize,
    pub instrument_count: usize,
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful session
    pub reconnect_attempts: u64,
    pub current_backoff_ms: u64,
    /// Unix ms of the last inbound frame (heartbeats included)
    pub last_message_ms: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub sequence_gaps: u64,
    pub elevated_count: u64,
}

/// Shared, lock-free health counters for one connection.
///
/// Written by the connection task, read by the pool's health reporter.
#[derive(Debug, Default)]
pub struct ConnectionHealth {
    state: AtomicU8,
    pub reconnect_attempts: AtomicU64,
    pub current_backoff_ms: AtomicU64,
    pub last_message_ms: AtomicU64,
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub elevated_count: AtomicU64,
}

impl ConnectionHealth {
    pub fn new() -> Arc<Self> {
        let health = Self::default();
        health.set_state(ConnectionState::Disconnected);
        Arc::new(health)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    /// Record an inbound frame
    pub fn touch(&self) {
        self.last_message_ms.store(current_time_ms(), Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connection_id: usize, instrument_count: usize) -> ConnectionStats {
        ConnectionStats {
            connection_id,
            instrument_count,
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            current_backoff_ms: self.current_backoff_ms.load(Ordering::Relaxed),
            last_message_ms: self.last_message_ms.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            elevated_count: self.elevated_count.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Order Types
// =============================================================================

/// Order status from exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Resting on the book
    Open,
    /// Completely filled
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

/// Order response from exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub instrument_id: String,
    pub status: OrderStatus,
    /// Base quantity filled so far
    pub filled_quantity: f64,
    /// Average fill price (0 when nothing filled)
    pub avg_price: f64,
    /// Quote amount consumed by fills, fees excluded
    pub filled_value: f64,
}

impl OrderResponse {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

// =============================================================================
// Instrument Metadata
// =============================================================================

/// Tradeable product as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub base_currency: String,
    pub quote_currency: String,
    /// Trading enabled on the venue
    pub tradable: bool,
}

impl Instrument {
    pub fn new(id: &str) -> Self {
        let mut parts = id.splitn(2, '-');
        let base = parts.next().unwrap_or_default().to_string();
        let quote = parts.next().unwrap_or_default().to_string();
        Self {
            id: id.to_string(),
            base_currency: base,
            quote_currency: quote,
            tradable: true,
        }
    }
}

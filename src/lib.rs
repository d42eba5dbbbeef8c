//! Volume-surge mean-reversion bot
//!
//! Real-time market data ingestion and automated position lifecycle:
//! - Multi-connection streaming ingestion with signed, short-lived tokens
//! - Ticker cache and sliding-window volume surge detection
//! - Per-instrument position state machine with trailing stops and hibernation
//! - Trading state aggregation feeding subscription priority back to ingestion

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;

pub use error::AppError;

//! Shared helpers for exchange adapters
//!
//! WebSocket dialing, reconnect backoff and the in-memory endpoint used by
//! replays and tests.

pub mod memory;
pub mod reconnect;
pub mod websocket;

pub use memory::{MemoryConnector, MemorySession};
pub use reconnect::{Backoff, ReconnectConfig};
pub use websocket::{connect_tls, FrameSink, FrameStream, TlsWsConnector, WsConnector};

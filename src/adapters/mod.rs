//! Exchange adapters
//!
//! Streaming ingestion (Coinbase Advanced Trade), the REST client seam used by
//! the engine, and a paper venue for dry runs.

pub mod coinbase;
pub mod errors;
pub mod paper;
pub mod shared;
pub mod traits;
pub mod types;

// Re-export commonly used types for convenience
pub use coinbase::{AuthTokenManager, ConnectionPool, Es256Signer, PriorityRouter};
pub use errors::{ExchangeError, ExchangeResult};
pub use paper::PaperExchangeClient;
pub use traits::ExchangeClient;
pub use types::{ConnectionState, ConnectionStats, Instrument, OrderResponse, OrderStatus};

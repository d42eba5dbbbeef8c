//! Coinbase Advanced Trade streaming adapter
//!
//! - `types`: wire frames and inbound validation
//! - `auth`: ES256 token signing and the token manager
//! - `connection`: one connection task per instrument batch
//! - `pool`: batching, priority routing, lifecycle

pub mod auth;
pub mod connection;
pub mod pool;
pub mod types;

pub use auth::{AuthError, AuthToken, AuthTokenManager, Es256Signer, TokenSigner};
pub use connection::{Connection, ConnectionCommand, ConnectionContext};
pub use pool::{partition, ConnectionPool, PriorityRouter};
pub use types::{parse_frame, ErrorKind, InboundFrame, MalformedMessage, SubscribeFrame, SubscriptionAction};

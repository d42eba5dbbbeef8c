//! Exchange client trait definition
//!
//! The REST side of the exchange. The engine calls these operations but the
//! trading core never implements them; production wiring plugs a venue
//! client in, dry runs and tests use [`PaperExchangeClient`](super::paper::PaperExchangeClient).

use async_trait::async_trait;

use crate::adapters::errors::ExchangeResult;
use crate::adapters::types::{Instrument, OrderResponse};

/// Order entry and product discovery against the exchange
///
/// Market orders are never retried by callers: a failure is surfaced and the
/// caller decides whether to re-evaluate or abandon.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// All products currently listed, tradable or not
    async fn fetch_all_instruments(&self) -> ExchangeResult<Vec<Instrument>>;

    /// Buy `quote_amount` worth of the instrument at market
    async fn place_market_buy(
        &self,
        instrument_id: &str,
        quote_amount: f64,
    ) -> ExchangeResult<OrderResponse>;

    /// Place a limit sell for `quantity` at `price`
    async fn place_limit_sell(
        &self,
        instrument_id: &str,
        price: f64,
        quantity: f64,
    ) -> ExchangeResult<OrderResponse>;

    /// Cancel an order by exchange id
    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()>;
}

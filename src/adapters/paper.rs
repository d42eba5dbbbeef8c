//! Simulated exchange client for dry runs and tests
//!
//! Market buys fill at the cached ask (last price when no ask is known).
//! Limit sells fill immediately at their limit price unless the client is set
//! to let them rest. Every order is recorded for inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::traits::ExchangeClient;
use crate::adapters::types::{Instrument, OrderResponse, OrderStatus};
use crate::core::ticker_cache::TickerCache;
use crate::core::types::TradeSide;

/// One order seen by the paper venue
#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub order_id: String,
    pub instrument_id: String,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub status: OrderStatus,
}

pub struct PaperExchangeClient {
    cache: Arc<TickerCache>,
    instruments: Vec<Instrument>,
    /// When true, every order is rejected
    pub should_fail: AtomicBool,
    /// When true, limit sells rest on the book instead of filling
    pub rest_limit_sells: AtomicBool,
    pub order_count: AtomicU64,
    orders: Mutex<Vec<PaperOrder>>,
    resting: Mutex<HashMap<String, usize>>,
}

impl PaperExchangeClient {
    pub fn new(cache: Arc<TickerCache>) -> Self {
        Self {
            cache,
            instruments: Vec::new(),
            should_fail: AtomicBool::new(false),
            rest_limit_sells: AtomicBool::new(false),
            order_count: AtomicU64::new(0),
            orders: Mutex::new(Vec::new()),
            resting: Mutex::new(HashMap::new()),
        }
    }

    /// Listed products returned by `fetch_all_instruments`
    pub fn with_instruments(mut self, ids: &[&str]) -> Self {
        self.instruments = ids.iter().map(|id| Instrument::new(id)).collect();
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_rest_limit_sells(&self, rest: bool) {
        self.rest_limit_sells.store(rest, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<PaperOrder> {
        self.orders.lock().clone()
    }

    pub fn resting_orders(&self) -> usize {
        self.resting.lock().len()
    }

    fn record(&self, order: PaperOrder) {
        let mut orders = self.orders.lock();
        if order.status == OrderStatus::Open {
            self.resting.lock().insert(order.order_id.clone(), orders.len());
        }
        orders.push(order);
    }

    fn check_fail(&self, what: &str) -> ExchangeResult<()> {
        self.order_count.fetch_add(1, Ordering::Relaxed);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ExchangeError::OrderRejected(format!("paper {} rejected", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchangeClient {
    async fn fetch_all_instruments(&self) -> ExchangeResult<Vec<Instrument>> {
        Ok(self.instruments.clone())
    }

    async fn place_market_buy(
        &self,
        instrument_id: &str,
        quote_amount: f64,
    ) -> ExchangeResult<OrderResponse> {
        self.check_fail("market buy")?;
        if !quote_amount.is_finite() || quote_amount <= 0.0 {
            return Err(ExchangeError::OrderRejected(format!(
                "invalid quote amount {}",
                quote_amount
            )));
        }

        let snapshot = self.cache.get(instrument_id).ok_or_else(|| {
            ExchangeError::InvalidResponse(format!("no market price for {}", instrument_id))
        })?;
        let price = if snapshot.ask > 0.0 { snapshot.ask } else { snapshot.price };
        let quantity = quote_amount / price;
        let order_id = Uuid::new_v4().to_string();

        self.record(PaperOrder {
            order_id: order_id.clone(),
            instrument_id: instrument_id.to_string(),
            side: TradeSide::Buy,
            price,
            quantity,
            status: OrderStatus::Filled,
        });
        info!(instrument = %instrument_id, price, quantity, "[PAPER] Market buy filled");

        Ok(OrderResponse {
            order_id,
            instrument_id: instrument_id.to_string(),
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            avg_price: price,
            filled_value: quote_amount,
        })
    }

    async fn place_limit_sell(
        &self,
        instrument_id: &str,
        price: f64,
        quantity: f64,
    ) -> ExchangeResult<OrderResponse> {
        self.check_fail("limit sell")?;
        if price <= 0.0 || quantity <= 0.0 {
            return Err(ExchangeError::OrderRejected(format!(
                "invalid limit sell {} @ {}",
                quantity, price
            )));
        }

        let order_id = Uuid::new_v4().to_string();
        let rest = self.rest_limit_sells.load(Ordering::SeqCst);
        let status = if rest { OrderStatus::Open } else { OrderStatus::Filled };

        self.record(PaperOrder {
            order_id: order_id.clone(),
            instrument_id: instrument_id.to_string(),
            side: TradeSide::Sell,
            price,
            quantity,
            status,
        });
        info!(instrument = %instrument_id, price, quantity, status = ?status, "[PAPER] Limit sell");

        let (filled_quantity, avg_price) = if rest { (0.0, 0.0) } else { (quantity, price) };
        Ok(OrderResponse {
            order_id,
            instrument_id: instrument_id.to_string(),
            status,
            filled_quantity,
            avg_price,
            filled_value: filled_quantity * avg_price,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let index = self
            .resting
            .lock()
            .remove(order_id)
            .ok_or_else(|| ExchangeError::OrderRejected(format!("unknown order {}", order_id)))?;
        if let Some(order) = self.orders.lock().get_mut(index) {
            order.status = OrderStatus::Cancelled;
        }
        info!(order_id = %order_id, "[PAPER] Order cancelled");
        Ok(())
    }
}

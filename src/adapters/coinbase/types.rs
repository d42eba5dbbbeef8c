//! Wire types for the streaming protocol
//!
//! Outbound subscribe/unsubscribe frames and the inbound envelope:
//!
//! ```text
//! {"channel":"ticker_batch","timestamp":"2024-05-01T12:00:00.123Z","sequence_num":42,
//!  "events":[{"type":"update","tickers":[{"product_id":"BTC-USD","price":"64000.1",...}]}]}
//! {"type":"error","message":"authentication failure"}
//! ```
//!
//! Numeric fields arrive as strings (occasionally as numbers). Every ticker
//! and trade is validated here and normalized into the fixed core shapes; an
//! individual bad entry is dropped and counted, a bad frame is rejected whole.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::adapters::errors::ExchangeError;
use crate::core::types::{TickerSnapshot, TradeEvent, TradeSide};

// =============================================================================
// Outbound
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Subscribe / unsubscribe frame
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    pub action: SubscriptionAction,
    pub channel: &'a str,
    #[serde(skip_serializing_if = "no_products")]
    pub product_ids: &'a [String],
    pub jwt: &'a str,
}

fn no_products(ids: &&[String]) -> bool {
    ids.is_empty()
}

impl SubscribeFrame<'_> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Frame-level parse failure; the frame is dropped
#[derive(Error, Debug)]
pub enum MalformedMessage {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has neither channel nor type")]
    Untyped,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Classification of exchange error frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Token rejected: refresh and resubscribe
    Auth,
    /// Too many requests: slow the subscribe pacing
    RateLimit,
    Other,
}

impl ErrorKind {
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("auth") || lower.contains("jwt") || lower.contains("unauthorized") {
            ErrorKind::Auth
        } else if lower.contains("rate limit") || lower.contains("too many") {
            ErrorKind::RateLimit
        } else {
            ErrorKind::Other
        }
    }

    /// The exchange error an error frame of this kind stands for
    pub fn into_error(self, message: String) -> ExchangeError {
        match self {
            ErrorKind::Auth => ExchangeError::AuthenticationFailed(message),
            ErrorKind::RateLimit => ExchangeError::RateLimited(message),
            ErrorKind::Other => ExchangeError::SubscriptionFailed(message),
        }
    }
}

/// A validated inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Tickers {
        sequence: u64,
        snapshots: Vec<TickerSnapshot>,
        /// Entries dropped during validation
        rejected: usize,
    },
    Trades {
        sequence: u64,
        trades: Vec<TradeEvent>,
        rejected: usize,
    },
    Heartbeat {
        sequence: u64,
        counter: u64,
    },
    Subscriptions {
        sequence: u64,
        channels: BTreeMap<String, Vec<String>>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl InboundFrame {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            InboundFrame::Tickers { sequence, .. }
            | InboundFrame::Trades { sequence, .. }
            | InboundFrame::Heartbeat { sequence, .. }
            | InboundFrame::Subscriptions { sequence, .. } => Some(*sequence),
            InboundFrame::Error { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
    sequence_num: Option<u64>,
    timestamp: Option<String>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(default)]
    tickers: Vec<WireTicker>,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    product_id: Option<String>,
    price: Option<Value>,
    best_bid: Option<Value>,
    best_ask: Option<Value>,
    high_24_h: Option<Value>,
    low_24_h: Option<Value>,
    volume_24_h: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TradesEvent {
    #[serde(default)]
    trades: Vec<WireTrade>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    trade_id: Option<Value>,
    product_id: Option<String>,
    price: Option<Value>,
    size: Option<Value>,
    side: Option<String>,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatEvent {
    heartbeat_counter: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionsEvent {
    #[serde(default)]
    subscriptions: BTreeMap<String, Vec<String>>,
}

/// Parse and validate one text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, MalformedMessage> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.kind.as_deref() == Some("error") {
        let message = envelope.message.unwrap_or_default();
        return Ok(InboundFrame::Error {
            kind: ErrorKind::classify(&message),
            message,
        });
    }

    let channel = envelope.channel.as_deref().ok_or(MalformedMessage::Untyped)?;
    let sequence = envelope
        .sequence_num
        .ok_or(MalformedMessage::MissingField("sequence_num"))?;
    let frame_ts = envelope
        .timestamp
        .as_deref()
        .and_then(parse_timestamp_ms)
        .unwrap_or(0);

    match channel {
        "ticker" | "ticker_batch" => {
            let mut snapshots = Vec::new();
            let mut rejected = 0;
            for event in envelope.events {
                let event: TickerEvent = serde_json::from_value(event)?;
                for wire in event.tickers {
                    match normalize_ticker(wire, sequence, frame_ts) {
                        Some(s) => snapshots.push(s),
                        None => rejected += 1,
                    }
                }
            }
            Ok(InboundFrame::Tickers {
                sequence,
                snapshots,
                rejected,
            })
        }
        "market_trades" => {
            let mut trades = Vec::new();
            let mut rejected = 0;
            for event in envelope.events {
                let event: TradesEvent = serde_json::from_value(event)?;
                for wire in event.trades {
                    match normalize_trade(wire, frame_ts) {
                        Some(t) => trades.push(t),
                        None => rejected += 1,
                    }
                }
            }
            Ok(InboundFrame::Trades {
                sequence,
                trades,
                rejected,
            })
        }
        "heartbeats" => {
            let counter = envelope
                .events
                .into_iter()
                .filter_map(|e| serde_json::from_value::<HeartbeatEvent>(e).ok())
                .filter_map(|e| e.heartbeat_counter.as_ref().and_then(parse_u64))
                .last()
                .unwrap_or(0);
            Ok(InboundFrame::Heartbeat { sequence, counter })
        }
        "subscriptions" => {
            let mut channels = BTreeMap::new();
            for event in envelope.events {
                let event: SubscriptionsEvent = serde_json::from_value(event)?;
                channels.extend(event.subscriptions);
            }
            Ok(InboundFrame::Subscriptions { sequence, channels })
        }
        other => Err(MalformedMessage::UnknownChannel(other.to_string())),
    }
}

fn normalize_ticker(wire: WireTicker, sequence: u64, timestamp_ms: u64) -> Option<TickerSnapshot> {
    let instrument_id = wire.product_id.filter(|id| !id.is_empty())?;
    let price = wire.price.as_ref().and_then(parse_f64).filter(|p| *p > 0.0)?;

    Some(TickerSnapshot {
        instrument_id,
        price,
        bid: optional_f64(wire.best_bid.as_ref())?,
        ask: optional_f64(wire.best_ask.as_ref())?,
        high_24h: optional_f64(wire.high_24_h.as_ref())?,
        low_24h: optional_f64(wire.low_24_h.as_ref())?,
        volume_24h: optional_f64(wire.volume_24_h.as_ref())?,
        sequence,
        timestamp_ms,
    })
}

fn normalize_trade(wire: WireTrade, frame_ts: u64) -> Option<TradeEvent> {
    let instrument_id = wire.product_id.filter(|id| !id.is_empty())?;
    let price = wire.price.as_ref().and_then(parse_f64).filter(|p| *p > 0.0)?;
    let size = wire.size.as_ref().and_then(parse_f64).filter(|s| *s > 0.0)?;
    let side = match wire.side.as_deref() {
        Some("BUY") | Some("buy") => TradeSide::Buy,
        Some("SELL") | Some("sell") => TradeSide::Sell,
        _ => return None,
    };
    let trade_id = match wire.trade_id {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let timestamp_ms = wire
        .time
        .as_deref()
        .and_then(parse_timestamp_ms)
        .unwrap_or(frame_ts);

    Some(TradeEvent {
        instrument_id,
        trade_id,
        price,
        size,
        side,
        timestamp_ms,
    })
}

/// Absent is 0; present but unparseable is invalid.
fn optional_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        None | Some(Value::Null) => Some(0.0),
        Some(Value::String(s)) if s.is_empty() => Some(0.0),
        Some(v) => parse_f64(v).filter(|x| *x >= 0.0),
    }
}

fn parse_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn parse_timestamp_ms(ts: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
}

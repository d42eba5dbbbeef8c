//! Configuration types for the bot
//!
//! This module defines all configuration structs that are loaded from YAML.
//! Every section has serde defaults so a minimal file only names what differs.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Most instruments one connection may carry
pub const MAX_BATCH_SIZE: usize = 50;

// ============================================================================
// Ingestion
// ============================================================================

/// Streaming ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Streaming endpoint
    pub ws_url: String,
    /// Maximum instruments per connection
    pub batch_size: usize,
    /// Pause between consecutive subscribe frames on one connection (ms)
    pub subscribe_delay_ms: u64,
    /// Upper bound for the subscribe pacing after rate-limit errors (ms)
    pub max_subscribe_delay_ms: u64,
    /// Pause between opening consecutive connections (ms)
    pub connection_stagger_ms: u64,
    /// First reconnect delay (ms)
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap (ms)
    pub reconnect_max_ms: u64,
    /// Random jitter added to each reconnect delay (ms, exclusive upper bound)
    pub reconnect_jitter_ms: u64,
    /// A dial (TCP, TLS and upgrade) not done within this is abandoned (s)
    pub connect_timeout_secs: u64,
    /// A connection silent for longer than this is torn down (s)
    pub stale_after_secs: u64,
    /// Period of connection health publication (s)
    pub health_interval_secs: u64,
    /// Market-data channel for every instrument
    pub ticker_channel: String,
    /// Real-time channel added for elevated instruments
    pub priority_channel: String,
    /// Public trades channel feeding volume surge detection
    pub trades_channel: String,
    /// Liveness channel subscribed first on every connection
    pub heartbeat_channel: String,
    /// Capacity of the ingestion -> engine event channel
    pub event_channel_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://advanced-trade-ws.coinbase.com".to_string(),
            batch_size: 50,
            subscribe_delay_ms: 250,
            max_subscribe_delay_ms: 5_000,
            connection_stagger_ms: 500,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_ms: 250,
            connect_timeout_secs: 10,
            stale_after_secs: 30,
            health_interval_secs: 60,
            ticker_channel: "ticker_batch".to_string(),
            priority_channel: "ticker".to_string(),
            trades_channel: "market_trades".to_string(),
            heartbeat_channel: "heartbeats".to_string(),
            event_channel_capacity: 4_096,
        }
    }
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.ws_url.starts_with("wss://") && !self.ws_url.starts_with("ws://") {
            return Err(AppError::Config(format!(
                "ingestion.ws_url must be a ws:// or wss:// URL (got {})",
                self.ws_url
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(AppError::Config(format!(
                "ingestion.batch_size must be in 1..={} (got {})",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(AppError::Config(format!(
                "ingestion: reconnect_base_ms ({}) must be > 0 and <= reconnect_max_ms ({})",
                self.reconnect_base_ms, self.reconnect_max_ms
            )));
        }
        if self.subscribe_delay_ms > self.max_subscribe_delay_ms {
            return Err(AppError::Config(format!(
                "ingestion: subscribe_delay_ms ({}) must be <= max_subscribe_delay_ms ({})",
                self.subscribe_delay_ms, self.max_subscribe_delay_ms
            )));
        }
        if self.stale_after_secs == 0 {
            return Err(AppError::Config(
                "ingestion.stale_after_secs must be > 0".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(AppError::Config(
                "ingestion.connect_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Auth
// ============================================================================

/// Streaming token settings. Key material itself comes from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Environment variable holding the API key name
    pub key_name_env: String,
    /// Environment variable holding the EC private key (PEM)
    pub private_key_env: String,
    /// Token lifetime (s)
    pub token_lifetime_secs: u64,
    /// Tokens with less remaining lifetime than this are never handed out (s)
    pub refresh_buffer_secs: u64,
    /// Proactive refresh happens this long before the buffer is reached (s)
    pub refresh_lead_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_name_env: "COINBASE_API_KEY_NAME".to_string(),
            private_key_env: "COINBASE_API_PRIVATE_KEY".to_string(),
            token_lifetime_secs: 120,
            refresh_buffer_secs: 30,
            refresh_lead_secs: 10,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.refresh_buffer_secs + self.refresh_lead_secs >= self.token_lifetime_secs {
            return Err(AppError::Config(format!(
                "auth: refresh_buffer_secs ({}) + refresh_lead_secs ({}) must be < token_lifetime_secs ({})",
                self.refresh_buffer_secs, self.refresh_lead_secs, self.token_lifetime_secs
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Volume surge
// ============================================================================

/// Volume surge detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurgeConfig {
    /// Alert when window volume / historical average exceeds this ratio
    pub threshold: f64,
    /// Sliding window width (s)
    pub window_secs: u64,
    /// Exponential smoothing factor applied to the average after an alert
    pub smoothing_alpha: f64,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            window_secs: 60,
            smoothing_alpha: 0.1,
        }
    }
}

impl SurgeConfig {
    pub fn window_ms(&self) -> u64 {
        self.window_secs * 1_000
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.threshold <= 1.0 {
            return Err(AppError::Config(format!(
                "surge.threshold must be > 1.0 (got {})",
                self.threshold
            )));
        }
        if self.window_secs == 0 {
            return Err(AppError::Config("surge.window_secs must be > 0".to_string()));
        }
        if self.smoothing_alpha <= 0.0 || self.smoothing_alpha > 1.0 {
            return Err(AppError::Config(format!(
                "surge.smoothing_alpha must be in (0, 1] (got {})",
                self.smoothing_alpha
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Which price the trailing exit can never fall below
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingFloor {
    /// Break-even plus the minimum profit target
    MinimumExit,
    /// Round-trip fees only
    BreakEven,
}

/// When the trailing-exit rule may fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingArming {
    /// As soon as the minimum hold time has elapsed
    #[default]
    AfterMinHold,
    /// Also wait until the peak has reached the trailing floor
    PeakAtFloor,
}

/// How a max-hold timeout exit is priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutExit {
    /// Limit sell at the best bid (crosses immediately)
    Marketable,
    /// Limit sell at the last trade price
    LastPrice,
}

/// Entry and exit parameters of the mean-reversion strategy (percentages are 0-100)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Total quote capital available for positions
    pub capital: f64,
    pub entry_fee_pct: f64,
    pub exit_fee_pct: f64,
    /// Profit over break-even required before the trailing floor is reached
    pub min_profit_pct: f64,
    /// Profit over break-even that exits immediately
    pub take_profit_pct: f64,
    /// Distance below entry that exits unconditionally
    pub stop_loss_pct: f64,
    /// Distance below peak of the trailing exit
    pub trailing_pct: f64,
    pub trailing_floor: TrailingFloor,
    pub trailing_arming: TrailingArming,
    pub min_hold_secs: u64,
    pub max_hold_secs: u64,
    pub timeout_exit: TimeoutExit,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            capital: 100.0,
            entry_fee_pct: 0.6,
            exit_fee_pct: 0.4,
            min_profit_pct: 3.0,
            take_profit_pct: 15.0,
            stop_loss_pct: 5.0,
            trailing_pct: 1.5,
            trailing_floor: TrailingFloor::MinimumExit,
            trailing_arming: TrailingArming::AfterMinHold,
            min_hold_secs: 300,
            max_hold_secs: 86_400,
            timeout_exit: TimeoutExit::Marketable,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        let pct_fields = [
            ("entry_fee_pct", self.entry_fee_pct),
            ("exit_fee_pct", self.exit_fee_pct),
            ("min_profit_pct", self.min_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("trailing_pct", self.trailing_pct),
        ];
        for (name, value) in pct_fields {
            if !(0.0..100.0).contains(&value) {
                return Err(AppError::Config(format!(
                    "strategy.{} must be in [0, 100) (got {})",
                    name, value
                )));
            }
        }
        if self.take_profit_pct <= self.min_profit_pct {
            return Err(AppError::Config(format!(
                "strategy: take_profit_pct ({}) must be > min_profit_pct ({})",
                self.take_profit_pct, self.min_profit_pct
            )));
        }
        if self.capital <= 0.0 {
            return Err(AppError::Config(format!(
                "strategy.capital must be > 0 (got {})",
                self.capital
            )));
        }
        if self.min_hold_secs > self.max_hold_secs {
            return Err(AppError::Config(format!(
                "strategy: min_hold_secs ({}) must be <= max_hold_secs ({})",
                self.min_hold_secs, self.max_hold_secs
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Entry policy
// ============================================================================

/// Automatic entry on volume surges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryPolicyConfig {
    pub enabled: bool,
    /// Quote amount spent per entry
    pub quote_amount: f64,
    pub max_open_positions: usize,
    /// Minimum surge ratio that qualifies
    pub min_surge_ratio: f64,
    /// Price must sit at least this far below the 24h high (%)
    pub min_dip_pct: f64,
}

impl Default for EntryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quote_amount: 10.0,
            max_open_positions: 3,
            min_surge_ratio: 3.0,
            min_dip_pct: 5.0,
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Position store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file path; positions are kept in memory only when unset
    pub path: Option<String>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Closed positions kept in memory and in saved snapshots
    pub archive_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retry_attempts: 5,
            retry_delay_ms: 500,
            archive_limit: 500,
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub ingestion: IngestionConfig,
    pub auth: AuthConfig,
    pub surge: SurgeConfig,
    pub strategy: StrategyConfig,
    pub entry: EntryPolicyConfig,
    pub store: StoreConfig,
    /// Explicit monitoring universe; fetched from the exchange when empty
    pub instruments: Vec<String>,
}

impl AppConfig {
    /// Validate all configuration rules
    pub fn validate(&self) -> Result<(), AppError> {
        self.ingestion.validate()?;
        self.auth.validate()?;
        self.surge.validate()?;
        self.strategy.validate()?;

        if self.entry.enabled {
            if self.entry.quote_amount <= 0.0 {
                return Err(AppError::Config(format!(
                    "entry.quote_amount must be > 0 (got {})",
                    self.entry.quote_amount
                )));
            }
            if self.entry.max_open_positions == 0 {
                return Err(AppError::Config(
                    "entry.max_open_positions must be > 0".to_string(),
                ));
            }
        }

        if self.instruments.iter().any(|i| i.trim().is_empty()) {
            return Err(AppError::Config(
                "instruments must not contain empty identifiers".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

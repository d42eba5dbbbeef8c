//! Configuration module for bot settings and YAML loading
//!
//! This module provides:
//! - Configuration types (`AppConfig` and one struct per section)
//! - YAML loading functionality (`load_config`)
//! - Logging initialization (`logging::init_logging`)

mod loader;
pub mod logging;
mod types;

// Re-export types
pub use types::{
    AppConfig, AuthConfig, EntryPolicyConfig, IngestionConfig, StoreConfig, StrategyConfig,
    SurgeConfig, TimeoutExit, TrailingArming, TrailingFloor, MAX_BATCH_SIZE,
};

// Re-export loader functions
pub use loader::{load_config, load_config_from_str};

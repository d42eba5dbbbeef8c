//! Configuration loader for YAML files
//!
//! This module handles loading and validating configuration from YAML files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::AppError;

use super::types::AppConfig;

/// Load configuration from a YAML file
///
/// This function:
/// 1. Checks if the file exists
/// 2. Parses the YAML content (missing sections fall back to defaults)
/// 3. Validates the configuration rules
///
/// # Example
/// ```ignore
/// use std::path::Path;
/// use surge_bot::config::load_config;
///
/// let config = load_config(Path::new("config.yaml"))?;
/// ```
pub fn load_config(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Err(AppError::Config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let config: AppConfig = serde_yaml::from_reader(reader).map_err(|e| {
        AppError::Config(format!(
            "YAML parse error in '{}': {}",
            path.display(),
            e
        ))
    })?;

    config.validate()?;

    Ok(config)
}

/// Load configuration from a YAML string (useful for testing)
pub fn load_config_from_str(yaml_content: &str) -> Result<AppConfig, AppError> {
    let config: AppConfig = serde_yaml::from_str(yaml_content)
        .map_err(|e| AppError::Config(format!("YAML parse error: {}", e)))?;

    config.validate()?;

    Ok(config)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TimeoutExit, TrailingFloor};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID_CONFIG_YAML: &str = r#"
ingestion:
  batch_size: 25
  reconnect_base_ms: 500
  reconnect_max_ms: 30000
auth:
  token_lifetime_secs: 120
  refresh_buffer_secs: 30
surge:
  threshold: 4.0
  window_secs: 120
strategy:
  capital: 250.0
  trailing_pct: 2.0
  trailing_floor: break_even
  timeout_exit: last_price
entry:
  enabled: true
  quote_amount: 20.0
  max_open_positions: 2
store:
  path: data/positions.json
instruments:
  - BTC-USD
  - ETH-USD
"#;

    #[test]
    fn test_load_config_from_str_valid() {
        let config = load_config_from_str(VALID_CONFIG_YAML).unwrap();
        assert_eq!(config.ingestion.batch_size, 25);
        assert_eq!(config.ingestion.reconnect_base_ms, 500);
        assert_eq!(config.surge.threshold, 4.0);
        assert_eq!(config.surge.window_ms(), 120_000);
        assert_eq!(config.strategy.trailing_floor, TrailingFloor::BreakEven);
        assert_eq!(config.strategy.timeout_exit, TimeoutExit::LastPrice);
        assert!(config.entry.enabled);
        assert_eq!(config.store.path.as_deref(), Some("data/positions.json"));
        assert_eq!(config.instruments, vec!["BTC-USD", "ETH-USD"]);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = load_config_from_str("instruments: [DOGE-USD]").unwrap();
        assert_eq!(config.ingestion.batch_size, 50);
        assert_eq!(config.ingestion.ticker_channel, "ticker_batch");
        assert_eq!(config.auth.token_lifetime_secs, 120);
        assert_eq!(config.strategy.stop_loss_pct, 5.0);
        assert!(!config.entry.enabled);
    }

    #[test]
    fn test_load_config_from_str_invalid_yaml() {
        let result = load_config_from_str("invalid: yaml: content: [");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("YAML parse error"));
    }

    #[test]
    fn test_load_config_from_str_validation_failure() {
        let yaml = r#"
ingestion:
  batch_size: 0
"#;
        let result = load_config_from_str(yaml);
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_unknown_trailing_floor_rejected() {
        let yaml = r#"
strategy:
  trailing_floor: somewhere
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.yaml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Configuration file not found"));
    }

    #[test]
    fn test_load_config_from_file_valid() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(VALID_CONFIG_YAML.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.strategy.capital, 250.0);
    }

    #[test]
    fn test_load_config_from_file_invalid_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"invalid: [yaml: content").unwrap();
        temp_file.flush().unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("YAML parse error"));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.yaml");
        let config = load_config(&path).unwrap();
        assert!(!config.entry.enabled);
        assert_eq!(config.instruments.len(), 4);
    }
}

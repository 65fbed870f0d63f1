//! Escrow CLI Configuration Management
//!
//! Configuration is read from a TOML file given with `--config`, or from
//! `escrow/config.toml` in the platform config directory when that exists.
//! Missing sections fall back to their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use escrow_core::config::EngineConfig;
use escrow_core::types::{Coin, COIN};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CliError, Result};

const CONFIG_DIR: &str = "escrow";
const CONFIG_FILE: &str = "config.toml";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the escrow CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    /// Engine settings shared by every simulated node
    pub engine: EngineConfig,
    pub simulation: SimulationConfig,
}

/// Settings of the in-process simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// How long one protocol step may take before the simulation gives up
    pub step_timeout_secs: u64,
    /// Market price the nodes' price feeds report for the offer currency
    pub market_price: f64,
    /// Trade id of the simulated offer
    pub trade_id: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 15,
            market_price: 50_000.0,
            trade_id: "sim-1".to_string(),
        }
    }
}

impl SimulationConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for CliAppConfig {
    fn default() -> Self {
        let mut engine = EngineConfig::testing();
        // Simulated accounts carry no aged witness
        engine.account_age.small_trade_limit = Coin::from_sat(21_000_000 * COIN);
        Self {
            engine,
            simulation: SimulationConfig::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load from an explicit path, else from the platform config file, else defaults
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                info!("Loading configuration from: {}", path);
                Self::load_from_file(path)
            }
            None => match Self::default_config_path() {
                Some(path) if path.exists() => {
                    info!("Loading configuration from: {}", path.display());
                    Self::load_from_file(&path)
                }
                _ => {
                    info!("Using default configuration");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CliAppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/escrow/config.toml`, if the platform has a config dir
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.simulation.step_timeout_secs == 0 {
            return Err(CliError::Config(
                "simulation step timeout must be greater than 0".to_string(),
            ));
        }
        if !(self.simulation.market_price.is_finite() && self.simulation.market_price > 0.0) {
            return Err(CliError::Config(format!(
                "invalid market price {}",
                self.simulation.market_price
            )));
        }
        if self.simulation.trade_id.is_empty() {
            return Err(CliError::Config("trade id must not be empty".to_string()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CliAppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.protocol.fee_unlock_confirmations, 2);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CliAppConfig::from_toml(
            r#"
            [simulation]
            market_price = 61000.5

            [engine.dispute]
            mirror_delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.simulation.market_price, 61_000.5);
        assert_eq!(config.simulation.step_timeout_secs, 15);
        assert_eq!(config.engine.dispute.mirror_delay_ms, 250);
        assert_eq!(config.engine.dispute.price_info_max_retries, 3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            CliAppConfig::from_toml("[simulation]\nstep_timeout_secs = 0\n"),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            CliAppConfig::from_toml("[engine.channels]\nevent_buffer_size = 0\n"),
            Err(CliError::Engine(_))
        ));
        assert!(matches!(
            CliAppConfig::from_toml("[simulation\n"),
            Err(CliError::TomlParsing(_))
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("escrow-cli-{}", std::process::id()))
            .join(CONFIG_FILE);
        let mut config = CliAppConfig::default();
        config.simulation.trade_id = "saved".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = CliAppConfig::load(path.to_str()).unwrap();
        assert_eq!(loaded.simulation.trade_id, "saved");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(matches!(
            CliAppConfig::load(Some("/nonexistent/escrow.toml")),
            Err(CliError::Io(_))
        ));
    }
}

//! Centralized Configuration Management
//!
//! All configuration structures used by the engine, with serde support so a
//! complete `EngineConfig` can be loaded from a TOML file.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{EscrowError, EscrowResult};
use crate::types::{Coin, NodeAddress, TradeId};

// ----------------------------------------------------------------------------
// Node Configuration
// ----------------------------------------------------------------------------

/// Network identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address this node is reachable under
    pub address: NodeAddress,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: NodeAddress::new("localhost", 9999),
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Configuration
// ----------------------------------------------------------------------------

/// Configuration for pipeline execution and the multisig reservation flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Interval between ready-to-fund requests once the fee tx unlocked
    pub multisig_request_interval_secs: u64,
    /// Confirmations after which a fee transaction counts as unlocked
    pub fee_unlock_confirmations: u32,
    /// Whether per-transition pipeline timeouts are enforced
    pub enforce_timeouts: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            multisig_request_interval_secs: 60,
            fee_unlock_confirmations: 10,
            enforce_timeouts: true,
        }
    }
}

impl ProtocolConfig {
    pub fn multisig_request_interval(&self) -> Duration {
        Duration::from_secs(self.multisig_request_interval_secs)
    }
}

// ----------------------------------------------------------------------------
// Dispute Configuration
// ----------------------------------------------------------------------------

/// Configuration for the dispute manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputeConfig {
    /// Delay before the agent mirrors a dispute to the counterparty
    pub mirror_delay_ms: u64,
    /// How often the price-info message is retried while the feed has no data
    pub price_info_max_retries: u32,
    /// Delay between price-info retries
    pub price_info_retry_delay_secs: u64,
    /// Minimum refund a trader keeps at a mediated payout
    pub min_refund_at_mediated_dispute: Coin,
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            mirror_delay_ms: 100,
            price_info_max_retries: 3,
            price_info_retry_delay_secs: 10,
            min_refund_at_mediated_dispute: Coin::from_sat(300_000),
        }
    }
}

impl DisputeConfig {
    pub fn mirror_delay(&self) -> Duration {
        Duration::from_millis(self.mirror_delay_ms)
    }

    pub fn price_info_retry_delay(&self) -> Duration {
        Duration::from_secs(self.price_info_retry_delay_secs)
    }
}

// ----------------------------------------------------------------------------
// Filter Configuration
// ----------------------------------------------------------------------------

/// Network filter applied by the `ApplyFilter` task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub banned_node_addresses: Vec<NodeAddress>,
    pub banned_offer_ids: Vec<TradeId>,
    pub banned_payment_methods: Vec<String>,
}

impl FilterConfig {
    pub fn is_node_banned(&self, address: &NodeAddress) -> bool {
        self.banned_node_addresses.contains(address)
    }

    pub fn is_offer_banned(&self, trade_id: &TradeId) -> bool {
        self.banned_offer_ids.contains(trade_id)
    }

    pub fn is_payment_method_banned(&self, method: &str) -> bool {
        self.banned_payment_methods.iter().any(|m| m == method)
    }
}

// ----------------------------------------------------------------------------
// Account Age Configuration
// ----------------------------------------------------------------------------

/// Limits enforced by the account-age witness verifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountAgeConfig {
    /// Trades up to this amount need no aged witness
    pub small_trade_limit: Coin,
    /// Minimum witness age in days for larger trades
    pub min_age_days: u64,
}

impl Default for AccountAgeConfig {
    fn default() -> Self {
        Self {
            small_trade_limit: Coin::from_sat(1_000_000),
            min_age_days: 30,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the engine's channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub command_buffer_size: usize,
    pub event_buffer_size: usize,
    pub effect_buffer_size: usize,
    pub app_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 256,
            event_buffer_size: 1024,
            effect_buffer_size: 1024,
            app_event_buffer_size: 512,
        }
    }
}

impl ChannelConfig {
    /// Small buffers for unit tests
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 100,
            event_buffer_size: 100,
            effect_buffer_size: 100,
            app_event_buffer_size: 100,
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node: NodeConfig,
    pub protocol: ProtocolConfig,
    pub dispute: DisputeConfig,
    pub filter: FilterConfig,
    pub account_age: AccountAgeConfig,
    pub channels: ChannelConfig,
}

impl EngineConfig {
    /// Configuration for tests: small buffers, short fee unlock and no account-age floor
    pub fn testing() -> Self {
        Self {
            node: NodeConfig::default(),
            protocol: ProtocolConfig {
                multisig_request_interval_secs: 60,
                fee_unlock_confirmations: 2,
                enforce_timeouts: true,
            },
            dispute: DisputeConfig::default(),
            filter: FilterConfig::default(),
            account_age: AccountAgeConfig {
                small_trade_limit: Coin::from_sat(u64::MAX),
                min_age_days: 0,
            },
            channels: ChannelConfig::testing(),
        }
    }

    pub fn with_address(mut self, address: NodeAddress) -> Self {
        self.node.address = address;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> EscrowResult<()> {
        let channels = &self.channels;
        if channels.command_buffer_size == 0
            || channels.event_buffer_size == 0
            || channels.effect_buffer_size == 0
            || channels.app_event_buffer_size == 0
        {
            return Err(EscrowError::configuration("channel buffer sizes must be non-zero"));
        }
        if self.protocol.multisig_request_interval_secs == 0 {
            return Err(EscrowError::configuration(
                "multisig request interval must be non-zero",
            ));
        }
        if self.dispute.price_info_retry_delay_secs == 0 && self.dispute.price_info_max_retries > 0 {
            return Err(EscrowError::configuration(
                "price info retries need a non-zero delay",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let mut config = EngineConfig::default();
        config.channels.effect_buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(EscrowError::Configuration { .. })
        ));
    }

    #[test]
    fn test_dispute_defaults() {
        let config = DisputeConfig::default();
        assert_eq!(config.mirror_delay(), Duration::from_millis(100));
        assert_eq!(config.price_info_max_retries, 3);
        assert_eq!(config.price_info_retry_delay(), Duration::from_secs(10));
        assert_eq!(config.min_refund_at_mediated_dispute, Coin::from_sat(300_000));
    }

    #[test]
    fn test_filter_lookup() {
        let filter = FilterConfig {
            banned_node_addresses: vec![NodeAddress::new("evil", 1)],
            banned_offer_ids: vec![],
            banned_payment_methods: vec!["CASH_BY_MAIL".to_string()],
        };
        assert!(filter.is_node_banned(&NodeAddress::new("evil", 1)));
        assert!(!filter.is_node_banned(&NodeAddress::new("good", 1)));
        assert!(filter.is_payment_method_banned("CASH_BY_MAIL"));
        assert!(!filter.is_offer_banned(&TradeId::from("abc")));
    }
}

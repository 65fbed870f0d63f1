//! Collaborator interfaces consumed by the engine
//!
//! The messaging gateway, price feed and account-age witness service are
//! external. The engine only talks to them through these traits so tests can
//! substitute in-memory implementations.

use serde::{Deserialize, Serialize};

use crate::config::AccountAgeConfig;
use crate::errors::TransportError;
use crate::message::NetworkEnvelope;
use crate::trade::{AccountAgeWitness, Offer, PaymentAccount};
use crate::types::{Coin, NodeAddress, Price, PubKeyRing, Timestamp};

// ----------------------------------------------------------------------------
// Messaging Gateway
// ----------------------------------------------------------------------------

/// Outbound side of the peer-to-peer transport
///
/// `send_mailbox` hands the envelope to the transport and returns
/// immediately. The tri-state outcome (arrived, stored in mailbox, fault)
/// comes back later as a delivery report keyed by the envelope uid.
pub trait MessagingGateway: Send + Sync {
    fn send_mailbox(
        &self,
        recipient: &NodeAddress,
        recipient_key: &PubKeyRing,
        envelope: NetworkEnvelope,
    ) -> Result<(), TransportError>;

    fn publish_trade_statistics(&self, statistics: TradeStatistics) -> Result<(), TransportError>;
}

/// Anonymised trade data published to the network after the deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub currency: String,
    pub price: Price,
    pub amount: Coin,
    pub payment_method: String,
    pub date: Timestamp,
    pub offer_hash: String,
}

// ----------------------------------------------------------------------------
// Price Feed
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MarketPrice {
    pub currency: String,
    pub price: f64,
    pub is_recent_external_price_available: bool,
}

pub trait PriceFeed: Send + Sync {
    /// Whether the feed received any data yet
    fn has_prices(&self) -> bool;

    fn market_price(&self, currency: &str) -> Option<MarketPrice>;

    /// Recent market price as a scaled [`Price`], if available
    fn price(&self, currency: &str) -> Option<Price> {
        let market = self.market_price(currency)?;
        if !market.is_recent_external_price_available {
            return None;
        }
        Price::from_market(currency, market.price)
    }
}

// ----------------------------------------------------------------------------
// Account Age Witness
// ----------------------------------------------------------------------------

pub trait AccountAgeWitnessService: Send + Sync {
    /// Check that the peer's payment account is allowed to trade this offer
    fn verify_peers_account_age(
        &self,
        offer: &Offer,
        trade_amount: Coin,
        peer_account: &PaymentAccount,
        witness: Option<&AccountAgeWitness>,
        now: Timestamp,
    ) -> Result<(), String>;
}

/// Requires an aged witness for trades above a small-trade limit
#[derive(Debug, Clone)]
pub struct AgeLimitedWitnessVerifier {
    config: AccountAgeConfig,
}

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

impl AgeLimitedWitnessVerifier {
    pub fn new(config: AccountAgeConfig) -> Self {
        Self { config }
    }
}

impl AccountAgeWitnessService for AgeLimitedWitnessVerifier {
    fn verify_peers_account_age(
        &self,
        offer: &Offer,
        trade_amount: Coin,
        peer_account: &PaymentAccount,
        witness: Option<&AccountAgeWitness>,
        now: Timestamp,
    ) -> Result<(), String> {
        if peer_account.payment_method != offer.payment_method {
            return Err(format!(
                "Peer payment method {} does not match offer payment method {}",
                peer_account.payment_method, offer.payment_method
            ));
        }
        if trade_amount <= self.config.small_trade_limit {
            return Ok(());
        }
        let witness = witness.ok_or_else(|| {
            format!(
                "Trade amount {} requires an account age witness",
                trade_amount
            )
        })?;
        let age_days = now.as_millis().saturating_sub(witness.date.as_millis()) / DAY_MS;
        if age_days < self.config.min_age_days {
            return Err(format!(
                "Peer account is {} days old, {} required for amount {}",
                age_days, self.config.min_age_days, trade_amount
            ));
        }
        Ok(())
    }
}

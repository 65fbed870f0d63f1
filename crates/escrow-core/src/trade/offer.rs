//! Offer terms and payment account data

use serde::{Deserialize, Serialize};

use crate::trade::state::Direction;
use crate::types::{Coin, NodeAddress, Price, PubKeyRing, Timestamp, TradeId, TxId, Volume};

/// How the deposit is funded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepositScheme {
    /// Jointly signed deposit plus pre-signed delayed payout
    #[default]
    Classic,
    /// Both parties fund a multisig wallet after reserving the trade
    Multisig,
}

/// Network identity of a dispute agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentInfo {
    pub node_address: NodeAddress,
    pub pub_key_ring: PubKeyRing,
}

/// Payment account data shared with the trading peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentAccount {
    pub payment_method: String,
    pub account_id: String,
    pub holder_name: String,
}

impl PaymentAccount {
    pub fn new(
        payment_method: impl Into<String>,
        account_id: impl Into<String>,
        holder_name: impl Into<String>,
    ) -> Self {
        Self {
            payment_method: payment_method.into(),
            account_id: account_id.into(),
            holder_name: holder_name.into(),
        }
    }
}

/// Signed age proof of a payment account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountAgeWitness {
    pub hash: String,
    pub date: Timestamp,
}

/// Terms of the offer as published by the maker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: TradeId,
    pub maker_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    /// Direction of the maker
    pub direction: Direction,
    pub amount: Coin,
    pub price: Price,
    pub use_market_based_price: bool,
    pub market_price_margin: f64,
    pub payment_method: String,
    pub buyer_security_deposit: Coin,
    pub seller_security_deposit: Coin,
    pub maker_fee: Coin,
    pub maker_fee_tx_id: TxId,
    pub taker_fee: Coin,
    pub tx_fee: Coin,
    /// Address trade fees are paid to
    pub fee_address: String,
    pub deposit_scheme: DepositScheme,
    pub mediator: AgentInfo,
    pub refund_agent: AgentInfo,
    pub date: Timestamp,
}

impl Offer {
    pub fn currency(&self) -> &str {
        &self.price.currency
    }

    pub fn volume(&self) -> Volume {
        self.price.volume_by_amount(self.amount)
    }
}

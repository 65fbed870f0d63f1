//! Immutable snapshot of the agreed trade terms
//!
//! Both parties sign the SHA-256 hash of the contract's JSON serialization.
//! Disputes carry a copy of the contract so the agent can resolve addresses
//! and keys of both traders.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256_hex, verify_signature, KeyRing};
use crate::errors::EscrowResult;
use crate::trade::offer::{AgentInfo, Offer, PaymentAccount};
use crate::types::{Coin, NodeAddress, Price, PubKeyRing, TxId, Volume};

/// One side of the contract
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractParty {
    pub node_address: NodeAddress,
    pub pub_key_ring: PubKeyRing,
    pub payment_account: PaymentAccount,
    pub payout_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub offer: Offer,
    pub trade_amount: Coin,
    pub trade_price: Price,
    pub taker_fee_tx_id: Option<TxId>,
    pub maker_is_buyer: bool,
    pub buyer: ContractParty,
    pub seller: ContractParty,
    pub mediator: AgentInfo,
    pub refund_agent: AgentInfo,
    pub lock_time: u32,
}

impl Contract {
    /// Hex SHA-256 over the canonical JSON form
    pub fn hash(&self) -> EscrowResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(sha256_hex(&json))
    }

    pub fn sign(&self, keys: &KeyRing) -> EscrowResult<String> {
        Ok(keys.sign(self.hash()?.as_bytes()))
    }

    pub fn verify(&self, key: &PubKeyRing, signature: &str) -> EscrowResult<bool> {
        Ok(verify_signature(key, self.hash()?.as_bytes(), signature))
    }

    pub fn trade_volume(&self) -> Volume {
        self.trade_price.volume_by_amount(self.trade_amount)
    }

    pub fn maker(&self) -> &ContractParty {
        if self.maker_is_buyer {
            &self.buyer
        } else {
            &self.seller
        }
    }

    pub fn taker(&self) -> &ContractParty {
        if self.maker_is_buyer {
            &self.seller
        } else {
            &self.buyer
        }
    }

    /// Contract party that owns the given key, if any
    pub fn party_of(&self, key: &PubKeyRing) -> Option<&ContractParty> {
        if &self.buyer.pub_key_ring == key {
            Some(&self.buyer)
        } else if &self.seller.pub_key_ring == key {
            Some(&self.seller)
        } else {
            None
        }
    }

    pub fn is_buyer_key(&self, key: &PubKeyRing) -> bool {
        &self.buyer.pub_key_ring == key
    }
}

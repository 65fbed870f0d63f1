//! Wallet collaborator interface
//!
//! The engine never builds transactions itself. It asks the wallet to create,
//! sign, broadcast and look up transactions, and subscribes to balance changes
//! when it has to wait for an on-chain condition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::crypto::{sha256_hex, verify_signature};
use crate::errors::WalletError;
use crate::types::{Coin, PubKeyRing, TradeId, TxId};

// ----------------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------------

/// Purpose of a transaction within a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    TakerFee,
    Deposit,
    DelayedPayout,
    Payout,
    MultisigFunding,
}

impl TxKind {
    /// Number of signatures needed before the transaction may be broadcast
    pub fn required_signatures(&self) -> usize {
        match self {
            TxKind::TakerFee | TxKind::MultisigFunding => 1,
            TxKind::Deposit | TxKind::DelayedPayout | TxKind::Payout => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: Coin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub signer: PubKeyRing,
    pub signature: String,
}

/// Parameters for a transaction the wallet should create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub kind: TxKind,
    pub trade_id: TradeId,
    /// Transactions whose outputs are spent
    pub inputs: Vec<TxId>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

/// A transaction as exchanged between the parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx {
    pub kind: TxKind,
    pub trade_id: TradeId,
    pub inputs: Vec<TxId>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub signatures: Vec<TxSignature>,
}

#[derive(Serialize)]
struct UnsignedView<'a> {
    kind: TxKind,
    trade_id: &'a TradeId,
    inputs: &'a [TxId],
    outputs: &'a [TxOutput],
    lock_time: u32,
}

impl RawTx {
    pub fn from_request(request: TxRequest) -> Self {
        Self {
            kind: request.kind,
            trade_id: request.trade_id,
            inputs: request.inputs,
            outputs: request.outputs,
            lock_time: request.lock_time,
            signatures: Vec::new(),
        }
    }

    /// Bytes covered by signatures (everything but the signatures)
    pub fn sighash(&self) -> Vec<u8> {
        let view = UnsignedView {
            kind: self.kind,
            trade_id: &self.trade_id,
            inputs: &self.inputs,
            outputs: &self.outputs,
            lock_time: self.lock_time,
        };
        // Serializing plain data into a Vec cannot fail
        serde_json::to_vec(&view).unwrap_or_default()
    }

    pub fn tx_id(&self) -> TxId {
        TxId::new(sha256_hex(&self.sighash()))
    }

    pub fn is_signed_by(&self, key: &PubKeyRing) -> bool {
        let sighash = self.sighash();
        self.signatures
            .iter()
            .any(|s| &s.signer == key && verify_signature(key, &sighash, &s.signature))
    }

    /// Count of distinct valid signatures
    pub fn valid_signature_count(&self) -> usize {
        let sighash = self.sighash();
        let mut signers: Vec<&PubKeyRing> = self
            .signatures
            .iter()
            .filter(|s| verify_signature(&s.signer, &sighash, &s.signature))
            .map(|s| &s.signer)
            .collect();
        signers.sort_by_key(|k| *k.signature_pub_key());
        signers.dedup();
        signers.len()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.valid_signature_count() >= self.kind.required_signatures()
    }

    /// Merge signatures of another copy of the same transaction
    pub fn merge_signatures(&mut self, other: &RawTx) -> Result<(), WalletError> {
        if self.tx_id() != other.tx_id() {
            return Err(WalletError::SigningFailed {
                reason: "cannot merge signatures of different transactions".to_string(),
            });
        }
        for signature in &other.signatures {
            if !self.signatures.contains(signature) {
                self.signatures.push(signature.clone());
            }
        }
        Ok(())
    }

    pub fn output_to(&self, address: &str) -> Option<Coin> {
        self.outputs
            .iter()
            .find(|o| o.address == address)
            .map(|o| o.amount)
    }

    pub fn total_output(&self) -> Coin {
        Coin::from_sat(self.outputs.iter().map(|o| o.amount.sat()).sum())
    }
}

/// Wallet view of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTx {
    pub tx_id: TxId,
    pub kind: TxKind,
    pub amount: Coin,
    pub confirmations: u32,
}

impl WalletTx {
    pub fn is_unlocked(&self, required_confirmations: u32) -> bool {
        self.confirmations >= required_confirmations
    }
}

/// Notification that wallet balances may have changed (new block or tx)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub height: u64,
}

// ----------------------------------------------------------------------------
// Wallet Trait
// ----------------------------------------------------------------------------

/// Wallet operations the protocol invokes
#[async_trait]
pub trait TradeWallet: Send + Sync {
    /// Create and fund a transaction from the request
    async fn create_transaction(&self, request: TxRequest) -> Result<RawTx, WalletError>;

    /// Add our own signature to the transaction
    async fn sign_transaction(&self, tx: RawTx) -> Result<RawTx, WalletError>;

    /// Broadcast a fully signed transaction
    async fn broadcast_transaction(&self, tx: &RawTx) -> Result<TxId, WalletError>;

    /// Look up a transaction known to the chain
    async fn get_transaction(&self, tx_id: &TxId) -> Result<Option<WalletTx>, WalletError>;

    /// Prepare our multisig participant info for a trade
    async fn prepare_multisig(&self, trade_id: &TradeId) -> Result<String, WalletError>;

    /// Fresh receive address for the given trade
    fn address_for(&self, trade_id: &TradeId) -> String;

    /// Subscribe to balance-change notifications
    fn subscribe_balance_changes(&self) -> broadcast::Receiver<BalanceUpdate>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyRing;

    fn deposit() -> RawTx {
        RawTx::from_request(TxRequest {
            kind: TxKind::Deposit,
            trade_id: TradeId::from("t1"),
            inputs: vec![TxId::new("in")],
            outputs: vec![TxOutput {
                address: "multisig".into(),
                amount: Coin::from_sat(1_000),
            }],
            lock_time: 0,
        })
    }

    fn sign(tx: &mut RawTx, keys: &KeyRing) {
        let signature = keys.sign(&tx.sighash());
        tx.signatures.push(TxSignature {
            signer: keys.pub_key_ring(),
            signature,
        });
    }

    #[test]
    fn test_signatures_do_not_change_tx_id() {
        let mut tx = deposit();
        let id = tx.tx_id();
        sign(&mut tx, &KeyRing::from_seed([1; 32]));
        assert_eq!(tx.tx_id(), id);
    }

    #[test]
    fn test_fully_signed_needs_distinct_signers() {
        let a = KeyRing::from_seed([1; 32]);
        let b = KeyRing::from_seed([2; 32]);
        let mut tx = deposit();
        sign(&mut tx, &a);
        sign(&mut tx, &a);
        assert!(!tx.is_fully_signed());

        let mut other = deposit();
        sign(&mut other, &b);
        tx.merge_signatures(&other).unwrap();
        assert!(tx.is_fully_signed());
        assert!(tx.is_signed_by(&a.pub_key_ring()));
        assert!(tx.is_signed_by(&b.pub_key_ring()));
    }
}

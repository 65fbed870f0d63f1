//! Per-trade working state shared by the tasks of a pipeline
//!
//! Tasks read the pending message and peer data from here and write back
//! what later steps need. Flags guarding irreversible actions are set by the
//! task performing the action before it reports success.
//!
//! Field ownership by pipeline stage:
//! - `trade_message`: written by the engine before a message pipeline, read by
//!   the `*Process*` tasks.
//! - `peer`: written by the process tasks and the condition matcher, read by
//!   verification and send tasks.
//! - prepared transactions: written by create/sign tasks, read by the
//!   finalize/publish tasks of the same or a later pipeline.
//! - flags: written only by the task performing the guarded action.

use serde::{Deserialize, Serialize};

use crate::delivery::SentMessage;
use crate::message::TradeMessage;
use crate::trade::contract::Contract;
use crate::trade::offer::{AccountAgeWitness, PaymentAccount};
use crate::types::{NodeAddress, PubKeyRing, Uid};
use crate::wallet::RawTx;

/// Data known about the trading peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingPeer {
    pub node_address: Option<NodeAddress>,
    pub pub_key_ring: Option<PubKeyRing>,
    pub payment_account: Option<PaymentAccount>,
    pub payout_address: Option<String>,
    pub account_age_witness: Option<AccountAgeWitness>,
    pub contract_signature: Option<String>,
    pub multisig_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    /// Inbound message the current pipeline works on
    pub trade_message: Option<TradeMessage>,
    pub peer: TradingPeer,
    /// Sender address of the first message, before it is confirmed
    pub temp_peer_address: Option<NodeAddress>,
    pub my_payment_account: PaymentAccount,
    pub my_payout_address: Option<String>,
    pub my_account_age_witness: Option<AccountAgeWitness>,
    pub my_multisig_info: Option<String>,
    /// Contract received from the maker, not yet verified
    pub proposed_contract: Option<Contract>,

    pub taker_fee_tx: Option<RawTx>,
    pub prepared_deposit_tx: Option<RawTx>,
    pub prepared_delayed_payout_tx: Option<RawTx>,
    pub prepared_payout_tx: Option<RawTx>,

    pub fee_tx_initiated: bool,
    pub maker_ready_to_fund_multisig: bool,
    pub multisig_setup_complete: bool,
    pub multisig_deposit_initiated: bool,

    /// Uids of inbound messages admitted to a pipeline
    pub processed_uids: Vec<Uid>,
    pub sent_messages: Vec<SentMessage>,
}

impl ProcessModel {
    pub fn new(my_payment_account: PaymentAccount) -> Self {
        Self {
            trade_message: None,
            peer: TradingPeer::default(),
            temp_peer_address: None,
            my_payment_account,
            my_payout_address: None,
            my_account_age_witness: None,
            my_multisig_info: None,
            proposed_contract: None,
            taker_fee_tx: None,
            prepared_deposit_tx: None,
            prepared_delayed_payout_tx: None,
            prepared_payout_tx: None,
            fee_tx_initiated: false,
            maker_ready_to_fund_multisig: false,
            multisig_setup_complete: false,
            multisig_deposit_initiated: false,
            processed_uids: Vec::new(),
            sent_messages: Vec::new(),
        }
    }

    pub fn is_processed(&self, uid: &Uid) -> bool {
        self.processed_uids.contains(uid)
    }

    pub fn mark_processed(&mut self, uid: Uid) {
        if !self.is_processed(&uid) {
            self.processed_uids.push(uid);
        }
    }

    pub fn sent_message(&self, uid: &Uid) -> Option<&SentMessage> {
        self.sent_messages.iter().find(|m| &m.uid == uid)
    }

    pub fn sent_message_mut(&mut self, uid: &Uid) -> Option<&mut SentMessage> {
        self.sent_messages.iter_mut().find(|m| &m.uid == uid)
    }

    /// Whether a message of the given kind was already handed to the transport
    pub fn has_sent(&self, kind: &str) -> bool {
        self.sent_messages.iter().any(|m| m.kind == kind)
    }
}

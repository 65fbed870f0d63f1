//! Dispute tickets, chat messages and results
//!
//! A [`Dispute`] is keyed by `(trade id, trader id)`: the buyer's and the
//! seller's tickets for the same trade are distinct records that reference
//! the same contract.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::delivery::{AckState, DeliveryOutcome, DeliveryState};
use crate::trade::Contract;
use crate::types::{Coin, NodeAddress, PubKeyRing, Timestamp, TradeId, TraderId, TxId, Uid};

// ----------------------------------------------------------------------------
// Support Type and Lifecycle
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportType {
    Mediation,
    Arbitration,
    Refund,
}

/// Lifecycle of one dispute ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeLifecycle {
    OpenedBySelf,
    OpenedByPeer,
    ResultReceived,
    Closed,
}

/// Key identifying a dispute ticket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisputeKey {
    pub trade_id: TradeId,
    pub trader_id: TraderId,
}

// ----------------------------------------------------------------------------
// Chat Message
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub uid: Uid,
    pub support_type: SupportType,
    pub trade_id: TradeId,
    /// Trader whose ticket this message belongs to
    pub trader_id: TraderId,
    pub sender_is_trader: bool,
    pub is_system_message: bool,
    pub text: String,
    pub sender_address: NodeAddress,
    pub date: Timestamp,
    pub delivery: DeliveryState,
    pub ack: AckState,
}

impl ChatMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        support_type: SupportType,
        trade_id: TradeId,
        trader_id: TraderId,
        sender_is_trader: bool,
        text: impl Into<String>,
        sender_address: NodeAddress,
        date: Timestamp,
    ) -> Self {
        Self {
            uid: Uid::new(),
            support_type,
            trade_id,
            trader_id,
            sender_is_trader,
            is_system_message: false,
            text: text.into(),
            sender_address,
            date,
            delivery: DeliveryState::Unsent,
            ack: AckState::Pending,
        }
    }

    pub fn system(mut self) -> Self {
        self.is_system_message = true;
        self
    }

    pub fn key(&self) -> DisputeKey {
        DisputeKey {
            trade_id: self.trade_id.clone(),
            trader_id: self.trader_id,
        }
    }

    /// Record a transport callback; returns true if the visible state changed
    pub fn apply_delivery(&mut self, outcome: &DeliveryOutcome) -> bool {
        self.delivery.advance(outcome)
    }

    pub fn is_arrived(&self) -> bool {
        self.delivery.is_arrived()
    }

    pub fn is_stored_in_mailbox(&self) -> bool {
        self.delivery.is_stored_in_mailbox()
    }

    pub fn send_message_error(&self) -> Option<&str> {
        self.delivery.error()
    }
}

// ----------------------------------------------------------------------------
// Dispute Result
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    Buyer,
    Seller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeReason {
    Other,
    Bug,
    Usability,
    Scam,
    ProtocolViolation,
    NoReply,
    BankProblems,
    OptionTrade,
    SellerNotResponding,
    WrongSenderAccount,
    PeerWasLate,
    TradeAlreadySettled,
}

/// Payout decision of the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResult {
    pub trade_id: TradeId,
    pub trader_id: TraderId,
    pub winner: Option<Winner>,
    pub reason: DisputeReason,
    pub buyer_payout_amount: Coin,
    pub seller_payout_amount: Coin,
    pub summary_notes: String,
    pub chat_message: Option<ChatMessage>,
    pub close_date: Timestamp,
}

// ----------------------------------------------------------------------------
// Option Trade Analysis
// ----------------------------------------------------------------------------

/// Whether the price moved enough for the buyer to profit from defaulting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTradeAnalysis {
    pub price_at_opening: crate::types::Price,
    pub potential_amount: Coin,
    pub max_loss_security_deposit: i64,
    /// Positive: possible gain from defaulting; negative: loss
    pub potential_gain: i64,
}

impl OptionTradeAnalysis {
    /// Compare the trade amount with what the volume buys at the current price
    pub fn compute(
        contract: &Contract,
        price_at_opening: crate::types::Price,
        min_refund_at_mediated_dispute: Coin,
    ) -> Self {
        let potential_amount = price_at_opening.amount_by_volume(&contract.trade_volume());
        let max_loss_security_deposit = contract
            .offer
            .buyer_security_deposit
            .signed_diff(min_refund_at_mediated_dispute);
        let potential_gain = potential_amount.signed_diff(contract.trade_amount)
            - max_loss_security_deposit;
        Self {
            price_at_opening,
            potential_amount,
            max_loss_security_deposit,
            potential_gain,
        }
    }

    pub fn is_potential_option_trade(&self) -> bool {
        self.potential_gain > 0
    }

    /// Human readable report for the agent
    pub fn describe(&self, contract: &Contract) -> String {
        use crate::types::format_sat;

        let headline = if self.is_potential_option_trade() {
            "This might be a potential option trade!"
        } else {
            "It does not appear to be an option trade."
        };
        let gain_line = if self.is_potential_option_trade() {
            format!(
                "Possible gain from an option trade is: {}",
                format_sat(self.potential_gain)
            )
        } else {
            format!(
                "Possible loss from an option trade is: {}",
                format_sat(-self.potential_gain)
            )
        };
        let price_details = if contract.offer.use_market_based_price {
            format!(
                " (market based price was used: {}%)",
                contract.offer.market_price_margin * 100.0
            )
        } else {
            " (fix price was used)".to_string()
        };
        format!(
            "System message: {}\n\nTrade price: {}{}\nTrade amount: {}\nPrice at dispute opening: {}\n\
             BTC amount calculated with price at dispute opening: {}\n\
             Max loss of security deposit is: {}\n{}",
            headline,
            contract.trade_price,
            price_details,
            contract.trade_amount,
            self.price_at_opening,
            self.potential_amount,
            format_sat(self.max_loss_security_deposit),
            gain_line
        )
    }
}

// ----------------------------------------------------------------------------
// Dispute
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub trade_id: TradeId,
    pub trader_id: TraderId,
    pub trader_pub_key_ring: PubKeyRing,
    pub dispute_opener_is_buyer: bool,
    pub dispute_opener_is_maker: bool,
    pub trade_date: Timestamp,
    pub opening_date: Timestamp,
    pub contract: Contract,
    pub contract_hash: String,
    pub maker_contract_signature: Option<String>,
    pub taker_contract_signature: Option<String>,
    pub deposit_tx_id: Option<TxId>,
    pub delayed_payout_tx_id: Option<TxId>,
    pub payout_tx_id: Option<TxId>,
    pub agent_pub_key_ring: PubKeyRing,
    pub agent_address: NodeAddress,
    pub support_type: SupportType,
    pub is_support_ticket: bool,
    pub chat_messages: Vec<ChatMessage>,
    pub result: Option<DisputeResult>,
    pub lifecycle: DisputeLifecycle,
    pub price_analysis: Option<OptionTradeAnalysis>,
    /// Mediator's summary when a refund follows mediation
    pub mediators_dispute_result: Option<String>,
}

impl Dispute {
    pub fn key(&self) -> DisputeKey {
        DisputeKey {
            trade_id: self.trade_id.clone(),
            trader_id: self.trader_id,
        }
    }

    /// Append a chat message unless one with the same uid is stored
    pub fn add_chat_message(&mut self, message: ChatMessage) -> bool {
        if self.chat_messages.iter().any(|m| m.uid == message.uid) {
            warn!(
                uid = %message.uid,
                trade_id = %message.trade_id,
                "We got a chat message that we have already stored"
            );
            return false;
        }
        self.chat_messages.push(message);
        true
    }

    pub fn chat_message_mut(&mut self, uid: &Uid) -> Option<&mut ChatMessage> {
        self.chat_messages.iter_mut().find(|m| &m.uid == uid)
    }

    pub fn first_chat_message(&self) -> Option<&ChatMessage> {
        self.chat_messages.first()
    }

    /// Node address and key of the trader this ticket belongs to
    pub fn trader_contact(&self) -> (&NodeAddress, &PubKeyRing) {
        if self.contract.is_buyer_key(&self.trader_pub_key_ring) {
            (
                &self.contract.buyer.node_address,
                &self.contract.buyer.pub_key_ring,
            )
        } else {
            (
                &self.contract.seller.node_address,
                &self.contract.seller.pub_key_ring,
            )
        }
    }

    /// Key of the trader who opened the dispute
    pub fn opener_pub_key_ring(&self) -> &PubKeyRing {
        if self.dispute_opener_is_buyer {
            &self.contract.buyer.pub_key_ring
        } else {
            &self.contract.seller.pub_key_ring
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == DisputeLifecycle::Closed
    }
}

// ----------------------------------------------------------------------------
// Dispute List
// ----------------------------------------------------------------------------

/// Persisted collection of disputes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisputeList {
    disputes: Vec<Dispute>,
}

impl DisputeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &DisputeKey) -> bool {
        self.find(key).is_some()
    }

    pub fn find(&self, key: &DisputeKey) -> Option<&Dispute> {
        self.disputes
            .iter()
            .find(|d| d.trade_id == key.trade_id && d.trader_id == key.trader_id)
    }

    pub fn find_mut(&mut self, key: &DisputeKey) -> Option<&mut Dispute> {
        self.disputes
            .iter_mut()
            .find(|d| d.trade_id == key.trade_id && d.trader_id == key.trader_id)
    }

    /// Any dispute of the trade, regardless of trader
    pub fn find_by_trade(&self, trade_id: &TradeId) -> Option<&Dispute> {
        self.disputes.iter().find(|d| &d.trade_id == trade_id)
    }

    /// Insert a dispute unless its key is taken; returns false on duplicates
    pub fn add(&mut self, dispute: Dispute) -> bool {
        if self.contains(&dispute.key()) {
            return false;
        }
        self.disputes.push(dispute);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dispute> {
        self.disputes.iter()
    }

    pub fn len(&self) -> usize {
        self.disputes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disputes.is_empty()
    }

    pub fn num_open(&self) -> usize {
        self.disputes.iter().filter(|d| !d.is_closed()).count()
    }
}

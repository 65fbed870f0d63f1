//! Wire-level messages of the trade and support protocols
//!
//! Trade messages form a closed enum so every protocol role has to decide,
//! by exhaustive match, what to do with each message type.

use serde::{Deserialize, Serialize};

use crate::dispute::{ChatMessage, Dispute, DisputeResult, SupportType};
use crate::trade::{AccountAgeWitness, Contract, PaymentAccount};
use crate::types::{Coin, NodeAddress, Price, PubKeyRing, Timestamp, TradeId, TxId, Uid};
use crate::wallet::RawTx;

// ----------------------------------------------------------------------------
// Trade Protocol Messages
// ----------------------------------------------------------------------------

/// Taker asks the maker for deposit inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputsForDepositTxRequest {
    pub trade_id: TradeId,
    pub trade_amount: Coin,
    pub trade_price: Price,
    /// Signed but unpublished taker fee transaction
    pub taker_fee_tx: RawTx,
    pub taker_payment_account: PaymentAccount,
    pub taker_payout_address: String,
    pub taker_account_age_witness: Option<AccountAgeWitness>,
    pub current_date: Timestamp,
}

/// Maker answers with the signed contract and the unsigned deposit transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputsForDepositTxResponse {
    pub trade_id: TradeId,
    pub contract: Contract,
    pub maker_contract_signature: String,
    pub maker_payment_account: PaymentAccount,
    pub maker_payout_address: String,
    pub maker_account_age_witness: Option<AccountAgeWitness>,
    pub prepared_deposit_tx: RawTx,
    pub lock_time: u32,
}

/// Buyer as taker sends its signed deposit transaction to the seller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositTxMessage {
    pub trade_id: TradeId,
    pub deposit_tx: RawTx,
}

/// Seller asks the buyer to co-sign the delayed payout transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedPayoutTxSignatureRequest {
    pub trade_id: TradeId,
    pub delayed_payout_tx: RawTx,
    pub deposit_tx: RawTx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedPayoutTxSignatureResponse {
    pub trade_id: TradeId,
    pub delayed_payout_tx: RawTx,
    pub deposit_tx: RawTx,
}

/// Seller informs the buyer that the deposit was published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositTxAndDelayedPayoutTxMessage {
    pub trade_id: TradeId,
    pub deposit_tx: RawTx,
    pub delayed_payout_tx: RawTx,
}

/// Buyer started the counter-currency payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterCurrencyTransferStartedMessage {
    pub trade_id: TradeId,
    pub buyer_payout_address: String,
    /// Payout transaction carrying the buyer's signature
    pub buyer_signed_payout_tx: RawTx,
    pub counter_currency_tx_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutTxPublishedMessage {
    pub trade_id: TradeId,
    pub payout_tx: RawTx,
}

/// Taker asks whether the maker is ready to fund the multisig deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerReadyToFundMultisigRequest {
    pub trade_id: TradeId,
    pub trade_amount: Coin,
    pub taker_fee_tx_id: Option<TxId>,
    pub taker_payment_account: PaymentAccount,
    pub taker_payout_address: String,
    pub taker_account_age_witness: Option<AccountAgeWitness>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerReadyToFundMultisigResponse {
    pub trade_id: TradeId,
    pub is_maker_ready_to_fund_multisig: bool,
    pub maker_payment_account: PaymentAccount,
    pub maker_payout_address: String,
    pub maker_account_age_witness: Option<AccountAgeWitness>,
    /// Present once the maker is ready
    pub contract: Option<Contract>,
    pub maker_contract_signature: Option<String>,
}

/// Multisig participant info exchanged by both parties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMultisigMessage {
    pub trade_id: TradeId,
    pub prepared_multisig_info: String,
}

/// Closed set of trade protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradeMessage {
    InputsForDepositTxRequest(InputsForDepositTxRequest),
    InputsForDepositTxResponse(InputsForDepositTxResponse),
    DepositTxMessage(DepositTxMessage),
    DelayedPayoutTxSignatureRequest(DelayedPayoutTxSignatureRequest),
    DelayedPayoutTxSignatureResponse(DelayedPayoutTxSignatureResponse),
    DepositTxAndDelayedPayoutTxMessage(DepositTxAndDelayedPayoutTxMessage),
    CounterCurrencyTransferStartedMessage(CounterCurrencyTransferStartedMessage),
    PayoutTxPublishedMessage(PayoutTxPublishedMessage),
    MakerReadyToFundMultisigRequest(MakerReadyToFundMultisigRequest),
    MakerReadyToFundMultisigResponse(MakerReadyToFundMultisigResponse),
    InitMultisigMessage(InitMultisigMessage),
}

impl TradeMessage {
    pub fn trade_id(&self) -> &TradeId {
        match self {
            TradeMessage::InputsForDepositTxRequest(m) => &m.trade_id,
            TradeMessage::InputsForDepositTxResponse(m) => &m.trade_id,
            TradeMessage::DepositTxMessage(m) => &m.trade_id,
            TradeMessage::DelayedPayoutTxSignatureRequest(m) => &m.trade_id,
            TradeMessage::DelayedPayoutTxSignatureResponse(m) => &m.trade_id,
            TradeMessage::DepositTxAndDelayedPayoutTxMessage(m) => &m.trade_id,
            TradeMessage::CounterCurrencyTransferStartedMessage(m) => &m.trade_id,
            TradeMessage::PayoutTxPublishedMessage(m) => &m.trade_id,
            TradeMessage::MakerReadyToFundMultisigRequest(m) => &m.trade_id,
            TradeMessage::MakerReadyToFundMultisigResponse(m) => &m.trade_id,
            TradeMessage::InitMultisigMessage(m) => &m.trade_id,
        }
    }

    /// Type name used in logs and sent-message records
    pub fn kind(&self) -> &'static str {
        match self {
            TradeMessage::InputsForDepositTxRequest(_) => "InputsForDepositTxRequest",
            TradeMessage::InputsForDepositTxResponse(_) => "InputsForDepositTxResponse",
            TradeMessage::DepositTxMessage(_) => "DepositTxMessage",
            TradeMessage::DelayedPayoutTxSignatureRequest(_) => "DelayedPayoutTxSignatureRequest",
            TradeMessage::DelayedPayoutTxSignatureResponse(_) => {
                "DelayedPayoutTxSignatureResponse"
            }
            TradeMessage::DepositTxAndDelayedPayoutTxMessage(_) => {
                "DepositTxAndDelayedPayoutTxMessage"
            }
            TradeMessage::CounterCurrencyTransferStartedMessage(_) => {
                "CounterCurrencyTransferStartedMessage"
            }
            TradeMessage::PayoutTxPublishedMessage(_) => "PayoutTxPublishedMessage",
            TradeMessage::MakerReadyToFundMultisigRequest(_) => "MakerReadyToFundMultisigRequest",
            TradeMessage::MakerReadyToFundMultisigResponse(_) => {
                "MakerReadyToFundMultisigResponse"
            }
            TradeMessage::InitMultisigMessage(_) => "InitMultisigMessage",
        }
    }
}

// ----------------------------------------------------------------------------
// Support (Dispute) Messages
// ----------------------------------------------------------------------------

/// Trader asks the agent to open a dispute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenNewDisputeMessage {
    pub dispute: Dispute,
    pub sender_address: NodeAddress,
    pub uid: Uid,
    pub support_type: SupportType,
}

/// Agent informs the other trader that the peer opened a dispute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerOpenedDisputeMessage {
    pub dispute: Dispute,
    pub sender_address: NodeAddress,
    pub uid: Uid,
    pub support_type: SupportType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeResultMessage {
    pub dispute_result: DisputeResult,
    pub sender_address: NodeAddress,
    pub uid: Uid,
    pub support_type: SupportType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SupportMessage {
    OpenNewDispute(OpenNewDisputeMessage),
    PeerOpenedDispute(PeerOpenedDisputeMessage),
    DisputeResult(DisputeResultMessage),
    Chat(ChatMessage),
}

impl SupportMessage {
    pub fn uid(&self) -> Uid {
        match self {
            SupportMessage::OpenNewDispute(m) => m.uid,
            SupportMessage::PeerOpenedDispute(m) => m.uid,
            SupportMessage::DisputeResult(m) => m.uid,
            SupportMessage::Chat(m) => m.uid,
        }
    }

    pub fn trade_id(&self) -> &TradeId {
        match self {
            SupportMessage::OpenNewDispute(m) => &m.dispute.trade_id,
            SupportMessage::PeerOpenedDispute(m) => &m.dispute.trade_id,
            SupportMessage::DisputeResult(m) => &m.dispute_result.trade_id,
            SupportMessage::Chat(m) => &m.trade_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SupportMessage::OpenNewDispute(_) => "OpenNewDisputeMessage",
            SupportMessage::PeerOpenedDispute(_) => "PeerOpenedDisputeMessage",
            SupportMessage::DisputeResult(_) => "DisputeResultMessage",
            SupportMessage::Chat(_) => "ChatMessage",
        }
    }
}

// ----------------------------------------------------------------------------
// Acknowledgement and Envelope
// ----------------------------------------------------------------------------

/// What kind of message an acknowledgement refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckSource {
    TradeMessage,
    ChatMessage,
    DisputeMessage,
}

/// Application-level confirmation that a message was processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub source_uid: Uid,
    pub source: AckSource,
    pub trade_id: TradeId,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Trade(TradeMessage),
    Support(SupportMessage),
    Ack(AckMessage),
}

/// Envelope carrying a message and its authenticated sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEnvelope {
    pub uid: Uid,
    pub sender: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub payload: Payload,
}

impl NetworkEnvelope {
    pub fn new(sender: NodeAddress, sender_pub_key_ring: PubKeyRing, payload: Payload) -> Self {
        let uid = match &payload {
            Payload::Support(message) => message.uid(),
            _ => Uid::new(),
        };
        Self {
            uid,
            sender,
            sender_pub_key_ring,
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Payload::Trade(m) => m.kind(),
            Payload::Support(m) => m.kind(),
            Payload::Ack(_) => "AckMessage",
        }
    }

    pub fn trade_id(&self) -> &TradeId {
        match &self.payload {
            Payload::Trade(m) => m.trade_id(),
            Payload::Support(m) => m.trade_id(),
            Payload::Ack(m) => &m.trade_id,
        }
    }

    /// Encode for transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

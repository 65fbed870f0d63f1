//! Task framework
//!
//! A [`Task`] is one atomic protocol step. Pipelines are ordered lists of
//! [`TaskKind`] tags; the [`TaskRegistry`] resolves each tag to its
//! implementation and the [`TaskRunner`] executes them in order against a
//! [`TaskContext`].
//!
//! Validation tasks may be re-run freely. Tasks performing an irreversible
//! action (publishing a transaction, funding the multisig) record the action
//! on the trade before returning and skip it when they find it recorded.

pub mod buyer;
pub mod common;
pub mod maker;
pub mod multisig;
pub mod registry;
pub mod runner;
pub mod seller;
pub mod taker;

#[cfg(test)]
pub(crate) mod test_support;

pub use registry::{Intercept, Resolved, TaskRegistry};
pub use runner::{PipelineFault, RunOutcome, TaskRunner};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    config::{FilterConfig, ProtocolConfig},
    crypto::KeyRing,
    delivery::SentMessage,
    errors::{TaskError, TransportError},
    message::{NetworkEnvelope, Payload, TradeMessage},
    services::{AccountAgeWitnessService, MessagingGateway},
    trade::{Trade, TradeState},
    types::{NodeAddress, PubKeyRing, TimeSource, Timestamp, Uid},
    wallet::TradeWallet,
};
use serde::Serialize;
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Task Tags
// ----------------------------------------------------------------------------

/// Identity of every protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    // Shared steps
    ApplyFilter,
    VerifyPeersAccountAgeWitness,
    SignDepositTx,
    PublishTradeStatistics,
    CloseTrade,

    // Taker
    TakerVerifyMakerFeePayment,
    TakerCreateFeeTx,
    TakerSendInputsForDepositTxRequest,
    TakerProcessesInputsForDepositTxResponse,
    TakerVerifyAndSignContract,
    TakerPublishFeeTx,
    TakerSendReadyToFundMultisigRequest,
    TakerProcessReadyToFundMultisigResponse,

    // Maker
    MakerProcessesInputsForDepositTxRequest,
    MakerVerifyTakerFeePayment,
    MakerSetsLockTime,
    MakerCreateAndSignContract,
    MakerCreatesUnsignedDepositTx,
    MakerSendsInputsForDepositTxResponse,
    MakerProcessReadyToFundMultisigRequest,
    MakerSendsReadyToFundMultisigResponse,

    // Buyer
    BuyerSendsDepositTxMessage,
    BuyerProcessDelayedPayoutTxSignatureRequest,
    BuyerVerifiesPreparedDelayedPayoutTx,
    BuyerSignsDelayedPayoutTx,
    BuyerSendsDelayedPayoutTxSignatureResponse,
    BuyerProcessDepositTxAndDelayedPayoutTxMessage,
    BuyerVerifiesFinalDelayedPayoutTx,
    BuyerSignPayoutTx,
    BuyerSendsCounterCurrencyTransferStartedMessage,
    BuyerProcessPayoutTxPublishedMessage,

    // Seller
    SellerAsMakerProcessDepositTxMessage,
    SellerCreatesDelayedPayoutTx,
    SellerSignsDelayedPayoutTx,
    SellerSendsDelayedPayoutTxSignatureRequest,
    SellerProcessDelayedPayoutTxSignatureResponse,
    SellerFinalizesDelayedPayoutTx,
    SellerPublishesDepositTx,
    SellerSendsDepositTxAndDelayedPayoutTxMessage,
    SellerProcessCounterCurrencyTransferStartedMessage,
    SellerSignAndFinalizePayoutTx,
    SellerBroadcastPayoutTx,
    SellerSendPayoutTxPublishedMessage,

    // Multisig deposit scheme
    ProcessInitMultisigMessage,
    SendInitMultisigMessage,
    FundMultisig,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// Task Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait Task: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Perform the step; an error aborts the pipeline
    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError>;
}

// ----------------------------------------------------------------------------
// Task Services
// ----------------------------------------------------------------------------

/// Collaborators shared by every pipeline run
pub struct TaskServices {
    pub keys: KeyRing,
    pub my_address: NodeAddress,
    pub wallet: Arc<dyn TradeWallet>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub account_age: Arc<dyn AccountAgeWitnessService>,
    pub time: Arc<dyn TimeSource>,
    pub filter: FilterConfig,
    pub protocol: ProtocolConfig,
}

impl fmt::Debug for TaskServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskServices")
            .field("my_address", &self.my_address)
            .field("pub_key_ring", &self.keys.pub_key_ring())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Task Context
// ----------------------------------------------------------------------------

/// Explicit context handed to every task of a run
///
/// The run owns the checked-out [`Trade`]; its process model is the scratch
/// space tasks read from and write to.
#[derive(Debug)]
pub struct TaskContext {
    pub trade: Trade,
    pub services: Arc<TaskServices>,
}

impl TaskContext {
    pub fn new(trade: Trade, services: Arc<TaskServices>) -> Self {
        Self { trade, services }
    }

    pub fn into_trade(self) -> Trade {
        self.trade
    }

    pub fn now(&self) -> Timestamp {
        self.services.time.now()
    }

    pub fn my_pub_key_ring(&self) -> PubKeyRing {
        self.services.keys.pub_key_ring()
    }

    /// Message the current pipeline was started for
    pub fn message(&self) -> Result<&TradeMessage, TaskError> {
        self.trade
            .process_model
            .trade_message
            .as_ref()
            .ok_or_else(|| TaskError::missing("trade message"))
    }

    /// Strict state change; moving to an earlier phase is an error
    pub fn set_state(&mut self, state: TradeState) -> Result<(), TaskError> {
        self.trade.set_state(state)?;
        Ok(())
    }

    /// State change that leaves a trade already past `state` untouched
    ///
    /// Used by steps that also run as a resend after the trade advanced.
    pub fn advance_state(&mut self, state: TradeState) -> Result<(), TaskError> {
        if state.phase() < self.trade.phase() {
            debug!(trade_id = %self.trade.id, state = ?state, "Trade already past state, keeping it");
            return Ok(());
        }
        self.set_state(state)
    }

    /// Payout address of this trade, requested from the wallet on first use
    pub fn my_payout_address(&mut self) -> String {
        if let Some(address) = &self.trade.process_model.my_payout_address {
            return address.clone();
        }
        let address = self.services.wallet.address_for(&self.trade.id);
        self.trade.process_model.my_payout_address = Some(address.clone());
        address
    }

    /// Address and key of the trading peer
    pub fn peer_contact(&self) -> Result<(NodeAddress, PubKeyRing), TaskError> {
        let peer = &self.trade.process_model.peer;
        let address = peer
            .node_address
            .clone()
            .or_else(|| self.trade.process_model.temp_peer_address.clone())
            .ok_or_else(|| TransportError::NoPeerAddress {
                trade_id: self.trade.id.clone(),
            })?;
        let key = peer
            .pub_key_ring
            .ok_or_else(|| TaskError::missing("peer pub key ring"))?;
        Ok((address, key))
    }

    /// Hand a trade message to the gateway and record it for delivery tracking
    pub fn send_to_peer(&mut self, message: TradeMessage) -> Result<Uid, TaskError> {
        let (address, key) = self.peer_contact()?;
        let envelope = NetworkEnvelope::new(
            self.services.my_address.clone(),
            self.my_pub_key_ring(),
            Payload::Trade(message),
        );
        let uid = envelope.uid;
        let kind = envelope.kind();
        self.services.gateway.send_mailbox(&address, &key, envelope)?;

        let now = self.now();
        self.trade.process_model.sent_messages.push(SentMessage::new(
            uid,
            self.trade.id.clone(),
            kind,
            address.clone(),
            now,
        ));
        info!(trade_id = %self.trade.id, kind, to = %address, uid = %uid, "Sent trade message");
        Ok(uid)
    }
}

/// Extract the expected variant of the pending trade message
#[macro_export]
macro_rules! expect_message {
    ($ctx:expr, $variant:ident) => {
        match $ctx.message()? {
            escrow_core::message::TradeMessage::$variant(message) => message.clone(),
            other => {
                return Err(escrow_core::errors::TaskError::invalid(format!(
                    "expected {}, got {}",
                    stringify!($variant),
                    other.kind()
                )))
            }
        }
    };
}

//! CSP Channel Communication Protocol Types
//!
//! All traffic into and out of the engine task flows through these message
//! types: commands from the application, events from the transport, effects
//! for the transport and app events for observers.

use crate::delivery::{DeliveryOutcome, DeliveryState};
use crate::dispute::{DisputeKey, DisputeLifecycle, DisputeResult, SupportType};
use crate::errors::DisputeError;
use crate::message::NetworkEnvelope;
use crate::services::TradeStatistics;
use crate::trade::{DisputeState, Phase, Trade, TradeRole, TradeState};
use crate::types::{NodeAddress, PubKeyRing, TradeId, Uid};

// ----------------------------------------------------------------------------
// Command: Application → Engine
// ----------------------------------------------------------------------------

/// Commands sent by the application to the engine task
#[derive(Debug, Clone)]
pub enum Command {
    /// Register a trade created from a taken offer
    AddTrade(Box<Trade>),
    /// Taker starts the protocol
    TakeOffer { trade_id: TradeId },
    /// Buyer confirms the counter-currency payment was started
    PaymentStarted { trade_id: TradeId },
    /// Seller confirms the counter-currency payment arrived
    PaymentReceived { trade_id: TradeId },
    /// Close a trade whose payout is published
    CompleteTrade { trade_id: TradeId },
    /// Trader opens a dispute with the offer's agent
    OpenDispute {
        trade_id: TradeId,
        support_type: SupportType,
        reopen: bool,
    },
    /// Agent closes a dispute ticket
    SendDisputeResult {
        key: DisputeKey,
        result: DisputeResult,
        text: String,
    },
    /// Chat message on a dispute ticket
    SendChatMessage { key: DisputeKey, text: String },
    /// Stores, wallet and price feed are ready
    AllServicesInitialized,
    /// Request a status snapshot as [`AppEvent::StatusReport`]
    GetStatus,
    /// Shutdown the engine gracefully
    Shutdown,
}

// ----------------------------------------------------------------------------
// Event: Transport → Engine
// ----------------------------------------------------------------------------

/// Events reported by the transport
#[derive(Debug, Clone)]
pub enum Event {
    /// Authenticated inbound envelope
    MessageReceived(Box<NetworkEnvelope>),
    /// Tri-state delivery outcome of an earlier send
    DeliveryReport { uid: Uid, outcome: DeliveryOutcome },
}

// ----------------------------------------------------------------------------
// Effect: Engine → Transport
// ----------------------------------------------------------------------------

/// Actions the transport must carry out
#[derive(Debug, Clone)]
pub enum Effect {
    SendMailbox {
        recipient: NodeAddress,
        recipient_key: PubKeyRing,
        envelope: Box<NetworkEnvelope>,
    },
    PublishTradeStatistics(TradeStatistics),
}

// ----------------------------------------------------------------------------
// App Event: Engine → Application
// ----------------------------------------------------------------------------

/// Events for the application layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    TradeAdded {
        trade_id: TradeId,
        role: TradeRole,
    },
    TradeStateChanged {
        trade_id: TradeId,
        state: TradeState,
        phase: Phase,
    },
    PipelineCompleted {
        trade_id: TradeId,
        transition: &'static str,
    },
    /// A task failed; the trade stays at its last completed step
    PipelineFailed {
        trade_id: TradeId,
        transition: &'static str,
        task: String,
        reason: String,
    },
    PipelineTimedOut {
        trade_id: TradeId,
        transition: &'static str,
    },
    /// Inbound message or user action not admitted
    MessageRejected {
        trade_id: TradeId,
        kind: String,
        reason: String,
    },
    DeliveryUpdated {
        uid: Uid,
        trade_id: TradeId,
        state: DeliveryState,
    },
    AckReceived {
        source_uid: Uid,
        trade_id: TradeId,
        success: bool,
        error: Option<String>,
    },
    TradeDisputeStateChanged {
        trade_id: TradeId,
        state: DisputeState,
    },
    /// Our open-dispute message reached the agent or its mailbox
    DisputeOpened {
        key: DisputeKey,
        stored_in_mailbox: bool,
    },
    DisputeFault {
        trade_id: TradeId,
        error: DisputeError,
    },
    /// A dispute ticket was stored or changed lifecycle
    DisputeUpdated {
        key: DisputeKey,
        lifecycle: DisputeLifecycle,
    },
    ChatMessageReceived {
        key: DisputeKey,
        uid: Uid,
        text: String,
    },
    StatusReport {
        trades: usize,
        busy_trades: usize,
        disputes: Option<usize>,
        open_disputes: usize,
    },
    SystemError {
        error: String,
    },
}

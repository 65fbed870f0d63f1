//! Events the engine posts to its own queue
//!
//! Pipeline completions, timer ticks and wallet listeners never touch trade
//! or dispute state directly. They post an [`InternalEvent`] and the engine
//! loop applies it in queue order.

use escrow_core::dispute::DisputeKey;
use escrow_core::trade::Trade;
use escrow_core::types::{NodeAddress, PubKeyRing, TradeId, Uid};

use crate::protocol::{Transition, UserAction};
use crate::task::RunOutcome;

/// What started a pipeline run
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Inbound trade message; acked to the sender once the run finishes
    Message {
        uid: Uid,
        sender: NodeAddress,
        sender_key: PubKeyRing,
        kind: &'static str,
    },
    UserAction(UserAction),
    /// Timer driven resend
    Periodic,
    /// Started by the engine after another run completed
    FollowUp,
}

#[derive(Debug, Clone)]
pub enum InternalEvent {
    PipelineFinished {
        trade: Box<Trade>,
        transition: &'static Transition,
        outcome: RunOutcome,
        trigger: Trigger,
    },
    /// The taker fee reached the unlock depth
    FeeTxUnlocked { trade_id: TradeId },
    MultisigRequestTick { trade_id: TradeId },
    /// Agent sends the mirrored dispute to the counterparty
    MirrorDispute { key: DisputeKey },
    PriceInfoRetry { key: DisputeKey, attempt: u32 },
}

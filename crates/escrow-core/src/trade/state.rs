//! Trade roles, phases and fine-grained states
//!
//! Every [`TradeState`] belongs to exactly one [`Phase`]. Phases advance
//! monotonically; states inside a phase are used for resume and display.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::dispute::SupportType;

// ----------------------------------------------------------------------------
// Roles
// ----------------------------------------------------------------------------

/// Direction of a party in the trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buyer,
    Seller,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Buyer => Direction::Seller,
            Direction::Seller => Direction::Buyer,
        }
    }
}

/// Whether a party posted the offer or took it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    Maker,
    Taker,
}

impl Position {
    pub fn opposite(self) -> Self {
        match self {
            Position::Maker => Position::Taker,
            Position::Taker => Position::Maker,
        }
    }
}

/// One of the four protocol roles (maker/taker × buyer/seller)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeRole {
    pub position: Position,
    pub direction: Direction,
}

impl TradeRole {
    pub const MAKER_BUYER: Self = Self::new(Position::Maker, Direction::Buyer);
    pub const MAKER_SELLER: Self = Self::new(Position::Maker, Direction::Seller);
    pub const TAKER_BUYER: Self = Self::new(Position::Taker, Direction::Buyer);
    pub const TAKER_SELLER: Self = Self::new(Position::Taker, Direction::Seller);

    pub const ALL: [Self; 4] = [
        Self::MAKER_BUYER,
        Self::MAKER_SELLER,
        Self::TAKER_BUYER,
        Self::TAKER_SELLER,
    ];

    pub const fn new(position: Position, direction: Direction) -> Self {
        Self {
            position,
            direction,
        }
    }

    /// Role of the trading peer
    pub fn counterpart(self) -> Self {
        Self::new(self.position.opposite(), self.direction.opposite())
    }

    pub fn is_maker(&self) -> bool {
        self.position == Position::Maker
    }

    pub fn is_buyer(&self) -> bool {
        self.direction == Direction::Buyer
    }
}

impl fmt::Display for TradeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = match self.position {
            Position::Maker => "maker",
            Position::Taker => "taker",
        };
        let direction = match self.direction {
            Direction::Buyer => "buyer",
            Direction::Seller => "seller",
        };
        write!(f, "{}-{}", position, direction)
    }
}

// ----------------------------------------------------------------------------
// Phase
// ----------------------------------------------------------------------------

/// Coarse, monotonically advancing trade milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    TakerFeePublished,
    DepositPublished,
    FiatSent,
    FiatReceived,
    PayoutPublished,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::TakerFeePublished => "TAKER_FEE_PUBLISHED",
            Phase::DepositPublished => "DEPOSIT_PUBLISHED",
            Phase::FiatSent => "FIAT_SENT",
            Phase::FiatReceived => "FIAT_RECEIVED",
            Phase::PayoutPublished => "PAYOUT_PUBLISHED",
            Phase::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Trade State
// ----------------------------------------------------------------------------

/// Fine-grained step within a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    // Init
    Preparation,
    TakerSentInputsForDepositTxRequest,
    TakerSentReadyToFundMultisigRequest,
    MakerSentReadyToFundMultisigResponse,

    // TakerFeePublished
    TakerPublishedTakerFeeTx,
    MakerSentInputsForDepositTxResponse,
    BuyerSentDepositTxMessage,
    SellerSentDelayedPayoutTxSignatureRequest,
    BuyerSentDelayedPayoutTxSignatureResponse,
    MultisigPrepared,

    // DepositPublished
    SellerPublishedDepositTx,
    BuyerReceivedDepositTxPublishedMsg,
    MultisigDepositFunded,

    // FiatSent
    BuyerSentFiatPaymentInitiatedMsg,
    SellerReceivedFiatPaymentInitiatedMsg,

    // FiatReceived
    SellerConfirmedFiatPaymentReceipt,

    // PayoutPublished
    SellerPublishedPayoutTx,
    SellerSentPayoutTxPublishedMsg,
    BuyerReceivedPayoutTxPublishedMsg,

    // Completed
    TradeCompleted,
}

impl TradeState {
    pub fn phase(&self) -> Phase {
        use TradeState::*;
        match self {
            Preparation
            | TakerSentInputsForDepositTxRequest
            | TakerSentReadyToFundMultisigRequest
            | MakerSentReadyToFundMultisigResponse => Phase::Init,
            TakerPublishedTakerFeeTx
            | MakerSentInputsForDepositTxResponse
            | BuyerSentDepositTxMessage
            | SellerSentDelayedPayoutTxSignatureRequest
            | BuyerSentDelayedPayoutTxSignatureResponse
            | MultisigPrepared => Phase::TakerFeePublished,
            SellerPublishedDepositTx | BuyerReceivedDepositTxPublishedMsg | MultisigDepositFunded => {
                Phase::DepositPublished
            }
            BuyerSentFiatPaymentInitiatedMsg | SellerReceivedFiatPaymentInitiatedMsg => {
                Phase::FiatSent
            }
            SellerConfirmedFiatPaymentReceipt => Phase::FiatReceived,
            SellerPublishedPayoutTx
            | SellerSentPayoutTxPublishedMsg
            | BuyerReceivedPayoutTxPublishedMsg => Phase::PayoutPublished,
            TradeCompleted => Phase::Completed,
        }
    }
}

// ----------------------------------------------------------------------------
// Dispute State
// ----------------------------------------------------------------------------

/// Dispute branch of a trade, tracked alongside the phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeState {
    #[default]
    NoDispute,
    MediationRequested,
    MediationStartedByPeer,
    MediationClosed,
    RefundRequested,
    RefundRequestStartedByPeer,
    RefundRequestClosed,
    DisputeRequested,
    DisputeStartedByPeer,
    DisputeClosed,
}

impl DisputeState {
    pub fn requested(support_type: SupportType) -> Self {
        match support_type {
            SupportType::Mediation => DisputeState::MediationRequested,
            SupportType::Refund => DisputeState::RefundRequested,
            SupportType::Arbitration => DisputeState::DisputeRequested,
        }
    }

    pub fn started_by_peer(support_type: SupportType) -> Self {
        match support_type {
            SupportType::Mediation => DisputeState::MediationStartedByPeer,
            SupportType::Refund => DisputeState::RefundRequestStartedByPeer,
            SupportType::Arbitration => DisputeState::DisputeStartedByPeer,
        }
    }

    pub fn closed(support_type: SupportType) -> Self {
        match support_type {
            SupportType::Mediation => DisputeState::MediationClosed,
            SupportType::Refund => DisputeState::RefundRequestClosed,
            SupportType::Arbitration => DisputeState::DisputeClosed,
        }
    }

    /// Whether the trade left the normal protocol for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisputeState::RefundRequestClosed | DisputeState::DisputeClosed
        )
    }

    pub fn is_open(&self) -> bool {
        !matches!(
            self,
            DisputeState::NoDispute
                | DisputeState::MediationClosed
                | DisputeState::RefundRequestClosed
                | DisputeState::DisputeClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counterpart_flips_both_axes() {
        assert_eq!(TradeRole::MAKER_BUYER.counterpart(), TradeRole::TAKER_SELLER);
        assert_eq!(TradeRole::TAKER_BUYER.counterpart(), TradeRole::MAKER_SELLER);
        assert_eq!(TradeRole::MAKER_BUYER.to_string(), "maker-buyer");
    }

    #[test]
    fn test_phase_order() {
        assert!(Phase::Init < Phase::TakerFeePublished);
        assert!(Phase::TakerFeePublished < Phase::DepositPublished);
        assert!(Phase::PayoutPublished < Phase::Completed);
        assert_eq!(TradeState::MultisigDepositFunded.phase(), Phase::DepositPublished);
        assert_eq!(
            TradeState::MakerSentInputsForDepositTxResponse.phase(),
            Phase::TakerFeePublished
        );
    }

    #[test]
    fn test_dispute_state_by_support_type() {
        assert_eq!(
            DisputeState::started_by_peer(SupportType::Mediation),
            DisputeState::MediationStartedByPeer
        );
        assert!(DisputeState::closed(SupportType::Refund).is_terminal());
        assert!(!DisputeState::closed(SupportType::Mediation).is_terminal());
        assert!(DisputeState::requested(SupportType::Arbitration).is_open());
    }
}

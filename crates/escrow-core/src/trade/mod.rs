//! Trade record and state machine
//!
//! A [`Trade`] holds the persisted phase/state, role, contract, transaction
//! data and the [`ProcessModel`]. The phase never moves backwards:
//! [`Trade::set_state`] rejects any state belonging to an earlier phase.

pub mod contract;
pub mod offer;
pub mod process_model;
pub mod state;

pub use contract::{Contract, ContractParty};
pub use offer::{AccountAgeWitness, AgentInfo, DepositScheme, Offer, PaymentAccount};
pub use process_model::{ProcessModel, TradingPeer};
pub use state::{Direction, DisputeState, Phase, Position, TradeRole, TradeState};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::TradeError;
use crate::types::{Coin, NodeAddress, Price, PubKeyRing, Timestamp, TradeId, TxId};
use crate::wallet::RawTx;

// ----------------------------------------------------------------------------
// Trade
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub role: TradeRole,
    pub offer: Offer,
    pub amount: Coin,
    pub price: Price,
    state: TradeState,
    dispute_state: DisputeState,
    pub contract: Option<Contract>,
    pub maker_contract_signature: Option<String>,
    pub taker_contract_signature: Option<String>,
    pub lock_time: Option<u32>,
    pub taker_fee_tx_id: Option<TxId>,
    pub deposit_tx: Option<RawTx>,
    pub deposit_tx_id: Option<TxId>,
    pub delayed_payout_tx: Option<RawTx>,
    pub delayed_payout_tx_id: Option<TxId>,
    pub payout_tx: Option<RawTx>,
    pub payout_tx_id: Option<TxId>,
    /// Mediator's summary, carried into a later refund dispute
    pub mediation_result_summary: Option<String>,
    pub error_message: Option<String>,
    pub take_offer_date: Timestamp,
    pub process_model: ProcessModel,
}

impl Trade {
    /// Trade record of the maker, created when the offer is taken
    pub fn new_maker(offer: Offer, payment_account: PaymentAccount, now: Timestamp) -> Self {
        let role = TradeRole::new(Position::Maker, offer.direction);
        let amount = offer.amount;
        Self::new(role, offer, amount, payment_account, now)
    }

    /// Trade record of the taker; the maker's address and key come from the offer
    pub fn new_taker(
        offer: Offer,
        amount: Coin,
        payment_account: PaymentAccount,
        now: Timestamp,
    ) -> Self {
        let role = TradeRole::new(Position::Taker, offer.direction.opposite());
        let maker_address = offer.maker_address.clone();
        let maker_key = offer.maker_pub_key_ring;
        let mut trade = Self::new(role, offer, amount, payment_account, now);
        trade.process_model.peer.node_address = Some(maker_address);
        trade.process_model.peer.pub_key_ring = Some(maker_key);
        trade
    }

    fn new(
        role: TradeRole,
        offer: Offer,
        amount: Coin,
        payment_account: PaymentAccount,
        now: Timestamp,
    ) -> Self {
        Self {
            id: offer.id.clone(),
            role,
            price: offer.price.clone(),
            offer,
            amount,
            state: TradeState::Preparation,
            dispute_state: DisputeState::NoDispute,
            contract: None,
            maker_contract_signature: None,
            taker_contract_signature: None,
            lock_time: None,
            taker_fee_tx_id: None,
            deposit_tx: None,
            deposit_tx_id: None,
            delayed_payout_tx: None,
            delayed_payout_tx_id: None,
            payout_tx: None,
            payout_tx_id: None,
            mediation_result_summary: None,
            error_message: None,
            take_offer_date: now,
            process_model: ProcessModel::new(payment_account),
        }
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Move to a new state; states of an earlier phase are rejected
    pub fn set_state(&mut self, state: TradeState) -> Result<(), TradeError> {
        if state.phase() < self.phase() {
            return Err(TradeError::PhaseRegression {
                trade_id: self.id.clone(),
                from: format!("{:?}", self.state),
                to: format!("{:?}", state),
            });
        }
        if state != self.state {
            debug!(trade_id = %self.id, from = ?self.state, to = ?state, "Trade state changed");
            self.state = state;
        }
        Ok(())
    }

    pub fn dispute_state(&self) -> DisputeState {
        self.dispute_state
    }

    pub fn set_dispute_state(&mut self, state: DisputeState) {
        if state != self.dispute_state {
            debug!(trade_id = %self.id, from = ?self.dispute_state, to = ?state, "Dispute state changed");
            self.dispute_state = state;
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == Phase::Completed
    }

    /// No further protocol transitions possible
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.dispute_state.is_terminal()
    }

    pub fn contract(&self) -> Result<&Contract, TradeError> {
        self.contract.as_ref().ok_or_else(|| TradeError::NoContract {
            trade_id: self.id.clone(),
        })
    }

    pub fn peer_address(&self) -> Option<&NodeAddress> {
        self.process_model.peer.node_address.as_ref()
    }

    pub fn peer_pub_key_ring(&self) -> Option<&PubKeyRing> {
        self.process_model.peer.pub_key_ring.as_ref()
    }

    pub fn security_deposit(&self) -> Coin {
        if self.role.is_buyer() {
            self.offer.buyer_security_deposit
        } else {
            self.offer.seller_security_deposit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{COIN, FIAT_SCALE};

    fn offer() -> Offer {
        let agent = AgentInfo {
            node_address: NodeAddress::new("mediator", 1),
            pub_key_ring: PubKeyRing::new([9; 32]),
        };
        Offer {
            id: TradeId::from("abc123"),
            maker_address: NodeAddress::new("maker", 1),
            maker_pub_key_ring: PubKeyRing::new([1; 32]),
            direction: Direction::Seller,
            amount: Coin::from_sat(COIN / 10),
            price: Price::new("EUR", 50_000 * FIAT_SCALE),
            use_market_based_price: false,
            market_price_margin: 0.0,
            payment_method: "SEPA".into(),
            buyer_security_deposit: Coin::from_sat(1_500_000),
            seller_security_deposit: Coin::from_sat(1_500_000),
            maker_fee: Coin::from_sat(10_000),
            maker_fee_tx_id: TxId::new("maker-fee"),
            taker_fee: Coin::from_sat(30_000),
            tx_fee: Coin::from_sat(2_000),
            fee_address: "fee".into(),
            deposit_scheme: DepositScheme::Classic,
            mediator: agent.clone(),
            refund_agent: agent,
            date: Timestamp::new(0),
        }
    }

    #[test]
    fn test_roles_from_offer_direction() {
        let account = PaymentAccount::new("SEPA", "acc", "Alice");
        let maker = Trade::new_maker(offer(), account.clone(), Timestamp::new(1));
        let taker = Trade::new_taker(offer(), Coin::from_sat(COIN / 10), account, Timestamp::new(1));
        assert_eq!(maker.role, TradeRole::MAKER_SELLER);
        assert_eq!(taker.role, TradeRole::TAKER_BUYER);
        assert_eq!(taker.peer_address(), Some(&NodeAddress::new("maker", 1)));
        assert!(maker.peer_address().is_none());
    }

    #[test]
    fn test_phase_is_monotonic() {
        let account = PaymentAccount::new("SEPA", "acc", "Alice");
        let mut trade = Trade::new_maker(offer(), account, Timestamp::new(1));
        trade
            .set_state(TradeState::MakerSentInputsForDepositTxResponse)
            .unwrap();
        assert_eq!(trade.phase(), Phase::TakerFeePublished);

        let err = trade.set_state(TradeState::Preparation).unwrap_err();
        assert!(matches!(err, TradeError::PhaseRegression { .. }));
        assert_eq!(trade.phase(), Phase::TakerFeePublished);

        // Sideways moves within the same phase are allowed
        trade.set_state(TradeState::SellerSentDelayedPayoutTxSignatureRequest).unwrap();
    }
}

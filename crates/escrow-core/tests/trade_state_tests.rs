//! Phase monotonicity of the trade state machine

use escrow_core::{
    trade::{
        AgentInfo, DepositScheme, Direction, Offer, PaymentAccount, Phase, Trade, TradeState,
    },
    types::{Coin, NodeAddress, Price, PubKeyRing, Timestamp, TradeId, TxId},
};
use proptest::prelude::*;

const STATES: [TradeState; 20] = [
    TradeState::Preparation,
    TradeState::TakerSentInputsForDepositTxRequest,
    TradeState::TakerSentReadyToFundMultisigRequest,
    TradeState::MakerSentReadyToFundMultisigResponse,
    TradeState::TakerPublishedTakerFeeTx,
    TradeState::MakerSentInputsForDepositTxResponse,
    TradeState::BuyerSentDepositTxMessage,
    TradeState::SellerSentDelayedPayoutTxSignatureRequest,
    TradeState::BuyerSentDelayedPayoutTxSignatureResponse,
    TradeState::MultisigPrepared,
    TradeState::SellerPublishedDepositTx,
    TradeState::BuyerReceivedDepositTxPublishedMsg,
    TradeState::MultisigDepositFunded,
    TradeState::BuyerSentFiatPaymentInitiatedMsg,
    TradeState::SellerReceivedFiatPaymentInitiatedMsg,
    TradeState::SellerConfirmedFiatPaymentReceipt,
    TradeState::SellerPublishedPayoutTx,
    TradeState::SellerSentPayoutTxPublishedMsg,
    TradeState::BuyerReceivedPayoutTxPublishedMsg,
    TradeState::TradeCompleted,
];

fn trade() -> Trade {
    let agent = AgentInfo {
        node_address: NodeAddress::new("mediator", 1),
        pub_key_ring: PubKeyRing::new([9; 32]),
    };
    let offer = Offer {
        id: TradeId::from("abc123"),
        maker_address: NodeAddress::new("maker", 1),
        maker_pub_key_ring: PubKeyRing::new([1; 32]),
        direction: Direction::Buyer,
        amount: Coin::from_sat(10_000_000),
        price: Price::new("EUR", 500_000_000),
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
    };
    Trade::new_maker(offer, PaymentAccount::new("SEPA", "acc", "Bob"), Timestamp::new(0))
}

proptest! {
    /// Property: Whatever sequence of states is requested, the phase never decreases
    #[test]
    fn phase_never_decreases(indices in prop::collection::vec(0usize..STATES.len(), 1..40)) {
        let mut trade = trade();
        let mut highest = Phase::Init;
        for index in indices {
            let requested = STATES[index];
            let result = trade.set_state(requested);
            prop_assert_eq!(result.is_ok(), requested.phase() >= highest);
            prop_assert!(trade.phase() >= highest);
            highest = trade.phase();
        }
    }
}

#[test]
fn test_terminal_states() {
    let mut completed = trade();
    assert!(!completed.is_terminal());
    completed.set_state(TradeState::TradeCompleted).unwrap();
    assert!(completed.is_terminal());

    let mut disputed = trade();
    disputed.set_dispute_state(escrow_core::trade::DisputeState::DisputeClosed);
    assert!(disputed.is_terminal());
}

//! Dispute flows between two traders and the mediator

mod common;

use common::TestNode;
use escrow_core::dispute::{
    DisputeKey, DisputeLifecycle, DisputeReason, DisputeResult, SupportType, Winner,
};
use escrow_core::errors::DisputeError;
use escrow_core::testing::{fixtures, Ledger};
use escrow_core::trade::{DepositScheme, Direction, DisputeState, Offer};
use escrow_core::types::{Coin, Timestamp, TradeId, TraderId};
use escrow_core::{AppEvent, Command};
use escrow_runtime::LoopbackNetwork;

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

struct Scenario {
    network: LoopbackNetwork,
    offer: Offer,
    maker: TestNode,
    taker: TestNode,
    mediator: TestNode,
}

impl Scenario {
    /// Both traders hold a funded trade; the mediator holds nothing yet
    async fn funded(id: &str) -> Self {
        let network = LoopbackNetwork::new();
        let ledger = Ledger::new();
        let offer = fixtures::offer(id, Direction::Seller, DepositScheme::Classic);
        let mut maker = TestNode::maker(&network, &ledger).await;
        let mut taker = TestNode::taker(&network, &ledger).await;
        let mediator = TestNode::mediator(&network, &ledger).await;
        maker.add_trade(fixtures::funded_maker_trade(&offer)).await;
        taker.add_trade(fixtures::funded_taker_trade(&offer)).await;
        Self {
            network,
            offer,
            maker,
            taker,
            mediator,
        }
    }

    fn trade_id(&self) -> TradeId {
        self.offer.id.clone()
    }

    fn taker_key(&self) -> DisputeKey {
        DisputeKey {
            trade_id: self.trade_id(),
            trader_id: fixtures::taker_keys().pub_key_ring().trader_id(),
        }
    }

    fn maker_key(&self) -> DisputeKey {
        DisputeKey {
            trade_id: self.trade_id(),
            trader_id: fixtures::maker_keys().pub_key_ring().trader_id(),
        }
    }

    async fn taker_opens_mediation(&self) {
        self.taker
            .command(Command::OpenDispute {
                trade_id: self.trade_id(),
                support_type: SupportType::Mediation,
                reopen: false,
            })
            .await;
    }
}

async fn wait_trade_dispute_state(node: &mut TestNode, target: DisputeState) {
    node.wait_for(&format!("{:?}", target), |event| {
        matches!(event, AppEvent::TradeDisputeStateChanged { state, .. } if *state == target)
    })
    .await;
}

async fn wait_lifecycle(node: &mut TestNode, key: &DisputeKey, target: DisputeLifecycle) {
    node.wait_for(&format!("{:?} ticket", target), |event| {
        matches!(
            event,
            AppEvent::DisputeUpdated { key: k, lifecycle } if k == key && *lifecycle == target
        )
    })
    .await;
}

fn buyer_wins() -> DisputeResult {
    DisputeResult {
        // Overwritten with the ticket's key when sent
        trade_id: TradeId::from(""),
        trader_id: TraderId(0),
        winner: Some(Winner::Buyer),
        reason: DisputeReason::SellerNotResponding,
        buyer_payout_amount: Coin::from_sat(11_500_000),
        seller_payout_amount: Coin::from_sat(1_500_000),
        summary_notes: "Seller did not confirm a payment that arrived".to_string(),
        chat_message: None,
        close_date: Timestamp::new(0),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_mediation_is_mirrored_and_closed_with_result() {
    let mut s = Scenario::funded("mediation").await;
    let taker_key = s.taker_key();
    let maker_key = s.maker_key();

    s.taker_opens_mediation().await;
    wait_trade_dispute_state(&mut s.taker, DisputeState::MediationRequested).await;
    let opened = s
        .taker
        .wait_for("dispute opened", |event| {
            matches!(event, AppEvent::DisputeOpened { .. })
        })
        .await;
    match opened {
        AppEvent::DisputeOpened {
            key,
            stored_in_mailbox,
        } => {
            assert_eq!(key, taker_key);
            assert!(!stored_in_mailbox);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Agent stores the ticket and mirrors it to the maker after a short delay
    wait_lifecycle(&mut s.mediator, &taker_key, DisputeLifecycle::OpenedBySelf).await;
    wait_lifecycle(&mut s.mediator, &maker_key, DisputeLifecycle::OpenedByPeer).await;
    wait_trade_dispute_state(&mut s.maker, DisputeState::MediationStartedByPeer).await;
    s.taker
        .seen_or_wait("agent ack", |event| {
            matches!(event, AppEvent::AckReceived { success: true, .. })
        })
        .await;

    s.mediator
        .command(Command::SendDisputeResult {
            key: taker_key.clone(),
            result: buyer_wins(),
            text: "Paying out to the buyer".to_string(),
        })
        .await;
    wait_lifecycle(&mut s.mediator, &taker_key, DisputeLifecycle::Closed).await;
    wait_trade_dispute_state(&mut s.taker, DisputeState::MediationClosed).await;

    match s.mediator.status().await {
        AppEvent::StatusReport { disputes, .. } => assert_eq!(disputes, Some(2)),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_dispute_to_offline_agent_lands_in_mailbox() {
    let mut s = Scenario::funded("offline-agent").await;
    let agent = fixtures::mediator_address();
    s.network.set_online(&agent, false).await;

    s.taker_opens_mediation().await;
    let opened = s
        .taker
        .wait_for("dispute opened", |event| {
            matches!(event, AppEvent::DisputeOpened { .. })
        })
        .await;
    assert!(matches!(
        opened,
        AppEvent::DisputeOpened {
            stored_in_mailbox: true,
            ..
        }
    ));
    assert_eq!(s.network.mailbox_len(&agent), 1);

    s.network.set_online(&agent, true).await;
    let taker_key = s.taker_key();
    wait_lifecycle(&mut s.mediator, &taker_key, DisputeLifecycle::OpenedBySelf).await;
    s.taker
        .seen_or_wait("agent ack", |event| {
            matches!(event, AppEvent::AckReceived { success: true, .. })
        })
        .await;
}

#[tokio::test]
async fn test_chat_reaches_agent_and_second_open_is_refused() {
    let mut s = Scenario::funded("chat").await;
    let taker_key = s.taker_key();

    s.taker_opens_mediation().await;
    wait_lifecycle(&mut s.mediator, &taker_key, DisputeLifecycle::OpenedBySelf).await;

    s.taker
        .command(Command::SendChatMessage {
            key: taker_key.clone(),
            text: "Payment reference attached".to_string(),
        })
        .await;
    let chat = s
        .mediator
        .wait_for("chat message", |event| {
            matches!(event, AppEvent::ChatMessageReceived { .. })
        })
        .await;
    match chat {
        AppEvent::ChatMessageReceived { key, text, .. } => {
            assert_eq!(key, taker_key);
            assert_eq!(text, "Payment reference attached");
        }
        other => panic!("unexpected event {:?}", other),
    }

    s.taker_opens_mediation().await;
    let fault = s
        .taker
        .wait_for("dispute fault", |event| {
            matches!(event, AppEvent::DisputeFault { .. })
        })
        .await;
    assert!(matches!(
        fault,
        AppEvent::DisputeFault {
            error: DisputeError::AlreadyOpen { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_dispute_needs_a_contract() {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("no-contract", Direction::Buyer, DepositScheme::Classic);
    let mut maker = TestNode::maker(&network, &ledger).await;
    maker.add_trade(fixtures::maker_trade(&offer)).await;

    maker
        .command(Command::OpenDispute {
            trade_id: offer.id.clone(),
            support_type: SupportType::Refund,
            reopen: false,
        })
        .await;
    let fault = maker
        .wait_for("dispute fault", |event| {
            matches!(event, AppEvent::DisputeFault { .. })
        })
        .await;
    assert!(matches!(
        fault,
        AppEvent::DisputeFault {
            error: DisputeError::NoContract { .. },
            ..
        }
    ));
}

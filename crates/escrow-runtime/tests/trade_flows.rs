//! End-to-end trade flows over the loopback network
//!
//! Maker and taker engines run against a shared ledger; the tests drive them
//! with the same commands a wallet application would send.

mod common;

use common::TestNode;
use escrow_core::channel::{Effect, Event};
use escrow_core::testing::{fixtures, Ledger};
use escrow_core::trade::{DepositScheme, Direction, TradeState};
use escrow_core::types::TradeId;
use escrow_core::wallet::TxKind;
use escrow_core::{AppEvent, Command};
use escrow_runtime::{Intercept, LoopbackNetwork, TaskKind};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Split maker and taker into buyer and seller for the offer direction
fn buyer_and_seller<'a>(
    maker_direction: Direction,
    maker: &'a mut TestNode,
    taker: &'a mut TestNode,
) -> (&'a mut TestNode, &'a mut TestNode) {
    match maker_direction {
        Direction::Buyer => (maker, taker),
        Direction::Seller => (taker, maker),
    }
}

async fn run_to_deposit(
    maker: &mut TestNode,
    taker: &mut TestNode,
    offer: &escrow_core::trade::Offer,
) -> TradeId {
    let trade_id = offer.id.clone();
    maker.add_trade(fixtures::maker_trade(offer)).await;
    taker.add_trade(fixtures::taker_trade(offer)).await;
    taker
        .command(Command::TakeOffer {
            trade_id: trade_id.clone(),
        })
        .await;

    let (buyer, seller) = buyer_and_seller(offer.direction, maker, taker);
    seller
        .wait_pipeline("SellerHandleDelayedPayoutTxSignatureResponse")
        .await;
    buyer
        .wait_pipeline("BuyerHandleDepositTxAndDelayedPayoutTxMessage")
        .await;
    trade_id
}

async fn run_to_completion(buyer: &mut TestNode, seller: &mut TestNode, trade_id: &TradeId) {
    buyer
        .command(Command::PaymentStarted {
            trade_id: trade_id.clone(),
        })
        .await;
    seller
        .wait_pipeline("SellerHandleCounterCurrencyTransferStartedMessage")
        .await;

    seller
        .command(Command::PaymentReceived {
            trade_id: trade_id.clone(),
        })
        .await;
    buyer
        .wait_pipeline("BuyerHandlePayoutTxPublishedMessage")
        .await;

    for node in [&mut *buyer, &mut *seller] {
        node.command(Command::CompleteTrade {
            trade_id: trade_id.clone(),
        })
        .await;
        node.wait_state(TradeState::TradeCompleted).await;
    }
}

async fn classic_trade(maker_direction: Direction) {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("classic", maker_direction, DepositScheme::Classic);
    fixtures::publish_maker_fee(&ledger, &offer);

    let mut maker = TestNode::maker(&network, &ledger).await;
    let mut taker = TestNode::taker(&network, &ledger).await;
    let trade_id = run_to_deposit(&mut maker, &mut taker, &offer).await;
    {
        let (buyer, seller) = buyer_and_seller(maker_direction, &mut maker, &mut taker);
        run_to_completion(buyer, seller, &trade_id).await;
    }

    assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 1);
    assert_eq!(ledger.broadcast_count(TxKind::Deposit), 1);
    assert_eq!(ledger.broadcast_count(TxKind::Payout), 1);
    // The delayed payout is only a safety net
    assert_eq!(ledger.broadcast_count(TxKind::DelayedPayout), 0);
    assert_eq!(network.statistics().statistics_published, 1);
    maker.assert_phases_monotonic(&trade_id);
    taker.assert_phases_monotonic(&trade_id);
}

// ----------------------------------------------------------------------------
// Classic deposit
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_classic_trade_with_buyer_as_maker() {
    classic_trade(Direction::Buyer).await;
}

#[tokio::test]
async fn test_classic_trade_with_seller_as_maker() {
    classic_trade(Direction::Seller).await;
}

#[tokio::test]
async fn test_payment_started_before_deposit_is_rejected() {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("early", Direction::Buyer, DepositScheme::Classic);
    fixtures::publish_maker_fee(&ledger, &offer);

    let mut maker = TestNode::maker(&network, &ledger).await;
    maker.add_trade(fixtures::maker_trade(&offer)).await;
    maker
        .command(Command::PaymentStarted {
            trade_id: offer.id.clone(),
        })
        .await;

    let event = maker
        .wait_for("rejection", |event| {
            matches!(event, AppEvent::MessageRejected { .. })
        })
        .await;
    match event {
        AppEvent::MessageRejected { trade_id, kind, .. } => {
            assert_eq!(trade_id, offer.id);
            assert_eq!(kind, "PaymentStarted");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(ledger.broadcast_count(TxKind::Payout), 0);
}

#[tokio::test]
async fn test_failed_task_leaves_trade_at_last_step_and_nacks_peer() {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("intercepted", Direction::Seller, DepositScheme::Classic);
    fixtures::publish_maker_fee(&ledger, &offer);

    let mut maker = TestNode::maker(&network, &ledger).await;
    let mut taker = TestNode::taker(&network, &ledger).await;
    taker.handle.registry().set_intercept(
        TaskKind::TakerPublishFeeTx,
        Intercept::Fail {
            reason: "wallet offline".into(),
        },
    );

    maker.add_trade(fixtures::maker_trade(&offer)).await;
    taker.add_trade(fixtures::taker_trade(&offer)).await;
    taker
        .command(Command::TakeOffer {
            trade_id: offer.id.clone(),
        })
        .await;

    let failure = taker
        .wait_for("pipeline failure", |event| {
            matches!(event, AppEvent::PipelineFailed { .. })
        })
        .await;
    match failure {
        AppEvent::PipelineFailed {
            transition,
            task,
            reason,
            ..
        } => {
            assert_eq!(transition, "BuyerAsTakerHandleInputsForDepositTxResponse");
            assert_eq!(task, "TakerPublishFeeTx");
            assert!(reason.contains("wallet offline"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    maker
        .wait_for("negative ack", |event| {
            matches!(event, AppEvent::AckReceived { success: false, .. })
        })
        .await;
    assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 0);
    assert_eq!(ledger.broadcast_count(TxKind::Deposit), 0);
}

#[tokio::test]
async fn test_failed_message_runs_again_when_redelivered() {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("redelivered", Direction::Seller, DepositScheme::Classic);
    fixtures::publish_maker_fee(&ledger, &offer);

    let mut maker = TestNode::maker(&network, &ledger).await;
    let mut taker = TestNode::taker(&network, &ledger).await;
    let mut maker_effects = maker.handle.subscribe_effects();
    taker.handle.registry().set_intercept(
        TaskKind::TakerPublishFeeTx,
        Intercept::Fail {
            reason: "wallet offline".into(),
        },
    );

    maker.add_trade(fixtures::maker_trade(&offer)).await;
    taker.add_trade(fixtures::taker_trade(&offer)).await;
    taker
        .command(Command::TakeOffer {
            trade_id: offer.id.clone(),
        })
        .await;
    taker
        .wait_for("pipeline failure", |event| {
            matches!(event, AppEvent::PipelineFailed { .. })
        })
        .await;

    let response = tokio::time::timeout(common::WAIT, async {
        loop {
            match maker_effects.recv().await.unwrap() {
                Effect::SendMailbox { envelope, .. }
                    if envelope.kind() == "InputsForDepositTxResponse" =>
                {
                    return *envelope
                }
                _ => {}
            }
        }
    })
    .await
    .expect("maker sent its inputs response");
    let uid = response.uid;
    maker
        .seen_or_wait("negative ack", |event| {
            matches!(event, AppEvent::AckReceived { source_uid, success: false, .. } if *source_uid == uid)
        })
        .await;

    // Wallet is back; the mailbox hands over the same envelope again
    taker
        .handle
        .registry()
        .clear_intercept(TaskKind::TakerPublishFeeTx);
    taker
        .handle
        .event_sender()
        .send(Event::MessageReceived(Box::new(response)))
        .await
        .unwrap();

    taker
        .wait_pipeline("BuyerAsTakerHandleInputsForDepositTxResponse")
        .await;
    maker
        .wait_for("positive ack", |event| {
            matches!(event, AppEvent::AckReceived { source_uid, success: true, .. } if *source_uid == uid)
        })
        .await;
    assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 1);
}

// ----------------------------------------------------------------------------
// Resume
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_trade_resumes_after_restart() {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("resume", Direction::Buyer, DepositScheme::Classic);
    fixtures::publish_maker_fee(&ledger, &offer);

    let mut maker = TestNode::maker(&network, &ledger).await;
    let mut taker = TestNode::taker(&network, &ledger).await;
    let trade_id = run_to_deposit(&mut maker, &mut taker, &offer).await;

    // Buyer restarts between deposit and payment
    let mut maker = maker.restart(&network, &ledger).await;
    maker
        .wait_for("trade reloaded", |event| {
            matches!(event, AppEvent::TradeAdded { trade_id: id, .. } if *id == trade_id)
        })
        .await;
    match maker.status().await {
        AppEvent::StatusReport { trades, .. } => assert_eq!(trades, 1),
        other => panic!("unexpected event {:?}", other),
    }

    run_to_completion(&mut maker, &mut taker, &trade_id).await;
    assert_eq!(ledger.broadcast_count(TxKind::Payout), 1);
}

// ----------------------------------------------------------------------------
// Multisig reservation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_multisig_reservation_and_funding() {
    let network = LoopbackNetwork::new();
    let ledger = Ledger::new();
    let offer = fixtures::offer("multisig", Direction::Seller, DepositScheme::Multisig);
    fixtures::publish_maker_fee(&ledger, &offer);

    let mut maker = TestNode::maker(&network, &ledger).await;
    let mut taker = TestNode::taker(&network, &ledger).await;
    maker.add_trade(fixtures::maker_trade(&offer)).await;
    taker.add_trade(fixtures::taker_trade(&offer)).await;
    taker
        .command(Command::TakeOffer {
            trade_id: offer.id.clone(),
        })
        .await;

    // Maker is not ready until the taker fee is confirmed
    taker.wait_pipeline("TakerReserveTrade").await;
    assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 1);
    assert_eq!(ledger.broadcast_count(TxKind::MultisigFunding), 0);

    ledger.mine_blocks(2);
    taker
        .wait_pipeline("TakerHandleMakerReadyToFundMultisig")
        .await;
    maker.wait_pipeline("SellerFundMultisig").await;
    taker.wait_pipeline("BuyerFundMultisig").await;

    assert!(taker.has_seen(|event| matches!(
        event,
        AppEvent::TradeStateChanged {
            state: TradeState::MultisigDepositFunded,
            ..
        }
    )));
    assert_eq!(ledger.broadcast_count(TxKind::MultisigFunding), 2);
    assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 1);
    assert_eq!(ledger.broadcast_count(TxKind::Deposit), 0);
    maker.assert_phases_monotonic(&offer.id);
    taker.assert_phases_monotonic(&offer.id);
}

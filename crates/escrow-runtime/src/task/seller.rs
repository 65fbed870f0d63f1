//! Seller steps: delayed payout creation, deposit publication and the payout

use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    errors::TaskError,
    message::{
        DelayedPayoutTxSignatureRequest, DepositTxAndDelayedPayoutTxMessage,
        PayoutTxPublishedMessage, TradeMessage,
    },
    trade::TradeState,
    types::PubKeyRing,
    wallet::{RawTx, TxKind, TxOutput, TxRequest},
};
use tracing::{debug, info};

use super::common::{
    contract, delayed_payout_address, multisig_address, payout_request, peer_key,
    prepared_deposit,
};
use super::{Task, TaskContext, TaskKind, TaskRegistry};
use crate::expect_message;

pub fn register(registry: &mut TaskRegistry) {
    registry.register(Arc::new(SellerAsMakerProcessDepositTxMessage));
    registry.register(Arc::new(SellerCreatesDelayedPayoutTx));
    registry.register(Arc::new(SellerSignsDelayedPayoutTx));
    registry.register(Arc::new(SellerSendsDelayedPayoutTxSignatureRequest));
    registry.register(Arc::new(SellerProcessDelayedPayoutTxSignatureResponse));
    registry.register(Arc::new(SellerFinalizesDelayedPayoutTx));
    registry.register(Arc::new(SellerPublishesDepositTx));
    registry.register(Arc::new(SellerSendsDepositTxAndDelayedPayoutTxMessage));
    registry.register(Arc::new(SellerProcessCounterCurrencyTransferStartedMessage));
    registry.register(Arc::new(SellerSignAndFinalizePayoutTx));
    registry.register(Arc::new(SellerBroadcastPayoutTx));
    registry.register(Arc::new(SellerSendPayoutTxPublishedMessage));
}

fn prepared_delayed_payout(ctx: &TaskContext) -> Result<RawTx, TaskError> {
    ctx.trade
        .process_model
        .prepared_delayed_payout_tx
        .clone()
        .ok_or_else(|| TaskError::missing("prepared delayed payout tx"))
}

/// Adopt the signatures of the peer's copy of a transaction we prepared
fn merge_peer_signatures(ours: &mut RawTx, theirs: &RawTx, peer: &PubKeyRing) -> Result<(), TaskError> {
    if !theirs.is_signed_by(peer) {
        return Err(TaskError::verification(format!(
            "{:?} tx is not signed by the buyer",
            theirs.kind
        )));
    }
    ours.merge_signatures(theirs)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Deposit and Delayed Payout
// ----------------------------------------------------------------------------

/// Seller as maker receives the buyer-signed deposit
pub struct SellerAsMakerProcessDepositTxMessage;

#[async_trait]
impl Task for SellerAsMakerProcessDepositTxMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerAsMakerProcessDepositTxMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = expect_message!(ctx, DepositTxMessage);
        let mut deposit = prepared_deposit(ctx)?;
        merge_peer_signatures(&mut deposit, &message.deposit_tx, &peer_key(ctx)?)?;
        ctx.trade.process_model.prepared_deposit_tx = Some(deposit);
        Ok(())
    }
}

/// Delayed payout spending the whole escrow to the refund agent after the lock time
pub struct SellerCreatesDelayedPayoutTx;

#[async_trait]
impl Task for SellerCreatesDelayedPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerCreatesDelayedPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.process_model.prepared_delayed_payout_tx.is_some() {
            return Ok(());
        }
        let deposit = prepared_deposit(ctx)?;
        let trade = &ctx.trade;
        let escrowed = deposit
            .output_to(&multisig_address(&trade.id))
            .ok_or_else(|| TaskError::invalid("Deposit tx has no multisig output"))?;
        let request = TxRequest {
            kind: TxKind::DelayedPayout,
            trade_id: trade.id.clone(),
            inputs: vec![deposit.tx_id()],
            outputs: vec![TxOutput {
                address: delayed_payout_address(&trade.offer),
                amount: escrowed,
            }],
            lock_time: trade.lock_time.ok_or_else(|| TaskError::missing("lock time"))?,
        };
        let dpt = ctx.services.wallet.create_transaction(request).await?;
        ctx.trade.process_model.prepared_delayed_payout_tx = Some(dpt);
        Ok(())
    }
}

pub struct SellerSignsDelayedPayoutTx;

#[async_trait]
impl Task for SellerSignsDelayedPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerSignsDelayedPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let dpt = prepared_delayed_payout(ctx)?;
        let signed = ctx.services.wallet.sign_transaction(dpt).await?;
        ctx.trade.process_model.prepared_delayed_payout_tx = Some(signed);
        Ok(())
    }
}

pub struct SellerSendsDelayedPayoutTxSignatureRequest;

#[async_trait]
impl Task for SellerSendsDelayedPayoutTxSignatureRequest {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerSendsDelayedPayoutTxSignatureRequest
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let request = DelayedPayoutTxSignatureRequest {
            trade_id: ctx.trade.id.clone(),
            delayed_payout_tx: prepared_delayed_payout(ctx)?,
            deposit_tx: prepared_deposit(ctx)?,
        };
        ctx.send_to_peer(TradeMessage::DelayedPayoutTxSignatureRequest(request))?;
        ctx.advance_state(TradeState::SellerSentDelayedPayoutTxSignatureRequest)
    }
}

pub struct SellerProcessDelayedPayoutTxSignatureResponse;

#[async_trait]
impl Task for SellerProcessDelayedPayoutTxSignatureResponse {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerProcessDelayedPayoutTxSignatureResponse
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let response = expect_message!(ctx, DelayedPayoutTxSignatureResponse);
        let peer = peer_key(ctx)?;
        let mut dpt = prepared_delayed_payout(ctx)?;
        merge_peer_signatures(&mut dpt, &response.delayed_payout_tx, &peer)?;
        let mut deposit = prepared_deposit(ctx)?;
        merge_peer_signatures(&mut deposit, &response.deposit_tx, &peer)?;

        let model = &mut ctx.trade.process_model;
        model.prepared_delayed_payout_tx = Some(dpt);
        model.prepared_deposit_tx = Some(deposit);
        Ok(())
    }
}

pub struct SellerFinalizesDelayedPayoutTx;

#[async_trait]
impl Task for SellerFinalizesDelayedPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerFinalizesDelayedPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let dpt = prepared_delayed_payout(ctx)?;
        if !dpt.is_fully_signed() {
            return Err(TaskError::verification(format!(
                "Delayed payout tx has {} of {} signatures",
                dpt.valid_signature_count(),
                dpt.kind.required_signatures()
            )));
        }
        ctx.trade.delayed_payout_tx_id = Some(dpt.tx_id());
        ctx.trade.delayed_payout_tx = Some(dpt);
        Ok(())
    }
}

/// Broadcast the fully signed deposit; skipped once published
pub struct SellerPublishesDepositTx;

#[async_trait]
impl Task for SellerPublishesDepositTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerPublishesDepositTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.deposit_tx_id.is_some() {
            debug!(trade_id = %ctx.trade.id, "Deposit tx already published");
            return ctx.advance_state(TradeState::SellerPublishedDepositTx);
        }
        let deposit = prepared_deposit(ctx)?;
        let tx_id = ctx.services.wallet.broadcast_transaction(&deposit).await?;
        info!(trade_id = %ctx.trade.id, tx_id = %tx_id, "Published deposit tx");
        ctx.trade.deposit_tx_id = Some(tx_id);
        ctx.trade.deposit_tx = Some(deposit);
        ctx.advance_state(TradeState::SellerPublishedDepositTx)
    }
}

pub struct SellerSendsDepositTxAndDelayedPayoutTxMessage;

#[async_trait]
impl Task for SellerSendsDepositTxAndDelayedPayoutTxMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerSendsDepositTxAndDelayedPayoutTxMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let trade = &ctx.trade;
        let message = DepositTxAndDelayedPayoutTxMessage {
            trade_id: trade.id.clone(),
            deposit_tx: trade
                .deposit_tx
                .clone()
                .ok_or_else(|| TaskError::missing("deposit tx"))?,
            delayed_payout_tx: trade
                .delayed_payout_tx
                .clone()
                .ok_or_else(|| TaskError::missing("delayed payout tx"))?,
        };
        ctx.send_to_peer(TradeMessage::DepositTxAndDelayedPayoutTxMessage(message))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Payment and Payout
// ----------------------------------------------------------------------------

/// Accept the buyer's payment notice and its pre-signed payout
pub struct SellerProcessCounterCurrencyTransferStartedMessage;

#[async_trait]
impl Task for SellerProcessCounterCurrencyTransferStartedMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerProcessCounterCurrencyTransferStartedMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = expect_message!(ctx, CounterCurrencyTransferStartedMessage);
        let contract = contract(ctx)?;
        if message.buyer_payout_address != contract.buyer.payout_address {
            return Err(TaskError::verification(
                "Buyer payout address differs from contract",
            ));
        }
        let payout = message.buyer_signed_payout_tx;
        let expected = payout_request(&ctx.trade, &contract)?;
        if payout.kind != TxKind::Payout
            || payout.inputs != expected.inputs
            || payout.outputs != expected.outputs
        {
            return Err(TaskError::verification("Payout tx does not match the contract"));
        }
        if !payout.is_signed_by(&peer_key(ctx)?) {
            return Err(TaskError::verification("Payout tx is not signed by the buyer"));
        }

        if let Some(tx_id) = &message.counter_currency_tx_id {
            debug!(trade_id = %ctx.trade.id, tx_id = %tx_id, "Buyer reported counter-currency tx");
        }
        ctx.trade.process_model.peer.payout_address = Some(message.buyer_payout_address);
        ctx.trade.process_model.prepared_payout_tx = Some(payout);
        ctx.advance_state(TradeState::SellerReceivedFiatPaymentInitiatedMsg)
    }
}

pub struct SellerSignAndFinalizePayoutTx;

#[async_trait]
impl Task for SellerSignAndFinalizePayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerSignAndFinalizePayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let payout = ctx
            .trade
            .process_model
            .prepared_payout_tx
            .clone()
            .ok_or_else(|| TaskError::missing("buyer signed payout tx"))?;
        let signed = ctx.services.wallet.sign_transaction(payout).await?;
        if !signed.is_fully_signed() {
            return Err(TaskError::verification("Payout tx is not fully signed"));
        }
        ctx.trade.process_model.prepared_payout_tx = Some(signed);
        ctx.advance_state(TradeState::SellerConfirmedFiatPaymentReceipt)
    }
}

/// Broadcast the payout; skipped once published
pub struct SellerBroadcastPayoutTx;

#[async_trait]
impl Task for SellerBroadcastPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerBroadcastPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.payout_tx_id.is_some() {
            debug!(trade_id = %ctx.trade.id, "Payout tx already published");
            return ctx.advance_state(TradeState::SellerPublishedPayoutTx);
        }
        let payout = ctx
            .trade
            .process_model
            .prepared_payout_tx
            .clone()
            .ok_or_else(|| TaskError::missing("signed payout tx"))?;
        let tx_id = ctx.services.wallet.broadcast_transaction(&payout).await?;
        info!(trade_id = %ctx.trade.id, tx_id = %tx_id, "Published payout tx");
        ctx.trade.payout_tx_id = Some(tx_id);
        ctx.trade.payout_tx = Some(payout);
        ctx.advance_state(TradeState::SellerPublishedPayoutTx)
    }
}

pub struct SellerSendPayoutTxPublishedMessage;

#[async_trait]
impl Task for SellerSendPayoutTxPublishedMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::SellerSendPayoutTxPublishedMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = PayoutTxPublishedMessage {
            trade_id: ctx.trade.id.clone(),
            payout_tx: ctx
                .trade
                .payout_tx
                .clone()
                .ok_or_else(|| TaskError::missing("payout tx"))?,
        };
        ctx.send_to_peer(TradeMessage::PayoutTxPublishedMessage(message))?;
        ctx.advance_state(TradeState::SellerSentPayoutTxPublishedMsg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::common::escrow_total;
    use crate::task::test_support::context_with;
    use escrow_core::message::DepositTxMessage;
    use escrow_core::testing::{fixtures, Ledger, MockWallet};
    use escrow_core::trade::{DepositScheme, Direction, Phase};
    use escrow_core::wallet::TradeWallet;

    #[tokio::test]
    async fn test_seller_maker_builds_delayed_payout_after_deposit_message() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("sell1", Direction::Seller, DepositScheme::Classic);
        let mut trade = fixtures::maker_trade(&offer);
        trade.lock_time = Some(2_880);
        trade.process_model.peer.node_address = Some(fixtures::taker_address());
        trade.process_model.peer.pub_key_ring = Some(fixtures::taker_keys().pub_key_ring());
        let deposit = RawTx::from_request(TxRequest {
            kind: TxKind::Deposit,
            trade_id: trade.id.clone(),
            inputs: vec![],
            outputs: vec![TxOutput {
                address: multisig_address(&trade.id),
                amount: escrow_total(&trade).unwrap(),
            }],
            lock_time: 0,
        });
        trade.process_model.prepared_deposit_tx = Some(deposit.clone());

        let buyer = MockWallet::new("buyer", fixtures::taker_keys(), ledger.clone());
        let buyer_signed = buyer.sign_transaction(deposit).await.unwrap();
        trade.process_model.trade_message = Some(TradeMessage::DepositTxMessage(DepositTxMessage {
            trade_id: trade.id.clone(),
            deposit_tx: buyer_signed,
        }));

        let (mut ctx, gateway, wallet) = context_with(
            trade,
            fixtures::maker_keys(),
            fixtures::maker_address(),
            "seller",
            &ledger,
        );
        let steps: [&dyn Task; 5] = [
            &SellerAsMakerProcessDepositTxMessage,
            &crate::task::common::SignDepositTx,
            &SellerCreatesDelayedPayoutTx,
            &SellerSignsDelayedPayoutTx,
            &SellerSendsDelayedPayoutTxSignatureRequest,
        ];
        for step in steps {
            step.run(&mut ctx).await.unwrap();
        }

        let Some(TradeMessage::DelayedPayoutTxSignatureRequest(request)) =
            gateway.last_trade_message()
        else {
            panic!("expected a delayed payout signature request");
        };
        assert!(request.deposit_tx.is_fully_signed());
        assert_eq!(request.delayed_payout_tx.inputs, vec![request.deposit_tx.tx_id()]);
        assert_eq!(request.delayed_payout_tx.lock_time, 2_880);
        assert_eq!(ctx.trade.phase(), Phase::TakerFeePublished);

        // Publishing twice broadcasts once
        SellerPublishesDepositTx.run(&mut ctx).await.unwrap();
        SellerPublishesDepositTx.run(&mut ctx).await.unwrap();
        assert_eq!(wallet.ledger().broadcast_count(TxKind::Deposit), 1);
        assert_eq!(ctx.trade.phase(), Phase::DepositPublished);
    }

    #[tokio::test]
    async fn test_unsigned_deposit_message_rejected() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("sell2", Direction::Seller, DepositScheme::Classic);
        let mut trade = fixtures::maker_trade(&offer);
        trade.process_model.peer.pub_key_ring = Some(fixtures::taker_keys().pub_key_ring());
        let deposit = RawTx::from_request(TxRequest {
            kind: TxKind::Deposit,
            trade_id: trade.id.clone(),
            inputs: vec![],
            outputs: vec![TxOutput {
                address: multisig_address(&trade.id),
                amount: escrow_total(&trade).unwrap(),
            }],
            lock_time: 0,
        });
        trade.process_model.prepared_deposit_tx = Some(deposit.clone());
        trade.process_model.trade_message = Some(TradeMessage::DepositTxMessage(DepositTxMessage {
            trade_id: trade.id.clone(),
            deposit_tx: deposit,
        }));
        let (mut ctx, _, _) = context_with(
            trade,
            fixtures::maker_keys(),
            fixtures::maker_address(),
            "seller",
            &ledger,
        );
        let err = SellerAsMakerProcessDepositTxMessage
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Verification { .. }));
    }
}

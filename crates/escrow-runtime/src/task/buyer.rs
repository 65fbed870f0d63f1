//! Buyer steps: co-signing the deposit and delayed payout, starting the payment

use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    errors::TaskError,
    message::{
        CounterCurrencyTransferStartedMessage, DelayedPayoutTxSignatureResponse,
        DepositTxMessage, TradeMessage,
    },
    trade::TradeState,
    wallet::{RawTx, TxKind},
};
use tracing::{debug, info};

use super::common::{
    contract, delayed_payout_address, multisig_address, payout_request, peer_key,
    prepared_deposit,
};
use super::{Task, TaskContext, TaskKind, TaskRegistry};
use crate::expect_message;

pub fn register(registry: &mut TaskRegistry) {
    registry.register(Arc::new(BuyerSendsDepositTxMessage));
    registry.register(Arc::new(BuyerProcessDelayedPayoutTxSignatureRequest));
    registry.register(Arc::new(BuyerVerifiesPreparedDelayedPayoutTx));
    registry.register(Arc::new(BuyerSignsDelayedPayoutTx));
    registry.register(Arc::new(BuyerSendsDelayedPayoutTxSignatureResponse));
    registry.register(Arc::new(BuyerProcessDepositTxAndDelayedPayoutTxMessage));
    registry.register(Arc::new(BuyerVerifiesFinalDelayedPayoutTx));
    registry.register(Arc::new(BuyerSignPayoutTx));
    registry.register(Arc::new(BuyerSendsCounterCurrencyTransferStartedMessage));
    registry.register(Arc::new(BuyerProcessPayoutTxPublishedMessage));
}

/// Delayed payout must spend the deposit after the agreed lock time and pay
/// the whole escrow to the refund agent
fn check_delayed_payout(ctx: &TaskContext, dpt: &RawTx, deposit: &RawTx) -> Result<(), TaskError> {
    let trade = &ctx.trade;
    if dpt.kind != TxKind::DelayedPayout || dpt.trade_id != trade.id {
        return Err(TaskError::verification("Delayed payout tx does not belong to trade"));
    }
    if dpt.inputs != [deposit.tx_id()] {
        return Err(TaskError::verification("Delayed payout tx does not spend the deposit"));
    }
    let lock_time = trade.lock_time.ok_or_else(|| TaskError::missing("lock time"))?;
    if dpt.lock_time != lock_time {
        return Err(TaskError::verification(format!(
            "Delayed payout lock time {} differs from agreed {}",
            dpt.lock_time, lock_time
        )));
    }
    let escrowed = deposit.output_to(&multisig_address(&trade.id));
    if escrowed.is_none() || dpt.output_to(&delayed_payout_address(&trade.offer)) != escrowed {
        return Err(TaskError::verification(
            "Delayed payout tx does not pay the escrow to the refund agent",
        ));
    }
    Ok(())
}

/// Merge the peer's signatures into our copy of the deposit, or adopt theirs
fn merge_deposit(ctx: &mut TaskContext, peer_copy: &RawTx) -> Result<(), TaskError> {
    let merged = match ctx.trade.process_model.prepared_deposit_tx.take() {
        Some(mut ours) => {
            ours.merge_signatures(peer_copy)?;
            ours
        }
        None => peer_copy.clone(),
    };
    ctx.trade.process_model.prepared_deposit_tx = Some(merged);
    Ok(())
}

// ----------------------------------------------------------------------------
// Deposit and Delayed Payout
// ----------------------------------------------------------------------------

/// Buyer as taker hands its signed deposit to the seller
pub struct BuyerSendsDepositTxMessage;

#[async_trait]
impl Task for BuyerSendsDepositTxMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerSendsDepositTxMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = DepositTxMessage {
            trade_id: ctx.trade.id.clone(),
            deposit_tx: prepared_deposit(ctx)?,
        };
        ctx.send_to_peer(TradeMessage::DepositTxMessage(message))?;
        ctx.advance_state(TradeState::BuyerSentDepositTxMessage)
    }
}

pub struct BuyerProcessDelayedPayoutTxSignatureRequest;

#[async_trait]
impl Task for BuyerProcessDelayedPayoutTxSignatureRequest {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerProcessDelayedPayoutTxSignatureRequest
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let request = expect_message!(ctx, DelayedPayoutTxSignatureRequest);
        if !request.deposit_tx.is_signed_by(&peer_key(ctx)?) {
            return Err(TaskError::verification("Deposit tx is not signed by the seller"));
        }
        merge_deposit(ctx, &request.deposit_tx)?;
        ctx.trade.process_model.prepared_delayed_payout_tx = Some(request.delayed_payout_tx);
        Ok(())
    }
}

pub struct BuyerVerifiesPreparedDelayedPayoutTx;

#[async_trait]
impl Task for BuyerVerifiesPreparedDelayedPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerVerifiesPreparedDelayedPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let dpt = ctx
            .trade
            .process_model
            .prepared_delayed_payout_tx
            .clone()
            .ok_or_else(|| TaskError::missing("prepared delayed payout tx"))?;
        check_delayed_payout(ctx, &dpt, &prepared_deposit(ctx)?)?;
        if !dpt.is_signed_by(&peer_key(ctx)?) {
            return Err(TaskError::verification(
                "Delayed payout tx is not signed by the seller",
            ));
        }
        Ok(())
    }
}

pub struct BuyerSignsDelayedPayoutTx;

#[async_trait]
impl Task for BuyerSignsDelayedPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerSignsDelayedPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let dpt = ctx
            .trade
            .process_model
            .prepared_delayed_payout_tx
            .clone()
            .ok_or_else(|| TaskError::missing("prepared delayed payout tx"))?;
        let signed = ctx.services.wallet.sign_transaction(dpt).await?;
        ctx.trade.process_model.prepared_delayed_payout_tx = Some(signed);
        Ok(())
    }
}

pub struct BuyerSendsDelayedPayoutTxSignatureResponse;

#[async_trait]
impl Task for BuyerSendsDelayedPayoutTxSignatureResponse {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerSendsDelayedPayoutTxSignatureResponse
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let response = DelayedPayoutTxSignatureResponse {
            trade_id: ctx.trade.id.clone(),
            delayed_payout_tx: ctx
                .trade
                .process_model
                .prepared_delayed_payout_tx
                .clone()
                .ok_or_else(|| TaskError::missing("prepared delayed payout tx"))?,
            deposit_tx: prepared_deposit(ctx)?,
        };
        ctx.send_to_peer(TradeMessage::DelayedPayoutTxSignatureResponse(response))?;
        ctx.advance_state(TradeState::BuyerSentDelayedPayoutTxSignatureResponse)
    }
}

/// Record the published deposit and the final delayed payout
pub struct BuyerProcessDepositTxAndDelayedPayoutTxMessage;

#[async_trait]
impl Task for BuyerProcessDepositTxAndDelayedPayoutTxMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerProcessDepositTxAndDelayedPayoutTxMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = expect_message!(ctx, DepositTxAndDelayedPayoutTxMessage);
        if !message.deposit_tx.is_fully_signed() {
            return Err(TaskError::verification("Published deposit tx is not fully signed"));
        }
        let trade = &mut ctx.trade;
        trade.deposit_tx_id = Some(message.deposit_tx.tx_id());
        trade.deposit_tx = Some(message.deposit_tx);
        trade.delayed_payout_tx_id = Some(message.delayed_payout_tx.tx_id());
        trade.delayed_payout_tx = Some(message.delayed_payout_tx);
        ctx.advance_state(TradeState::BuyerReceivedDepositTxPublishedMsg)
    }
}

pub struct BuyerVerifiesFinalDelayedPayoutTx;

#[async_trait]
impl Task for BuyerVerifiesFinalDelayedPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerVerifiesFinalDelayedPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let trade = &ctx.trade;
        let deposit = trade
            .deposit_tx
            .clone()
            .ok_or_else(|| TaskError::missing("deposit tx"))?;
        let dpt = trade
            .delayed_payout_tx
            .clone()
            .ok_or_else(|| TaskError::missing("delayed payout tx"))?;
        check_delayed_payout(ctx, &dpt, &deposit)?;
        if !dpt.is_fully_signed() || !dpt.is_signed_by(&ctx.my_pub_key_ring()) {
            return Err(TaskError::verification(
                "Final delayed payout tx is missing a signature",
            ));
        }
        if ctx
            .services
            .wallet
            .get_transaction(&deposit.tx_id())
            .await?
            .is_none()
        {
            return Err(TaskError::verification("Deposit tx is not on chain"));
        }
        debug!(trade_id = %ctx.trade.id, "Final delayed payout tx verified");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Payment and Payout
// ----------------------------------------------------------------------------

/// Create the payout from the contract and sign it as buyer
pub struct BuyerSignPayoutTx;

#[async_trait]
impl Task for BuyerSignPayoutTx {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerSignPayoutTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let my_key = ctx.my_pub_key_ring();
        if let Some(payout) = &ctx.trade.process_model.prepared_payout_tx {
            if payout.is_signed_by(&my_key) {
                return Ok(());
            }
        }
        let contract = contract(ctx)?;
        let request = payout_request(&ctx.trade, &contract)?;
        let wallet = &ctx.services.wallet;
        let payout = wallet.sign_transaction(wallet.create_transaction(request).await?).await?;
        ctx.trade.process_model.prepared_payout_tx = Some(payout);
        Ok(())
    }
}

/// Announce the counter-currency payment; also used to resend it
pub struct BuyerSendsCounterCurrencyTransferStartedMessage;

#[async_trait]
impl Task for BuyerSendsCounterCurrencyTransferStartedMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerSendsCounterCurrencyTransferStartedMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let payout_address = ctx.my_payout_address();
        let message = CounterCurrencyTransferStartedMessage {
            trade_id: ctx.trade.id.clone(),
            buyer_payout_address: payout_address,
            buyer_signed_payout_tx: ctx
                .trade
                .process_model
                .prepared_payout_tx
                .clone()
                .ok_or_else(|| TaskError::missing("signed payout tx"))?,
            counter_currency_tx_id: None,
        };
        ctx.send_to_peer(TradeMessage::CounterCurrencyTransferStartedMessage(message))?;
        ctx.advance_state(TradeState::BuyerSentFiatPaymentInitiatedMsg)
    }
}

pub struct BuyerProcessPayoutTxPublishedMessage;

#[async_trait]
impl Task for BuyerProcessPayoutTxPublishedMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::BuyerProcessPayoutTxPublishedMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = expect_message!(ctx, PayoutTxPublishedMessage);
        let payout = message.payout_tx;
        if payout.kind != TxKind::Payout || !payout.is_fully_signed() {
            return Err(TaskError::verification("Payout tx is not a fully signed payout"));
        }
        let my_payout_address = ctx.my_payout_address();
        if payout.output_to(&my_payout_address).is_none() {
            return Err(TaskError::verification("Payout tx does not pay the buyer"));
        }
        info!(trade_id = %ctx.trade.id, tx_id = %payout.tx_id(), "Seller published payout tx");
        ctx.trade.payout_tx_id = Some(payout.tx_id());
        ctx.trade.payout_tx = Some(payout);
        ctx.advance_state(TradeState::BuyerReceivedPayoutTxPublishedMsg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::common::escrow_total;
    use crate::task::test_support::context_with;
    use escrow_core::message::DelayedPayoutTxSignatureRequest;
    use escrow_core::testing::{fixtures, Ledger, MockWallet};
    use escrow_core::trade::{DepositScheme, Direction, Trade};
    use escrow_core::wallet::{TradeWallet, TxOutput, TxRequest};

    fn buyer_trade(id: &str) -> Trade {
        // Taker is the buyer when the maker sells
        let offer = fixtures::offer(id, Direction::Seller, DepositScheme::Classic);
        let mut trade = fixtures::taker_trade(&offer);
        trade.lock_time = Some(2_880);
        trade
    }

    async fn seller_signed(seller: &MockWallet, trade: &Trade) -> (RawTx, RawTx) {
        let deposit = RawTx::from_request(TxRequest {
            kind: TxKind::Deposit,
            trade_id: trade.id.clone(),
            inputs: vec![],
            outputs: vec![TxOutput {
                address: multisig_address(&trade.id),
                amount: escrow_total(trade).unwrap(),
            }],
            lock_time: 0,
        });
        let dpt = RawTx::from_request(TxRequest {
            kind: TxKind::DelayedPayout,
            trade_id: trade.id.clone(),
            inputs: vec![deposit.tx_id()],
            outputs: vec![TxOutput {
                address: delayed_payout_address(&trade.offer),
                amount: escrow_total(trade).unwrap(),
            }],
            lock_time: 2_880,
        });
        (
            seller.sign_transaction(deposit).await.unwrap(),
            seller.sign_transaction(dpt).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_buyer_cosigns_delayed_payout() {
        let ledger = Ledger::new();
        let trade = buyer_trade("dpt1");
        let seller = MockWallet::new("seller", fixtures::maker_keys(), ledger.clone());
        let (deposit, dpt) = seller_signed(&seller, &trade).await;
        let (mut ctx, gateway, _) = context_with(
            trade,
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "buyer",
            &ledger,
        );
        ctx.trade.process_model.trade_message = Some(
            TradeMessage::DelayedPayoutTxSignatureRequest(DelayedPayoutTxSignatureRequest {
                trade_id: ctx.trade.id.clone(),
                delayed_payout_tx: dpt,
                deposit_tx: deposit,
            }),
        );

        let steps: [&dyn Task; 4] = [
            &BuyerProcessDelayedPayoutTxSignatureRequest,
            &BuyerVerifiesPreparedDelayedPayoutTx,
            &BuyerSignsDelayedPayoutTx,
            &BuyerSendsDelayedPayoutTxSignatureResponse,
        ];
        for step in steps {
            step.run(&mut ctx).await.unwrap();
        }

        let Some(TradeMessage::DelayedPayoutTxSignatureResponse(response)) =
            gateway.last_trade_message()
        else {
            panic!("expected a signature response");
        };
        assert!(response.delayed_payout_tx.is_fully_signed());
        assert_eq!(
            ctx.trade.state(),
            TradeState::BuyerSentDelayedPayoutTxSignatureResponse
        );
    }

    #[tokio::test]
    async fn test_wrong_lock_time_rejected() {
        let ledger = Ledger::new();
        let mut trade = buyer_trade("dpt2");
        let seller = MockWallet::new("seller", fixtures::maker_keys(), ledger.clone());
        let (deposit, dpt) = seller_signed(&seller, &trade).await;
        trade.lock_time = Some(100);
        let (mut ctx, _, _) = context_with(
            trade,
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "buyer",
            &ledger,
        );
        ctx.trade.process_model.prepared_deposit_tx = Some(deposit);
        ctx.trade.process_model.prepared_delayed_payout_tx = Some(dpt);

        let err = BuyerVerifiesPreparedDelayedPayoutTx
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Verification { ref reason } if reason.contains("lock time")));
    }
}

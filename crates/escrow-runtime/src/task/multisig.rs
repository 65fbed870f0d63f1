//! Multisig deposit scheme: participant info exchange and funding

use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    errors::TaskError,
    message::{InitMultisigMessage, TradeMessage},
    trade::TradeState,
    wallet::{TxKind, TxOutput, TxRequest},
};
use tracing::{debug, info};

use super::common::multisig_address;
use super::{Task, TaskContext, TaskKind, TaskRegistry};
use crate::expect_message;

const INIT_MULTISIG: &str = "InitMultisigMessage";

pub fn register(registry: &mut TaskRegistry) {
    registry.register(Arc::new(ProcessInitMultisigMessage));
    registry.register(Arc::new(SendInitMultisigMessage));
    registry.register(Arc::new(FundMultisig));
}

pub struct ProcessInitMultisigMessage;

#[async_trait]
impl Task for ProcessInitMultisigMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::ProcessInitMultisigMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let message = expect_message!(ctx, InitMultisigMessage);
        if message.prepared_multisig_info.is_empty() {
            return Err(TaskError::invalid("Empty multisig info"));
        }
        ctx.trade.process_model.peer.multisig_info = Some(message.prepared_multisig_info);
        Ok(())
    }
}

/// Send our participant info once; completes the setup when the peer's is known
pub struct SendInitMultisigMessage;

#[async_trait]
impl Task for SendInitMultisigMessage {
    fn kind(&self) -> TaskKind {
        TaskKind::SendInitMultisigMessage
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let info = match ctx.trade.process_model.my_multisig_info.clone() {
            Some(info) => info,
            None => {
                let info = ctx.services.wallet.prepare_multisig(&ctx.trade.id).await?;
                ctx.trade.process_model.my_multisig_info = Some(info.clone());
                info
            }
        };

        if ctx.trade.process_model.has_sent(INIT_MULTISIG) {
            debug!(trade_id = %ctx.trade.id, "Multisig info already sent");
        } else {
            let message = InitMultisigMessage {
                trade_id: ctx.trade.id.clone(),
                prepared_multisig_info: info,
            };
            ctx.send_to_peer(TradeMessage::InitMultisigMessage(message))?;
        }

        if ctx.trade.process_model.peer.multisig_info.is_some() {
            ctx.trade.process_model.multisig_setup_complete = true;
            ctx.advance_state(TradeState::MultisigPrepared)?;
            info!(trade_id = %ctx.trade.id, "Multisig setup complete");
        }
        Ok(())
    }
}

/// Pay our share into the multisig: the buyer its deposit, the seller amount plus deposit
pub struct FundMultisig;

#[async_trait]
impl Task for FundMultisig {
    fn kind(&self) -> TaskKind {
        TaskKind::FundMultisig
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.deposit_tx_id.is_some() {
            debug!(trade_id = %ctx.trade.id, "Multisig already funded");
            return Ok(());
        }
        if !ctx.trade.process_model.multisig_setup_complete {
            return Err(TaskError::missing("completed multisig setup"));
        }
        let trade = &ctx.trade;
        let share = if trade.role.is_buyer() {
            trade.offer.buyer_security_deposit
        } else {
            trade
                .amount
                .checked_add(trade.offer.seller_security_deposit)
                .ok_or_else(|| TaskError::invalid("seller share overflows"))?
        };
        let request = TxRequest {
            kind: TxKind::MultisigFunding,
            trade_id: trade.id.clone(),
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                address: multisig_address(&trade.id),
                amount: share,
            }],
            lock_time: 0,
        };
        let wallet = &ctx.services.wallet;
        let funding = wallet.sign_transaction(wallet.create_transaction(request).await?).await?;
        let tx_id = wallet.broadcast_transaction(&funding).await?;
        info!(trade_id = %ctx.trade.id, tx_id = %tx_id, share = %share, "Funded multisig");

        ctx.trade.deposit_tx_id = Some(tx_id);
        ctx.trade.deposit_tx = Some(funding);
        ctx.set_state(TradeState::MultisigDepositFunded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::context_with;
    use escrow_core::testing::{fixtures, Ledger};
    use escrow_core::trade::{DepositScheme, Direction, Phase};
    use escrow_core::types::Coin;

    #[tokio::test]
    async fn test_setup_completes_once_both_infos_known() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("msig1", Direction::Buyer, DepositScheme::Multisig);
        let (mut ctx, gateway, _) = context_with(
            fixtures::taker_trade(&offer),
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "taker",
            &ledger,
        );

        SendInitMultisigMessage.run(&mut ctx).await.unwrap();
        assert_eq!(gateway.sent_count(), 1);
        assert!(!ctx.trade.process_model.multisig_setup_complete);
        assert_eq!(ctx.trade.phase(), Phase::Init);

        ctx.trade.process_model.trade_message =
            Some(TradeMessage::InitMultisigMessage(InitMultisigMessage {
                trade_id: ctx.trade.id.clone(),
                prepared_multisig_info: "maker-info".into(),
            }));
        ProcessInitMultisigMessage.run(&mut ctx).await.unwrap();
        SendInitMultisigMessage.run(&mut ctx).await.unwrap();

        // Info is not sent a second time
        assert_eq!(gateway.sent_count(), 1);
        assert!(ctx.trade.process_model.multisig_setup_complete);
        assert_eq!(ctx.trade.state(), TradeState::MultisigPrepared);
    }

    #[tokio::test]
    async fn test_seller_funds_amount_and_deposit_once() {
        let ledger = Ledger::new();
        // Maker buys, so the taker sells
        let offer = fixtures::offer("msig2", Direction::Buyer, DepositScheme::Multisig);
        let (mut ctx, _, _) = context_with(
            fixtures::taker_trade(&offer),
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "taker",
            &ledger,
        );
        assert!(FundMultisig.run(&mut ctx).await.is_err());

        ctx.trade.process_model.multisig_setup_complete = true;
        FundMultisig.run(&mut ctx).await.unwrap();
        FundMultisig.run(&mut ctx).await.unwrap();

        assert_eq!(ledger.broadcast_count(TxKind::MultisigFunding), 1);
        let funding = ctx.trade.deposit_tx.clone().unwrap();
        assert_eq!(
            funding.output_to(&multisig_address(&ctx.trade.id)),
            Some(Coin::from_sat(11_500_000))
        );
        assert_eq!(ctx.trade.phase(), Phase::DepositPublished);
    }
}

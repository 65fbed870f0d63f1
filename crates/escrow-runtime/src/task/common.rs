//! Steps shared by several roles, and the transaction layout helpers the
//! role-specific steps build on

use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    crypto::sha256_hex,
    errors::TaskError,
    services::TradeStatistics,
    trade::{Contract, DepositScheme, Offer, Trade, TradeState},
    types::{Coin, PubKeyRing, TradeId, TxId},
    wallet::{RawTx, TxKind, TxOutput, TxRequest},
};
use tracing::{debug, info};

use super::{Task, TaskContext, TaskKind, TaskRegistry};

pub fn register(registry: &mut TaskRegistry) {
    registry.register(Arc::new(ApplyFilter));
    registry.register(Arc::new(VerifyPeersAccountAgeWitness));
    registry.register(Arc::new(SignDepositTx));
    registry.register(Arc::new(PublishTradeStatistics));
    registry.register(Arc::new(CloseTrade));
}

// ----------------------------------------------------------------------------
// Transaction Layout
// ----------------------------------------------------------------------------

/// Blocks the delayed payout stays locked after the deposit
pub const DELAYED_PAYOUT_LOCK_BLOCKS: u32 = 2_880;

/// Escrow output both parties pay into
pub fn multisig_address(trade_id: &TradeId) -> String {
    format!("multisig-{}", trade_id)
}

/// Receiver of the delayed payout when nobody cooperates
pub fn delayed_payout_address(offer: &Offer) -> String {
    format!("refund-agent-{}", offer.refund_agent.node_address)
}

/// Amount locked in escrow: trade amount plus both security deposits
pub fn escrow_total(trade: &Trade) -> Result<Coin, TaskError> {
    trade
        .amount
        .checked_add(trade.offer.buyer_security_deposit)
        .and_then(|sum| sum.checked_add(trade.offer.seller_security_deposit))
        .ok_or_else(|| TaskError::invalid("escrow amount overflows"))
}

/// Transaction the payout spends
pub fn deposit_input(trade: &Trade) -> Result<TxId, TaskError> {
    match trade.offer.deposit_scheme {
        DepositScheme::Classic => trade
            .deposit_tx_id
            .clone()
            .ok_or_else(|| TaskError::missing("deposit tx id")),
        DepositScheme::Multisig => Ok(TxId::new(multisig_address(&trade.id))),
    }
}

/// Payout outputs: the buyer receives amount and deposit, the seller its deposit
pub fn payout_request(trade: &Trade, contract: &Contract) -> Result<TxRequest, TaskError> {
    let buyer_amount = trade
        .amount
        .checked_add(trade.offer.buyer_security_deposit)
        .ok_or_else(|| TaskError::invalid("buyer payout overflows"))?;
    Ok(TxRequest {
        kind: TxKind::Payout,
        trade_id: trade.id.clone(),
        inputs: vec![deposit_input(trade)?],
        outputs: vec![
            TxOutput {
                address: contract.buyer.payout_address.clone(),
                amount: buyer_amount,
            },
            TxOutput {
                address: contract.seller.payout_address.clone(),
                amount: trade.offer.seller_security_deposit,
            },
        ],
        lock_time: 0,
    })
}

pub fn peer_key(ctx: &TaskContext) -> Result<PubKeyRing, TaskError> {
    ctx.trade
        .process_model
        .peer
        .pub_key_ring
        .ok_or_else(|| TaskError::missing("peer pub key ring"))
}

pub fn prepared_deposit(ctx: &TaskContext) -> Result<RawTx, TaskError> {
    ctx.trade
        .process_model
        .prepared_deposit_tx
        .clone()
        .ok_or_else(|| TaskError::missing("prepared deposit tx"))
}

pub fn contract(ctx: &TaskContext) -> Result<Contract, TaskError> {
    Ok(ctx.trade.contract()?.clone())
}

// ----------------------------------------------------------------------------
// Shared Tasks
// ----------------------------------------------------------------------------

/// Reject offers, peers and payment methods banned by the filter
pub struct ApplyFilter;

#[async_trait]
impl Task for ApplyFilter {
    fn kind(&self) -> TaskKind {
        TaskKind::ApplyFilter
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let filter = &ctx.services.filter;
        let trade = &ctx.trade;
        let banned = |reason: String| Err(TaskError::Filtered { reason });

        if filter.is_offer_banned(&trade.id) {
            return banned(format!("Offer ID is banned. Offer ID={}", trade.id));
        }
        let peer_address = trade
            .peer_address()
            .or(trade.process_model.temp_peer_address.as_ref());
        if let Some(address) = peer_address {
            if filter.is_node_banned(address) {
                return banned(format!("Node address is banned. Node address={}", address));
            }
        }
        if filter.is_payment_method_banned(&trade.offer.payment_method) {
            return banned(format!(
                "Payment method is banned. Payment method={}",
                trade.offer.payment_method
            ));
        }
        if let Some(account) = &trade.process_model.peer.payment_account {
            if filter.is_payment_method_banned(&account.payment_method) {
                return banned(format!(
                    "Peer payment method is banned. Payment method={}",
                    account.payment_method
                ));
            }
        }
        Ok(())
    }
}

pub struct VerifyPeersAccountAgeWitness;

#[async_trait]
impl Task for VerifyPeersAccountAgeWitness {
    fn kind(&self) -> TaskKind {
        TaskKind::VerifyPeersAccountAgeWitness
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let peer = &ctx.trade.process_model.peer;
        let account = peer
            .payment_account
            .as_ref()
            .ok_or_else(|| TaskError::missing("peer payment account"))?;
        ctx.services
            .account_age
            .verify_peers_account_age(
                &ctx.trade.offer,
                ctx.trade.amount,
                account,
                peer.account_age_witness.as_ref(),
                ctx.now(),
            )
            .map_err(TaskError::verification)
    }
}

/// Add our signature to the prepared deposit
pub struct SignDepositTx;

#[async_trait]
impl Task for SignDepositTx {
    fn kind(&self) -> TaskKind {
        TaskKind::SignDepositTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let deposit = prepared_deposit(ctx)?;
        if deposit.is_signed_by(&ctx.my_pub_key_ring()) {
            debug!(trade_id = %ctx.trade.id, "Deposit tx already signed by us");
            return Ok(());
        }
        let signed = ctx.services.wallet.sign_transaction(deposit).await?;
        ctx.trade.process_model.prepared_deposit_tx = Some(signed);
        Ok(())
    }
}

pub struct PublishTradeStatistics;

#[async_trait]
impl Task for PublishTradeStatistics {
    fn kind(&self) -> TaskKind {
        TaskKind::PublishTradeStatistics
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let trade = &ctx.trade;
        let statistics = TradeStatistics {
            currency: trade.offer.currency().to_string(),
            price: trade.price.clone(),
            amount: trade.amount,
            payment_method: trade.offer.payment_method.clone(),
            date: ctx.now(),
            offer_hash: sha256_hex(trade.id.as_str().as_bytes()),
        };
        ctx.services.gateway.publish_trade_statistics(statistics)?;
        info!(trade_id = %trade.id, "Published trade statistics");
        Ok(())
    }
}

/// Close a trade whose payout is on chain
pub struct CloseTrade;

#[async_trait]
impl Task for CloseTrade {
    fn kind(&self) -> TaskKind {
        TaskKind::CloseTrade
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.payout_tx_id.is_none() {
            return Err(TaskError::missing("payout tx id"));
        }
        ctx.set_state(TradeState::TradeCompleted)
    }
}

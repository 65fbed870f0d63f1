//! Taker steps: fee payment, the deposit request and contract verification

use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    errors::TaskError,
    message::{InputsForDepositTxRequest, MakerReadyToFundMultisigRequest, TradeMessage},
    trade::{DepositScheme, Direction, TradeState},
    wallet::{TxKind, TxOutput, TxRequest},
};
use tracing::{debug, info};

use super::common::{escrow_total, multisig_address, peer_key};
use super::{Task, TaskContext, TaskKind, TaskRegistry};
use crate::expect_message;

pub fn register(registry: &mut TaskRegistry) {
    registry.register(Arc::new(TakerVerifyMakerFeePayment));
    registry.register(Arc::new(TakerCreateFeeTx));
    registry.register(Arc::new(TakerSendInputsForDepositTxRequest));
    registry.register(Arc::new(TakerProcessesInputsForDepositTxResponse));
    registry.register(Arc::new(TakerVerifyAndSignContract));
    registry.register(Arc::new(TakerPublishFeeTx));
    registry.register(Arc::new(TakerSendReadyToFundMultisigRequest));
    registry.register(Arc::new(TakerProcessReadyToFundMultisigResponse));
}

// ----------------------------------------------------------------------------
// Fee Payment
// ----------------------------------------------------------------------------

/// The maker fee of the offer must be on chain
pub struct TakerVerifyMakerFeePayment;

#[async_trait]
impl Task for TakerVerifyMakerFeePayment {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerVerifyMakerFeePayment
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let offer = &ctx.trade.offer;
        let fee_tx = ctx
            .services
            .wallet
            .get_transaction(&offer.maker_fee_tx_id)
            .await?
            .ok_or_else(|| {
                TaskError::verification(format!(
                    "Maker fee tx {} not found",
                    offer.maker_fee_tx_id
                ))
            })?;
        if fee_tx.amount < offer.maker_fee {
            return Err(TaskError::verification(format!(
                "Maker fee tx pays {}, offer requires {}",
                fee_tx.amount, offer.maker_fee
            )));
        }
        Ok(())
    }
}

/// Create and sign the taker fee transaction without publishing it
pub struct TakerCreateFeeTx;

#[async_trait]
impl Task for TakerCreateFeeTx {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerCreateFeeTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.process_model.taker_fee_tx.is_some() {
            debug!(trade_id = %ctx.trade.id, "Taker fee tx already created");
            return Ok(());
        }
        let offer = &ctx.trade.offer;
        let request = TxRequest {
            kind: TxKind::TakerFee,
            trade_id: ctx.trade.id.clone(),
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                address: offer.fee_address.clone(),
                amount: offer.taker_fee,
            }],
            lock_time: 0,
        };
        let wallet = &ctx.services.wallet;
        let fee_tx = wallet.sign_transaction(wallet.create_transaction(request).await?).await?;

        ctx.trade.taker_fee_tx_id = Some(fee_tx.tx_id());
        ctx.trade.process_model.taker_fee_tx = Some(fee_tx);
        ctx.trade.process_model.fee_tx_initiated = true;
        Ok(())
    }
}

pub struct TakerPublishFeeTx;

#[async_trait]
impl Task for TakerPublishFeeTx {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerPublishFeeTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let fee_tx = ctx
            .trade
            .process_model
            .taker_fee_tx
            .clone()
            .ok_or_else(|| TaskError::missing("taker fee tx"))?;
        let wallet = &ctx.services.wallet;
        if wallet.get_transaction(&fee_tx.tx_id()).await?.is_some() {
            debug!(trade_id = %ctx.trade.id, "Taker fee tx already published");
        } else {
            let tx_id = wallet.broadcast_transaction(&fee_tx).await?;
            info!(trade_id = %ctx.trade.id, tx_id = %tx_id, "Published taker fee tx");
        }
        ctx.advance_state(TradeState::TakerPublishedTakerFeeTx)
    }
}

// ----------------------------------------------------------------------------
// Classic Deposit
// ----------------------------------------------------------------------------

pub struct TakerSendInputsForDepositTxRequest;

#[async_trait]
impl Task for TakerSendInputsForDepositTxRequest {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerSendInputsForDepositTxRequest
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let taker_fee_tx = ctx
            .trade
            .process_model
            .taker_fee_tx
            .clone()
            .ok_or_else(|| TaskError::missing("taker fee tx"))?;
        let payout_address = ctx.my_payout_address();
        let request = InputsForDepositTxRequest {
            trade_id: ctx.trade.id.clone(),
            trade_amount: ctx.trade.amount,
            trade_price: ctx.trade.price.clone(),
            taker_fee_tx,
            taker_payment_account: ctx.trade.process_model.my_payment_account.clone(),
            taker_payout_address: payout_address,
            taker_account_age_witness: ctx.trade.process_model.my_account_age_witness.clone(),
            current_date: ctx.now(),
        };
        ctx.send_to_peer(TradeMessage::InputsForDepositTxRequest(request))?;
        ctx.advance_state(TradeState::TakerSentInputsForDepositTxRequest)
    }
}

/// Store the maker's contract proposal and unsigned deposit
pub struct TakerProcessesInputsForDepositTxResponse;

#[async_trait]
impl Task for TakerProcessesInputsForDepositTxResponse {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerProcessesInputsForDepositTxResponse
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let response = expect_message!(ctx, InputsForDepositTxResponse);

        if response.lock_time != response.contract.lock_time {
            return Err(TaskError::invalid(format!(
                "Lock time {} differs from contract lock time {}",
                response.lock_time, response.contract.lock_time
            )));
        }
        let deposit = &response.prepared_deposit_tx;
        if deposit.kind != TxKind::Deposit || deposit.trade_id != ctx.trade.id {
            return Err(TaskError::invalid("Prepared deposit tx does not belong to trade"));
        }
        let expected = escrow_total(&ctx.trade)?;
        if deposit.output_to(&multisig_address(&ctx.trade.id)) != Some(expected) {
            return Err(TaskError::invalid(format!(
                "Deposit tx does not lock {} in the multisig output",
                expected
            )));
        }

        let model = &mut ctx.trade.process_model;
        model.peer.payment_account = Some(response.maker_payment_account);
        model.peer.payout_address = Some(response.maker_payout_address);
        model.peer.account_age_witness = response.maker_account_age_witness;
        model.peer.contract_signature = Some(response.maker_contract_signature);
        model.proposed_contract = Some(response.contract);
        model.prepared_deposit_tx = Some(response.prepared_deposit_tx);
        Ok(())
    }
}

/// Check the maker's contract against our own view of the trade and countersign
pub struct TakerVerifyAndSignContract;

#[async_trait]
impl Task for TakerVerifyAndSignContract {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerVerifyAndSignContract
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let contract = ctx
            .trade
            .process_model
            .proposed_contract
            .clone()
            .ok_or_else(|| TaskError::missing("proposed contract"))?;
        let maker_signature = ctx
            .trade
            .process_model
            .peer
            .contract_signature
            .clone()
            .ok_or_else(|| TaskError::missing("maker contract signature"))?;
        let maker_key = peer_key(ctx)?;
        let my_key = ctx.my_pub_key_ring();
        let my_payout_address = ctx.my_payout_address();
        let trade = &ctx.trade;

        let mismatch = |what: &str| TaskError::verification(format!("Contract {} mismatch", what));
        if contract.offer.id != trade.id {
            return Err(mismatch("offer id"));
        }
        if contract.trade_amount != trade.amount || contract.trade_price != trade.price {
            return Err(mismatch("trade terms"));
        }
        if contract.maker_is_buyer != (trade.offer.direction == Direction::Buyer) {
            return Err(mismatch("direction"));
        }
        if contract.taker().pub_key_ring != my_key
            || contract.taker().payout_address != my_payout_address
        {
            return Err(mismatch("taker party"));
        }
        if contract.maker().pub_key_ring != maker_key {
            return Err(mismatch("maker key"));
        }
        if contract.taker_fee_tx_id != trade.taker_fee_tx_id {
            return Err(mismatch("taker fee tx"));
        }
        if !contract
            .verify(&maker_key, &maker_signature)
            .map_err(|e| TaskError::verification(e.to_string()))?
        {
            return Err(TaskError::verification("Maker contract signature is invalid"));
        }

        let signature = contract
            .sign(&ctx.services.keys)
            .map_err(|e| TaskError::verification(e.to_string()))?;
        ctx.trade.lock_time = Some(contract.lock_time);
        ctx.trade.maker_contract_signature = Some(maker_signature);
        ctx.trade.taker_contract_signature = Some(signature);
        ctx.trade.contract = Some(contract);
        info!(trade_id = %ctx.trade.id, "Contract verified and signed");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Multisig Reservation
// ----------------------------------------------------------------------------

/// Ask the maker whether it is ready to fund; resent until it is
pub struct TakerSendReadyToFundMultisigRequest;

#[async_trait]
impl Task for TakerSendReadyToFundMultisigRequest {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerSendReadyToFundMultisigRequest
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.offer.deposit_scheme != DepositScheme::Multisig {
            return Err(TaskError::invalid("Offer does not use the multisig deposit"));
        }
        let payout_address = ctx.my_payout_address();
        let request = MakerReadyToFundMultisigRequest {
            trade_id: ctx.trade.id.clone(),
            trade_amount: ctx.trade.amount,
            taker_fee_tx_id: ctx.trade.taker_fee_tx_id.clone(),
            taker_payment_account: ctx.trade.process_model.my_payment_account.clone(),
            taker_payout_address: payout_address,
            taker_account_age_witness: ctx.trade.process_model.my_account_age_witness.clone(),
        };
        ctx.send_to_peer(TradeMessage::MakerReadyToFundMultisigRequest(request))?;
        ctx.advance_state(TradeState::TakerSentReadyToFundMultisigRequest)
    }
}

pub struct TakerProcessReadyToFundMultisigResponse;

#[async_trait]
impl Task for TakerProcessReadyToFundMultisigResponse {
    fn kind(&self) -> TaskKind {
        TaskKind::TakerProcessReadyToFundMultisigResponse
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let response = expect_message!(ctx, MakerReadyToFundMultisigResponse);
        let model = &mut ctx.trade.process_model;
        model.peer.payment_account = Some(response.maker_payment_account);
        model.peer.payout_address = Some(response.maker_payout_address);
        model.peer.account_age_witness = response.maker_account_age_witness;
        model.maker_ready_to_fund_multisig = response.is_maker_ready_to_fund_multisig;

        if response.is_maker_ready_to_fund_multisig {
            let contract = response
                .contract
                .ok_or_else(|| TaskError::invalid("Ready maker sent no contract"))?;
            let signature = response
                .maker_contract_signature
                .ok_or_else(|| TaskError::invalid("Ready maker sent no contract signature"))?;
            model.proposed_contract = Some(contract);
            model.peer.contract_signature = Some(signature);
        }
        debug!(
            trade_id = %ctx.trade.id,
            ready = response.is_maker_ready_to_fund_multisig,
            "Maker answered ready-to-fund request"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::maker::{
        MakerCreateAndSignContract, MakerCreatesUnsignedDepositTx,
        MakerProcessesInputsForDepositTxRequest, MakerSendsInputsForDepositTxResponse,
        MakerSetsLockTime,
    };
    use crate::task::test_support::context_with;
    use escrow_core::testing::{fixtures, Ledger};
    use escrow_core::trade::Phase;

    async fn run_all(ctx: &mut TaskContext, tasks: &[&dyn Task]) -> Result<(), TaskError> {
        for task in tasks {
            task.run(ctx).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_take_offer_sends_signed_fee_tx() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("take1", Direction::Seller, DepositScheme::Classic);
        fixtures::publish_maker_fee(&ledger, &offer);
        let (mut ctx, gateway, _) = context_with(
            fixtures::taker_trade(&offer),
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "taker",
            &ledger,
        );

        run_all(
            &mut ctx,
            &[
                &TakerVerifyMakerFeePayment,
                &TakerCreateFeeTx,
                &TakerSendInputsForDepositTxRequest,
            ],
        )
        .await
        .unwrap();

        assert_eq!(ctx.trade.state(), TradeState::TakerSentInputsForDepositTxRequest);
        let Some(TradeMessage::InputsForDepositTxRequest(request)) = gateway.last_trade_message()
        else {
            panic!("expected a deposit inputs request");
        };
        assert_eq!(Some(request.taker_fee_tx.tx_id()), ctx.trade.taker_fee_tx_id);
        assert!(request.taker_fee_tx.is_fully_signed());
        // Creating twice keeps the first fee tx
        TakerCreateFeeTx.run(&mut ctx).await.unwrap();
        assert_eq!(Some(request.taker_fee_tx.tx_id()), ctx.trade.taker_fee_tx_id);
        assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 0);
    }

    #[tokio::test]
    async fn test_missing_maker_fee_fails_verification() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("take2", Direction::Seller, DepositScheme::Classic);
        let (mut ctx, _, _) = context_with(
            fixtures::taker_trade(&offer),
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "taker",
            &ledger,
        );
        let err = TakerVerifyMakerFeePayment.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, TaskError::Verification { .. }));
    }

    #[tokio::test]
    async fn test_contract_round_trip_between_maker_and_taker() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("take3", Direction::Buyer, DepositScheme::Classic);
        fixtures::publish_maker_fee(&ledger, &offer);
        let (mut taker, taker_gateway, _) = context_with(
            fixtures::taker_trade(&offer),
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "taker",
            &ledger,
        );
        run_all(
            &mut taker,
            &[&TakerCreateFeeTx, &TakerSendInputsForDepositTxRequest],
        )
        .await
        .unwrap();

        let (mut maker, maker_gateway, _) = context_with(
            fixtures::maker_trade(&offer),
            fixtures::maker_keys(),
            fixtures::maker_address(),
            "maker",
            &ledger,
        );
        maker.trade.process_model.peer.node_address = Some(fixtures::taker_address());
        maker.trade.process_model.peer.pub_key_ring = Some(fixtures::taker_keys().pub_key_ring());
        maker.trade.process_model.trade_message = taker_gateway.last_trade_message();
        run_all(
            &mut maker,
            &[
                &MakerProcessesInputsForDepositTxRequest,
                &MakerSetsLockTime,
                &MakerCreateAndSignContract,
                &MakerCreatesUnsignedDepositTx,
                &MakerSendsInputsForDepositTxResponse,
            ],
        )
        .await
        .unwrap();

        taker.trade.process_model.trade_message = maker_gateway.last_trade_message();
        run_all(
            &mut taker,
            &[
                &TakerProcessesInputsForDepositTxResponse,
                &TakerVerifyAndSignContract,
                &TakerPublishFeeTx,
            ],
        )
        .await
        .unwrap();

        let contract = taker.trade.contract.clone().unwrap();
        assert!(contract.maker_is_buyer);
        assert_eq!(contract.buyer.pub_key_ring, fixtures::maker_keys().pub_key_ring());
        assert!(contract
            .verify(
                &fixtures::taker_keys().pub_key_ring(),
                taker.trade.taker_contract_signature.as_deref().unwrap()
            )
            .unwrap());
        assert_eq!(taker.trade.phase(), Phase::TakerFeePublished);
        assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 1);

        // A tampered maker signature is rejected
        taker.trade.process_model.peer.contract_signature = Some("00".repeat(64));
        assert!(TakerVerifyAndSignContract.run(&mut taker).await.is_err());
    }
}

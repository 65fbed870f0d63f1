//! Maker steps: answering the taker, building the contract and the deposit

use std::sync::Arc;

use async_trait::async_trait;
use escrow_core::{
    errors::TaskError,
    message::{InputsForDepositTxResponse, MakerReadyToFundMultisigResponse, TradeMessage},
    trade::{Contract, ContractParty, DepositScheme, TradeState},
    types::Coin,
    wallet::{TxKind, TxOutput, TxRequest},
};
use tracing::{debug, info};

use super::common::{escrow_total, multisig_address, peer_key, DELAYED_PAYOUT_LOCK_BLOCKS};
use super::{Task, TaskContext, TaskKind, TaskRegistry};
use crate::expect_message;

pub fn register(registry: &mut TaskRegistry) {
    registry.register(Arc::new(MakerProcessesInputsForDepositTxRequest));
    registry.register(Arc::new(MakerVerifyTakerFeePayment));
    registry.register(Arc::new(MakerSetsLockTime));
    registry.register(Arc::new(MakerCreateAndSignContract));
    registry.register(Arc::new(MakerCreatesUnsignedDepositTx));
    registry.register(Arc::new(MakerSendsInputsForDepositTxResponse));
    registry.register(Arc::new(MakerProcessReadyToFundMultisigRequest));
    registry.register(Arc::new(MakerSendsReadyToFundMultisigResponse));
}

/// Requested amount must be positive and not exceed the offer
fn check_trade_amount(ctx: &TaskContext, amount: Coin) -> Result<(), TaskError> {
    if amount == Coin::ZERO || amount > ctx.trade.offer.amount {
        return Err(TaskError::invalid(format!(
            "Trade amount {} outside offer range (max {})",
            amount, ctx.trade.offer.amount
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Classic Deposit
// ----------------------------------------------------------------------------

pub struct MakerProcessesInputsForDepositTxRequest;

#[async_trait]
impl Task for MakerProcessesInputsForDepositTxRequest {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerProcessesInputsForDepositTxRequest
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let request = expect_message!(ctx, InputsForDepositTxRequest);
        check_trade_amount(ctx, request.trade_amount)?;
        if request.trade_price != ctx.trade.offer.price {
            return Err(TaskError::invalid(format!(
                "Trade price {} differs from offer price {}",
                request.trade_price, ctx.trade.offer.price
            )));
        }
        let fee_tx = &request.taker_fee_tx;
        if fee_tx.kind != TxKind::TakerFee || fee_tx.trade_id != ctx.trade.id {
            return Err(TaskError::invalid("Taker fee tx does not belong to trade"));
        }

        ctx.trade.amount = request.trade_amount;
        ctx.trade.price = request.trade_price;
        ctx.trade.taker_fee_tx_id = Some(fee_tx.tx_id());
        let model = &mut ctx.trade.process_model;
        model.taker_fee_tx = Some(request.taker_fee_tx);
        model.peer.payment_account = Some(request.taker_payment_account);
        model.peer.payout_address = Some(request.taker_payout_address);
        model.peer.account_age_witness = request.taker_account_age_witness;
        Ok(())
    }
}

/// The taker's fee tx must pay the offer fee and carry the taker's signature
pub struct MakerVerifyTakerFeePayment;

#[async_trait]
impl Task for MakerVerifyTakerFeePayment {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerVerifyTakerFeePayment
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let fee_tx = ctx
            .trade
            .process_model
            .taker_fee_tx
            .as_ref()
            .ok_or_else(|| TaskError::missing("taker fee tx"))?;
        let offer = &ctx.trade.offer;
        let paid = fee_tx.output_to(&offer.fee_address).unwrap_or(Coin::ZERO);
        if paid < offer.taker_fee {
            return Err(TaskError::verification(format!(
                "Taker fee tx pays {}, offer requires {}",
                paid, offer.taker_fee
            )));
        }
        if !fee_tx.is_signed_by(&peer_key(ctx)?) {
            return Err(TaskError::verification("Taker fee tx is not signed by the taker"));
        }
        Ok(())
    }
}

pub struct MakerSetsLockTime;

#[async_trait]
impl Task for MakerSetsLockTime {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerSetsLockTime
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.lock_time.is_none() {
            ctx.trade.lock_time = Some(DELAYED_PAYOUT_LOCK_BLOCKS);
        }
        Ok(())
    }
}

/// Build the contract from both parties' data and sign it as maker
///
/// In the multisig scheme the contract is only created once the maker is
/// ready to fund.
pub struct MakerCreateAndSignContract;

#[async_trait]
impl Task for MakerCreateAndSignContract {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerCreateAndSignContract
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let multisig = ctx.trade.offer.deposit_scheme == DepositScheme::Multisig;
        if multisig && !ctx.trade.process_model.maker_ready_to_fund_multisig {
            debug!(trade_id = %ctx.trade.id, "Not ready to fund, contract deferred");
            return Ok(());
        }
        if ctx.trade.contract.is_some() {
            return Ok(());
        }

        let my_payout_address = ctx.my_payout_address();
        let (peer_address, peer_key) = ctx.peer_contact()?;
        let trade = &ctx.trade;
        let peer = &trade.process_model.peer;
        let maker = ContractParty {
            node_address: ctx.services.my_address.clone(),
            pub_key_ring: ctx.my_pub_key_ring(),
            payment_account: trade.process_model.my_payment_account.clone(),
            payout_address: my_payout_address,
        };
        let taker = ContractParty {
            node_address: peer_address,
            pub_key_ring: peer_key,
            payment_account: peer
                .payment_account
                .clone()
                .ok_or_else(|| TaskError::missing("taker payment account"))?,
            payout_address: peer
                .payout_address
                .clone()
                .ok_or_else(|| TaskError::missing("taker payout address"))?,
        };
        let maker_is_buyer = trade.role.is_buyer();
        let (buyer, seller) = if maker_is_buyer {
            (maker, taker)
        } else {
            (taker, maker)
        };
        let contract = Contract {
            offer: trade.offer.clone(),
            trade_amount: trade.amount,
            trade_price: trade.price.clone(),
            taker_fee_tx_id: trade.taker_fee_tx_id.clone(),
            maker_is_buyer,
            buyer,
            seller,
            mediator: trade.offer.mediator.clone(),
            refund_agent: trade.offer.refund_agent.clone(),
            lock_time: trade
                .lock_time
                .ok_or_else(|| TaskError::missing("lock time"))?,
        };
        let signature = contract
            .sign(&ctx.services.keys)
            .map_err(|e| TaskError::verification(e.to_string()))?;

        ctx.trade.contract = Some(contract);
        ctx.trade.maker_contract_signature = Some(signature);
        info!(trade_id = %ctx.trade.id, "Contract created and signed");
        Ok(())
    }
}

/// Deposit locking amount and both security deposits in the multisig output
pub struct MakerCreatesUnsignedDepositTx;

#[async_trait]
impl Task for MakerCreatesUnsignedDepositTx {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerCreatesUnsignedDepositTx
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if ctx.trade.process_model.prepared_deposit_tx.is_some() {
            return Ok(());
        }
        let request = TxRequest {
            kind: TxKind::Deposit,
            trade_id: ctx.trade.id.clone(),
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                address: multisig_address(&ctx.trade.id),
                amount: escrow_total(&ctx.trade)?,
            }],
            lock_time: 0,
        };
        let deposit = ctx.services.wallet.create_transaction(request).await?;
        ctx.trade.process_model.prepared_deposit_tx = Some(deposit);
        Ok(())
    }
}

pub struct MakerSendsInputsForDepositTxResponse;

#[async_trait]
impl Task for MakerSendsInputsForDepositTxResponse {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerSendsInputsForDepositTxResponse
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let trade = &ctx.trade;
        let contract = trade.contract()?.clone();
        let response = InputsForDepositTxResponse {
            trade_id: trade.id.clone(),
            lock_time: contract.lock_time,
            maker_contract_signature: trade
                .maker_contract_signature
                .clone()
                .ok_or_else(|| TaskError::missing("maker contract signature"))?,
            maker_payment_account: trade.process_model.my_payment_account.clone(),
            maker_payout_address: contract.maker().payout_address.clone(),
            maker_account_age_witness: trade.process_model.my_account_age_witness.clone(),
            prepared_deposit_tx: trade
                .process_model
                .prepared_deposit_tx
                .clone()
                .ok_or_else(|| TaskError::missing("prepared deposit tx"))?,
            contract,
        };
        ctx.send_to_peer(TradeMessage::InputsForDepositTxResponse(response))?;
        ctx.advance_state(TradeState::MakerSentInputsForDepositTxResponse)
    }
}

// ----------------------------------------------------------------------------
// Multisig Reservation
// ----------------------------------------------------------------------------

/// The maker is ready once the taker's fee tx is unlocked on chain
pub struct MakerProcessReadyToFundMultisigRequest;

#[async_trait]
impl Task for MakerProcessReadyToFundMultisigRequest {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerProcessReadyToFundMultisigRequest
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let request = expect_message!(ctx, MakerReadyToFundMultisigRequest);
        check_trade_amount(ctx, request.trade_amount)?;

        let ready = match &request.taker_fee_tx_id {
            Some(tx_id) => {
                let required = ctx.services.protocol.fee_unlock_confirmations;
                ctx.services
                    .wallet
                    .get_transaction(tx_id)
                    .await?
                    .map(|tx| tx.kind == TxKind::TakerFee && tx.is_unlocked(required))
                    .unwrap_or(false)
            }
            None => false,
        };

        ctx.trade.amount = request.trade_amount;
        if ready {
            ctx.trade.taker_fee_tx_id = request.taker_fee_tx_id;
        }
        let model = &mut ctx.trade.process_model;
        model.maker_ready_to_fund_multisig = ready;
        model.peer.payment_account = Some(request.taker_payment_account);
        model.peer.payout_address = Some(request.taker_payout_address);
        model.peer.account_age_witness = request.taker_account_age_witness;
        debug!(trade_id = %ctx.trade.id, ready, "Processed ready-to-fund request");
        Ok(())
    }
}

pub struct MakerSendsReadyToFundMultisigResponse;

#[async_trait]
impl Task for MakerSendsReadyToFundMultisigResponse {
    fn kind(&self) -> TaskKind {
        TaskKind::MakerSendsReadyToFundMultisigResponse
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let payout_address = ctx.my_payout_address();
        let trade = &ctx.trade;
        let ready = trade.process_model.maker_ready_to_fund_multisig;
        let response = MakerReadyToFundMultisigResponse {
            trade_id: trade.id.clone(),
            is_maker_ready_to_fund_multisig: ready,
            maker_payment_account: trade.process_model.my_payment_account.clone(),
            maker_payout_address: payout_address,
            maker_account_age_witness: trade.process_model.my_account_age_witness.clone(),
            contract: trade.contract.clone().filter(|_| ready),
            maker_contract_signature: trade.maker_contract_signature.clone().filter(|_| ready),
        };
        ctx.send_to_peer(TradeMessage::MakerReadyToFundMultisigResponse(response))?;
        ctx.advance_state(TradeState::MakerSentReadyToFundMultisigResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::context_with;
    use escrow_core::message::MakerReadyToFundMultisigRequest;
    use escrow_core::testing::{fixtures, Ledger};
    use escrow_core::trade::Direction;
    use escrow_core::types::TxId;

    fn ready_request(trade_id: &str, fee: Option<TxId>) -> TradeMessage {
        TradeMessage::MakerReadyToFundMultisigRequest(MakerReadyToFundMultisigRequest {
            trade_id: trade_id.into(),
            trade_amount: Coin::from_sat(10_000_000),
            taker_fee_tx_id: fee,
            taker_payment_account: fixtures::payment_account("taker"),
            taker_payout_address: "taker-payout".into(),
            taker_account_age_witness: None,
        })
    }

    #[tokio::test]
    async fn test_maker_ready_only_after_fee_unlocks() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("ms1", Direction::Seller, DepositScheme::Multisig);
        let (mut ctx, gateway, _) = context_with(
            fixtures::maker_trade(&offer),
            fixtures::maker_keys(),
            fixtures::maker_address(),
            "maker",
            &ledger,
        );
        ctx.trade.process_model.peer.node_address = Some(fixtures::taker_address());
        ctx.trade.process_model.peer.pub_key_ring = Some(fixtures::taker_keys().pub_key_ring());

        let fee_id = TxId::new("taker-fee-ms1");
        ledger.insert_confirmed(fee_id.clone(), TxKind::TakerFee, Coin::from_sat(30_000), 0);
        ctx.trade.process_model.trade_message = Some(ready_request("ms1", Some(fee_id.clone())));

        let steps: [&dyn Task; 4] = [
            &MakerProcessReadyToFundMultisigRequest,
            &MakerSetsLockTime,
            &MakerCreateAndSignContract,
            &MakerSendsReadyToFundMultisigResponse,
        ];
        for step in steps {
            step.run(&mut ctx).await.unwrap();
        }
        let Some(TradeMessage::MakerReadyToFundMultisigResponse(response)) =
            gateway.last_trade_message()
        else {
            panic!("expected a ready-to-fund response");
        };
        assert!(!response.is_maker_ready_to_fund_multisig);
        assert!(response.contract.is_none());
        assert!(ctx.trade.contract.is_none());

        ledger.mine_blocks(2);
        for step in steps {
            step.run(&mut ctx).await.unwrap();
        }
        let Some(TradeMessage::MakerReadyToFundMultisigResponse(response)) =
            gateway.last_trade_message()
        else {
            panic!("expected a ready-to-fund response");
        };
        assert!(response.is_maker_ready_to_fund_multisig);
        let contract = response.contract.unwrap();
        assert_eq!(contract.taker_fee_tx_id, Some(fee_id));
        assert_eq!(contract.seller.pub_key_ring, fixtures::maker_keys().pub_key_ring());
        assert_eq!(ctx.trade.state(), TradeState::MakerSentReadyToFundMultisigResponse);
    }

    #[tokio::test]
    async fn test_amount_above_offer_rejected() {
        let ledger = Ledger::new();
        let offer = fixtures::offer("ms2", Direction::Seller, DepositScheme::Multisig);
        let (mut ctx, _, _) = context_with(
            fixtures::maker_trade(&offer),
            fixtures::maker_keys(),
            fixtures::maker_address(),
            "maker",
            &ledger,
        );
        let mut message = ready_request("ms2", None);
        if let TradeMessage::MakerReadyToFundMultisigRequest(request) = &mut message {
            request.trade_amount = Coin::from_sat(20_000_000);
        }
        ctx.trade.process_model.trade_message = Some(message);
        let err = MakerProcessReadyToFundMultisigRequest
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidMessage { .. }));
    }

    #[tokio::test]
    async fn test_maker_answers_inputs_request_once() {
        use crate::protocol::{Admission, ConditionMatcher, Dispatch, Protocol};
        use crate::protocol::tables::MAKER_INPUTS_REQUEST;
        use crate::task::taker::{TakerCreateFeeTx, TakerSendInputsForDepositTxRequest};
        use crate::task::{RunOutcome, TaskRunner};
        use escrow_core::message::Payload;
        use escrow_core::trade::Phase;

        let ledger = Ledger::new();
        let offer = fixtures::offer("abc123", Direction::Seller, DepositScheme::Classic);
        fixtures::publish_maker_fee(&ledger, &offer);

        let (mut taker, taker_gateway, _) = context_with(
            fixtures::taker_trade(&offer),
            fixtures::taker_keys(),
            fixtures::taker_address(),
            "taker",
            &ledger,
        );
        TakerCreateFeeTx.run(&mut taker).await.unwrap();
        TakerSendInputsForDepositTxRequest.run(&mut taker).await.unwrap();
        let (_, envelope) = taker_gateway.sent.lock().unwrap().pop().unwrap();
        let message = match &envelope.payload {
            Payload::Trade(message) => message.clone(),
            other => panic!("unexpected payload {:?}", other),
        };

        let (mut maker, maker_gateway, _) = context_with(
            fixtures::maker_trade(&offer),
            fixtures::maker_keys(),
            fixtures::maker_address(),
            "maker",
            &ledger,
        );
        assert_eq!(maker.trade.phase(), Phase::Init);

        let transition = match Protocol::for_role(maker.trade.role).route(&maker.trade, &message) {
            Dispatch::Run(transition) => transition,
            other => panic!("request not routed: {:?}", other),
        };
        assert_eq!(transition.name, MAKER_INPUTS_REQUEST.name);
        let admission =
            ConditionMatcher::check_message(transition, &maker.trade, &envelope, &message).unwrap();
        assert_eq!(admission, Admission::FirstContact);
        ConditionMatcher::record_sender(&mut maker.trade, &envelope);
        maker.trade.process_model.trade_message = Some(message);

        let registry = Arc::new(TaskRegistry::standard());
        let (maker, outcome) = TaskRunner::new(transition.name, transition.tasks, registry)
            .run(maker)
            .await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(maker.trade.phase(), Phase::TakerFeePublished);
        let sent = maker_gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, fixtures::taker_address());
        assert!(matches!(
            &sent[0].1.payload,
            Payload::Trade(TradeMessage::InputsForDepositTxResponse(_))
        ));
    }
}

//! In-process trade simulation
//!
//! Runs a maker, a taker and a mediator engine on one [`LoopbackNetwork`]
//! and a shared mock ledger, and drives them through a trade the way two
//! wallet applications and a mediator would. Every app event is recorded in
//! a transcript tagged with the node that emitted it.

use std::fmt;
use std::sync::Arc;

use escrow_core::crypto::KeyRing;
use escrow_core::dispute::{
    DisputeKey, DisputeLifecycle, DisputeReason, DisputeResult, SupportType, Winner,
};
use escrow_core::testing::{fixtures, Ledger, MockWallet, StaticPriceFeed};
use escrow_core::trade::{DepositScheme, Direction, DisputeState, Offer, TradeState};
use escrow_core::types::{Coin, NodeAddress, Timestamp, TradeId};
use escrow_core::wallet::TxKind;
use escrow_core::{AppEvent, Command};
use escrow_runtime::{EngineBuilder, EngineHandle, LoopbackNetwork};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Options and Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    pub maker_direction: Direction,
    pub scheme: DepositScheme,
    pub dispute: bool,
    pub offline_agent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptLine {
    pub at_ms: u64,
    pub node: String,
    pub event: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub height: u64,
    pub taker_fee: usize,
    pub deposit: usize,
    pub delayed_payout: usize,
    pub payout: usize,
    pub multisig_funding: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSummary {
    pub delivered: u64,
    pub stored_in_mailbox: u64,
    pub faults: u64,
    pub statistics_published: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub trade_id: String,
    pub scheme: String,
    pub maker_role: String,
    pub outcome: String,
    pub transcript: Vec<TranscriptLine>,
    pub ledger: LedgerSummary,
    pub network: NetworkSummary,
}

// ----------------------------------------------------------------------------
// Parties
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Maker,
    Taker,
    Mediator,
}

impl Party {
    fn keys(self) -> KeyRing {
        match self {
            Party::Maker => fixtures::maker_keys(),
            Party::Taker => fixtures::taker_keys(),
            Party::Mediator => fixtures::mediator_keys(),
        }
    }

    fn address(self) -> NodeAddress {
        match self {
            Party::Maker => fixtures::maker_address(),
            Party::Taker => fixtures::taker_address(),
            Party::Mediator => fixtures::mediator_address(),
        }
    }

    fn dispute_key(self, trade_id: &TradeId) -> DisputeKey {
        DisputeKey {
            trade_id: trade_id.clone(),
            trader_id: self.keys().pub_key_ring().trader_id(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Party::Maker => "maker",
            Party::Taker => "taker",
            Party::Mediator => "mediator",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Simulation
// ----------------------------------------------------------------------------

pub struct Simulation {
    config: CliAppConfig,
    options: SimulationOptions,
    network: LoopbackNetwork,
    ledger: Ledger,
    offer: Offer,
    maker: EngineHandle,
    taker: EngineHandle,
    mediator: EngineHandle,
    events: mpsc::UnboundedReceiver<(Party, AppEvent)>,
    history: Vec<(Party, AppEvent)>,
    transcript: Vec<TranscriptLine>,
    started: Instant,
}

impl Simulation {
    /// Start the three engines and attach them to a fresh network
    pub async fn start(config: CliAppConfig, options: SimulationOptions) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let ledger = Ledger::new();
        let offer = fixtures::offer(
            &config.simulation.trade_id,
            options.maker_direction,
            options.scheme,
        );
        fixtures::publish_maker_fee(&ledger, &offer);

        let (forward, events) = mpsc::unbounded_channel();
        let maker = start_node(&config, &network, &ledger, Party::Maker, forward.clone()).await?;
        let taker = start_node(&config, &network, &ledger, Party::Taker, forward.clone()).await?;
        let mediator = start_node(&config, &network, &ledger, Party::Mediator, forward).await?;

        Ok(Self {
            config,
            options,
            network,
            ledger,
            offer,
            maker,
            taker,
            mediator,
            events,
            history: Vec::new(),
            transcript: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Drive the trade to its end and collect the report
    pub async fn run(mut self) -> Result<SimulationReport> {
        let trade_id = self.offer.id.clone();
        info!(trade_id = %trade_id, scheme = ?self.options.scheme, dispute = self.options.dispute, "Simulation starting");

        self.send(Party::Maker, Command::AddTrade(Box::new(fixtures::maker_trade(&self.offer))))
            .await?;
        self.send(Party::Taker, Command::AddTrade(Box::new(fixtures::taker_trade(&self.offer))))
            .await?;
        self.send(
            Party::Taker,
            Command::TakeOffer {
                trade_id: trade_id.clone(),
            },
        )
        .await?;

        let outcome = match self.options.scheme {
            DepositScheme::Classic => self.run_classic(&trade_id).await?,
            DepositScheme::Multisig => self.run_multisig(&trade_id).await?,
        };
        info!(trade_id = %trade_id, outcome = %outcome, "Simulation finished");

        for handle in [&mut self.maker, &mut self.taker, &mut self.mediator] {
            handle.shutdown().await?;
        }
        while let Ok((party, event)) = self.events.try_recv() {
            self.record(party, event);
        }
        Ok(self.report(outcome))
    }

    fn buyer(&self) -> Party {
        match self.options.maker_direction {
            Direction::Buyer => Party::Maker,
            Direction::Seller => Party::Taker,
        }
    }

    fn seller(&self) -> Party {
        match self.options.maker_direction {
            Direction::Buyer => Party::Taker,
            Direction::Seller => Party::Maker,
        }
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    async fn run_classic(&mut self, trade_id: &TradeId) -> Result<String> {
        let (buyer, seller) = (self.buyer(), self.seller());
        self.wait_pipeline(seller, "SellerHandleDelayedPayoutTxSignatureResponse")
            .await?;
        self.wait_pipeline(buyer, "BuyerHandleDepositTxAndDelayedPayoutTxMessage")
            .await?;

        self.send(
            buyer,
            Command::PaymentStarted {
                trade_id: trade_id.clone(),
            },
        )
        .await?;
        self.wait_pipeline(seller, "SellerHandleCounterCurrencyTransferStartedMessage")
            .await?;

        if self.options.dispute {
            // Seller never confirms; the buyer asks for mediation
            return self.run_mediation(trade_id, buyer).await;
        }

        self.send(
            seller,
            Command::PaymentReceived {
                trade_id: trade_id.clone(),
            },
        )
        .await?;
        self.wait_pipeline(buyer, "BuyerHandlePayoutTxPublishedMessage")
            .await?;
        for party in [buyer, seller] {
            self.send(
                party,
                Command::CompleteTrade {
                    trade_id: trade_id.clone(),
                },
            )
            .await?;
            self.wait(party, "trade completed", |event| {
                matches!(
                    event,
                    AppEvent::TradeStateChanged {
                        state: TradeState::TradeCompleted,
                        ..
                    }
                )
            })
            .await?;
        }
        Ok("trade completed".to_string())
    }

    async fn run_multisig(&mut self, trade_id: &TradeId) -> Result<String> {
        self.wait_pipeline(Party::Taker, "TakerReserveTrade").await?;
        let confirmations = u64::from(self.config.engine.protocol.fee_unlock_confirmations);
        info!(blocks = confirmations, "Mining blocks to unlock the taker fee");
        self.ledger.mine_blocks(confirmations);

        let (maker_funding, taker_funding) = match self.options.maker_direction {
            Direction::Buyer => ("BuyerFundMultisig", "SellerFundMultisig"),
            Direction::Seller => ("SellerFundMultisig", "BuyerFundMultisig"),
        };
        self.wait_pipeline(Party::Maker, maker_funding).await?;
        self.wait_pipeline(Party::Taker, taker_funding).await?;

        if self.options.dispute {
            return self.run_mediation(trade_id, self.buyer()).await;
        }
        Ok("multisig funded".to_string())
    }

    async fn run_mediation(&mut self, trade_id: &TradeId, opener: Party) -> Result<String> {
        let peer = if opener == Party::Maker {
            Party::Taker
        } else {
            Party::Maker
        };
        let agent = Party::Mediator.address();
        if self.options.offline_agent {
            self.network.set_online(&agent, false).await;
        }

        self.send(
            opener,
            Command::OpenDispute {
                trade_id: trade_id.clone(),
                support_type: SupportType::Mediation,
                reopen: false,
            },
        )
        .await?;
        self.wait(opener, "dispute opened", |event| {
            matches!(event, AppEvent::DisputeOpened { .. })
        })
        .await?;
        if self.options.offline_agent {
            info!(parked = self.network.mailbox_len(&agent), "Mediator coming online");
            self.network.set_online(&agent, true).await;
        }

        let opener_key = opener.dispute_key(trade_id);
        let peer_key = peer.dispute_key(trade_id);
        self.wait_lifecycle(&opener_key, DisputeLifecycle::OpenedBySelf)
            .await?;
        self.wait_lifecycle(&peer_key, DisputeLifecycle::OpenedByPeer)
            .await?;
        self.wait(peer, "peer notified", |event| {
            matches!(
                event,
                AppEvent::TradeDisputeStateChanged {
                    state: DisputeState::MediationStartedByPeer,
                    ..
                }
            )
        })
        .await?;

        let result = self.payout_to(opener);
        self.send(
            Party::Mediator,
            Command::SendDisputeResult {
                key: opener_key,
                result,
                text: "Payment arrived; paying out to the buyer.".to_string(),
            },
        )
        .await?;
        self.wait(opener, "mediation closed", |event| {
            matches!(
                event,
                AppEvent::TradeDisputeStateChanged {
                    state: DisputeState::MediationClosed,
                    ..
                }
            )
        })
        .await?;
        Ok("mediation closed".to_string())
    }

    /// Mediator's suggestion: the trade amount to the winner, deposits back
    fn payout_to(&self, winner: Party) -> DisputeResult {
        let offer = &self.offer;
        let buyer_wins = winner == self.buyer();
        let (buyer_payout, seller_payout) = if buyer_wins {
            (
                Coin::from_sat(offer.amount.sat() + offer.buyer_security_deposit.sat()),
                offer.seller_security_deposit,
            )
        } else {
            (
                offer.buyer_security_deposit,
                Coin::from_sat(offer.amount.sat() + offer.seller_security_deposit.sat()),
            )
        };
        DisputeResult {
            trade_id: offer.id.clone(),
            trader_id: winner.keys().pub_key_ring().trader_id(),
            winner: Some(if buyer_wins { Winner::Buyer } else { Winner::Seller }),
            reason: DisputeReason::SellerNotResponding,
            buyer_payout_amount: buyer_payout,
            seller_payout_amount: seller_payout,
            summary_notes: "Counter-currency payment confirmed by bank statement".to_string(),
            chat_message: None,
            close_date: Timestamp::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    fn handle(&self, party: Party) -> &EngineHandle {
        match party {
            Party::Maker => &self.maker,
            Party::Taker => &self.taker,
            Party::Mediator => &self.mediator,
        }
    }

    async fn send(&self, party: Party, command: Command) -> Result<()> {
        debug!(node = %party, command = ?command, "Sending command");
        self.handle(party).send_command(command).await?;
        Ok(())
    }

    fn record(&mut self, party: Party, event: AppEvent) {
        self.transcript.push(TranscriptLine {
            at_ms: self.started.elapsed().as_millis() as u64,
            node: party.to_string(),
            event: summarize(&event),
        });
        self.history.push((party, event));
    }

    /// Consume events until `party` emits one matching `predicate`
    async fn wait<F>(&mut self, party: Party, step: &str, predicate: F) -> Result<AppEvent>
    where
        F: Fn(&AppEvent) -> bool,
    {
        let after = self.config.simulation.step_timeout();
        let deadline = Instant::now() + after;
        let step = format!("{} {}", party, step);
        loop {
            let (from, event) = match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => return Err(CliError::simulation(step, "engines stopped")),
                Err(_) => return Err(CliError::Timeout { step, after }),
            };
            self.record(from, event.clone());
            if from != party {
                continue;
            }
            match &event {
                AppEvent::PipelineFailed {
                    transition, reason, ..
                } if step.ends_with(transition) => {
                    return Err(CliError::simulation(step, reason.clone()));
                }
                AppEvent::PipelineTimedOut { transition, .. } if step.ends_with(transition) => {
                    return Err(CliError::simulation(step, "pipeline timed out"));
                }
                _ if predicate(&event) => return Ok(event),
                _ => {}
            }
        }
    }

    async fn wait_pipeline(&mut self, party: Party, transition: &'static str) -> Result<()> {
        self.wait(party, transition, |event| {
            matches!(event, AppEvent::PipelineCompleted { transition: name, .. } if *name == transition)
        })
        .await
        .map(|_| ())
    }

    /// Mediator ticket reached a lifecycle; satisfied by an earlier event too
    async fn wait_lifecycle(&mut self, key: &DisputeKey, target: DisputeLifecycle) -> Result<()> {
        let matches = |event: &AppEvent| {
            matches!(
                event,
                AppEvent::DisputeUpdated { key: k, lifecycle } if k == key && *lifecycle == target
            )
        };
        let seen = self
            .history
            .iter()
            .any(|(party, event)| *party == Party::Mediator && matches(event));
        if seen {
            return Ok(());
        }
        self.wait(Party::Mediator, &format!("{:?} ticket", target), matches)
            .await
            .map(|_| ())
    }

    fn report(self, outcome: String) -> SimulationReport {
        let stats = self.network.statistics();
        let ledger = &self.ledger;
        SimulationReport {
            trade_id: self.offer.id.to_string(),
            scheme: format!("{:?}", self.options.scheme),
            maker_role: format!("maker-{:?}", self.options.maker_direction).to_lowercase(),
            outcome,
            ledger: LedgerSummary {
                height: ledger.height(),
                taker_fee: ledger.broadcast_count(TxKind::TakerFee),
                deposit: ledger.broadcast_count(TxKind::Deposit),
                delayed_payout: ledger.broadcast_count(TxKind::DelayedPayout),
                payout: ledger.broadcast_count(TxKind::Payout),
                multisig_funding: ledger.broadcast_count(TxKind::MultisigFunding),
            },
            network: NetworkSummary {
                delivered: stats.delivered,
                stored_in_mailbox: stats.stored_in_mailbox,
                faults: stats.faults,
                statistics_published: stats.statistics_published,
            },
            transcript: self.transcript,
        }
    }
}

async fn start_node(
    config: &CliAppConfig,
    network: &LoopbackNetwork,
    ledger: &Ledger,
    party: Party,
    forward: mpsc::UnboundedSender<(Party, AppEvent)>,
) -> Result<EngineHandle> {
    let keys = party.keys();
    let address = party.address();
    let wallet = Arc::new(MockWallet::new(party.to_string(), keys.clone(), ledger.clone()));
    let feed = StaticPriceFeed::with_price(fixtures::CURRENCY, config.simulation.market_price);
    let mut handle = EngineBuilder::new(keys)
        .with_config(config.engine.clone().with_address(address.clone()))
        .with_wallet(wallet)
        .with_price_feed(Arc::new(feed))
        .build_and_start()
        .await?;
    network.attach(address, handle.event_sender(), handle.subscribe_effects());

    let mut app_events = handle
        .take_app_event_receiver()
        .ok_or_else(|| CliError::simulation("start", "app event receiver already taken"))?;
    tokio::spawn(async move {
        while let Some(event) = app_events.recv().await {
            if forward.send((party, event)).is_err() {
                break;
            }
        }
    });
    handle.send_command(Command::AllServicesInitialized).await?;
    Ok(handle)
}

/// One-line rendering of an app event for the transcript
pub fn summarize(event: &AppEvent) -> String {
    match event {
        AppEvent::TradeAdded { trade_id, role } => format!("trade {} added as {}", trade_id, role),
        AppEvent::TradeStateChanged { state, phase, .. } => {
            format!("state {:?} (phase {})", state, phase)
        }
        AppEvent::PipelineCompleted { transition, .. } => format!("pipeline {} completed", transition),
        AppEvent::PipelineFailed {
            transition,
            task,
            reason,
            ..
        } => format!("pipeline {} failed at {}: {}", transition, task, reason),
        AppEvent::PipelineTimedOut { transition, .. } => {
            format!("pipeline {} timed out", transition)
        }
        AppEvent::MessageRejected { kind, reason, .. } => format!("rejected {}: {}", kind, reason),
        AppEvent::DeliveryUpdated { uid, state, .. } => format!("message {} {:?}", uid, state),
        AppEvent::AckReceived {
            source_uid,
            success,
            error,
            ..
        } => match error {
            Some(error) => format!("ack for {} success={} ({})", source_uid, success, error),
            None => format!("ack for {} success={}", source_uid, success),
        },
        AppEvent::TradeDisputeStateChanged { state, .. } => format!("dispute state {:?}", state),
        AppEvent::DisputeOpened {
            stored_in_mailbox, ..
        } => {
            if *stored_in_mailbox {
                "dispute stored in the agent's mailbox".to_string()
            } else {
                "dispute delivered to the agent".to_string()
            }
        }
        AppEvent::DisputeFault { error, .. } => format!("dispute fault: {}", error),
        AppEvent::DisputeUpdated { key, lifecycle } => {
            format!("ticket of trader {} {:?}", key.trader_id, lifecycle)
        }
        AppEvent::ChatMessageReceived { text, .. } => format!("chat: {}", text),
        AppEvent::StatusReport { trades, disputes, .. } => {
            format!("status: {} trades, {:?} disputes", trades, disputes)
        }
        AppEvent::SystemError { error } => format!("system error: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(maker_direction: Direction, scheme: DepositScheme, dispute: bool) -> SimulationOptions {
        SimulationOptions {
            maker_direction,
            scheme,
            dispute,
            offline_agent: false,
        }
    }

    #[tokio::test]
    async fn test_classic_simulation_completes() {
        let config = CliAppConfig::default();
        let simulation = Simulation::start(config, options(Direction::Seller, DepositScheme::Classic, false))
            .await
            .unwrap();
        let report = simulation.run().await.unwrap();

        assert_eq!(report.outcome, "trade completed");
        assert_eq!(report.maker_role, "maker-seller");
        assert_eq!(report.ledger.deposit, 1);
        assert_eq!(report.ledger.payout, 1);
        assert_eq!(report.network.faults, 0);
        assert!(report.transcript.iter().any(|line| line.node == "taker"
            && line.event.contains("TradeCompleted")));
    }

    #[tokio::test]
    async fn test_multisig_dispute_with_offline_agent() {
        let config = CliAppConfig::default();
        let mut opts = options(Direction::Buyer, DepositScheme::Multisig, true);
        opts.offline_agent = true;
        let report = Simulation::start(config, opts).await.unwrap().run().await.unwrap();

        assert_eq!(report.outcome, "mediation closed");
        assert_eq!(report.ledger.multisig_funding, 2);
        assert_eq!(report.network.stored_in_mailbox, 1);
        assert!(report
            .transcript
            .iter()
            .any(|line| line.event == "dispute stored in the agent's mailbox"));
    }

    #[test]
    fn test_summaries_are_single_line() {
        let event = AppEvent::PipelineFailed {
            trade_id: TradeId::from("t"),
            transition: "TakerTakeOffer",
            task: "ApplyFilter".to_string(),
            reason: "banned".to_string(),
        };
        assert_eq!(
            summarize(&event),
            "pipeline TakerTakeOffer failed at ApplyFilter: banned"
        );
    }
}

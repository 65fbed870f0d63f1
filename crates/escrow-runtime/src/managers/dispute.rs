//! Dispute manager
//!
//! Traders open tickets with the agent named in the contract. The agent
//! stores the ticket, mirrors it to the counterparty after a short delay and
//! later sends the result. Every outbound support message is tracked by uid:
//! transport callbacks update the delivery flags of the chat message that
//! went out with it, acks update its ack state, and both are persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use escrow_core::channel::AppEvent;
use escrow_core::config::DisputeConfig;
use escrow_core::delivery::{AckState, DeliveryOutcome, DeliveryState};
use escrow_core::dispute::{
    ChatMessage, Dispute, DisputeKey, DisputeLifecycle, DisputeList, DisputeResult,
    OptionTradeAnalysis, SupportType,
};
use escrow_core::errors::{DisputeError, EscrowResult};
use escrow_core::message::{
    AckMessage, AckSource, DisputeResultMessage, NetworkEnvelope, OpenNewDisputeMessage, Payload,
    PeerOpenedDisputeMessage, SupportMessage,
};
use escrow_core::services::{MessagingGateway, PriceFeed};
use escrow_core::store::DisputeStore;
use escrow_core::trade::{DisputeState, Trade};
use escrow_core::types::{NodeAddress, PubKeyRing, TimeSource, TradeId, TraderId, Uid};
use tracing::{debug, error, info, warn};

use super::TradeUpdate;
use crate::internal::InternalEvent;
use crate::scheduler::{Scheduler, TimerHandle};

/// Events and trade changes produced by a dispute operation
#[derive(Debug, Default)]
pub struct DisputeOutput {
    pub events: Vec<AppEvent>,
    pub trade_updates: Vec<(TradeId, TradeUpdate)>,
}

impl DisputeOutput {
    fn event(mut self, event: AppEvent) -> Self {
        self.events.push(event);
        self
    }

    fn update(mut self, trade_id: &TradeId, update: TradeUpdate) -> Self {
        self.trade_updates.push((trade_id.clone(), update));
        self
    }

    fn lifecycle(self, key: &DisputeKey, lifecycle: DisputeLifecycle) -> Self {
        self.event(AppEvent::DisputeUpdated {
            key: key.clone(),
            lifecycle,
        })
    }
}

/// Outbound support message awaiting callbacks
#[derive(Debug, Clone)]
struct Outbound {
    key: DisputeKey,
    kind: &'static str,
}

fn support_label(support_type: SupportType) -> &'static str {
    match support_type {
        SupportType::Mediation => "mediation",
        SupportType::Refund => "refund request",
        SupportType::Arbitration => "dispute",
    }
}

// ----------------------------------------------------------------------------
// Dispute Manager
// ----------------------------------------------------------------------------

pub struct DisputeManager {
    config: DisputeConfig,
    my_key: PubKeyRing,
    my_address: NodeAddress,
    gateway: Arc<dyn MessagingGateway>,
    store: Arc<dyn DisputeStore>,
    price_feed: Arc<dyn PriceFeed>,
    time: Arc<dyn TimeSource>,
    scheduler: Scheduler,
    /// `None` until the stored list was loaded
    disputes: Option<DisputeList>,
    outbound: HashMap<Uid, Outbound>,
    /// Acks we sent; their delivery reports are consumed silently
    acks: HashSet<Uid>,
    mirror_timers: HashMap<DisputeKey, TimerHandle>,
    price_timers: HashMap<DisputeKey, TimerHandle>,
}

impl DisputeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DisputeConfig,
        my_key: PubKeyRing,
        my_address: NodeAddress,
        gateway: Arc<dyn MessagingGateway>,
        store: Arc<dyn DisputeStore>,
        price_feed: Arc<dyn PriceFeed>,
        time: Arc<dyn TimeSource>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            config,
            my_key,
            my_address,
            gateway,
            store,
            price_feed,
            time,
            scheduler,
            disputes: None,
            outbound: HashMap::new(),
            acks: HashSet::new(),
            mirror_timers: HashMap::new(),
            price_timers: HashMap::new(),
        }
    }

    fn my_trader_id(&self) -> TraderId {
        self.my_key.trader_id()
    }

    /// Load the stored list; returns the number of tickets
    pub fn on_all_services_initialized(&mut self) -> EscrowResult<usize> {
        let list = self.store.load_disputes()?;
        let count = list.len();
        self.disputes = Some(list);
        info!(disputes = count, "Dispute list loaded");
        Ok(count)
    }

    pub fn is_loaded(&self) -> bool {
        self.disputes.is_some()
    }

    pub fn len(&self) -> Option<usize> {
        self.disputes.as_ref().map(DisputeList::len)
    }

    pub fn num_open(&self) -> usize {
        self.disputes.as_ref().map_or(0, DisputeList::num_open)
    }

    pub fn find_dispute(&self, trade_id: &TradeId, trader_id: TraderId) -> Option<&Dispute> {
        let key = DisputeKey {
            trade_id: trade_id.clone(),
            trader_id,
        };
        self.disputes.as_ref()?.find(&key)
    }

    /// Ticket of the trade opened by or for this node
    pub fn find_own_dispute(&self, trade_id: &TradeId) -> Option<&Dispute> {
        self.find_dispute(trade_id, self.my_trader_id())
    }

    pub fn is_tracking(&self, uid: &Uid) -> bool {
        self.outbound.contains_key(uid) || self.acks.contains(uid)
    }

    /// Cancel pending mirror and price timers
    pub fn shutdown(&mut self) {
        self.mirror_timers.clear();
        self.price_timers.clear();
    }

    // ------------------------------------------------------------------------
    // Trader side
    // ------------------------------------------------------------------------

    /// Open a ticket for one of our trades and send it to the agent
    pub fn open_dispute(
        &mut self,
        trade: &Trade,
        support_type: SupportType,
        reopen: bool,
    ) -> Result<DisputeOutput, DisputeError> {
        let Some(disputes) = self.disputes.as_mut() else {
            warn!(trade_id = %trade.id, "Dispute list not loaded, cannot open dispute");
            return Err(DisputeError::NotLoaded);
        };
        let contract = trade.contract.clone().ok_or_else(|| DisputeError::NoContract {
            trade_id: trade.id.clone(),
        })?;
        let key = DisputeKey {
            trade_id: trade.id.clone(),
            trader_id: self.my_key.trader_id(),
        };
        let existing = disputes.contains(&key);
        if existing && !reopen {
            warn!(trade_id = %trade.id, "Dispute already open");
            return Err(DisputeError::AlreadyOpen {
                trade_id: trade.id.clone(),
            });
        }

        let agent = match support_type {
            SupportType::Mediation => contract.mediator.clone(),
            SupportType::Refund | SupportType::Arbitration => contract.refund_agent.clone(),
        };
        let now = self.time.now();
        let analysis = self
            .price_feed
            .price(contract.offer.currency())
            .map(|price| {
                OptionTradeAnalysis::compute(
                    &contract,
                    price,
                    self.config.min_refund_at_mediated_dispute,
                )
            });

        let mut text = format!(
            "System message: {} requested by the {} for trade {}.\nTrade amount: {}\nTrade price: {}\nDeposit tx: {}",
            support_label(support_type),
            trade.role,
            trade.id,
            trade.amount,
            trade.price,
            trade
                .deposit_tx_id
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string)
        );
        if let Some(analysis) = &analysis {
            text.push_str("\n\n");
            text.push_str(&analysis.describe(&contract));
        }
        let summary = ChatMessage::new(
            support_type,
            trade.id.clone(),
            key.trader_id,
            true,
            text,
            self.my_address.clone(),
            now,
        )
        .system();

        let fresh = Dispute {
            trade_id: trade.id.clone(),
            trader_id: key.trader_id,
            trader_pub_key_ring: self.my_key,
            dispute_opener_is_buyer: trade.role.is_buyer(),
            dispute_opener_is_maker: trade.role.is_maker(),
            trade_date: trade.take_offer_date,
            opening_date: now,
            contract_hash: contract.hash().unwrap_or_default(),
            maker_contract_signature: trade.maker_contract_signature.clone(),
            taker_contract_signature: trade.taker_contract_signature.clone(),
            deposit_tx_id: trade.deposit_tx_id.clone(),
            delayed_payout_tx_id: trade.delayed_payout_tx_id.clone(),
            payout_tx_id: trade.payout_tx_id.clone(),
            agent_pub_key_ring: agent.pub_key_ring,
            agent_address: agent.node_address.clone(),
            support_type,
            is_support_ticket: false,
            chat_messages: Vec::new(),
            result: None,
            lifecycle: DisputeLifecycle::OpenedBySelf,
            price_analysis: analysis,
            mediators_dispute_result: match support_type {
                SupportType::Refund => trade.mediation_result_summary.clone(),
                _ => None,
            },
            contract,
        };

        if existing {
            if let Some(stored) = disputes.find_mut(&key) {
                info!(trade_id = %trade.id, support = support_label(support_type), "Reopening dispute");
                let history = std::mem::take(&mut stored.chat_messages);
                *stored = Dispute {
                    chat_messages: history,
                    ..fresh
                };
            }
        } else {
            disputes.add(fresh);
        }

        let uid = summary.uid;
        let dispute = match disputes.find_mut(&key) {
            Some(dispute) => {
                dispute.add_chat_message(summary);
                dispute.clone()
            }
            None => {
                return Err(DisputeError::NotFound {
                    trade_id: trade.id.clone(),
                })
            }
        };
        persist(&*self.store, disputes);

        let message = SupportMessage::OpenNewDispute(OpenNewDisputeMessage {
            dispute,
            sender_address: self.my_address.clone(),
            uid,
            support_type,
        });
        self.send_tracked(&key, &agent.node_address, &agent.pub_key_ring, message)?;
        info!(trade_id = %trade.id, agent = %agent.node_address, support = support_label(support_type), "Sent open dispute message");

        Ok(DisputeOutput::default()
            .update(&trade.id, TradeUpdate::DisputeState(DisputeState::requested(support_type)))
            .lifecycle(&key, DisputeLifecycle::OpenedBySelf))
    }

    fn on_peer_opened_dispute(
        &mut self,
        envelope: &NetworkEnvelope,
        message: PeerOpenedDisputeMessage,
    ) -> DisputeOutput {
        let dispute = message.dispute;
        if dispute.agent_pub_key_ring == self.my_key {
            error!(trade_id = %dispute.trade_id, "Agent received a peer opened dispute message, dropping");
            return DisputeOutput::default();
        }
        if dispute.trader_pub_key_ring != self.my_key {
            error!(trade_id = %dispute.trade_id, "Peer opened dispute message is not for us, dropping");
            return DisputeOutput::default();
        }
        if envelope.sender_pub_key_ring != dispute.agent_pub_key_ring {
            error!(trade_id = %dispute.trade_id, sender = %envelope.sender, "Peer opened dispute not sent by the agent, dropping");
            return DisputeOutput::default();
        }
        let Some(disputes) = self.disputes.as_mut() else {
            warn!(trade_id = %dispute.trade_id, "Dispute list not loaded, peer opened dispute abandoned");
            return DisputeOutput::default();
        };

        let key = dispute.key();
        let trade_id = dispute.trade_id.clone();
        let support_type = dispute.support_type;
        let agent_key = dispute.agent_pub_key_ring;
        let has_chat = dispute.first_chat_message().is_some();

        let stored = disputes.add(Dispute {
            lifecycle: DisputeLifecycle::OpenedByPeer,
            ..dispute
        });
        let mut output = DisputeOutput::default();
        let error = if stored {
            persist(&*self.store, disputes);
            info!(trade_id = %trade_id, support = support_label(support_type), "Trading peer opened a dispute");
            output = output
                .update(&trade_id, TradeUpdate::DisputeState(DisputeState::started_by_peer(support_type)))
                .lifecycle(&key, DisputeLifecycle::OpenedByPeer);
            None
        } else {
            warn!(trade_id = %trade_id, "We got a dispute already open for that trade and trading peer");
            Some("dispute already open".to_string())
        };
        if has_chat {
            self.send_ack(
                &envelope.sender,
                &agent_key,
                message.uid,
                AckSource::DisputeMessage,
                &trade_id,
                error,
            );
        }
        output
    }

    fn on_dispute_result(
        &mut self,
        envelope: &NetworkEnvelope,
        message: DisputeResultMessage,
    ) -> DisputeOutput {
        let result = message.dispute_result;
        let trade_id = result.trade_id.clone();
        if result.trader_id != self.my_trader_id() {
            error!(trade_id = %trade_id, "Dispute result is not for us, dropping");
            return DisputeOutput::default();
        }
        let Some(disputes) = self.disputes.as_mut() else {
            warn!(trade_id = %trade_id, "Dispute list not loaded, dispute result abandoned");
            return DisputeOutput::default();
        };
        let key = DisputeKey {
            trade_id: trade_id.clone(),
            trader_id: result.trader_id,
        };
        let Some(dispute) = disputes.find_mut(&key) else {
            warn!(trade_id = %trade_id, "Received a dispute result for an unknown dispute");
            let sender_key = envelope.sender_pub_key_ring;
            self.send_ack(
                &envelope.sender,
                &sender_key,
                message.uid,
                AckSource::DisputeMessage,
                &trade_id,
                Some("dispute not found".into()),
            );
            return DisputeOutput::default();
        };
        if envelope.sender_pub_key_ring != dispute.agent_pub_key_ring {
            error!(trade_id = %trade_id, sender = %envelope.sender, "Dispute result not sent by the agent, dropping");
            return DisputeOutput::default();
        }
        let agent_key = dispute.agent_pub_key_ring;
        if dispute.result.is_some() {
            warn!(trade_id = %trade_id, "Dispute result already received");
            self.send_ack(
                &envelope.sender,
                &agent_key,
                message.uid,
                AckSource::DisputeMessage,
                &trade_id,
                Some("result already received".into()),
            );
            return DisputeOutput::default();
        }

        if let Some(chat) = result.chat_message.clone() {
            dispute.add_chat_message(chat);
        }
        let support_type = dispute.support_type;
        let summary = result.summary_notes.clone();
        dispute.result = Some(result);
        dispute.lifecycle = match support_type {
            SupportType::Mediation => DisputeLifecycle::ResultReceived,
            SupportType::Refund | SupportType::Arbitration => DisputeLifecycle::Closed,
        };
        let lifecycle = dispute.lifecycle;
        persist(&*self.store, disputes);
        info!(trade_id = %trade_id, support = support_label(support_type), "Dispute result received");

        let mut output = DisputeOutput::default()
            .update(&trade_id, TradeUpdate::DisputeState(DisputeState::closed(support_type)))
            .lifecycle(&key, lifecycle);
        if support_type == SupportType::Mediation {
            output = output.update(&trade_id, TradeUpdate::MediationSummary(summary));
        }
        self.send_ack(
            &envelope.sender,
            &agent_key,
            message.uid,
            AckSource::DisputeMessage,
            &trade_id,
            None,
        );
        output
    }

    // ------------------------------------------------------------------------
    // Agent side
    // ------------------------------------------------------------------------

    fn on_open_new_dispute(
        &mut self,
        envelope: &NetworkEnvelope,
        message: OpenNewDisputeMessage,
    ) -> DisputeOutput {
        let mut dispute = message.dispute;
        if dispute.agent_pub_key_ring != self.my_key {
            error!(trade_id = %dispute.trade_id, sender = %envelope.sender, "Open dispute message sent to a node that is not the agent, dropping");
            return DisputeOutput::default();
        }
        if envelope.sender_pub_key_ring != dispute.trader_pub_key_ring {
            error!(trade_id = %dispute.trade_id, "Open dispute message not sent by the ticket's trader, dropping");
            return DisputeOutput::default();
        }
        let Some(disputes) = self.disputes.as_mut() else {
            warn!(trade_id = %dispute.trade_id, "Dispute list not loaded, open dispute message abandoned");
            return DisputeOutput::default();
        };

        let key = dispute.key();
        let trade_id = dispute.trade_id.clone();
        let trader_key = dispute.trader_pub_key_ring;
        let has_chat = dispute.first_chat_message().is_some();

        if disputes.contains(&key) {
            warn!(trade_id = %trade_id, "We got a dispute already open for that trade and trading peer");
            if has_chat {
                self.send_ack(
                    &envelope.sender,
                    &trader_key,
                    message.uid,
                    AckSource::DisputeMessage,
                    &trade_id,
                    Some("dispute already open".into()),
                );
            }
            return DisputeOutput::default();
        }

        if let (SupportType::Refund, Some(summary)) =
            (dispute.support_type, dispute.mediators_dispute_result.clone())
        {
            let note = ChatMessage::new(
                dispute.support_type,
                trade_id.clone(),
                dispute.trader_id,
                false,
                format!("System message: Mediator's summary of the preceding mediation:\n{}", summary),
                self.my_address.clone(),
                self.time.now(),
            )
            .system();
            dispute.add_chat_message(note);
        }
        let needs_price_info = dispute.price_analysis.is_none();
        let lifecycle = dispute.lifecycle;
        disputes.add(dispute);
        persist(&*self.store, disputes);
        info!(trade_id = %trade_id, trader = %key.trader_id, "Stored new dispute");

        if has_chat {
            self.send_ack(
                &envelope.sender,
                &trader_key,
                message.uid,
                AckSource::DisputeMessage,
                &trade_id,
                None,
            );
        }

        let timer = self.scheduler.post_after(
            self.config.mirror_delay(),
            InternalEvent::MirrorDispute { key: key.clone() },
        );
        self.mirror_timers.insert(key.clone(), timer);

        let mut output = DisputeOutput::default().lifecycle(&key, lifecycle);
        if needs_price_info {
            output.events.extend(self.add_price_info(&key, 0).events);
        }
        output
    }

    /// Send the counterparty its copy of a ticket the agent just stored
    pub fn mirror_dispute(&mut self, key: &DisputeKey) -> DisputeOutput {
        self.mirror_timers.remove(key);
        let Some(disputes) = self.disputes.as_mut() else {
            warn!(trade_id = %key.trade_id, "Dispute list not loaded, mirroring abandoned");
            return DisputeOutput::default();
        };
        let Some(original) = disputes.find(key).cloned() else {
            warn!(trade_id = %key.trade_id, "Dispute to mirror is gone");
            return DisputeOutput::default();
        };

        let contract = &original.contract;
        let peer = if contract.is_buyer_key(&original.trader_pub_key_ring) {
            contract.seller.clone()
        } else {
            contract.buyer.clone()
        };
        let peer_key = DisputeKey {
            trade_id: original.trade_id.clone(),
            trader_id: peer.pub_key_ring.trader_id(),
        };
        if disputes.contains(&peer_key) {
            // Both traders opened before the mirror went out
            info!(trade_id = %key.trade_id, "Counterparty already has a ticket, not mirroring");
            return DisputeOutput::default();
        }

        let chat = ChatMessage::new(
            original.support_type,
            original.trade_id.clone(),
            peer_key.trader_id,
            false,
            format!(
                "System message: Your trading peer has requested {} for trade {}.",
                support_label(original.support_type),
                original.trade_id
            ),
            self.my_address.clone(),
            self.time.now(),
        )
        .system();
        let uid = chat.uid;
        let mirrored = Dispute {
            trader_id: peer_key.trader_id,
            trader_pub_key_ring: peer.pub_key_ring,
            chat_messages: vec![chat],
            result: None,
            lifecycle: DisputeLifecycle::OpenedByPeer,
            price_analysis: None,
            mediators_dispute_result: None,
            ..original
        };
        let support_type = mirrored.support_type;
        disputes.add(mirrored.clone());
        persist(&*self.store, disputes);

        let message = SupportMessage::PeerOpenedDispute(PeerOpenedDisputeMessage {
            dispute: mirrored,
            sender_address: self.my_address.clone(),
            uid,
            support_type,
        });
        let output = DisputeOutput::default().lifecycle(&peer_key, DisputeLifecycle::OpenedByPeer);
        match self.send_tracked(&peer_key, &peer.node_address, &peer.pub_key_ring, message) {
            Ok(()) => {
                info!(trade_id = %key.trade_id, to = %peer.node_address, "Mirrored dispute to counterparty");
                output
            }
            Err(error) => output.event(AppEvent::DisputeFault {
                trade_id: key.trade_id.clone(),
                error,
            }),
        }
    }

    /// Add the option-trade analysis once the price feed has data
    pub fn add_price_info(&mut self, key: &DisputeKey, attempt: u32) -> DisputeOutput {
        self.price_timers.remove(key);
        let Some(disputes) = self.disputes.as_mut() else {
            return DisputeOutput::default();
        };
        let Some(dispute) = disputes.find_mut(key) else {
            return DisputeOutput::default();
        };
        if dispute.price_analysis.is_some() {
            return DisputeOutput::default();
        }

        let currency = dispute.contract.offer.currency().to_string();
        let price = if self.price_feed.has_prices() {
            self.price_feed.price(&currency)
        } else {
            None
        };
        let Some(price) = price else {
            if attempt < self.config.price_info_max_retries {
                debug!(trade_id = %key.trade_id, attempt, "No price yet, retrying price info");
                let timer = self.scheduler.post_after(
                    self.config.price_info_retry_delay(),
                    InternalEvent::PriceInfoRetry {
                        key: key.clone(),
                        attempt: attempt + 1,
                    },
                );
                self.price_timers.insert(key.clone(), timer);
            } else {
                warn!(trade_id = %key.trade_id, retries = attempt, currency = %currency, "Price feed has no data, giving up on price info");
            }
            return DisputeOutput::default();
        };

        let analysis = OptionTradeAnalysis::compute(
            &dispute.contract,
            price,
            self.config.min_refund_at_mediated_dispute,
        );
        let note = ChatMessage::new(
            dispute.support_type,
            dispute.trade_id.clone(),
            dispute.trader_id,
            false,
            analysis.describe(&dispute.contract),
            self.my_address.clone(),
            self.time.now(),
        )
        .system();
        info!(
            trade_id = %key.trade_id,
            option_trade = analysis.is_potential_option_trade(),
            "Added price info to dispute"
        );
        dispute.add_chat_message(note);
        dispute.price_analysis = Some(analysis);
        persist(&*self.store, disputes);
        DisputeOutput::default()
    }

    /// Close a ticket with a result and send it to its trader
    pub fn send_dispute_result(
        &mut self,
        key: &DisputeKey,
        mut result: DisputeResult,
        text: String,
    ) -> Result<DisputeOutput, DisputeError> {
        let now = self.time.now();
        let my_key = self.my_key;
        let my_address = self.my_address.clone();
        let disputes = self.disputes.as_mut().ok_or(DisputeError::NotLoaded)?;
        let dispute = disputes.find_mut(key).ok_or_else(|| DisputeError::NotFound {
            trade_id: key.trade_id.clone(),
        })?;
        if dispute.agent_pub_key_ring != my_key {
            return Err(DisputeError::WrongRole {
                reason: "only the agent sends dispute results".to_string(),
            });
        }

        let chat = ChatMessage::new(
            dispute.support_type,
            key.trade_id.clone(),
            key.trader_id,
            false,
            text,
            my_address.clone(),
            now,
        );
        let uid = chat.uid;
        result.trade_id = key.trade_id.clone();
        result.trader_id = key.trader_id;
        result.close_date = now;
        result.chat_message = Some(chat.clone());

        dispute.add_chat_message(chat);
        dispute.result = Some(result.clone());
        dispute.lifecycle = DisputeLifecycle::Closed;
        let support_type = dispute.support_type;
        let (address, trader_key) = {
            let (address, key_ring) = dispute.trader_contact();
            (address.clone(), *key_ring)
        };
        persist(&*self.store, disputes);

        let message = SupportMessage::DisputeResult(DisputeResultMessage {
            dispute_result: result,
            sender_address: my_address,
            uid,
            support_type,
        });
        self.send_tracked(key, &address, &trader_key, message)?;
        info!(trade_id = %key.trade_id, to = %address, "Sent dispute result");
        Ok(DisputeOutput::default().lifecycle(key, DisputeLifecycle::Closed))
    }

    // ------------------------------------------------------------------------
    // Both sides
    // ------------------------------------------------------------------------

    pub fn send_chat_message(
        &mut self,
        key: &DisputeKey,
        text: String,
    ) -> Result<DisputeOutput, DisputeError> {
        let now = self.time.now();
        let my_key = self.my_key;
        let my_address = self.my_address.clone();
        let disputes = self.disputes.as_mut().ok_or(DisputeError::NotLoaded)?;
        let dispute = disputes.find_mut(key).ok_or_else(|| DisputeError::NotFound {
            trade_id: key.trade_id.clone(),
        })?;

        let sender_is_trader = dispute.trader_pub_key_ring == my_key;
        let (address, recipient_key) = if sender_is_trader {
            (dispute.agent_address.clone(), dispute.agent_pub_key_ring)
        } else if dispute.agent_pub_key_ring == my_key {
            let (address, key_ring) = dispute.trader_contact();
            (address.clone(), *key_ring)
        } else {
            return Err(DisputeError::WrongRole {
                reason: "neither trader nor agent of this dispute".to_string(),
            });
        };

        let chat = ChatMessage::new(
            dispute.support_type,
            key.trade_id.clone(),
            key.trader_id,
            sender_is_trader,
            text,
            my_address,
            now,
        );
        dispute.add_chat_message(chat.clone());
        persist(&*self.store, disputes);

        self.send_tracked(key, &address, &recipient_key, SupportMessage::Chat(chat))?;
        Ok(DisputeOutput::default())
    }

    fn on_chat_message(&mut self, envelope: &NetworkEnvelope, chat: ChatMessage) -> DisputeOutput {
        let key = chat.key();
        let trade_id = chat.trade_id.clone();
        let uid = chat.uid;
        let Some(disputes) = self.disputes.as_mut() else {
            warn!(trade_id = %trade_id, "Dispute list not loaded, chat message abandoned");
            return DisputeOutput::default();
        };
        let Some(dispute) = disputes.find_mut(&key) else {
            warn!(trade_id = %trade_id, uid = %uid, "Chat message for unknown dispute");
            let sender_key = envelope.sender_pub_key_ring;
            self.send_ack(
                &envelope.sender,
                &sender_key,
                uid,
                AckSource::ChatMessage,
                &trade_id,
                Some("dispute not found".into()),
            );
            return DisputeOutput::default();
        };
        let sender = envelope.sender_pub_key_ring;
        if sender != dispute.agent_pub_key_ring && sender != dispute.trader_pub_key_ring {
            error!(trade_id = %trade_id, sender = %envelope.sender, "Chat message from outside the dispute, dropping");
            return DisputeOutput::default();
        }

        let text = chat.text.clone();
        let mut output = DisputeOutput::default();
        if dispute.add_chat_message(chat) {
            persist(&*self.store, disputes);
            output = output.event(AppEvent::ChatMessageReceived {
                key: key.clone(),
                uid,
                text,
            });
        }
        // Duplicates are acked as well
        self.send_ack(&envelope.sender, &sender, uid, AckSource::ChatMessage, &trade_id, None);
        output
    }

    /// Route an inbound support message
    pub fn on_support_message(
        &mut self,
        envelope: &NetworkEnvelope,
        message: SupportMessage,
    ) -> DisputeOutput {
        info!(kind = message.kind(), trade_id = %message.trade_id(), from = %envelope.sender, "Received support message");
        match message {
            SupportMessage::OpenNewDispute(m) => self.on_open_new_dispute(envelope, m),
            SupportMessage::PeerOpenedDispute(m) => self.on_peer_opened_dispute(envelope, m),
            SupportMessage::DisputeResult(m) => self.on_dispute_result(envelope, m),
            SupportMessage::Chat(m) => self.on_chat_message(envelope, m),
        }
    }

    // ------------------------------------------------------------------------
    // Delivery and acknowledgement
    // ------------------------------------------------------------------------

    /// Apply a transport callback for one of our support messages
    pub fn on_delivery(&mut self, uid: Uid, outcome: &DeliveryOutcome) -> Option<DisputeOutput> {
        if self.acks.remove(&uid) {
            debug!(uid = %uid, outcome = ?outcome, "Delivery report for ack");
            return Some(DisputeOutput::default());
        }
        let outbound = self.outbound.get(&uid)?.clone();
        let disputes = self.disputes.as_mut()?;
        let chat = disputes.find_mut(&outbound.key)?.chat_message_mut(&uid)?;
        let changed = chat.apply_delivery(outcome);
        let state = chat.delivery.clone();
        let stored_in_mailbox = state.is_stored_in_mailbox();
        let settled = is_settled(&chat.delivery, &chat.ack);
        persist(&*self.store, disputes);
        if settled {
            self.outbound.remove(&uid);
        }

        let mut output = DisputeOutput::default();
        if !changed {
            return Some(output);
        }
        match state {
            DeliveryState::Failed { reason } => {
                warn!(trade_id = %outbound.key.trade_id, kind = outbound.kind, reason = %reason, "Support message delivery failed");
                output = output.event(AppEvent::DisputeFault {
                    trade_id: outbound.key.trade_id.clone(),
                    error: DisputeError::DeliveryFailed { reason },
                });
            }
            DeliveryState::Arrived | DeliveryState::StoredInMailbox
                if outbound.kind == "OpenNewDisputeMessage" =>
            {
                output = output.event(AppEvent::DisputeOpened {
                    key: outbound.key.clone(),
                    stored_in_mailbox,
                });
            }
            _ => {}
        }
        Some(output)
    }

    /// Record the receiver's ack of one of our support messages
    pub fn on_ack(&mut self, ack: &AckMessage) -> Option<DisputeOutput> {
        let outbound = self.outbound.get(&ack.source_uid)?.clone();
        let disputes = self.disputes.as_mut()?;
        let chat = disputes
            .find_mut(&outbound.key)?
            .chat_message_mut(&ack.source_uid)?;
        if chat.ack != AckState::Pending {
            warn!(uid = %ack.source_uid, "Duplicate ack for support message ignored");
            return Some(DisputeOutput::default());
        }
        chat.ack = AckState::from_ack(ack.success, ack.error.clone());
        let settled = is_settled(&chat.delivery, &chat.ack);
        persist(&*self.store, disputes);
        if settled {
            self.outbound.remove(&ack.source_uid);
        }
        if !ack.success {
            warn!(trade_id = %ack.trade_id, kind = outbound.kind, error = ?ack.error, "Support message rejected by receiver");
        }
        Some(DisputeOutput::default().event(AppEvent::AckReceived {
            source_uid: ack.source_uid,
            trade_id: ack.trade_id.clone(),
            success: ack.success,
            error: ack.error.clone(),
        }))
    }

    /// Send a support message and remember its uid for callbacks
    ///
    /// A refused hand-off is recorded on the chat message before the error
    /// is returned.
    fn send_tracked(
        &mut self,
        key: &DisputeKey,
        address: &NodeAddress,
        recipient_key: &PubKeyRing,
        message: SupportMessage,
    ) -> Result<(), DisputeError> {
        let uid = message.uid();
        let kind = message.kind();
        let envelope = NetworkEnvelope::new(
            self.my_address.clone(),
            self.my_key,
            Payload::Support(message),
        );
        match self.gateway.send_mailbox(address, recipient_key, envelope) {
            Ok(()) => {
                self.outbound.insert(
                    uid,
                    Outbound {
                        key: key.clone(),
                        kind,
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!(trade_id = %key.trade_id, kind, error = %e, "Support message not handed to transport");
                if let Some(disputes) = self.disputes.as_mut() {
                    if let Some(chat) = disputes
                        .find_mut(key)
                        .and_then(|d| d.chat_message_mut(&uid))
                    {
                        chat.apply_delivery(&DeliveryOutcome::Fault {
                            reason: e.to_string(),
                        });
                    }
                    persist(&*self.store, disputes);
                }
                Err(DisputeError::Transport(e))
            }
        }
    }

    fn send_ack(
        &mut self,
        to: &NodeAddress,
        to_key: &PubKeyRing,
        source_uid: Uid,
        source: AckSource,
        trade_id: &TradeId,
        error: Option<String>,
    ) {
        let ack = AckMessage {
            source_uid,
            source,
            trade_id: trade_id.clone(),
            success: error.is_none(),
            error,
        };
        let envelope = NetworkEnvelope::new(self.my_address.clone(), self.my_key, Payload::Ack(ack));
        let uid = envelope.uid;
        match self.gateway.send_mailbox(to, to_key, envelope) {
            Ok(()) => {
                self.acks.insert(uid);
            }
            Err(e) => warn!(trade_id = %trade_id, to = %to, error = %e, "Failed to send ack"),
        }
    }
}

fn persist(store: &dyn DisputeStore, disputes: &DisputeList) {
    if let Err(e) = store.persist_disputes(disputes) {
        error!(error = %e, "Failed to persist disputes");
    }
}

/// No further callback is expected: the send failed, or it was reported and acked
fn is_settled(delivery: &DeliveryState, ack: &AckState) -> bool {
    matches!(delivery, DeliveryState::Failed { .. })
        || (*delivery != DeliveryState::Unsent && *ack != AckState::Pending)
}

//! Command, event and internal event handlers
//!
//! Handlers mutate [`EngineState`] and return the app events to publish.
//! Pipelines are spawned; their completion comes back as
//! [`InternalEvent::PipelineFinished`] and is applied here.

use escrow_core::channel::AppEvent;
use escrow_core::delivery::{AckState, DeliveryOutcome};
use escrow_core::dispute::{DisputeKey, DisputeResult, SupportType};
use escrow_core::errors::{EscrowError, EscrowResult};
use escrow_core::message::{AckMessage, AckSource, NetworkEnvelope, Payload, TradeMessage};
use escrow_core::trade::{Phase, Trade};
use escrow_core::types::{NodeAddress, PubKeyRing, TradeId, Uid};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::state::EngineState;
use crate::internal::{InternalEvent, Trigger};
use crate::managers::{DisputeOutput, PendingWork, TrackerUpdate, TradeUpdate};
use crate::protocol::{
    Admission, ConditionMatcher, Dispatch, FollowUp, Protocol, Transition, UserAction,
};
use crate::task::{RunOutcome, TaskContext, TaskRunner};

type Events = EscrowResult<Vec<AppEvent>>;

/// Handlers for everything the engine task receives
pub struct Handlers;

impl Handlers {
    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn handle_add_trade(state: &mut EngineState, trade: Trade) -> Events {
        let trade_id = trade.id.clone();
        let role = trade.role;
        if state.trades.contains(&trade_id) {
            return Err(EscrowError::invalid_input(format!(
                "trade {} already known",
                trade_id
            )));
        }
        let updates = state.delivery.register(&trade);
        state.trades.insert(trade);
        state.trades.persist(&trade_id);
        info!(trade_id = %trade_id, role = %role, "Trade added");

        let mut events = vec![AppEvent::TradeAdded { trade_id, role }];
        events.extend(updates.into_iter().map(tracker_event));
        Ok(events)
    }

    pub fn handle_user_action(
        state: &mut EngineState,
        trade_id: TradeId,
        action: UserAction,
    ) -> Events {
        if !state.trades.contains(&trade_id) {
            return Err(EscrowError::TradeNotFound { trade_id });
        }
        if state.trades.is_busy(&trade_id) {
            state.trades.enqueue(&trade_id, PendingWork::Action(action));
            return Ok(Vec::new());
        }

        let (role, dispatch, admission) = match state.trades.get(&trade_id) {
            Some(trade) => {
                let dispatch = Protocol::for_role(trade.role).user_action(trade, action);
                let admission = match &dispatch {
                    Dispatch::Run(transition) => ConditionMatcher::check_action(transition, trade),
                    _ => Ok(()),
                };
                (trade.role, dispatch, admission)
            }
            None => return Ok(Vec::new()),
        };

        let kind = action.to_string();
        match dispatch {
            Dispatch::Run(transition) => match admission {
                Ok(()) => {
                    Self::start_pipeline(state, &trade_id, transition, Trigger::UserAction(action), None)?;
                    Ok(Vec::new())
                }
                Err(failure) => {
                    warn!(trade_id = %trade_id, action = %action, reason = %failure, "User action not admitted");
                    Ok(vec![rejected(state, &trade_id, kind, failure.to_string())])
                }
            },
            Dispatch::Ignore(reason) => {
                debug!(trade_id = %trade_id, action = %action, reason = %reason, "User action ignored");
                Ok(Vec::new())
            }
            Dispatch::Reject(reason) => Ok(vec![rejected(state, &trade_id, kind, reason)]),
            Dispatch::Unhandled => {
                let reason = format!("{} is not available to a {}", action, role);
                Ok(vec![rejected(state, &trade_id, kind, reason)])
            }
        }
    }

    pub fn handle_open_dispute(
        state: &mut EngineState,
        trade_id: TradeId,
        support_type: SupportType,
        reopen: bool,
    ) -> Events {
        let trade = state
            .trades
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| EscrowError::TradeNotFound {
                trade_id: trade_id.clone(),
            })?;
        match state.disputes.open_dispute(&trade, support_type, reopen) {
            Ok(output) => Ok(apply_dispute_output(state, output)),
            Err(error) => {
                warn!(trade_id = %trade_id, error = %error, "Could not open dispute");
                Ok(vec![AppEvent::DisputeFault { trade_id, error }])
            }
        }
    }

    pub fn handle_send_dispute_result(
        state: &mut EngineState,
        key: DisputeKey,
        result: DisputeResult,
        text: String,
    ) -> Events {
        match state.disputes.send_dispute_result(&key, result, text) {
            Ok(output) => Ok(apply_dispute_output(state, output)),
            Err(error) => {
                warn!(trade_id = %key.trade_id, error = %error, "Could not send dispute result");
                Ok(vec![AppEvent::DisputeFault {
                    trade_id: key.trade_id,
                    error,
                }])
            }
        }
    }

    pub fn handle_send_chat_message(state: &mut EngineState, key: DisputeKey, text: String) -> Events {
        match state.disputes.send_chat_message(&key, text) {
            Ok(output) => Ok(apply_dispute_output(state, output)),
            Err(error) => Ok(vec![AppEvent::DisputeFault {
                trade_id: key.trade_id,
                error,
            }]),
        }
    }

    /// Load stores, resume unfinished work and replay stashed messages
    pub fn handle_all_services_initialized(state: &mut EngineState) -> Events {
        if state.initialized {
            warn!("Services already initialized, ignoring");
            return Ok(Vec::new());
        }
        let loaded = state.trades.load()?;
        let mut events = Vec::new();
        for trade_id in &loaded {
            if let Some(trade) = state.trades.get(trade_id) {
                events.push(AppEvent::TradeAdded {
                    trade_id: trade_id.clone(),
                    role: trade.role,
                });
                events.extend(state.delivery.register(trade).into_iter().map(tracker_event));
            }
        }
        let disputes = state.disputes.on_all_services_initialized()?;
        state.initialized = true;
        info!(trades = loaded.len(), disputes, "All services initialized");

        for trade_id in state.trades.ids() {
            let follow_up = match state.trades.get(&trade_id) {
                Some(trade) => Protocol::for_role(trade.role).on_resume(trade),
                None => continue,
            };
            if follow_up != FollowUp::None {
                info!(trade_id = %trade_id, follow_up = ?follow_up, "Resuming trade");
            }
            events.extend(run_follow_up(state, &trade_id, follow_up)?);
        }

        let stashed = std::mem::take(&mut state.stashed);
        if !stashed.is_empty() {
            debug!(count = stashed.len(), "Replaying messages received before initialization");
        }
        for envelope in stashed {
            match route_envelope(state, envelope) {
                Ok(more) => events.extend(more),
                Err(e) => warn!(error = %e, "Stashed message failed"),
            }
        }
        Ok(events)
    }

    pub fn handle_get_status(state: &mut EngineState) -> Events {
        Ok(vec![AppEvent::StatusReport {
            trades: state.trades.len(),
            busy_trades: state.trades.busy_count(),
            disputes: state.disputes.len(),
            open_disputes: state.disputes.num_open(),
        }])
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    pub fn handle_message_received(state: &mut EngineState, envelope: NetworkEnvelope) -> Events {
        state.stats.messages_received += 1;
        if !state.initialized {
            debug!(kind = envelope.kind(), uid = %envelope.uid, "Services not ready, message stashed");
            state.stashed.push(envelope);
            return Ok(Vec::new());
        }
        route_envelope(state, envelope)
    }

    pub fn handle_delivery_report(
        state: &mut EngineState,
        uid: Uid,
        outcome: DeliveryOutcome,
    ) -> Events {
        if state.disputes.is_tracking(&uid) {
            let output = state.disputes.on_delivery(uid, &outcome).unwrap_or_default();
            return Ok(apply_dispute_output(state, output));
        }
        if state.sent_acks.remove(&uid) {
            debug!(uid = %uid, outcome = ?outcome, "Delivery report for ack");
            return Ok(Vec::new());
        }
        match state.delivery.on_delivery(uid, outcome) {
            Some(update) => {
                if let TrackerUpdate::Delivery { trade_id, .. } = &update {
                    sync_trade(state, trade_id);
                }
                Ok(vec![tracker_event(update)])
            }
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Internal events
    // ------------------------------------------------------------------------

    pub fn handle_internal(state: &mut EngineState, event: InternalEvent) -> Events {
        match event {
            InternalEvent::PipelineFinished {
                trade,
                transition,
                outcome,
                trigger,
            } => Self::handle_pipeline_finished(state, *trade, transition, outcome, trigger),
            InternalEvent::FeeTxUnlocked { trade_id } => {
                Self::handle_fee_tx_unlocked(state, &trade_id)
            }
            InternalEvent::MultisigRequestTick { trade_id } => {
                Self::handle_multisig_tick(state, &trade_id)
            }
            InternalEvent::MirrorDispute { key } => {
                let output = state.disputes.mirror_dispute(&key);
                Ok(apply_dispute_output(state, output))
            }
            InternalEvent::PriceInfoRetry { key, attempt } => {
                let output = state.disputes.add_price_info(&key, attempt);
                Ok(apply_dispute_output(state, output))
            }
        }
    }

    /// Check the trade back in and report what the run did
    pub fn handle_pipeline_finished(
        state: &mut EngineState,
        mut trade: Trade,
        transition: &'static Transition,
        outcome: RunOutcome,
        trigger: Trigger,
    ) -> Events {
        let trade_id = trade.id.clone();
        trade.process_model.trade_message = None;
        // Only a completed run consumes the message; a failed one may be redelivered
        if let (RunOutcome::Completed, Trigger::Message { uid, .. }) = (&outcome, &trigger) {
            trade.process_model.mark_processed(*uid);
        }
        match &outcome {
            RunOutcome::Completed => state.stats.pipelines_completed += 1,
            RunOutcome::Failed(fault) => {
                state.stats.pipelines_failed += 1;
                trade.error_message = Some(fault.to_string());
            }
            RunOutcome::TimedOut => {
                state.stats.pipelines_failed += 1;
                trade.error_message = Some(format!("{} timed out", transition.name));
            }
        }

        let mut events: Vec<AppEvent> = state
            .delivery
            .register(&trade)
            .into_iter()
            .map(tracker_event)
            .collect();
        state.delivery.sync(&mut trade);

        let previous = state.trades.checkin(trade)?;
        if let Some(stored) = state.trades.get(&trade_id) {
            if stored.state() != previous.state() {
                events.push(AppEvent::TradeStateChanged {
                    trade_id: trade_id.clone(),
                    state: stored.state(),
                    phase: stored.phase(),
                });
            }
        }
        state.trades.persist(&trade_id);

        events.push(match &outcome {
            RunOutcome::Completed => AppEvent::PipelineCompleted {
                trade_id: trade_id.clone(),
                transition: transition.name,
            },
            RunOutcome::Failed(fault) => AppEvent::PipelineFailed {
                trade_id: trade_id.clone(),
                transition: transition.name,
                task: fault.task.map(|task| task.to_string()).unwrap_or_default(),
                reason: fault.reason.clone(),
            },
            RunOutcome::TimedOut => AppEvent::PipelineTimedOut {
                trade_id: trade_id.clone(),
                transition: transition.name,
            },
        });

        if let Trigger::Message {
            uid,
            sender,
            sender_key,
            kind,
        } = &trigger
        {
            debug!(trade_id = %trade_id, kind, success = outcome.is_completed(), "Acking trade message");
            send_trade_ack(state, sender, sender_key, *uid, &trade_id, outcome.error());
        }

        if outcome.is_completed() {
            events.extend(run_follow_up(state, &trade_id, transition.follow_up)?);
        }
        events.extend(drain_pending(state, &trade_id)?);
        Ok(events)
    }

    pub fn handle_fee_tx_unlocked(state: &mut EngineState, trade_id: &TradeId) -> Events {
        state.fee_watchers.remove(trade_id);
        let Some(trade) = state.trades.get(trade_id) else {
            return Ok(Vec::new());
        };
        if trade.process_model.multisig_deposit_initiated || trade.is_terminal() {
            return Ok(Vec::new());
        }
        let interval = state.config.protocol.multisig_request_interval();
        info!(trade_id = %trade_id, interval_secs = interval.as_secs(), "Taker fee unlocked, polling maker");
        let timer = state.scheduler.post_every(
            interval,
            InternalEvent::MultisigRequestTick {
                trade_id: trade_id.clone(),
            },
        );
        state.multisig_timers.insert(trade_id.clone(), timer);
        Ok(Vec::new())
    }

    pub fn handle_multisig_tick(state: &mut EngineState, trade_id: &TradeId) -> Events {
        let finished = match state.trades.get(trade_id) {
            Some(trade) => {
                trade.process_model.multisig_deposit_initiated
                    || trade.phase() >= Phase::DepositPublished
                    || trade.is_terminal()
            }
            None => true,
        };
        if finished {
            if let Some(timer) = state.multisig_timers.remove(trade_id) {
                timer.cancel();
                debug!(trade_id = %trade_id, "Multisig requests stopped");
            }
            return Ok(Vec::new());
        }
        if state.trades.is_busy(trade_id) {
            debug!(trade_id = %trade_id, "Trade busy, skipping multisig request");
            return Ok(Vec::new());
        }

        let (dispatch, admission) = match state.trades.get(trade_id) {
            Some(trade) => {
                let dispatch = Protocol::for_role(trade.role).periodic_request(trade);
                let admission = match &dispatch {
                    Dispatch::Run(transition) => ConditionMatcher::check_action(transition, trade),
                    _ => Ok(()),
                };
                (dispatch, admission)
            }
            None => return Ok(Vec::new()),
        };
        match (dispatch, admission) {
            (Dispatch::Run(transition), Ok(())) => {
                Self::start_pipeline(state, trade_id, transition, Trigger::Periodic, None)?;
            }
            (Dispatch::Run(transition), Err(failure)) => {
                debug!(trade_id = %trade_id, transition = transition.name, reason = %failure, "Multisig request not admitted");
            }
            (other, _) => {
                debug!(trade_id = %trade_id, dispatch = ?other, "Multisig requests no longer needed");
                state.multisig_timers.remove(trade_id);
            }
        }
        Ok(Vec::new())
    }

    // ------------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------------

    /// Check the trade out and run the transition on a separate task
    pub fn start_pipeline(
        state: &mut EngineState,
        trade_id: &TradeId,
        transition: &'static Transition,
        trigger: Trigger,
        message: Option<TradeMessage>,
    ) -> EscrowResult<()> {
        let mut trade = state.trades.checkout(trade_id)?;
        trade.process_model.trade_message = message;
        let ctx = TaskContext::new(trade, state.services.clone());
        let runner = TaskRunner::new(transition.name, transition.tasks, state.registry.clone())
            .with_timeout(transition.timeout(state.config.protocol.enforce_timeouts));
        let internal = state.scheduler.sender();
        state.stats.pipelines_started += 1;
        debug!(trade_id = %trade_id, transition = transition.name, trigger = ?trigger, "Starting pipeline");

        tokio::spawn(async move {
            let (ctx, outcome) = runner.run(ctx).await;
            let finished = InternalEvent::PipelineFinished {
                trade: Box::new(ctx.into_trade()),
                transition,
                outcome,
                trigger,
            };
            if internal.send(finished).is_err() {
                debug!("Engine stopped before pipeline finished");
            }
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

fn route_envelope(state: &mut EngineState, envelope: NetworkEnvelope) -> Events {
    match envelope.payload.clone() {
        Payload::Trade(message) => handle_trade_message(state, envelope, message),
        Payload::Support(message) => {
            let output = state.disputes.on_support_message(&envelope, message);
            Ok(apply_dispute_output(state, output))
        }
        Payload::Ack(ack) => handle_ack(state, &envelope, ack),
    }
}

fn handle_trade_message(
    state: &mut EngineState,
    envelope: NetworkEnvelope,
    message: TradeMessage,
) -> Events {
    let trade_id = message.trade_id().clone();
    let kind = message.kind();
    if !state.trades.contains(&trade_id) {
        warn!(trade_id = %trade_id, kind, from = %envelope.sender, "Trade message for unknown trade");
        return Ok(vec![rejected(state, &trade_id, kind, "unknown trade")]);
    }
    if state.trades.is_busy(&trade_id) {
        state
            .trades
            .enqueue(&trade_id, PendingWork::Message(Box::new(envelope)));
        return Ok(Vec::new());
    }

    let (role, processed, dispatch, admission) = match state.trades.get(&trade_id) {
        Some(trade) => {
            let dispatch = Protocol::for_role(trade.role).route(trade, &message);
            let admission = match &dispatch {
                Dispatch::Run(transition) => {
                    Some(ConditionMatcher::check_message(transition, trade, &envelope, &message))
                }
                _ => None,
            };
            let processed = trade.process_model.is_processed(&envelope.uid);
            (trade.role, processed, dispatch, admission)
        }
        None => return Ok(Vec::new()),
    };

    if processed {
        warn!(trade_id = %trade_id, kind, uid = %envelope.uid, "Message already processed");
        send_trade_ack(state, &envelope.sender, &envelope.sender_pub_key_ring, envelope.uid, &trade_id, None);
        return Ok(Vec::new());
    }

    info!(trade_id = %trade_id, kind, from = %envelope.sender, "Received trade message");
    match (dispatch, admission) {
        (Dispatch::Run(transition), Some(Ok(admission))) => {
            if let Some(trade) = state.trades.get_mut(&trade_id) {
                if admission == Admission::FirstContact {
                    ConditionMatcher::record_sender(trade, &envelope);
                }
            }
            let trigger = Trigger::Message {
                uid: envelope.uid,
                sender: envelope.sender.clone(),
                sender_key: envelope.sender_pub_key_ring,
                kind,
            };
            Handlers::start_pipeline(state, &trade_id, transition, trigger, Some(message))?;
            Ok(Vec::new())
        }
        (Dispatch::Run(_), Some(Err(failure))) => {
            warn!(trade_id = %trade_id, kind, reason = %failure, "Trade message not admitted");
            Ok(vec![rejected(state, &trade_id, kind, failure.to_string())])
        }
        (Dispatch::Run(_), None) => Ok(Vec::new()),
        (Dispatch::Ignore(reason), _) => {
            info!(trade_id = %trade_id, kind, reason = %reason, "Trade message ignored");
            send_trade_ack(state, &envelope.sender, &envelope.sender_pub_key_ring, envelope.uid, &trade_id, None);
            Ok(Vec::new())
        }
        (Dispatch::Reject(reason), _) => {
            warn!(trade_id = %trade_id, kind, reason = %reason, "Trade message rejected");
            send_trade_ack(
                state,
                &envelope.sender,
                &envelope.sender_pub_key_ring,
                envelope.uid,
                &trade_id,
                Some(reason.clone()),
            );
            Ok(vec![rejected(state, &trade_id, kind, reason)])
        }
        (Dispatch::Unhandled, _) => {
            error!(trade_id = %trade_id, kind, role = %role, "Protocol violation: message not handled by this role");
            let reason = format!("{} not handled by a {}", kind, role);
            Ok(vec![rejected(state, &trade_id, kind, reason)])
        }
    }
}

fn handle_ack(state: &mut EngineState, envelope: &NetworkEnvelope, ack: AckMessage) -> Events {
    debug!(source_uid = %ack.source_uid, from = %envelope.sender, success = ack.success, "Received ack");
    match ack.source {
        AckSource::TradeMessage => {
            if !ack.success {
                warn!(trade_id = %ack.trade_id, error = ?ack.error, "Peer rejected our trade message");
            }
            let update = state
                .delivery
                .on_ack(ack.source_uid, AckState::from_ack(ack.success, ack.error.clone()));
            match update {
                Some(update) => {
                    sync_trade(state, &ack.trade_id);
                    Ok(vec![tracker_event(update)])
                }
                None => Ok(Vec::new()),
            }
        }
        AckSource::ChatMessage | AckSource::DisputeMessage => {
            let output = state.disputes.on_ack(&ack).unwrap_or_default();
            Ok(apply_dispute_output(state, output))
        }
    }
}

/// Run queued work for a trade that just became idle
fn drain_pending(state: &mut EngineState, trade_id: &TradeId) -> Events {
    let mut events = Vec::new();
    while let Some(work) = state.trades.pop_pending(trade_id) {
        let result = match work {
            PendingWork::Message(envelope) => route_envelope(state, *envelope),
            PendingWork::Action(action) => {
                Handlers::handle_user_action(state, trade_id.clone(), action)
            }
        };
        events.extend(result?);
    }
    Ok(events)
}

// ----------------------------------------------------------------------------
// Follow-ups
// ----------------------------------------------------------------------------

fn run_follow_up(state: &mut EngineState, trade_id: &TradeId, follow_up: FollowUp) -> Events {
    match follow_up {
        FollowUp::None => Ok(Vec::new()),
        FollowUp::FundMultisigIfReady => fund_multisig_if_ready(state, trade_id),
        FollowUp::WatchFeeTxUnlock => {
            watch_fee_tx_unlock(state, trade_id);
            Ok(Vec::new())
        }
    }
}

/// Start funding once both participants' multisig info is known
fn fund_multisig_if_ready(state: &mut EngineState, trade_id: &TradeId) -> Events {
    let (dispatch, admission) = match state.trades.get(trade_id) {
        Some(trade) => {
            let model = &trade.process_model;
            if !model.multisig_setup_complete || model.multisig_deposit_initiated {
                return Ok(Vec::new());
            }
            let dispatch = Protocol::for_role(trade.role).fund_multisig(trade);
            let admission = match &dispatch {
                Dispatch::Run(transition) => ConditionMatcher::check_action(transition, trade),
                _ => Ok(()),
            };
            (dispatch, admission)
        }
        None => return Ok(Vec::new()),
    };
    let transition = match (dispatch, admission) {
        (Dispatch::Run(transition), Ok(())) => transition,
        (Dispatch::Run(transition), Err(failure)) => {
            warn!(trade_id = %trade_id, reason = %failure, "Multisig funding not admitted");
            return Ok(vec![rejected(state, trade_id, transition.on, failure.to_string())]);
        }
        (other, _) => {
            debug!(trade_id = %trade_id, dispatch = ?other, "Not funding multisig");
            return Ok(Vec::new());
        }
    };

    if let Some(trade) = state.trades.get_mut(trade_id) {
        trade.process_model.multisig_deposit_initiated = true;
    }
    state.trades.persist(trade_id);
    if let Some(timer) = state.multisig_timers.remove(trade_id) {
        timer.cancel();
    }
    info!(trade_id = %trade_id, "Multisig setup complete, funding deposit");
    Handlers::start_pipeline(state, trade_id, transition, Trigger::FollowUp, None)?;
    Ok(Vec::new())
}

/// Wait for the taker fee to unlock, checking on every balance change
fn watch_fee_tx_unlock(state: &mut EngineState, trade_id: &TradeId) {
    let Some(tx_id) = state
        .trades
        .get(trade_id)
        .and_then(|trade| trade.taker_fee_tx_id.clone())
    else {
        warn!(trade_id = %trade_id, "No taker fee tx to watch");
        return;
    };
    let wallet = state.services.wallet.clone();
    let confirmations = state.config.protocol.fee_unlock_confirmations;
    let internal = state.scheduler.sender();
    let mut balance_changes = wallet.subscribe_balance_changes();
    let watched = trade_id.clone();
    debug!(trade_id = %trade_id, tx_id = %tx_id, confirmations, "Watching taker fee tx");

    let watcher = tokio::spawn(async move {
        loop {
            match wallet.get_transaction(&tx_id).await {
                Ok(Some(tx)) if tx.is_unlocked(confirmations) => {
                    let _ = internal.send(InternalEvent::FeeTxUnlocked { trade_id: watched });
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(trade_id = %watched, error = %e, "Fee tx lookup failed"),
            }
            match balance_changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    });
    if let Some(previous) = state.fee_watchers.insert(trade_id.clone(), watcher) {
        previous.abort();
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn rejected(
    state: &mut EngineState,
    trade_id: &TradeId,
    kind: impl Into<String>,
    reason: impl Into<String>,
) -> AppEvent {
    state.stats.messages_rejected += 1;
    AppEvent::MessageRejected {
        trade_id: trade_id.clone(),
        kind: kind.into(),
        reason: reason.into(),
    }
}

/// Tell the sender whether its trade message was processed
fn send_trade_ack(
    state: &mut EngineState,
    to: &NodeAddress,
    to_key: &PubKeyRing,
    source_uid: Uid,
    trade_id: &TradeId,
    error: Option<String>,
) {
    let ack = AckMessage {
        source_uid,
        source: AckSource::TradeMessage,
        trade_id: trade_id.clone(),
        success: error.is_none(),
        error,
    };
    let envelope = NetworkEnvelope::new(
        state.my_address().clone(),
        state.my_pub_key_ring(),
        Payload::Ack(ack),
    );
    let uid = envelope.uid;
    match state.services.gateway.send_mailbox(to, to_key, envelope) {
        Ok(()) => {
            state.sent_acks.insert(uid);
        }
        Err(e) => warn!(trade_id = %trade_id, to = %to, error = %e, "Failed to send ack"),
    }
}

/// Copy tracked delivery states into an idle trade and persist it
fn sync_trade(state: &mut EngineState, trade_id: &TradeId) {
    let changed = match state.trades.get_mut(trade_id) {
        Some(trade) => state.delivery.sync(trade),
        None => false,
    };
    if changed {
        state.trades.persist(trade_id);
    }
}

fn apply_dispute_output(state: &mut EngineState, output: DisputeOutput) -> Vec<AppEvent> {
    let mut events = output.events;
    for (trade_id, update) in output.trade_updates {
        if !state.trades.update(&trade_id, update.clone()) {
            debug!(trade_id = %trade_id, "Dispute update for a trade we do not hold");
            continue;
        }
        state.trades.persist(&trade_id);
        if let TradeUpdate::DisputeState(dispute_state) = update {
            events.push(AppEvent::TradeDisputeStateChanged {
                trade_id,
                state: dispute_state,
            });
        }
    }
    events
}

fn tracker_event(update: TrackerUpdate) -> AppEvent {
    match update {
        TrackerUpdate::Delivery {
            uid,
            trade_id,
            state,
        } => AppEvent::DeliveryUpdated {
            uid,
            trade_id,
            state,
        },
        TrackerUpdate::Ack {
            uid,
            trade_id,
            state,
        } => {
            let (success, error) = match state {
                AckState::Rejected { error } => (false, Some(error)),
                AckState::Acknowledged | AckState::Pending => (true, None),
            };
            AppEvent::AckReceived {
                source_uid: uid,
                trade_id,
                success,
                error,
            }
        }
    }
}

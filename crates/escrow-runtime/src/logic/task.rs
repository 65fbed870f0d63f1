//! Engine task
//!
//! Owns [`EngineState`] and serializes every command, transport event and
//! internal event through one loop.

use escrow_core::channel::{
    AppEvent, AppEventSender, ChannelError, Command, CommandReceiver, Event, EventReceiver,
    NonBlockingSend,
};
use escrow_core::errors::EscrowResult;
use tracing::{debug, error, info, warn};

use super::handlers::Handlers;
use super::state::{EngineState, EngineStats};
use crate::protocol::UserAction;
use crate::scheduler::InternalReceiver;

// ----------------------------------------------------------------------------
// Engine Task
// ----------------------------------------------------------------------------

pub struct EngineTask {
    state: EngineState,
    command_receiver: CommandReceiver,
    event_receiver: EventReceiver,
    internal_receiver: InternalReceiver,
    app_event_sender: AppEventSender,
    running: bool,
    /// The transport side may go away while commands keep flowing
    events_open: bool,
}

impl EngineTask {
    pub fn new(
        state: EngineState,
        command_receiver: CommandReceiver,
        event_receiver: EventReceiver,
        internal_receiver: InternalReceiver,
        app_event_sender: AppEventSender,
    ) -> Self {
        Self {
            state,
            command_receiver,
            event_receiver,
            internal_receiver,
            app_event_sender,
            running: true,
            events_open: true,
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.state.stats
    }

    /// Run until shutdown, a closed command channel or an unrecoverable error
    pub async fn run(&mut self) -> EscrowResult<()> {
        info!(address = %self.state.my_address(), "Engine task starting");

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => {
                            self.state.stats.commands_processed += 1;
                            let result = self.process_command(command);
                            self.handle_outcome("command", result);
                        }
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                event = self.event_receiver.recv(), if self.events_open => {
                    match event {
                        Some(event) => {
                            self.state.stats.events_processed += 1;
                            let result = self.process_event(event);
                            self.handle_outcome("event", result);
                        }
                        None => {
                            info!("Event channel closed");
                            self.events_open = false;
                        }
                    }
                }

                internal = self.internal_receiver.recv() => {
                    if let Some(internal) = internal {
                        self.state.stats.internal_events_processed += 1;
                        let result = Handlers::handle_internal(&mut self.state, internal);
                        self.handle_outcome("internal event", result);
                    }
                }
            }
        }

        self.state.cancel_background_work();
        info!(
            commands = self.state.stats.commands_processed,
            events = self.state.stats.events_processed,
            pipelines = self.state.stats.pipelines_started,
            "Engine task stopped"
        );
        Ok(())
    }

    fn process_command(&mut self, command: Command) -> EscrowResult<Vec<AppEvent>> {
        debug!(command = command_name(&command), "Processing command");
        let state = &mut self.state;
        match command {
            Command::AddTrade(trade) => Handlers::handle_add_trade(state, *trade),
            Command::TakeOffer { trade_id } => {
                Handlers::handle_user_action(state, trade_id, UserAction::TakeOffer)
            }
            Command::PaymentStarted { trade_id } => {
                Handlers::handle_user_action(state, trade_id, UserAction::PaymentStarted)
            }
            Command::PaymentReceived { trade_id } => {
                Handlers::handle_user_action(state, trade_id, UserAction::PaymentReceived)
            }
            Command::CompleteTrade { trade_id } => {
                Handlers::handle_user_action(state, trade_id, UserAction::CompleteTrade)
            }
            Command::OpenDispute {
                trade_id,
                support_type,
                reopen,
            } => Handlers::handle_open_dispute(state, trade_id, support_type, reopen),
            Command::SendDisputeResult { key, result, text } => {
                Handlers::handle_send_dispute_result(state, key, result, text)
            }
            Command::SendChatMessage { key, text } => {
                Handlers::handle_send_chat_message(state, key, text)
            }
            Command::AllServicesInitialized => Handlers::handle_all_services_initialized(state),
            Command::GetStatus => Handlers::handle_get_status(state),
            Command::Shutdown => {
                info!("Shutdown requested");
                self.running = false;
                Ok(Vec::new())
            }
        }
    }

    fn process_event(&mut self, event: Event) -> EscrowResult<Vec<AppEvent>> {
        match event {
            Event::MessageReceived(envelope) => {
                Handlers::handle_message_received(&mut self.state, *envelope)
            }
            Event::DeliveryReport { uid, outcome } => {
                Handlers::handle_delivery_report(&mut self.state, uid, outcome)
            }
        }
    }

    fn handle_outcome(&mut self, source: &str, result: EscrowResult<Vec<AppEvent>>) {
        match result {
            Ok(events) => {
                for event in events {
                    self.send_app_event(event);
                }
            }
            Err(e) if e.is_unrecoverable() => {
                error!(source, error = %e, "Unrecoverable error, shutting down engine task");
                self.running = false;
            }
            Err(e) => {
                warn!(source, error = %e, "Error processing {}", source);
                self.send_app_event(AppEvent::SystemError {
                    error: e.to_string(),
                });
            }
        }
    }

    fn send_app_event(&mut self, event: AppEvent) {
        self.state.stats.app_events_generated += 1;
        match self.app_event_sender.try_send_non_blocking(event) {
            Ok(()) => {}
            Err(ChannelError::ChannelFull) => warn!("App event channel full, event dropped"),
            Err(_) => debug!("No app event observer, event dropped"),
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::AddTrade(_) => "AddTrade",
        Command::TakeOffer { .. } => "TakeOffer",
        Command::PaymentStarted { .. } => "PaymentStarted",
        Command::PaymentReceived { .. } => "PaymentReceived",
        Command::CompleteTrade { .. } => "CompleteTrade",
        Command::OpenDispute { .. } => "OpenDispute",
        Command::SendDisputeResult { .. } => "SendDisputeResult",
        Command::SendChatMessage { .. } => "SendChatMessage",
        Command::AllServicesInitialized => "AllServicesInitialized",
        Command::GetStatus => "GetStatus",
        Command::Shutdown => "Shutdown",
    }
}

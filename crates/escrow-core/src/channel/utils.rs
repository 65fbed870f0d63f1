//! Channel Utilities for CSP Communication
//!
//! Channel aliases, constructors and the [`ChannelGateway`] that turns the
//! effect channel into a [`MessagingGateway`].

use std::fmt;

use tokio::sync::{broadcast, mpsc};

use crate::channel::communication::{AppEvent, Command, Effect, Event};
use crate::config::ChannelConfig;
use crate::errors::TransportError;
use crate::message::NetworkEnvelope;
use crate::services::{MessagingGateway, TradeStatistics};
use crate::types::{NodeAddress, PubKeyRing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    ChannelFull,
    ChannelClosed,
    ReceiverDropped,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ChannelFull => write!(f, "Channel buffer is full"),
            ChannelError::ChannelClosed => write!(f, "Channel is closed"),
            ChannelError::ReceiverDropped => write!(f, "Channel receiver was dropped"),
        }
    }
}

impl std::error::Error for ChannelError {}

pub type CommandSender = mpsc::Sender<Command>;
pub type CommandReceiver = mpsc::Receiver<Command>;
pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;
pub type EffectSender = broadcast::Sender<Effect>;
pub type EffectReceiver = broadcast::Receiver<Effect>;
pub type AppEventSender = mpsc::Sender<AppEvent>;
pub type AppEventReceiver = mpsc::Receiver<AppEvent>;

// ----------------------------------------------------------------------------
// Channel Creation Utilities
// ----------------------------------------------------------------------------

/// Create bounded command channel (Application → Engine)
pub fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    mpsc::channel(config.command_buffer_size)
}

/// Create bounded event channel (Transport → Engine)
pub fn create_event_channel(config: &ChannelConfig) -> (EventSender, EventReceiver) {
    mpsc::channel(config.event_buffer_size)
}

/// Create broadcast effect channel (Engine → Transports)
///
/// Further receivers are created with [`create_effect_receiver`].
pub fn create_effect_channel(config: &ChannelConfig) -> (EffectSender, EffectReceiver) {
    broadcast::channel(config.effect_buffer_size)
}

pub fn create_effect_receiver(effect_sender: &EffectSender) -> EffectReceiver {
    effect_sender.subscribe()
}

/// Create bounded app event channel (Engine → Application)
pub fn create_app_event_channel(config: &ChannelConfig) -> (AppEventSender, AppEventReceiver) {
    mpsc::channel(config.app_event_buffer_size)
}

// ----------------------------------------------------------------------------
// Non-blocking Send Utilities
// ----------------------------------------------------------------------------

/// Non-blocking send so the engine never waits on a slow observer
pub trait NonBlockingSend<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError>;
}

impl<T> NonBlockingSend<T> for mpsc::Sender<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError> {
        self.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::ChannelClosed,
        })
    }
}

// ----------------------------------------------------------------------------
// Channel Gateway
// ----------------------------------------------------------------------------

/// [`MessagingGateway`] that publishes sends as effects
///
/// The transport subscribed to the effect channel performs the delivery and
/// reports the outcome back as an [`Event::DeliveryReport`].
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    effects: EffectSender,
}

impl ChannelGateway {
    pub fn new(effects: EffectSender) -> Self {
        Self { effects }
    }

    fn publish(&self, effect: Effect) -> Result<(), TransportError> {
        self.effects
            .send(effect)
            .map(|_| ())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl MessagingGateway for ChannelGateway {
    fn send_mailbox(
        &self,
        recipient: &NodeAddress,
        recipient_key: &PubKeyRing,
        envelope: NetworkEnvelope,
    ) -> Result<(), TransportError> {
        self.publish(Effect::SendMailbox {
            recipient: recipient.clone(),
            recipient_key: *recipient_key,
            envelope: Box::new(envelope),
        })
    }

    fn publish_trade_statistics(&self, statistics: TradeStatistics) -> Result<(), TransportError> {
        self.publish(Effect::PublishTradeStatistics(statistics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckMessage, AckSource, Payload};
    use crate::types::{TradeId, Uid};

    fn envelope() -> NetworkEnvelope {
        NetworkEnvelope::new(
            NodeAddress::new("a", 1),
            PubKeyRing::new([1; 32]),
            Payload::Ack(AckMessage {
                source_uid: Uid::new(),
                source: AckSource::TradeMessage,
                trade_id: TradeId::from("t"),
                success: true,
                error: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_gateway_publishes_effect() {
        let (sender, mut receiver) = create_effect_channel(&ChannelConfig::testing());
        let gateway = ChannelGateway::new(sender);
        let env = envelope();
        let uid = env.uid;
        gateway
            .send_mailbox(&NodeAddress::new("b", 2), &PubKeyRing::new([2; 32]), env)
            .unwrap();

        match receiver.recv().await.unwrap() {
            Effect::SendMailbox {
                recipient, envelope, ..
            } => {
                assert_eq!(recipient, NodeAddress::new("b", 2));
                assert_eq!(envelope.uid, uid);
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn test_gateway_without_transport_reports_closed() {
        let (sender, receiver) = create_effect_channel(&ChannelConfig::testing());
        drop(receiver);
        let gateway = ChannelGateway::new(sender);
        let result =
            gateway.send_mailbox(&NodeAddress::new("b", 2), &PubKeyRing::new([2; 32]), envelope());
        assert_eq!(result, Err(TransportError::ChannelClosed));
    }

    #[test]
    fn test_non_blocking_send_full() {
        let (sender, _receiver) = mpsc::channel::<u8>(1);
        assert!(sender.try_send_non_blocking(1).is_ok());
        assert_eq!(sender.try_send_non_blocking(2), Err(ChannelError::ChannelFull));
    }
}

//! Admission checks in front of every transition
//!
//! A message is admitted when the trade is still live, its phase is one the
//! transition allows, the message belongs to this trade and the sender is the
//! recorded counterparty. The first message of a trade whose peer is still
//! unknown is accepted and its sender recorded.

use std::fmt;

use escrow_core::message::{NetworkEnvelope, TradeMessage};
use escrow_core::trade::{Phase, Trade};
use escrow_core::types::{NodeAddress, PubKeyRing, TradeId};

use super::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    KnownPeer,
    /// Sender accepted as the counterparty; record it with [`ConditionMatcher::record_sender`]
    FirstContact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionFailure {
    Terminal {
        trade_id: TradeId,
    },
    PhaseNotAllowed {
        transition: &'static str,
        phase: Phase,
        allowed: &'static [Phase],
    },
    TradeIdMismatch {
        expected: TradeId,
        actual: TradeId,
    },
    UnexpectedSender {
        expected: NodeAddress,
        actual: NodeAddress,
    },
    UnexpectedKey {
        expected: PubKeyRing,
        actual: PubKeyRing,
    },
}

impl fmt::Display for ConditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionFailure::Terminal { trade_id } => {
                write!(f, "trade {} is closed", trade_id)
            }
            ConditionFailure::PhaseNotAllowed {
                transition,
                phase,
                allowed,
            } => {
                let allowed: Vec<String> = allowed.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "{} not allowed in phase {} (expected {})",
                    transition,
                    phase,
                    allowed.join(" or ")
                )
            }
            ConditionFailure::TradeIdMismatch { expected, actual } => {
                write!(f, "message for trade {} arrived at trade {}", actual, expected)
            }
            ConditionFailure::UnexpectedSender { expected, actual } => {
                write!(f, "sender {} is not the trading peer {}", actual, expected)
            }
            ConditionFailure::UnexpectedKey { expected, actual } => {
                write!(f, "sender key {} is not the peer key {}", actual, expected)
            }
        }
    }
}

pub struct ConditionMatcher;

impl ConditionMatcher {
    /// Phase check shared by messages and user actions
    pub fn check_action(transition: &Transition, trade: &Trade) -> Result<(), ConditionFailure> {
        if trade.is_terminal() {
            return Err(ConditionFailure::Terminal {
                trade_id: trade.id.clone(),
            });
        }
        let phase = trade.phase();
        if !transition.allowed_phases.contains(&phase) {
            return Err(ConditionFailure::PhaseNotAllowed {
                transition: transition.name,
                phase,
                allowed: transition.allowed_phases,
            });
        }
        Ok(())
    }

    pub fn check_message(
        transition: &Transition,
        trade: &Trade,
        envelope: &NetworkEnvelope,
        message: &TradeMessage,
    ) -> Result<Admission, ConditionFailure> {
        Self::check_action(transition, trade)?;

        if message.trade_id() != &trade.id {
            return Err(ConditionFailure::TradeIdMismatch {
                expected: trade.id.clone(),
                actual: message.trade_id().clone(),
            });
        }

        let peer = &trade.process_model.peer;
        let mut admission = Admission::KnownPeer;
        match &peer.node_address {
            Some(expected) if expected != &envelope.sender => {
                return Err(ConditionFailure::UnexpectedSender {
                    expected: expected.clone(),
                    actual: envelope.sender.clone(),
                });
            }
            Some(_) => {}
            None => admission = Admission::FirstContact,
        }
        match &peer.pub_key_ring {
            Some(expected) if expected != &envelope.sender_pub_key_ring => {
                return Err(ConditionFailure::UnexpectedKey {
                    expected: *expected,
                    actual: envelope.sender_pub_key_ring,
                });
            }
            Some(_) => {}
            None => admission = Admission::FirstContact,
        }
        Ok(admission)
    }

    /// Record the first sender as the trading peer
    pub fn record_sender(trade: &mut Trade, envelope: &NetworkEnvelope) {
        let peer = &mut trade.process_model.peer;
        if peer.node_address.is_none() {
            peer.node_address = Some(envelope.sender.clone());
        }
        if peer.pub_key_ring.is_none() {
            peer.pub_key_ring = Some(envelope.sender_pub_key_ring);
        }
        trade.process_model.temp_peer_address = Some(envelope.sender.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tables::{INIT_MULTISIG, SELLER_SIGNATURE_RESPONSE};
    use escrow_core::message::{InitMultisigMessage, Payload};
    use escrow_core::testing::fixtures;
    use escrow_core::trade::{DepositScheme, Direction, TradeState};

    fn request(trade_id: &str) -> TradeMessage {
        TradeMessage::InitMultisigMessage(InitMultisigMessage {
            trade_id: TradeId::from(trade_id),
            prepared_multisig_info: "taker-info".into(),
        })
    }

    fn envelope(message: TradeMessage) -> NetworkEnvelope {
        NetworkEnvelope::new(
            fixtures::taker_address(),
            fixtures::taker_keys().pub_key_ring(),
            Payload::Trade(message),
        )
    }

    fn maker_trade() -> Trade {
        let offer = fixtures::offer("abc123", Direction::Seller, DepositScheme::Multisig);
        fixtures::maker_trade(&offer)
    }

    #[test]
    fn test_first_contact_then_recorded_peer() {
        let mut trade = maker_trade();
        let message = request("abc123");
        let env = envelope(message.clone());

        let admission =
            ConditionMatcher::check_message(&INIT_MULTISIG, &trade, &env, &message).unwrap();
        assert_eq!(admission, Admission::FirstContact);
        ConditionMatcher::record_sender(&mut trade, &env);
        assert_eq!(trade.peer_address(), Some(&fixtures::taker_address()));

        let admission =
            ConditionMatcher::check_message(&INIT_MULTISIG, &trade, &env, &message).unwrap();
        assert_eq!(admission, Admission::KnownPeer);
    }

    #[test]
    fn test_stranger_rejected_after_peer_recorded() {
        let mut trade = maker_trade();
        let message = request("abc123");
        ConditionMatcher::record_sender(&mut trade, &envelope(message.clone()));

        let stranger = NetworkEnvelope::new(
            NodeAddress::new("stranger", 1),
            fixtures::taker_keys().pub_key_ring(),
            Payload::Trade(message.clone()),
        );
        let failure =
            ConditionMatcher::check_message(&INIT_MULTISIG, &trade, &stranger, &message)
                .unwrap_err();
        assert!(matches!(failure, ConditionFailure::UnexpectedSender { .. }));

        let wrong_key = NetworkEnvelope::new(
            fixtures::taker_address(),
            fixtures::mediator_keys().pub_key_ring(),
            Payload::Trade(message.clone()),
        );
        let failure =
            ConditionMatcher::check_message(&INIT_MULTISIG, &trade, &wrong_key, &message)
                .unwrap_err();
        assert!(matches!(failure, ConditionFailure::UnexpectedKey { .. }));
    }

    #[test]
    fn test_phase_and_trade_id_checks() {
        let trade = maker_trade();
        let message = request("abc123");
        let env = envelope(message.clone());
        let failure =
            ConditionMatcher::check_message(&SELLER_SIGNATURE_RESPONSE, &trade, &env, &message)
                .unwrap_err();
        assert!(failure.to_string().contains("not allowed in phase INIT"));

        let other = request("other");
        let failure =
            ConditionMatcher::check_message(&INIT_MULTISIG, &trade, &envelope(other.clone()), &other)
                .unwrap_err();
        assert!(matches!(failure, ConditionFailure::TradeIdMismatch { .. }));
    }

    #[test]
    fn test_completed_trade_admits_nothing() {
        let mut trade = maker_trade();
        trade.set_state(TradeState::TradeCompleted).unwrap();
        assert_eq!(
            ConditionMatcher::check_action(&INIT_MULTISIG, &trade),
            Err(ConditionFailure::Terminal {
                trade_id: TradeId::from("abc123")
            })
        );
    }
}

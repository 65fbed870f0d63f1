//! Message delivery states for mailbox messages
//!
//! The transport reports one of three outcomes per outbound message
//! (arrived, stored in mailbox, fault). The recorded state only ever moves
//! forward so a late "stored" callback never downgrades "arrived".
//! Application-level acknowledgements are tracked separately in [`AckState`].

use serde::{Deserialize, Serialize};

use crate::types::{NodeAddress, Timestamp, TradeId, Uid};

// ----------------------------------------------------------------------------
// Delivery Outcome
// ----------------------------------------------------------------------------

/// Tri-state delivery outcome reported by the messaging gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Peer was online and received the message
    Arrived,
    /// Peer was offline, the message waits in its mailbox
    StoredInMailbox,
    /// The transport could not deliver the message
    Fault { reason: String },
}

// ----------------------------------------------------------------------------
// Delivery State
// ----------------------------------------------------------------------------

/// Recorded delivery state of one outbound message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    #[default]
    Unsent,
    StoredInMailbox,
    Arrived,
    Failed { reason: String },
}

impl DeliveryState {
    /// Apply a delivery outcome, returning true if the state changed
    ///
    /// Allowed transitions: `Unsent` to anything, `StoredInMailbox` to
    /// `Arrived`. `Arrived` and `Failed` are terminal.
    pub fn advance(&mut self, outcome: &DeliveryOutcome) -> bool {
        let next = match (&*self, outcome) {
            (DeliveryState::Unsent, DeliveryOutcome::Arrived) => DeliveryState::Arrived,
            (DeliveryState::Unsent, DeliveryOutcome::StoredInMailbox) => {
                DeliveryState::StoredInMailbox
            }
            (DeliveryState::Unsent, DeliveryOutcome::Fault { reason }) => DeliveryState::Failed {
                reason: reason.clone(),
            },
            (DeliveryState::StoredInMailbox, DeliveryOutcome::Arrived) => DeliveryState::Arrived,
            _ => return false,
        };
        *self = next;
        true
    }

    pub fn is_arrived(&self) -> bool {
        matches!(self, DeliveryState::Arrived)
    }

    pub fn is_stored_in_mailbox(&self) -> bool {
        matches!(self, DeliveryState::StoredInMailbox)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Arrived | DeliveryState::Failed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DeliveryState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Acknowledgement State
// ----------------------------------------------------------------------------

/// Application-level processing acknowledgement from the receiver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckState {
    #[default]
    Pending,
    Acknowledged,
    Rejected { error: String },
}

impl AckState {
    pub fn from_ack(success: bool, error: Option<String>) -> Self {
        if success {
            AckState::Acknowledged
        } else {
            AckState::Rejected {
                error: error.unwrap_or_else(|| "rejected without reason".to_string()),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Sent Message Record
// ----------------------------------------------------------------------------

/// Record of an outbound message, kept so irreversible sends are not repeated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub uid: Uid,
    pub trade_id: TradeId,
    pub kind: String,
    pub recipient: NodeAddress,
    pub sent_at: Timestamp,
    pub delivery: DeliveryState,
    pub ack: AckState,
}

impl SentMessage {
    pub fn new(
        uid: Uid,
        trade_id: TradeId,
        kind: impl Into<String>,
        recipient: NodeAddress,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            uid,
            trade_id,
            kind: kind.into(),
            recipient,
            sent_at,
            delivery: DeliveryState::Unsent,
            ack: AckState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrived_is_not_downgraded() {
        let mut state = DeliveryState::Unsent;
        assert!(state.advance(&DeliveryOutcome::Arrived));
        assert!(!state.advance(&DeliveryOutcome::StoredInMailbox));
        assert_eq!(state, DeliveryState::Arrived);
    }

    #[test]
    fn test_mailbox_then_arrived() {
        let mut state = DeliveryState::Unsent;
        assert!(state.advance(&DeliveryOutcome::StoredInMailbox));
        assert!(state.advance(&DeliveryOutcome::Arrived));
        assert!(state.is_arrived());
    }

    #[test]
    fn test_fault_is_terminal() {
        let mut state = DeliveryState::Unsent;
        assert!(state.advance(&DeliveryOutcome::Fault {
            reason: "peer unknown".into()
        }));
        assert!(!state.advance(&DeliveryOutcome::Arrived));
        assert_eq!(state.error(), Some("peer unknown"));
    }

    #[test]
    fn test_ack_state_from_ack() {
        assert_eq!(AckState::from_ack(true, None), AckState::Acknowledged);
        assert_eq!(
            AckState::from_ack(false, Some("bad".into())),
            AckState::Rejected {
                error: "bad".into()
            }
        );
    }
}

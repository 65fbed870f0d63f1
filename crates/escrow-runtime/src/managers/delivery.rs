//! Delivery and acknowledgement tracking for outbound trade messages
//!
//! Transport callbacks and acks may reach the engine before the pipeline that
//! sent the message has checked its trade back in. Signals for a uid the
//! tracker does not know yet are parked and applied once the sending trade
//! registers its sent messages.

use std::collections::HashMap;

use escrow_core::delivery::{AckState, DeliveryOutcome, DeliveryState, SentMessage};
use escrow_core::trade::Trade;
use escrow_core::types::{TradeId, Uid};
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Tracked Message
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    pub trade_id: TradeId,
    pub kind: String,
    pub delivery: DeliveryState,
    pub ack: AckState,
}

/// Signal received before its message was registered
#[derive(Debug, Clone)]
enum Parked {
    Delivery(DeliveryOutcome),
    Ack(AckState),
}

/// Visible change of a tracked message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerUpdate {
    Delivery {
        uid: Uid,
        trade_id: TradeId,
        state: DeliveryState,
    },
    Ack {
        uid: Uid,
        trade_id: TradeId,
        state: AckState,
    },
}

// ----------------------------------------------------------------------------
// Delivery Tracker
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    messages: HashMap<Uid, TrackedMessage>,
    parked: HashMap<Uid, Vec<Parked>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking the sent messages of a trade not seen before
    pub fn register(&mut self, trade: &Trade) -> Vec<TrackerUpdate> {
        let mut updates = Vec::new();
        for sent in &trade.process_model.sent_messages {
            if self.messages.contains_key(&sent.uid) {
                continue;
            }
            self.messages.insert(
                sent.uid,
                TrackedMessage {
                    trade_id: sent.trade_id.clone(),
                    kind: sent.kind.clone(),
                    delivery: sent.delivery.clone(),
                    ack: sent.ack.clone(),
                },
            );
            for signal in self.parked.remove(&sent.uid).unwrap_or_default() {
                let update = match signal {
                    Parked::Delivery(outcome) => self.on_delivery(sent.uid, outcome),
                    Parked::Ack(state) => self.on_ack(sent.uid, state),
                };
                updates.extend(update);
            }
        }
        updates
    }

    /// Apply a transport callback; `None` if nothing visible changed
    pub fn on_delivery(&mut self, uid: Uid, outcome: DeliveryOutcome) -> Option<TrackerUpdate> {
        let Some(tracked) = self.messages.get_mut(&uid) else {
            debug!(uid = %uid, "Delivery report for unregistered message parked");
            self.parked.entry(uid).or_default().push(Parked::Delivery(outcome));
            return None;
        };
        if !tracked.delivery.advance(&outcome) {
            debug!(uid = %uid, state = ?tracked.delivery, outcome = ?outcome, "Delivery report ignored");
            return None;
        }
        if let Some(reason) = tracked.delivery.error() {
            warn!(uid = %uid, trade_id = %tracked.trade_id, kind = %tracked.kind, reason, "Trade message delivery failed");
        }
        Some(TrackerUpdate::Delivery {
            uid,
            trade_id: tracked.trade_id.clone(),
            state: tracked.delivery.clone(),
        })
    }

    /// Apply an acknowledgement; the first ack of a message wins
    pub fn on_ack(&mut self, uid: Uid, state: AckState) -> Option<TrackerUpdate> {
        let Some(tracked) = self.messages.get_mut(&uid) else {
            self.parked.entry(uid).or_default().push(Parked::Ack(state));
            return None;
        };
        if tracked.ack != AckState::Pending {
            warn!(uid = %uid, trade_id = %tracked.trade_id, "Duplicate ack ignored");
            return None;
        }
        tracked.ack = state;
        Some(TrackerUpdate::Ack {
            uid,
            trade_id: tracked.trade_id.clone(),
            state: tracked.ack.clone(),
        })
    }

    /// Copy tracked states into the trade's sent message records
    pub fn sync(&self, trade: &mut Trade) -> bool {
        let mut changed = false;
        for sent in trade.process_model.sent_messages.iter_mut() {
            if let Some(tracked) = self.messages.get(&sent.uid) {
                changed |= copy_states(sent, tracked);
            }
        }
        changed
    }

    pub fn get(&self, uid: &Uid) -> Option<&TrackedMessage> {
        self.messages.get(uid)
    }

    pub fn tracked_count(&self) -> usize {
        self.messages.len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    pub fn statistics(&self) -> DeliveryStatistics {
        let mut stats = DeliveryStatistics::default();
        for message in self.messages.values() {
            match message.delivery {
                DeliveryState::Unsent => stats.unsent += 1,
                DeliveryState::StoredInMailbox => stats.stored_in_mailbox += 1,
                DeliveryState::Arrived => stats.arrived += 1,
                DeliveryState::Failed { .. } => stats.failed += 1,
            }
            match message.ack {
                AckState::Pending => {}
                AckState::Acknowledged => stats.acknowledged += 1,
                AckState::Rejected { .. } => stats.rejected += 1,
            }
        }
        stats.total_messages = self.messages.len() as u64;
        stats
    }
}

fn copy_states(sent: &mut SentMessage, tracked: &TrackedMessage) -> bool {
    let changed = sent.delivery != tracked.delivery || sent.ack != tracked.ack;
    sent.delivery = tracked.delivery.clone();
    sent.ack = tracked.ack.clone();
    changed
}

// ----------------------------------------------------------------------------
// Delivery Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStatistics {
    pub total_messages: u64,
    pub unsent: u64,
    pub stored_in_mailbox: u64,
    pub arrived: u64,
    pub failed: u64,
    pub acknowledged: u64,
    pub rejected: u64,
}

impl DeliveryStatistics {
    /// Share of messages that reached the peer or its mailbox
    pub fn success_rate(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            (self.arrived + self.stored_in_mailbox) as f64 / self.total_messages as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_core::testing::fixtures;
    use escrow_core::trade::{DepositScheme, Direction};
    use escrow_core::types::Timestamp;

    fn trade_with_sent() -> (Trade, Uid) {
        let offer = fixtures::offer("d1", Direction::Seller, DepositScheme::Classic);
        let mut trade = fixtures::maker_trade(&offer);
        let uid = Uid::new();
        trade.process_model.sent_messages.push(SentMessage::new(
            uid,
            trade.id.clone(),
            "InputsForDepositTxResponse",
            fixtures::taker_address(),
            Timestamp::new(5),
        ));
        (trade, uid)
    }

    #[test]
    fn test_reports_before_registration_are_applied() {
        let (mut trade, uid) = trade_with_sent();
        let mut tracker = DeliveryTracker::new();

        assert!(tracker.on_delivery(uid, DeliveryOutcome::StoredInMailbox).is_none());
        assert!(tracker.on_ack(uid, AckState::Acknowledged).is_none());
        assert_eq!(tracker.parked_count(), 1);

        let updates = tracker.register(&trade);
        assert_eq!(updates.len(), 2);
        assert_eq!(tracker.parked_count(), 0);

        assert!(tracker.sync(&mut trade));
        let sent = trade.process_model.sent_message(&uid).unwrap();
        assert!(sent.delivery.is_stored_in_mailbox());
        assert_eq!(sent.ack, AckState::Acknowledged);
    }

    #[test]
    fn test_arrived_is_not_downgraded_and_ack_is_independent() {
        let (trade, uid) = trade_with_sent();
        let mut tracker = DeliveryTracker::new();
        tracker.register(&trade);

        assert!(tracker.on_delivery(uid, DeliveryOutcome::Arrived).is_some());
        assert!(tracker.on_delivery(uid, DeliveryOutcome::StoredInMailbox).is_none());
        assert!(tracker
            .on_delivery(uid, DeliveryOutcome::Fault { reason: "late".into() })
            .is_none());

        let update = tracker.on_ack(uid, AckState::from_ack(false, Some("bad".into())));
        assert!(matches!(update, Some(TrackerUpdate::Ack { state: AckState::Rejected { .. }, .. })));
        assert!(tracker.get(&uid).unwrap().delivery.is_arrived());

        let stats = tracker.statistics();
        assert_eq!(stats.arrived, 1);
        assert_eq!(stats.rejected, 1);
        assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
    }
}

//! Trade book: the engine's view of every trade
//!
//! A trade is checked out while a pipeline runs on it. The stored copy stays
//! readable, inbound work for the trade is queued in arrival order, and
//! updates made meanwhile (dispute state, delivery sync) are replayed onto the
//! copy that comes back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use escrow_core::errors::{EscrowError, EscrowResult};
use escrow_core::message::NetworkEnvelope;
use escrow_core::store::TradeStore;
use escrow_core::trade::{DisputeState, Trade};
use escrow_core::types::TradeId;
use tracing::{debug, error};

use crate::protocol::UserAction;

/// Work deferred until the trade is free again
#[derive(Debug, Clone)]
pub enum PendingWork {
    Message(Box<NetworkEnvelope>),
    Action(UserAction),
}

/// Change applied to a trade whether or not it is checked out
#[derive(Debug, Clone, PartialEq)]
pub enum TradeUpdate {
    DisputeState(DisputeState),
    MediationSummary(String),
}

impl TradeUpdate {
    fn apply(&self, trade: &mut Trade) {
        match self {
            TradeUpdate::DisputeState(state) => trade.set_dispute_state(*state),
            TradeUpdate::MediationSummary(summary) => {
                trade.mediation_result_summary = Some(summary.clone())
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    trade: Trade,
    busy: bool,
    pending: VecDeque<PendingWork>,
    replay: Vec<TradeUpdate>,
}

pub struct TradeBook {
    slots: HashMap<TradeId, Slot>,
    store: Arc<dyn TradeStore>,
}

impl TradeBook {
    pub fn new(store: Arc<dyn TradeStore>) -> Self {
        Self {
            slots: HashMap::new(),
            store,
        }
    }

    /// Add a trade; false if the id is already known
    pub fn insert(&mut self, trade: Trade) -> bool {
        if self.slots.contains_key(&trade.id) {
            return false;
        }
        self.slots.insert(
            trade.id.clone(),
            Slot {
                trade,
                busy: false,
                pending: VecDeque::new(),
                replay: Vec::new(),
            },
        );
        true
    }

    /// Read the stored trades, skipping ids already present
    pub fn load(&mut self) -> EscrowResult<Vec<TradeId>> {
        let mut loaded = Vec::new();
        for trade in self.store.load_trades()? {
            let id = trade.id.clone();
            if self.insert(trade) {
                loaded.push(id);
            }
        }
        Ok(loaded)
    }

    pub fn contains(&self, trade_id: &TradeId) -> bool {
        self.slots.contains_key(trade_id)
    }

    /// Last checked-in copy of the trade
    pub fn get(&self, trade_id: &TradeId) -> Option<&Trade> {
        self.slots.get(trade_id).map(|slot| &slot.trade)
    }

    /// Mutable access to an idle trade
    pub fn get_mut(&mut self, trade_id: &TradeId) -> Option<&mut Trade> {
        self.slots
            .get_mut(trade_id)
            .filter(|slot| !slot.busy)
            .map(|slot| &mut slot.trade)
    }

    pub fn is_busy(&self, trade_id: &TradeId) -> bool {
        self.slots.get(trade_id).is_some_and(|slot| slot.busy)
    }

    pub fn busy_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.busy).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<TradeId> {
        let mut ids: Vec<_> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Hand a copy of the trade to a pipeline run and mark it busy
    pub fn checkout(&mut self, trade_id: &TradeId) -> EscrowResult<Trade> {
        let slot = self
            .slots
            .get_mut(trade_id)
            .ok_or_else(|| EscrowError::TradeNotFound {
                trade_id: trade_id.clone(),
            })?;
        if slot.busy {
            return Err(EscrowError::invalid_input(format!(
                "trade {} already has a pipeline running",
                trade_id
            )));
        }
        slot.busy = true;
        Ok(slot.trade.clone())
    }

    /// Store the trade a pipeline handed back, replaying updates made meanwhile
    ///
    /// Returns the previously stored copy.
    pub fn checkin(&mut self, mut trade: Trade) -> EscrowResult<Trade> {
        let slot = self
            .slots
            .get_mut(&trade.id)
            .ok_or_else(|| EscrowError::TradeNotFound {
                trade_id: trade.id.clone(),
            })?;
        for update in slot.replay.drain(..) {
            update.apply(&mut trade);
        }
        slot.busy = false;
        Ok(std::mem::replace(&mut slot.trade, trade))
    }

    /// Apply an update now and again at checkin if the trade is busy
    pub fn update(&mut self, trade_id: &TradeId, update: TradeUpdate) -> bool {
        let Some(slot) = self.slots.get_mut(trade_id) else {
            return false;
        };
        update.apply(&mut slot.trade);
        if slot.busy {
            slot.replay.push(update);
        }
        true
    }

    pub fn enqueue(&mut self, trade_id: &TradeId, work: PendingWork) {
        if let Some(slot) = self.slots.get_mut(trade_id) {
            debug!(trade_id = %trade_id, queued = slot.pending.len() + 1, "Trade busy, work queued");
            slot.pending.push_back(work);
        }
    }

    pub fn pop_pending(&mut self, trade_id: &TradeId) -> Option<PendingWork> {
        self.slots
            .get_mut(trade_id)
            .filter(|slot| !slot.busy)
            .and_then(|slot| slot.pending.pop_front())
    }

    pub fn pending_count(&self, trade_id: &TradeId) -> usize {
        self.slots.get(trade_id).map_or(0, |slot| slot.pending.len())
    }

    /// Write the stored copy of a trade; failures are logged
    pub fn persist(&self, trade_id: &TradeId) {
        let Some(slot) = self.slots.get(trade_id) else {
            return;
        };
        if let Err(e) = self.store.persist_trade(&slot.trade) {
            error!(trade_id = %trade_id, error = %e, "Failed to persist trade");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_core::dispute::SupportType;
    use escrow_core::store::MemoryStore;
    use escrow_core::testing::fixtures;
    use escrow_core::trade::{DepositScheme, Direction, TradeState};

    fn book() -> (TradeBook, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TradeBook::new(store.clone()), store)
    }

    fn trade(id: &str) -> Trade {
        fixtures::maker_trade(&fixtures::offer(id, Direction::Seller, DepositScheme::Classic))
    }

    #[test]
    fn test_checkout_marks_busy_and_checkin_replays_updates() {
        let (mut book, _) = book();
        let id = TradeId::from("t1");
        assert!(book.insert(trade("t1")));
        assert!(!book.insert(trade("t1")));

        let mut running = book.checkout(&id).unwrap();
        assert!(book.is_busy(&id));
        assert!(book.checkout(&id).is_err());
        assert!(book.get_mut(&id).is_none());

        let requested = DisputeState::requested(SupportType::Mediation);
        book.update(&id, TradeUpdate::DisputeState(requested));
        assert_eq!(book.get(&id).unwrap().dispute_state(), requested);

        running.set_state(TradeState::MakerSentInputsForDepositTxResponse).unwrap();
        let previous = book.checkin(running).unwrap();
        assert_eq!(previous.state(), TradeState::Preparation);

        let stored = book.get(&id).unwrap();
        assert_eq!(stored.state(), TradeState::MakerSentInputsForDepositTxResponse);
        assert_eq!(stored.dispute_state(), requested);
        assert_eq!(book.busy_count(), 0);
    }

    #[test]
    fn test_pending_work_waits_for_checkin() {
        let (mut book, _) = book();
        let id = TradeId::from("t2");
        book.insert(trade("t2"));
        let running = book.checkout(&id).unwrap();

        book.enqueue(&id, PendingWork::Action(UserAction::PaymentReceived));
        book.enqueue(&id, PendingWork::Action(UserAction::CompleteTrade));
        assert!(book.pop_pending(&id).is_none());

        book.checkin(running).unwrap();
        assert!(matches!(
            book.pop_pending(&id),
            Some(PendingWork::Action(UserAction::PaymentReceived))
        ));
        assert_eq!(book.pending_count(&id), 1);
    }

    #[test]
    fn test_persist_and_load() {
        let (mut book, store) = book();
        book.insert(trade("t3"));
        book.persist(&TradeId::from("t3"));
        assert_eq!(store.persist_count(), 1);

        let mut restored = TradeBook::new(store);
        assert_eq!(restored.load().unwrap(), vec![TradeId::from("t3")]);
        assert!(restored.load().unwrap().is_empty());
    }
}

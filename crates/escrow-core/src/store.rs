//! Persistence collaborators
//!
//! The engine calls `persist` after every state change it must survive a
//! restart with. The encoding is the store's business; [`MemoryStore`] keeps
//! bincode snapshots in memory so tests and the simulator exercise the same
//! serialize/deserialize path a file-backed store would.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::dispute::DisputeList;
use crate::errors::StoreError;
use crate::trade::Trade;
use crate::types::TradeId;

pub trait TradeStore: Send + Sync {
    fn load_trades(&self) -> Result<Vec<Trade>, StoreError>;
    fn persist_trade(&self, trade: &Trade) -> Result<(), StoreError>;
}

pub trait DisputeStore: Send + Sync {
    fn load_disputes(&self) -> Result<DisputeList, StoreError>;
    fn persist_disputes(&self, disputes: &DisputeList) -> Result<(), StoreError>;
}

/// In-memory store holding bincode snapshots
#[derive(Debug, Default)]
pub struct MemoryStore {
    trades: Mutex<BTreeMap<TradeId, Vec<u8>>>,
    disputes: Mutex<Option<Vec<u8>>>,
    persist_count: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persist calls served so far
    pub fn persist_count(&self) -> u64 {
        *self.persist_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        *self.persist_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}

impl TradeStore for MemoryStore {
    fn load_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.lock().unwrap_or_else(|e| e.into_inner());
        trades
            .values()
            .map(|bytes| bincode::deserialize(bytes).map_err(StoreError::from))
            .collect()
    }

    fn persist_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let bytes = bincode::serialize(trade)?;
        self.trades
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(trade.id.clone(), bytes);
        self.bump();
        Ok(())
    }
}

impl DisputeStore for MemoryStore {
    fn load_disputes(&self) -> Result<DisputeList, StoreError> {
        let disputes = self.disputes.lock().unwrap_or_else(|e| e.into_inner());
        match disputes.as_ref() {
            Some(bytes) => Ok(bincode::deserialize(bytes)?),
            None => Ok(DisputeList::new()),
        }
    }

    fn persist_disputes(&self, disputes: &DisputeList) -> Result<(), StoreError> {
        let bytes = bincode::serialize(disputes)?;
        *self.disputes.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes);
        self.bump();
        Ok(())
    }
}

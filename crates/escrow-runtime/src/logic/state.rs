//! Engine state
//!
//! Everything the engine task owns. Only the engine task touches it; pipeline
//! runs and timers talk back through the internal queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use escrow_core::config::EngineConfig;
use escrow_core::message::NetworkEnvelope;
use escrow_core::services::PriceFeed;
use escrow_core::store::{DisputeStore, TradeStore};
use escrow_core::types::{NodeAddress, PubKeyRing, TradeId, Uid};
use tokio::task::JoinHandle;

use crate::managers::{DeliveryTracker, DisputeManager, TradeBook};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::task::{TaskRegistry, TaskServices};

// ----------------------------------------------------------------------------
// Engine State
// ----------------------------------------------------------------------------

pub struct EngineState {
    pub config: EngineConfig,
    /// Collaborators handed to every pipeline run
    pub services: Arc<TaskServices>,
    pub registry: Arc<TaskRegistry>,
    pub scheduler: Scheduler,
    pub trades: TradeBook,
    pub delivery: DeliveryTracker,
    pub disputes: DisputeManager,
    /// Periodic ready-to-fund requests of taker trades in the reservation
    pub multisig_timers: HashMap<TradeId, TimerHandle>,
    /// Taker fee unlock watchers
    pub fee_watchers: HashMap<TradeId, JoinHandle<()>>,
    /// Set once stores, wallet and price feed are ready
    pub initialized: bool,
    /// Envelopes received before initialization, replayed in arrival order
    pub stashed: Vec<NetworkEnvelope>,
    /// Uids of acks we sent for trade messages, so their delivery reports are dropped
    pub sent_acks: HashSet<Uid>,
    pub stats: EngineStats,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        services: Arc<TaskServices>,
        registry: Arc<TaskRegistry>,
        scheduler: Scheduler,
        trade_store: Arc<dyn TradeStore>,
        dispute_store: Arc<dyn DisputeStore>,
        price_feed: Arc<dyn PriceFeed>,
    ) -> Self {
        let disputes = DisputeManager::new(
            config.dispute.clone(),
            services.keys.pub_key_ring(),
            services.my_address.clone(),
            services.gateway.clone(),
            dispute_store,
            price_feed,
            services.time.clone(),
            scheduler.clone(),
        );
        Self {
            config,
            services,
            registry,
            scheduler,
            trades: TradeBook::new(trade_store),
            delivery: DeliveryTracker::new(),
            disputes,
            multisig_timers: HashMap::new(),
            fee_watchers: HashMap::new(),
            initialized: false,
            stashed: Vec::new(),
            sent_acks: HashSet::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn my_address(&self) -> &NodeAddress {
        &self.services.my_address
    }

    pub fn my_pub_key_ring(&self) -> PubKeyRing {
        self.services.keys.pub_key_ring()
    }

    /// Stop every timer and watcher owned by the engine
    pub fn cancel_background_work(&mut self) {
        for (_, timer) in self.multisig_timers.drain() {
            timer.cancel();
        }
        for (_, watcher) in self.fee_watchers.drain() {
            watcher.abort();
        }
        self.disputes.shutdown();
    }
}

/// Counters of the engine task
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub commands_processed: u64,
    pub events_processed: u64,
    pub internal_events_processed: u64,
    pub app_events_generated: u64,
    pub pipelines_started: u64,
    pub pipelines_completed: u64,
    pub pipelines_failed: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
}

//! Shared harness for the engine integration tests
//!
//! Every node runs a real engine task wired to a [`LoopbackNetwork`] and a
//! shared [`Ledger`]. App events are forwarded into an unbounded queue so a
//! node never drops events while the test is waiting on another one.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use escrow_core::crypto::KeyRing;
use escrow_core::store::{DisputeStore, MemoryStore, TradeStore};
use escrow_core::testing::{fixtures, Ledger, MockWallet, StaticPriceFeed};
use escrow_core::trade::{Phase, Trade, TradeState};
use escrow_core::types::{NodeAddress, TradeId};
use escrow_core::{AppEvent, Command, EngineConfig};
use escrow_runtime::{EngineBuilder, EngineHandle, LoopbackNetwork};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Test Node
// ----------------------------------------------------------------------------

pub struct TestNode {
    pub name: &'static str,
    pub address: NodeAddress,
    pub keys: KeyRing,
    pub handle: EngineHandle,
    pub wallet: Arc<MockWallet>,
    pub store: Arc<MemoryStore>,
    events: mpsc::UnboundedReceiver<AppEvent>,
    /// Every app event received so far, in order
    pub history: Vec<AppEvent>,
}

impl TestNode {
    pub async fn maker(network: &LoopbackNetwork, ledger: &Ledger) -> Self {
        Self::start(
            network,
            ledger,
            "maker",
            fixtures::maker_keys(),
            fixtures::maker_address(),
            Arc::new(MemoryStore::new()),
        )
        .await
    }

    pub async fn taker(network: &LoopbackNetwork, ledger: &Ledger) -> Self {
        Self::start(
            network,
            ledger,
            "taker",
            fixtures::taker_keys(),
            fixtures::taker_address(),
            Arc::new(MemoryStore::new()),
        )
        .await
    }

    pub async fn mediator(network: &LoopbackNetwork, ledger: &Ledger) -> Self {
        Self::start(
            network,
            ledger,
            "mediator",
            fixtures::mediator_keys(),
            fixtures::mediator_address(),
            Arc::new(MemoryStore::new()),
        )
        .await
    }

    /// Start an engine, attach it to the network and initialize its services
    pub async fn start(
        network: &LoopbackNetwork,
        ledger: &Ledger,
        name: &'static str,
        keys: KeyRing,
        address: NodeAddress,
        store: Arc<MemoryStore>,
    ) -> Self {
        let wallet = Arc::new(MockWallet::new(name, keys.clone(), ledger.clone()));
        let config = EngineConfig::testing().with_address(address.clone());
        let mut handle = EngineBuilder::new(keys.clone())
            .with_config(config)
            .with_wallet(wallet.clone())
            .with_price_feed(Arc::new(StaticPriceFeed::with_price(
                fixtures::CURRENCY,
                50_000.0,
            )))
            .with_trade_store(store.clone() as Arc<dyn TradeStore>)
            .with_dispute_store(store.clone() as Arc<dyn DisputeStore>)
            .build_and_start()
            .await
            .expect("engine should start");

        network.attach(
            address.clone(),
            handle.event_sender(),
            handle.subscribe_effects(),
        );

        let mut app_events = handle
            .take_app_event_receiver()
            .expect("app event receiver is taken once");
        let (forward, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = app_events.recv().await {
                if forward.send(event).is_err() {
                    break;
                }
            }
        });

        let node = Self {
            name,
            address,
            keys,
            handle,
            wallet,
            store,
            events,
            history: Vec::new(),
        };
        node.command(Command::AllServicesInitialized).await;
        node
    }

    /// Stop the engine and start a fresh one on the same store
    pub async fn restart(mut self, network: &LoopbackNetwork, ledger: &Ledger) -> Self {
        tokio_test::assert_ok!(self.handle.shutdown().await);
        Self::start(
            network,
            ledger,
            self.name,
            self.keys.clone(),
            self.address.clone(),
            self.store.clone(),
        )
        .await
    }

    pub async fn command(&self, command: Command) {
        tokio_test::assert_ok!(self.handle.send_command(command).await);
    }

    pub async fn add_trade(&mut self, trade: Trade) {
        let trade_id = trade.id.clone();
        self.command(Command::AddTrade(Box::new(trade))).await;
        self.wait_for("trade added", |event| {
            matches!(event, AppEvent::TradeAdded { trade_id: id, .. } if *id == trade_id)
        })
        .await;
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Consume app events until one matches
    pub async fn wait_for<F>(&mut self, what: &str, mut predicate: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let event = match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => panic!("{}: app events closed waiting for {}", self.name, what),
                Err(_) => panic!(
                    "{}: timed out waiting for {}; seen {:#?}",
                    self.name, what, self.history
                ),
            };
            self.history.push(event.clone());
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Like [`wait_for`](Self::wait_for) but satisfied by an event already seen
    pub async fn seen_or_wait<F>(&mut self, what: &str, predicate: F) -> AppEvent
    where
        F: Fn(&AppEvent) -> bool,
    {
        if let Some(event) = self.history.iter().find(|event| predicate(event)) {
            return event.clone();
        }
        self.wait_for(what, predicate).await
    }

    pub async fn wait_pipeline(&mut self, transition: &'static str) {
        self.wait_for(transition, |event| {
            matches!(event, AppEvent::PipelineCompleted { transition: name, .. } if *name == transition)
        })
        .await;
    }

    pub async fn wait_state(&mut self, target: TradeState) {
        self.wait_for(&format!("{:?}", target), |event| {
            matches!(event, AppEvent::TradeStateChanged { state, .. } if *state == target)
        })
        .await;
    }

    pub async fn status(&mut self) -> AppEvent {
        self.command(Command::GetStatus).await;
        self.wait_for("status report", |event| {
            matches!(event, AppEvent::StatusReport { .. })
        })
        .await
    }

    pub fn has_seen(&self, predicate: impl Fn(&AppEvent) -> bool) -> bool {
        self.history.iter().any(predicate)
    }

    /// Phases reported for a trade, in order
    pub fn phases(&self, trade_id: &TradeId) -> Vec<Phase> {
        self.history
            .iter()
            .filter_map(|event| match event {
                AppEvent::TradeStateChanged {
                    trade_id: id,
                    phase,
                    ..
                } if id == trade_id => Some(*phase),
                _ => None,
            })
            .collect()
    }

    pub fn assert_phases_monotonic(&self, trade_id: &TradeId) {
        let phases = self.phases(trade_id);
        assert!(
            phases.windows(2).all(|pair| pair[0] <= pair[1]),
            "{}: phase went backwards: {:?}",
            self.name,
            phases
        );
    }
}

//! Engine Builder API
//!
//! Wires the engine task to its collaborators and hands back channel handles
//! for consumers (CLI, simulator, tests).

use std::sync::Arc;
use std::time::Duration;

use escrow_core::channel::{
    create_app_event_channel, create_command_channel, create_effect_channel,
    create_effect_receiver, create_event_channel, AppEventReceiver, ChannelGateway, Command,
    CommandSender, EffectReceiver, EffectSender, EventSender,
};
use escrow_core::config::EngineConfig;
use escrow_core::crypto::KeyRing;
use escrow_core::errors::{EscrowError, EscrowResult};
use escrow_core::services::{
    AccountAgeWitnessService, AgeLimitedWitnessVerifier, MarketPrice, PriceFeed,
};
use escrow_core::store::{DisputeStore, MemoryStore, TradeStore};
use escrow_core::types::{NodeAddress, SystemTimeSource, TimeSource};
use escrow_core::wallet::TradeWallet;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::logic::{EngineState, EngineTask};
use crate::scheduler::{create_internal_channel, Scheduler};
use crate::task::{TaskRegistry, TaskServices};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Engine Builder
// ----------------------------------------------------------------------------

/// Builder for an engine instance
pub struct EngineBuilder {
    keys: KeyRing,
    config: EngineConfig,
    wallet: Option<Arc<dyn TradeWallet>>,
    price_feed: Option<Arc<dyn PriceFeed>>,
    trade_store: Option<Arc<dyn TradeStore>>,
    dispute_store: Option<Arc<dyn DisputeStore>>,
    time: Option<Arc<dyn TimeSource>>,
    account_age: Option<Arc<dyn AccountAgeWitnessService>>,
    registry: Option<TaskRegistry>,
}

impl EngineBuilder {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            keys,
            config: EngineConfig::default(),
            wallet: None,
            price_feed: None,
            trade_store: None,
            dispute_store: None,
            time: None,
            account_age: None,
            registry: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Wallet the pipelines create, sign and broadcast transactions with (required)
    pub fn with_wallet(mut self, wallet: Arc<dyn TradeWallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn with_price_feed(mut self, price_feed: Arc<dyn PriceFeed>) -> Self {
        self.price_feed = Some(price_feed);
        self
    }

    pub fn with_trade_store(mut self, store: Arc<dyn TradeStore>) -> Self {
        self.trade_store = Some(store);
        self
    }

    pub fn with_dispute_store(mut self, store: Arc<dyn DisputeStore>) -> Self {
        self.dispute_store = Some(store);
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_account_age_service(mut self, service: Arc<dyn AccountAgeWitnessService>) -> Self {
        self.account_age = Some(service);
        self
    }

    /// Replace the standard task registry, e.g. one carrying intercepts
    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the engine and spawn its task
    pub async fn build_and_start(self) -> EscrowResult<EngineHandle> {
        self.config.validate()?;
        let wallet = self
            .wallet
            .ok_or_else(|| EscrowError::configuration("engine needs a wallet"))?;
        let address = self.config.node.address.clone();
        info!(address = %address, "Building escrow engine");

        let channels = self.config.channels.clone();
        let (command_sender, command_receiver) = create_command_channel(&channels);
        let (event_sender, event_receiver) = create_event_channel(&channels);
        let (effect_sender, _effect_receiver) = create_effect_channel(&channels);
        let (app_event_sender, app_event_receiver) = create_app_event_channel(&channels);
        let (internal_sender, internal_receiver) = create_internal_channel();

        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let trade_store = self
            .trade_store
            .unwrap_or_else(|| store.clone() as Arc<dyn TradeStore>);
        let dispute_store = self
            .dispute_store
            .unwrap_or_else(|| store as Arc<dyn DisputeStore>);

        let services = Arc::new(TaskServices {
            keys: self.keys,
            my_address: address.clone(),
            wallet,
            gateway: Arc::new(ChannelGateway::new(effect_sender.clone())),
            account_age: self.account_age.unwrap_or_else(|| {
                Arc::new(AgeLimitedWitnessVerifier::new(
                    self.config.account_age.clone(),
                ))
            }),
            time: self.time.unwrap_or_else(|| Arc::new(SystemTimeSource)),
            filter: self.config.filter.clone(),
            protocol: self.config.protocol.clone(),
        });
        let registry = Arc::new(self.registry.unwrap_or_else(TaskRegistry::standard));
        let price_feed = self.price_feed.unwrap_or_else(|| Arc::new(NoPrices));

        let state = EngineState::new(
            self.config,
            services,
            registry.clone(),
            Scheduler::new(internal_sender),
            trade_store,
            dispute_store,
            price_feed,
        );
        let mut task = EngineTask::new(
            state,
            command_receiver,
            event_receiver,
            internal_receiver,
            app_event_sender,
        );
        let engine_handle = tokio::spawn(async move { task.run().await });

        info!(address = %address, "Escrow engine started");
        Ok(EngineHandle {
            address,
            command_sender,
            event_sender,
            effect_sender,
            app_event_receiver: Some(app_event_receiver),
            registry,
            engine_handle: Some(engine_handle),
            running: true,
        })
    }
}

/// Price feed that never has data
struct NoPrices;

impl PriceFeed for NoPrices {
    fn has_prices(&self) -> bool {
        false
    }

    fn market_price(&self, _currency: &str) -> Option<MarketPrice> {
        None
    }
}

// ----------------------------------------------------------------------------
// Engine Handle
// ----------------------------------------------------------------------------

/// Handle to a running engine
pub struct EngineHandle {
    address: NodeAddress,
    command_sender: CommandSender,
    event_sender: EventSender,
    effect_sender: EffectSender,
    app_event_receiver: Option<AppEventReceiver>,
    registry: Arc<TaskRegistry>,
    engine_handle: Option<JoinHandle<EscrowResult<()>>>,
    running: bool,
}

impl EngineHandle {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn command_sender(&self) -> CommandSender {
        self.command_sender.clone()
    }

    /// Sender a transport feeds inbound messages and delivery reports into
    pub fn event_sender(&self) -> EventSender {
        self.event_sender.clone()
    }

    /// New subscription to the effects the engine publishes
    pub fn subscribe_effects(&self) -> EffectReceiver {
        create_effect_receiver(&self.effect_sender)
    }

    /// Take the app event receiver (can only be called once)
    pub fn take_app_event_receiver(&mut self) -> Option<AppEventReceiver> {
        self.app_event_receiver.take()
    }

    /// Registry shared with every pipeline run; intercepts set here apply at once
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub async fn send_command(&self, command: Command) -> EscrowResult<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| EscrowError::channel("Failed to send command to engine"))
    }

    pub fn is_running(&self) -> bool {
        self.running
            && self
                .engine_handle
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the engine task to stop
    pub async fn wait(&mut self) -> EscrowResult<()> {
        match self.engine_handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(EscrowError::channel(format!("Engine task panicked: {}", e))),
            },
            None => Ok(()),
        }
    }

    /// Stop the engine gracefully, aborting it after a grace period
    pub async fn shutdown(&mut self) -> EscrowResult<()> {
        info!(address = %self.address, "Shutting down escrow engine");
        let _ = self.send_command(Command::Shutdown).await;

        if let Some(mut handle) = self.engine_handle.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(address = %self.address, "Engine did not stop in time, aborting");
                handle.abort();
            }
        }
        self.running = false;
        Ok(())
    }
}

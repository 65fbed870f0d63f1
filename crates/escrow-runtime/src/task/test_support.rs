//! Shared setup for task unit tests

use std::sync::{Arc, Mutex};

use escrow_core::config::EngineConfig;
use escrow_core::crypto::KeyRing;
use escrow_core::errors::TransportError;
use escrow_core::message::{NetworkEnvelope, Payload, TradeMessage};
use escrow_core::services::{AgeLimitedWitnessVerifier, MessagingGateway, TradeStatistics};
use escrow_core::testing::{fixtures, Ledger, MockTimeSource, MockWallet};
use escrow_core::trade::{DepositScheme, Direction, Trade};
use escrow_core::types::{NodeAddress, PubKeyRing, Timestamp};
use escrow_core::wallet::TradeWallet;

use super::{TaskContext, TaskServices};

/// Gateway keeping every envelope it was handed
#[derive(Default)]
pub(crate) struct RecordingGateway {
    pub sent: Mutex<Vec<(NodeAddress, NetworkEnvelope)>>,
    pub statistics: Mutex<Vec<TradeStatistics>>,
}

impl RecordingGateway {
    pub fn trade_messages(&self) -> Vec<TradeMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, envelope)| match &envelope.payload {
                Payload::Trade(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_trade_message(&self) -> Option<TradeMessage> {
        self.trade_messages().pop()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl MessagingGateway for RecordingGateway {
    fn send_mailbox(
        &self,
        recipient: &NodeAddress,
        _recipient_key: &PubKeyRing,
        envelope: NetworkEnvelope,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((recipient.clone(), envelope));
        Ok(())
    }

    fn publish_trade_statistics(&self, statistics: TradeStatistics) -> Result<(), TransportError> {
        self.statistics.lock().unwrap().push(statistics);
        Ok(())
    }
}

pub(crate) fn services_for(
    keys: KeyRing,
    address: NodeAddress,
    wallet: Arc<dyn TradeWallet>,
) -> (Arc<TaskServices>, Arc<RecordingGateway>) {
    let config = EngineConfig::testing();
    let gateway = Arc::new(RecordingGateway::default());
    let services = Arc::new(TaskServices {
        keys,
        my_address: address,
        wallet,
        gateway: gateway.clone(),
        account_age: Arc::new(AgeLimitedWitnessVerifier::new(config.account_age)),
        time: Arc::new(MockTimeSource::new(Timestamp::new(1_000))),
        filter: config.filter,
        protocol: config.protocol,
    });
    (services, gateway)
}

pub(crate) fn maker_services() -> (Arc<TaskServices>, Arc<RecordingGateway>) {
    let wallet = MockWallet::new("maker", fixtures::maker_keys(), Ledger::new());
    services_for(fixtures::maker_keys(), fixtures::maker_address(), Arc::new(wallet))
}

/// Seller-maker trade "abc123" on a classic offer
pub(crate) fn context(services: Arc<TaskServices>) -> TaskContext {
    let offer = fixtures::offer("abc123", Direction::Seller, DepositScheme::Classic);
    TaskContext::new(fixtures::maker_trade(&offer), services)
}

/// Context for an arbitrary trade with a wallet on the given ledger
pub(crate) fn context_with(
    trade: Trade,
    keys: KeyRing,
    address: NodeAddress,
    name: &str,
    ledger: &Ledger,
) -> (TaskContext, Arc<RecordingGateway>, MockWallet) {
    let wallet = MockWallet::new(name, keys.clone(), ledger.clone());
    let (services, gateway) = services_for(keys, address, Arc::new(wallet.clone()));
    (TaskContext::new(trade, services), gateway, wallet)
}

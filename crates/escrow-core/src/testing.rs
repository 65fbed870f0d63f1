//! Test doubles for the engine's collaborators
//!
//! Enabled for unit tests and, through the `testing` feature, for the
//! runtime's integration tests and the CLI simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::crypto::KeyRing;
use crate::errors::WalletError;
use crate::services::{MarketPrice, PriceFeed};
use crate::types::{Coin, TimeSource, Timestamp, TradeId, TxId};
use crate::wallet::{BalanceUpdate, RawTx, TradeWallet, TxKind, TxRequest, TxSignature, WalletTx};

// ----------------------------------------------------------------------------
// Ledger
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LedgerEntry {
    kind: TxKind,
    amount: Coin,
    /// Inclusion height; negative for transactions older than the simulation
    height: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    height: u64,
    entries: HashMap<TxId, LedgerEntry>,
    broadcasts: Vec<(TxId, TxKind)>,
}

/// Shared in-memory chain all mock wallets of a simulation publish to
#[derive(Debug, Clone)]
pub struct Ledger {
    state: Arc<Mutex<LedgerState>>,
    balance_events: broadcast::Sender<BalanceUpdate>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        let (balance_events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            balance_events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn height(&self) -> u64 {
        self.lock().height
    }

    /// Insert a transaction published outside the simulation, e.g. a maker fee
    pub fn insert_confirmed(&self, tx_id: TxId, kind: TxKind, amount: Coin, confirmations: u64) {
        let mut state = self.lock();
        let height = state.height as i64 - confirmations as i64;
        state.entries.insert(
            tx_id,
            LedgerEntry {
                kind,
                amount,
                height,
            },
        );
    }

    /// Advance the chain and notify balance listeners once per block
    pub fn mine_blocks(&self, blocks: u64) {
        for _ in 0..blocks {
            let height = {
                let mut state = self.lock();
                state.height += 1;
                state.height
            };
            let _ = self.balance_events.send(BalanceUpdate { height });
        }
    }

    /// Number of successful broadcasts of the given kind
    pub fn broadcast_count(&self, kind: TxKind) -> usize {
        self.lock()
            .broadcasts
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.lock().entries.contains_key(tx_id)
    }

    fn publish(&self, tx: &RawTx) -> TxId {
        let tx_id = tx.tx_id();
        let mut state = self.lock();
        if state.entries.contains_key(&tx_id) {
            return tx_id;
        }
        let height = state.height as i64;
        state.entries.insert(
            tx_id.clone(),
            LedgerEntry {
                kind: tx.kind,
                amount: tx.total_output(),
                height,
            },
        );
        state.broadcasts.push((tx_id.clone(), tx.kind));
        tx_id
    }

    fn lookup(&self, tx_id: &TxId) -> Option<WalletTx> {
        let state = self.lock();
        state.entries.get(tx_id).map(|entry| WalletTx {
            tx_id: tx_id.clone(),
            kind: entry.kind,
            amount: entry.amount,
            confirmations: (state.height as i64 - entry.height).max(0) as u32,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BalanceUpdate> {
        self.balance_events.subscribe()
    }
}

// ----------------------------------------------------------------------------
// Mock Wallet
// ----------------------------------------------------------------------------

/// Wallet signing with a [`KeyRing`] and publishing to a shared [`Ledger`]
#[derive(Debug, Clone)]
pub struct MockWallet {
    name: String,
    keys: KeyRing,
    ledger: Ledger,
    fail_broadcasts: Arc<AtomicBool>,
}

impl MockWallet {
    pub fn new(name: impl Into<String>, keys: KeyRing, ledger: Ledger) -> Self {
        Self {
            name: name.into(),
            keys,
            ledger,
            fail_broadcasts: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Make every following broadcast fail
    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TradeWallet for MockWallet {
    async fn create_transaction(&self, request: TxRequest) -> Result<RawTx, WalletError> {
        if request.outputs.is_empty() {
            return Err(WalletError::SigningFailed {
                reason: "transaction without outputs".to_string(),
            });
        }
        Ok(RawTx::from_request(request))
    }

    async fn sign_transaction(&self, mut tx: RawTx) -> Result<RawTx, WalletError> {
        let signer = self.keys.pub_key_ring();
        if !tx.is_signed_by(&signer) {
            let signature = self.keys.sign(&tx.sighash());
            tx.signatures.push(TxSignature { signer, signature });
        }
        Ok(tx)
    }

    async fn broadcast_transaction(&self, tx: &RawTx) -> Result<TxId, WalletError> {
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(WalletError::BroadcastFailed {
                reason: "broadcast disabled".to_string(),
            });
        }
        if !tx.is_fully_signed() {
            return Err(WalletError::BroadcastFailed {
                reason: format!(
                    "{:?} tx has {} of {} signatures",
                    tx.kind,
                    tx.valid_signature_count(),
                    tx.kind.required_signatures()
                ),
            });
        }
        Ok(self.ledger.publish(tx))
    }

    async fn get_transaction(&self, tx_id: &TxId) -> Result<Option<WalletTx>, WalletError> {
        Ok(self.ledger.lookup(tx_id))
    }

    async fn prepare_multisig(&self, trade_id: &TradeId) -> Result<String, WalletError> {
        Ok(format!("multisig:{}:{}", trade_id, self.keys.pub_key_ring()))
    }

    fn address_for(&self, trade_id: &TradeId) -> String {
        format!("{}-{}", self.name, trade_id)
    }

    fn subscribe_balance_changes(&self) -> broadcast::Receiver<BalanceUpdate> {
        self.ledger.subscribe()
    }
}

// ----------------------------------------------------------------------------
// Price Feed and Time
// ----------------------------------------------------------------------------

/// Price feed with manually set prices
#[derive(Debug, Default)]
pub struct StaticPriceFeed {
    prices: Mutex<HashMap<String, MarketPrice>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(currency: &str, price: f64) -> Self {
        let feed = Self::new();
        feed.set_price(currency, price);
        feed
    }

    pub fn set_price(&self, currency: &str, price: f64) {
        self.prices.lock().unwrap_or_else(|e| e.into_inner()).insert(
            currency.to_string(),
            MarketPrice {
                currency: currency.to_string(),
                price,
                is_recent_external_price_available: true,
            },
        );
    }

    pub fn clear(&self) {
        self.prices.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl PriceFeed for StaticPriceFeed {
    fn has_prices(&self) -> bool {
        !self
            .prices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    fn market_price(&self, currency: &str) -> Option<MarketPrice> {
        self.prices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(currency)
            .cloned()
    }
}

/// Controllable clock
#[derive(Debug, Clone, Default)]
pub struct MockTimeSource {
    millis: Arc<AtomicU64>,
}

impl MockTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub mod fixtures {
    use super::*;
    use crate::trade::{
        AgentInfo, Contract, ContractParty, DepositScheme, Direction, Offer, PaymentAccount, Trade,
    };
    use crate::types::{NodeAddress, Price, COIN, FIAT_SCALE};

    pub const PAYMENT_METHOD: &str = "SEPA";
    pub const CURRENCY: &str = "EUR";

    pub fn maker_keys() -> KeyRing {
        KeyRing::from_seed([1; 32])
    }

    pub fn taker_keys() -> KeyRing {
        KeyRing::from_seed([2; 32])
    }

    pub fn mediator_keys() -> KeyRing {
        KeyRing::from_seed([3; 32])
    }

    pub fn refund_agent_keys() -> KeyRing {
        KeyRing::from_seed([4; 32])
    }

    pub fn maker_address() -> NodeAddress {
        NodeAddress::new("maker.onion", 9999)
    }

    pub fn taker_address() -> NodeAddress {
        NodeAddress::new("taker.onion", 9999)
    }

    pub fn mediator_address() -> NodeAddress {
        NodeAddress::new("mediator.onion", 9999)
    }

    pub fn refund_agent_address() -> NodeAddress {
        NodeAddress::new("refund.onion", 9999)
    }

    pub fn payment_account(holder: &str) -> PaymentAccount {
        PaymentAccount::new(PAYMENT_METHOD, format!("DE89-{}", holder), holder)
    }

    pub fn maker_fee_tx_id(trade_id: &TradeId) -> TxId {
        TxId::new(format!("maker-fee-{}", trade_id))
    }

    /// 0.1 BTC at 50 000 EUR with 0.015 BTC security deposits
    pub fn offer(id: &str, maker_direction: Direction, scheme: DepositScheme) -> Offer {
        let id = TradeId::from(id);
        Offer {
            maker_fee_tx_id: maker_fee_tx_id(&id),
            id,
            maker_address: maker_address(),
            maker_pub_key_ring: maker_keys().pub_key_ring(),
            direction: maker_direction,
            amount: Coin::from_sat(COIN / 10),
            price: Price::new(CURRENCY, 50_000 * FIAT_SCALE),
            use_market_based_price: false,
            market_price_margin: 0.0,
            payment_method: PAYMENT_METHOD.to_string(),
            buyer_security_deposit: Coin::from_sat(1_500_000),
            seller_security_deposit: Coin::from_sat(1_500_000),
            maker_fee: Coin::from_sat(10_000),
            taker_fee: Coin::from_sat(30_000),
            tx_fee: Coin::from_sat(2_000),
            fee_address: "fee-collector".to_string(),
            deposit_scheme: scheme,
            mediator: AgentInfo {
                node_address: mediator_address(),
                pub_key_ring: mediator_keys().pub_key_ring(),
            },
            refund_agent: AgentInfo {
                node_address: refund_agent_address(),
                pub_key_ring: refund_agent_keys().pub_key_ring(),
            },
            date: Timestamp::new(1_000),
        }
    }

    /// Record the maker fee of the offer as confirmed on the ledger
    pub fn publish_maker_fee(ledger: &Ledger, offer: &Offer) {
        ledger.insert_confirmed(
            offer.maker_fee_tx_id.clone(),
            TxKind::TakerFee,
            offer.maker_fee,
            6,
        );
    }

    pub fn maker_trade(offer: &Offer) -> Trade {
        Trade::new_maker(offer.clone(), payment_account("maker"), offer.date)
    }

    pub fn taker_trade(offer: &Offer) -> Trade {
        Trade::new_taker(offer.clone(), offer.amount, payment_account("taker"), offer.date)
    }

    /// Contract both parties would have signed for the offer
    pub fn contract(offer: &Offer) -> Contract {
        let maker = ContractParty {
            node_address: maker_address(),
            pub_key_ring: maker_keys().pub_key_ring(),
            payment_account: payment_account("maker"),
            payout_address: "maker-payout".to_string(),
        };
        let taker = ContractParty {
            node_address: taker_address(),
            pub_key_ring: taker_keys().pub_key_ring(),
            payment_account: payment_account("taker"),
            payout_address: "taker-payout".to_string(),
        };
        let maker_is_buyer = offer.direction == Direction::Buyer;
        let (buyer, seller) = if maker_is_buyer {
            (maker, taker)
        } else {
            (taker, maker)
        };
        Contract {
            offer: offer.clone(),
            trade_amount: offer.amount,
            trade_price: offer.price.clone(),
            taker_fee_tx_id: Some(TxId::new(format!("taker-fee-{}", offer.id))),
            maker_is_buyer,
            buyer,
            seller,
            mediator: offer.mediator.clone(),
            refund_agent: offer.refund_agent.clone(),
            lock_time: 2880,
        }
    }

    /// Maker trade past the deposit with peer and contract filled in
    pub fn funded_maker_trade(offer: &Offer) -> Trade {
        let mut trade = maker_trade(offer);
        trade.contract = Some(contract(offer));
        trade.process_model.peer.node_address = Some(taker_address());
        trade.process_model.peer.pub_key_ring = Some(taker_keys().pub_key_ring());
        trade.deposit_tx_id = Some(TxId::new(format!("deposit-{}", offer.id)));
        trade
    }

    /// Taker counterpart of [`funded_maker_trade`]
    pub fn funded_taker_trade(offer: &Offer) -> Trade {
        let mut trade = taker_trade(offer);
        trade.contract = Some(contract(offer));
        trade.deposit_tx_id = Some(TxId::new(format!("deposit-{}", offer.id)));
        trade
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::wallet::TxOutput;

    fn request(kind: TxKind) -> TxRequest {
        TxRequest {
            kind,
            trade_id: TradeId::from("t"),
            inputs: vec![],
            outputs: vec![TxOutput {
                address: "x".into(),
                amount: Coin::from_sat(5),
            }],
            lock_time: 0,
        }
    }

    #[tokio::test]
    async fn test_broadcast_requires_all_signatures() {
        let ledger = Ledger::new();
        let maker = MockWallet::new("maker", maker_keys(), ledger.clone());
        let taker = MockWallet::new("taker", taker_keys(), ledger.clone());

        let tx = maker.create_transaction(request(TxKind::Deposit)).await.unwrap();
        let tx = maker.sign_transaction(tx).await.unwrap();
        assert!(maker.broadcast_transaction(&tx).await.is_err());

        let tx = taker.sign_transaction(tx).await.unwrap();
        let id = maker.broadcast_transaction(&tx).await.unwrap();
        // Re-broadcast is not counted twice
        taker.broadcast_transaction(&tx).await.unwrap();
        assert_eq!(ledger.broadcast_count(TxKind::Deposit), 1);
        assert!(ledger.contains(&id));
    }

    #[tokio::test]
    async fn test_confirmations_follow_mined_blocks() {
        let ledger = Ledger::new();
        let wallet = MockWallet::new("taker", taker_keys(), ledger.clone());
        let mut updates = wallet.subscribe_balance_changes();

        let tx = wallet.create_transaction(request(TxKind::TakerFee)).await.unwrap();
        let tx = wallet.sign_transaction(tx).await.unwrap();
        let id = wallet.broadcast_transaction(&tx).await.unwrap();
        assert_eq!(wallet.get_transaction(&id).await.unwrap().unwrap().confirmations, 0);

        ledger.mine_blocks(2);
        assert_eq!(updates.recv().await.unwrap().height, 1);
        let found = wallet.get_transaction(&id).await.unwrap().unwrap();
        assert!(found.is_unlocked(2));
    }

    #[test]
    fn test_failing_broadcasts() {
        let ledger = Ledger::new();
        let wallet = MockWallet::new("taker", taker_keys(), ledger.clone());
        wallet.set_fail_broadcasts(true);

        let result = tokio_test::block_on(async {
            let tx = wallet.create_transaction(request(TxKind::TakerFee)).await?;
            let tx = wallet.sign_transaction(tx).await?;
            wallet.broadcast_transaction(&tx).await
        });
        assert!(matches!(result, Err(WalletError::BroadcastFailed { .. })));
        assert_eq!(ledger.broadcast_count(TxKind::TakerFee), 0);
    }

    #[test]
    fn test_price_feed_and_clock() {
        let feed = StaticPriceFeed::new();
        assert!(!feed.has_prices());
        feed.set_price(CURRENCY, 60_000.0);
        assert!(feed.has_prices());
        assert!(feed.price(CURRENCY).is_some());

        let clock = MockTimeSource::new(Timestamp::new(10));
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Timestamp::new(15));
    }
}

//! Escrow Trade Protocol Core
//!
//! Stable API crate for the two-party escrow trade engine: identifiers and
//! amounts, the trade and dispute models, the wire messages, the channel
//! protocol between the engine task and its surroundings, and the traits of
//! the collaborators the engine consumes (wallet, messaging gateway, price
//! feed, stores).

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod dispute;
pub mod errors;
pub mod message;
pub mod services;
pub mod store;
pub mod trade;
pub mod types;
pub mod wallet;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{AppEvent, ChannelConfig, ChannelGateway, Command, Effect, Event};
pub use config::{
    AccountAgeConfig, DisputeConfig, EngineConfig, FilterConfig, NodeConfig, ProtocolConfig,
};
pub use crypto::KeyRing;
pub use delivery::{AckState, DeliveryOutcome, DeliveryState, SentMessage};
pub use dispute::{
    ChatMessage, Dispute, DisputeKey, DisputeLifecycle, DisputeList, DisputeReason, DisputeResult,
    OptionTradeAnalysis, SupportType, Winner,
};
pub use errors::{
    DisputeError, EscrowError, EscrowResult, StoreError, TaskError, TradeError, TransportError,
    WalletError,
};
pub use message::{AckMessage, AckSource, NetworkEnvelope, Payload, SupportMessage, TradeMessage};
pub use services::{
    AccountAgeWitnessService, AgeLimitedWitnessVerifier, MarketPrice, MessagingGateway, PriceFeed,
    TradeStatistics,
};
pub use store::{DisputeStore, MemoryStore, TradeStore};
pub use trade::{
    Contract, DepositScheme, Direction, DisputeState, Offer, Phase, Position, ProcessModel, Trade,
    TradeRole, TradeState,
};
pub use types::{
    Coin, NodeAddress, Price, PubKeyRing, SystemTimeSource, TimeSource, Timestamp, TradeId,
    TraderId, TxId, Uid,
};
pub use wallet::{RawTx, TradeWallet, TxKind};

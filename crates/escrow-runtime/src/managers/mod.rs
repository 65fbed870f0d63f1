//! State owned by the engine task: trades, delivery tracking and disputes

pub mod delivery;
pub mod dispute;
pub mod trade;

pub use delivery::{DeliveryStatistics, DeliveryTracker, TrackedMessage, TrackerUpdate};
pub use dispute::{DisputeManager, DisputeOutput};
pub use trade::{PendingWork, TradeBook, TradeUpdate};

//! Engine logic
//!
//! The engine is a single task that owns all trade and dispute state:
//! - `state`: the owned state and counters
//! - `handlers`: command, event and internal event handlers
//! - `task`: the select loop feeding the handlers
//!
//! Pipelines run on their own tokio tasks against a checked-out copy of the
//! trade. The engine never waits on them; a finished run re-enters the loop as
//! an internal event. Work arriving for a trade with a running pipeline is
//! queued and replayed in arrival order once the trade is checked back in.

pub mod handlers;
pub mod state;
pub mod task;

pub use handlers::Handlers;
pub use state::{EngineState, EngineStats};
pub use task::EngineTask;

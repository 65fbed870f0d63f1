//! Escrow Trade Protocol Engine
//!
//! This crate runs the two-party escrow trade protocol:
//! - `EngineTask`: the single task owning every trade and dispute
//! - task pipelines and the runner executing them
//! - per-role protocols mapping messages and actions to pipelines
//! - delivery tracking and the dispute manager
//! - `LoopbackNetwork`: an in-process transport for simulations and tests
//!
//! `escrow-core` holds the stable data model and channel protocol; this crate
//! is the engine behind it.

pub mod builder;
pub mod internal;
pub mod logic;
pub mod loopback;
pub mod managers;
pub mod protocol;
pub mod scheduler;
pub mod task;

pub use builder::{EngineBuilder, EngineHandle};
pub use logic::{EngineState, EngineStats, EngineTask};
pub use loopback::{LoopbackNetwork, LoopbackStatistics};
pub use managers::*;
pub use protocol::{Dispatch, FollowUp, Protocol, Transition, UserAction};
pub use task::{Intercept, PipelineFault, RunOutcome, TaskKind, TaskRegistry, TaskRunner};

// Re-export core types for convenience
pub use escrow_core::{
    channel::{
        create_app_event_channel, create_command_channel, create_effect_channel,
        create_effect_receiver, create_event_channel, AppEventReceiver, AppEventSender,
        ChannelError, CommandReceiver, CommandSender, EffectReceiver, EffectSender,
        EventReceiver, EventSender, NonBlockingSend,
    },
    AppEvent, Command, Effect, EngineConfig, EscrowError, EscrowResult, Event,
};

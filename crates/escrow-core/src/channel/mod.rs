//! Channel Module
//!
//! CSP channel infrastructure between the engine task and its surroundings:
//! - `communication`: commands, events, effects and app events
//! - `utils`: channel aliases, constructors and the effect-backed gateway

pub mod communication;
pub mod utils;

pub use communication::{AppEvent, Command, Effect, Event};

pub use crate::config::ChannelConfig;

pub use utils::{
    create_app_event_channel, create_command_channel, create_effect_channel,
    create_effect_receiver, create_event_channel, AppEventReceiver, AppEventSender,
    ChannelError, ChannelGateway, CommandReceiver, CommandSender, EffectReceiver, EffectSender,
    EventReceiver, EventSender, NonBlockingSend,
};

//! Push of readings, state updates and mode changes to subscribers.

pub mod event;
pub mod hub;

pub use event::{BroadcastEvent, EventKind, InboundMessage};
pub use hub::{BroadcastError, BroadcastHub, BroadcastOutcome, SubscriberId, Subscription};

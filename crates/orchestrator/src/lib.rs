//! The conversation orchestrator.
//!
//! Owns all writes to the event and attachment stores, enforces the turn
//! state machine, fans events out to subscribers, and sweeps stalled
//! conversations. Everything above it (WebSocket/REST/MCP surfaces, the
//! agent host) goes through [`Orchestrator`].

pub mod hub;
pub mod locks;
pub mod orchestrator;
pub mod watchdog;

pub use hub::{FirehoseSubscription, Subscription, SubscriptionHub};
pub use locks::ConversationLocks;
pub use orchestrator::{new_call_id, Orchestrator};
pub use watchdog::{Watchdog, WatchdogHandle};

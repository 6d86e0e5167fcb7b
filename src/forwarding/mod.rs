//! Port Forwarding Module
//!
//! Named TCP forwarding rules: each rule binds a local port and relays
//! every accepted connection to a remote host:port, with live traffic
//! statistics and runtime add/edit/delete/start/stop.

mod error;
mod events;
mod forwarder;
pub mod manager;
mod pipe;
pub mod registry;
mod rule;
mod stats;
#[cfg(test)]
pub(crate) mod testing;

pub use error::ForwardError;
pub use events::{ForwardEvent, ForwardEventEmitter};
pub use forwarder::Forwarder;
pub use manager::ForwardingManager;
pub use pipe::{pipe, Direction};
pub use registry::{RuleRegistry, RuleStore};
pub use rule::{format_bytes, format_last_active, ForwardRule, ForwardStatus, RuleSnapshot, RuleSpec};
pub use stats::{ForwardStats, TrafficCounters};

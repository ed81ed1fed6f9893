//! Controller-side registry and topology broadcast
//!
//! The registry accepts edge control connections, authenticates them against
//! the namespace store, hands each edge its topology snapshot and keeps the
//! session alive; the broadcaster watches the edge/route stores and pushes
//! deltas to every affected live session.

mod broadcast;
mod registry;

pub use broadcast::TopologyBroadcaster;
pub use registry::{
    LogStatSink, RegistryConfig, RegistryServer, Session, SessionTable, StatSink,
};

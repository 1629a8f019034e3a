//! Realtime notification hub: connection manager, wire protocol, and the
//! channel subscription registry.

/// Connection manager and background worker.
pub mod client;
/// Hub wire protocol types.
pub mod proto;
/// Channel subscription registry and rebindable subscriptions.
pub mod registry;

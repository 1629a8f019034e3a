//! Session transport and realtime notification client for the EIMS invoice
//! platform.
//!
//! The crate is organized around the two transports and the state they share:
//! - `api`: authenticated HTTP transport with a single-flight token refresh.
//! - `hub`: realtime notification hub client and subscription registry.
//! - `session`: session lifecycle, login/logout, forced termination.
//! - `credentials`: token pair store read by both transports.
//! - `events`: typed session event bus observed by application code.

/// Authenticated HTTP transport and error taxonomy.
pub mod api;
/// Hub reconnect scheduling.
pub mod backoff;
/// Unverified JWT payload inspection.
pub mod claims;
/// Endpoints, timeouts, and session configuration.
pub mod config;
/// Token pair store and persistent storage backends.
pub mod credentials;
/// Typed session event bus.
pub mod events;
/// Realtime notification hub client and subscription registry.
pub mod hub;
/// Session lifecycle and login/logout flows.
pub mod session;

mod refresh;

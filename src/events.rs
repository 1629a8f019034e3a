//! Typed session event bus.
//!
//! Session-wide signals (token expiry, forced logout, hub lifecycle) are
//! published here instead of through ambient global dispatch, so publishers
//! and subscribers never reference each other directly.

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Process-wide session signals observable by application code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// A request observed a 401 and the refresh protocol is starting.
    TokenExpired,
    /// The refresh call itself failed; forced termination follows.
    RefreshFailed { reason: String },
    /// The session was terminated; emitted exactly once per termination.
    ForcedLogout { reason: String },
    /// The hub connection was re-established; dependent views should resync.
    HubReconnected,
    /// The hub connection dropped or was stopped.
    HubDisconnected,
}

/// Cloneable broadcast bus for [`SessionEvent`]s.
#[derive(Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Opens a new receiver; each receiver observes every event sent after
    /// this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // A send with no live receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

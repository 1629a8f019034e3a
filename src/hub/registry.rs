//! Channel subscription registry.
//!
//! Each subscription registers one stable wrapper slot with its channel. The
//! slot indirects to the current logical handler through a mutable cell, so
//! callers whose handler identity changes frequently can rebind in place
//! without touching the channel registration.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::warn;

use crate::hub::proto::{HubChannel, HubEvent};

type HandlerFn = Box<dyn Fn(&HubEvent) + Send + Sync>;
type HandlerCell = RwLock<HandlerFn>;

struct HandlerSlot {
    id: u64,
    cell: Arc<HandlerCell>,
}

#[derive(Default)]
struct RegistryInner {
    channels: RwLock<HashMap<HubChannel, Vec<HandlerSlot>>>,
    next_id: AtomicU64,
}

/// Fan-out registry from hub channels to independent subscribers.
#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<RegistryInner>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` on `channel`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped; other subscribers on the same channel are unaffected either
    /// way.
    pub fn subscribe<F>(&self, channel: HubChannel, handler: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cell: Arc<HandlerCell> = Arc::new(RwLock::new(Box::new(handler)));

        let mut channels = write_guard(&self.inner.channels);
        channels.entry(channel).or_default().push(HandlerSlot {
            id,
            cell: Arc::clone(&cell),
        });
        drop(channels);

        Subscription {
            registry: Arc::downgrade(&self.inner),
            channel,
            id,
            cell,
        }
    }

    /// Number of live registrations on a channel.
    pub fn subscriber_count(&self, channel: HubChannel) -> usize {
        read_guard(&self.inner.channels)
            .get(&channel)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    /// Delivers an event to every subscriber of its channel.
    ///
    /// The slot list is snapshotted first, so handlers may subscribe or
    /// unsubscribe reentrantly. A panicking handler is contained and logged;
    /// the remaining subscribers still receive the event.
    pub fn dispatch(&self, event: &HubEvent) {
        let cells: Vec<Arc<HandlerCell>> = {
            let channels = read_guard(&self.inner.channels);
            channels
                .get(&event.channel())
                .map(|slots| slots.iter().map(|slot| Arc::clone(&slot.cell)).collect())
                .unwrap_or_default()
        };

        for cell in cells {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let handler = cell.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                handler(event);
            }));
            if outcome.is_err() {
                warn!(event = "hub_subscriber_panicked", channel = %event.channel());
            }
        }
    }
}

/// One registration on one channel.
///
/// Dropping the subscription removes exactly this registration.
pub struct Subscription {
    registry: Weak<RegistryInner>,
    channel: HubChannel,
    id: u64,
    cell: Arc<HandlerCell>,
}

impl Subscription {
    pub fn channel(&self) -> HubChannel {
        self.channel
    }

    /// Swaps the logical handler without re-registering with the channel.
    ///
    /// The channel keeps dispatching through the same stable slot; only the
    /// cell contents change.
    pub fn rebind<F>(&self, handler: F)
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        let mut cell = self.cell.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *cell = Box::new(handler);
    }

    /// Removes this registration. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut channels = write_guard(&inner.channels);
        if let Some(slots) = channels.get_mut(&self.channel) {
            slots.retain(|slot| slot.id != self.id);
        }
    }
}

fn read_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! Link-state and address-change subscriber sets.
//!
//! Fixed slot arrays: subscribing takes the first empty slot, unsubscribing
//! clears the exact slot, and slots are never compacted. Dispatch copies the
//! callbacks out first so none runs under the registry lock.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{NetError, Result};
use crate::net::address::Interface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
}

pub type LinkCallback = dyn Fn(Interface, LinkEvent) + Send + Sync;

/// `None` when the address was removed.
pub type AddressCallback = dyn Fn(Interface, Option<Ipv4Addr>) + Send + Sync;

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle returned by `subscribe`; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscribers<F: ?Sized> {
    name: &'static str,
    slots: Mutex<Vec<Option<(SubscriptionId, Arc<F>)>>>,
}

impl<F: ?Sized> Subscribers<F> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, callback: Arc<F>) -> Result<SubscriptionId> {
        let mut slots = self.lock();
        let capacity = slots.len();
        let slot = slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(NetError::CapacityExceeded {
                registry: self.name,
                capacity,
            })?;
        let id = SubscriptionId(SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed));
        *slot = Some((id, callback));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut slots = self.lock();
        match slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|(sid, _)| *sid == id))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Current callbacks in slot order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.lock()
            .iter()
            .flatten()
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<(SubscriptionId, Arc<F>)>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Subscribers<LinkCallback> {
    pub fn dispatch(&self, interface: Interface, event: LinkEvent) {
        for callback in self.snapshot() {
            callback(interface, event);
        }
    }
}

impl Subscribers<AddressCallback> {
    pub fn dispatch(&self, interface: Interface, address: Option<Ipv4Addr>) {
        for callback in self.snapshot() {
            callback(interface, address);
        }
    }
}

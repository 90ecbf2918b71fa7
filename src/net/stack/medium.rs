//! The shared link every stack attaches to.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::StackInner;

/// Address → stack map shared by every device on one network.
///
/// Entries are weak so a dropped stack disappears from the medium without
/// explicit cleanup.
#[derive(Clone, Default)]
pub struct Medium {
    stations: Arc<DashMap<Ipv4Addr, Weak<StackInner>>>,
}

impl Medium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live stack answers for `address`.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.lookup(address).is_some()
    }

    /// Number of attached stacks.
    pub fn station_count(&self) -> usize {
        self.stations
            .iter()
            .filter(|e| e.value().strong_count() > 0)
            .count()
    }

    pub(crate) fn attach(&self, address: Ipv4Addr, stack: &Arc<StackInner>) {
        self.stations.insert(address, Arc::downgrade(stack));
    }

    pub(crate) fn detach(&self, address: Ipv4Addr, stack: &Arc<StackInner>) {
        self.stations
            .remove_if(&address, |_, weak| Weak::as_ptr(weak) == Arc::as_ptr(stack));
    }

    pub(crate) fn lookup(&self, address: Ipv4Addr) -> Option<Arc<StackInner>> {
        let stack = self.stations.get(&address)?.value().upgrade()?;
        if stack.deleted.load(Ordering::SeqCst) {
            return None;
        }
        Some(stack)
    }

    pub(crate) fn members(&self) -> Vec<Arc<StackInner>> {
        self.stations
            .iter()
            .filter_map(|e| e.value().upgrade())
            .filter(|s| !s.deleted.load(Ordering::SeqCst))
            .collect()
    }
}

impl std::fmt::Debug for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Medium")
            .field("stations", &self.station_count())
            .finish()
    }
}

//! Process-wide table from host slot to the host receiving that instance's
//! calls.
//!
//! This is the only state shared between interpreter instances, so instances
//! on different threads only ever meet here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::host::HostBridge;
use crate::registry::HostSlot;

struct HostTable {
    table: DashMap<HostSlot, Arc<dyn HostBridge>>,
    next: AtomicU32,
}

static HOSTS: LazyLock<HostTable> = LazyLock::new(|| HostTable {
    table: DashMap::new(),
    next: AtomicU32::new(1),
});

/// Attach `host` under a fresh slot. Slots are never reused within a process.
pub fn attach(host: Arc<dyn HostBridge>) -> HostSlot {
    let slot = loop {
        let raw = HOSTS.next.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = HostSlot::new(raw) {
            break slot;
        }
    };
    HOSTS.table.insert(slot, host);
    tracing::debug!(%slot, "attached host");
    slot
}

pub fn detach(slot: HostSlot) -> Option<Arc<dyn HostBridge>> {
    let removed = HOSTS.table.remove(&slot).map(|(_, host)| host);
    if removed.is_some() {
        tracing::debug!(%slot, "detached host");
    }
    removed
}

/// Clone the host out so no map guard is held across a host callback.
pub fn lookup(slot: HostSlot) -> Option<Arc<dyn HostBridge>> {
    HOSTS.table.get(&slot).map(|entry| Arc::clone(entry.value()))
}

pub fn attached() -> usize {
    HOSTS.table.len()
}

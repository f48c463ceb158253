//! Generation-checked arena for host values exposed to Lua.
//!
//! A proxy cell only carries a `u64`; this table turns that number back into
//! the host value. Every id packs `(generation << 32) | index`, and freeing a
//! slot bumps its generation, so an id that outlived its value is rejected
//! instead of resolving to whatever reused the slot.

use crate::proxy::ProxyId;

/// Handle to one entry of a [`CapabilityTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    index: u32,
    generation: u32,
}

impl CapabilityId {
    /// Decode a proxy id. `0` and ids with a zero generation were never issued.
    pub fn from_proxy(id: ProxyId) -> Option<Self> {
        let raw = id.get();
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(CapabilityId {
            index: raw as u32,
            generation,
        })
    }

    pub fn to_proxy(self) -> ProxyId {
        ProxyId::new((u64::from(self.generation) << 32) | u64::from(self.index))
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

pub struct CapabilityTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for CapabilityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CapabilityTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> CapabilityId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return CapabilityId {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 1,
            value: Some(value),
        });
        CapabilityId {
            index,
            generation: 1,
        }
    }

    fn entry(&self, id: CapabilityId) -> Option<&Entry<T>> {
        self.entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.entry(id).is_some_and(|entry| entry.value.is_some())
    }

    pub fn get(&self, id: CapabilityId) -> Option<&T> {
        self.entry(id).and_then(|entry| entry.value.as_ref())
    }

    /// Release `id`. The slot becomes reusable under the next generation.
    pub fn remove(&mut self, id: CapabilityId) -> Option<T> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)?;
        let value = entry.value.take()?;
        // A slot whose generation would wrap is retired rather than reused.
        match entry.generation.checked_add(1) {
            Some(next) => {
                entry.generation = next;
                self.free.push(id.index);
            }
            None => entry.generation = 0,
        }
        self.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<T: Clone> CapabilityTable<T> {
    /// Clone the value out so no borrow of the table outlives the lookup.
    pub fn get_cloned(&self, id: CapabilityId) -> Option<T> {
        self.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_never_zero() {
        let mut table = CapabilityTable::new();
        let id = table.insert("a");
        assert_ne!(id.to_proxy().get(), 0);
        assert_eq!(CapabilityId::from_proxy(id.to_proxy()), Some(id));
    }

    #[test]
    fn test_stale_id_is_rejected_after_reuse() {
        let mut table = CapabilityTable::new();
        let first = table.insert("first");
        assert_eq!(table.remove(first), Some("first"));

        let second = table.insert("second");
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"second"));
        assert_eq!(table.remove(first), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_zero_generation_never_decodes() {
        assert_eq!(CapabilityId::from_proxy(ProxyId::new(0)), None);
        assert_eq!(CapabilityId::from_proxy(ProxyId::new(5)), None);
    }
}

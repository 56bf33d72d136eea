use by_address::ByAddress;
use std::fmt::{self, Debug};

use super::OffloadError;
use crate::datamap::MapRef;
use crate::device::HostBuffer;
use crate::prelude::*;

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub map: MapRef,
    /// Whether the map was found in an enclosing offload rather than created by this one.
    pub inherited: bool,
}

/// Bounded cache of the maps an offload has created or inherited, keyed by the address of the
/// host array. Entries keep their insertion index, which callers can use as a lookup hint.
pub struct MapCache {
    entries: Mutex<IndexMap<ByAddress<HostBuffer>, CacheEntry>>,
    capacity: usize,
}

impl MapCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: default(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `map` and return its index. A map of the same host array replaces the existing
    /// entry in place.
    pub fn insert(&self, map: MapRef, inherited: bool) -> Result<usize, OffloadError> {
        let key = ByAddress(Arc::clone(map.info().source()));
        let mut entries = self.entries.lock();

        if let Some((index, _, entry)) = entries.get_full_mut(&key) {
            *entry = CacheEntry { map, inherited };
            return Ok(index);
        }

        if entries.len() >= self.capacity {
            return Err(OffloadError::CacheFull(self.capacity));
        }

        let (index, _) = entries.insert_full(key, CacheEntry { map, inherited });
        Ok(index)
    }

    pub fn find(&self, buffer: &HostBuffer) -> Option<(usize, CacheEntry)> {
        let key = ByAddress(Arc::clone(buffer));
        self.entries
            .lock()
            .get_full(&key)
            .map(|(index, _, entry)| (index, entry.clone()))
    }

    pub fn get(&self, index: usize) -> Option<CacheEntry> {
        self.entries
            .lock()
            .get_index(index)
            .map(|(_, entry)| entry.clone())
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn is_inherited(&self, map: &MapRef) -> bool {
        any(self.entries.lock().values(), |e| e.map == *map && e.inherited)
    }
}

impl Debug for MapCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("MapCache")
            .field("capacity", &self.capacity)
            .field("entries", &entries.values().collect_vec())
            .finish()
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource tables and object pools.
//!
//! [`Pool`] is a chunked arena with a free list: allocation is O(1)
//! amortized and storage is recycled without returning chunks to the
//! allocator. Handles carry a generation counter, so a handle that
//! outlives its object misses structurally instead of aliasing whatever
//! was recycled into the slot.
//!
//! [`IdTable`] maps small monotonically-increasing integer IDs (the values
//! that travel on the wire) to pool handles in O(1).
//!
//! Every mutating operation here is reached only through the primary state
//! lock: both tables live inside `ClientState`, so holding `&mut` to them
//! is proof of the lock.

use std::collections::HashMap;

/// Slots per arena chunk. Growth allocates one chunk at a time.
const CHUNK_SLOTS: usize = 64;

/// Generation-tagged handle into a [`Pool`].
///
/// A stale handle (its slot was freed, possibly re-allocated) is detected
/// by the generation mismatch and behaves like a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index, for diagnostics only.
    pub fn index(self) -> u32 {
        self.index
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Chunked object pool with free-list recycling.
pub struct Pool<T> {
    chunks: Vec<Vec<Slot<T>>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a value, recycling a freed slot when one exists.
    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = self.slot_mut(index);
            debug_assert!(slot.value.is_none(), "free-listed slot still occupied");
            slot.value = Some(value);
            self.live += 1;
            return Handle {
                index,
                generation: self.slot(index).generation,
            };
        }

        // No free slot: grow by one chunk if the current one is full.
        let index = self.chunks.len() * CHUNK_SLOTS
            - self.chunks.last().map_or(0, |c| CHUNK_SLOTS - c.len());
        if self
            .chunks
            .last()
            .is_none_or(|c| c.len() == CHUNK_SLOTS)
        {
            self.chunks.push(Vec::with_capacity(CHUNK_SLOTS));
        }
        let chunk = self
            .chunks
            .last_mut()
            .expect("chunk pushed above");
        chunk.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.live += 1;
        let index = index as u32;
        Handle {
            index,
            generation: 0,
        }
    }

    /// Look up a live object; stale handles return `None`.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.try_slot(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutable lookup; stale handles return `None`.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let idx = handle.index;
        let generation = handle.generation;
        let slot = self.try_slot_mut(idx)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Remove an object, bumping the slot generation so outstanding
    /// handles go stale. Returns the value for the caller to finish
    /// tearing down *after* it is unreachable from every table.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let idx = handle.index;
        let generation = handle.generation;
        let slot = self.try_slot_mut(idx)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        self.live -= 1;
        Some(value)
    }

    /// Iterate live objects. Consistency checks and teardown sweeps only,
    /// never the hot path.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.chunks.iter().enumerate().flat_map(|(ci, chunk)| {
            chunk.iter().enumerate().filter_map(move |(si, slot)| {
                let value = slot.value.as_ref()?;
                Some((
                    Handle {
                        index: (ci * CHUNK_SLOTS + si) as u32,
                        generation: slot.generation,
                    },
                    value,
                ))
            })
        })
    }

    /// Self-test walk: free list and occupancy must agree.
    pub fn verify(&self) -> bool {
        let total: usize = self.chunks.iter().map(Vec::len).sum();
        let occupied = self
            .chunks
            .iter()
            .flat_map(|c| c.iter())
            .filter(|s| s.value.is_some())
            .count();
        occupied == self.live && self.free.len() == total - self.live
    }

    fn slot(&self, index: u32) -> &Slot<T> {
        &self.chunks[index as usize / CHUNK_SLOTS][index as usize % CHUNK_SLOTS]
    }

    fn slot_mut(&mut self, index: u32) -> &mut Slot<T> {
        &mut self.chunks[index as usize / CHUNK_SLOTS][index as usize % CHUNK_SLOTS]
    }

    fn try_slot(&self, index: u32) -> Option<&Slot<T>> {
        self.chunks
            .get(index as usize / CHUNK_SLOTS)?
            .get(index as usize % CHUNK_SLOTS)
    }

    fn try_slot_mut(&mut self, index: u32) -> Option<&mut Slot<T>> {
        self.chunks
            .get_mut(index as usize / CHUNK_SLOTS)?
            .get_mut(index as usize % CHUNK_SLOTS)
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic wire-ID index.
///
/// IDs are never reassigned while live; the pool's generation tags make
/// even a delayed re-use of a removed ID harmless, but we still hand out
/// fresh IDs monotonically so wire traces stay unambiguous.
pub struct IdTable {
    next: u32,
    map: HashMap<u32, Handle>,
}

impl IdTable {
    pub fn new() -> Self {
        Self {
            next: 1,
            map: HashMap::new(),
        }
    }

    /// Attach a fresh ID to a handle.
    pub fn assign(&mut self, handle: Handle) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        self.map.insert(id, handle);
        id
    }

    pub fn lookup(&self, id: u32) -> Option<Handle> {
        self.map.get(&id).copied()
    }

    pub fn remove(&mut self, id: u32) -> Option<Handle> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate (id, handle) pairs. Teardown sweeps only.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Handle)> + '_ {
        self.map.iter().map(|(&id, &h)| (id, h))
    }
}

impl Default for IdTable {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut pool: Pool<String> = Pool::new();
        let h = pool.insert("alpha".into());
        assert_eq!(pool.get(h).map(String::as_str), Some("alpha"));
        assert_eq!(pool.remove(h), Some("alpha".into()));
        assert_eq!(pool.get(h), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_stale_handle_misses_after_reuse() {
        let mut pool: Pool<u32> = Pool::new();
        let h1 = pool.insert(7);
        pool.remove(h1);

        // Slot is recycled for a new object...
        let h2 = pool.insert(8);
        assert_eq!(h2.index(), h1.index());

        // ...but the old handle must not alias it.
        assert_eq!(pool.get(h1), None);
        assert_eq!(pool.get_mut(h1), None);
        assert_eq!(pool.remove(h1), None);
        assert_eq!(pool.get(h2), Some(&8));
    }

    #[test]
    fn test_growth_past_one_chunk() {
        let mut pool: Pool<usize> = Pool::new();
        let handles: Vec<_> = (0..CHUNK_SLOTS * 3 + 5).map(|i| pool.insert(i)).collect();
        assert_eq!(pool.len(), CHUNK_SLOTS * 3 + 5);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get(*h), Some(&i));
        }
        assert!(pool.verify());
    }

    #[test]
    fn test_free_list_recycling() {
        let mut pool: Pool<u8> = Pool::new();
        let handles: Vec<_> = (0..10u8).map(|i| pool.insert(i)).collect();
        for h in &handles {
            pool.remove(*h);
        }
        assert!(pool.verify());
        // All further inserts reuse freed slots; no new chunk appears.
        for i in 0..10u8 {
            let h = pool.insert(i);
            assert!(h.index() < 10);
        }
        assert_eq!(pool.chunks.len(), 1);
    }

    #[test]
    fn test_id_table_monotonic() {
        let mut pool: Pool<u8> = Pool::new();
        let mut ids = IdTable::new();
        let a = ids.assign(pool.insert(1));
        let b = ids.assign(pool.insert(2));
        assert!(b > a);
        assert_eq!(ids.lookup(a), Some(ids.lookup(a).unwrap()));
        ids.remove(a);
        assert_eq!(ids.lookup(a), None);
        assert!(ids.lookup(b).is_some());
    }

    #[test]
    fn test_verify_detects_consistency() {
        let mut pool: Pool<u8> = Pool::new();
        let h = pool.insert(1);
        assert!(pool.verify());
        pool.remove(h);
        assert!(pool.verify());
    }
}

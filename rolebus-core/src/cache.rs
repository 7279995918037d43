//! The Register Cache: a time-indexed store of recent register replies,
//! keyed by `(role, command, argument)`. Stores bytes only; the caller
//! (the Bridge) interprets them.

use crate::registry::RoleId;

/// Upper bound on how fresh a cache hit can be demanded; callers that ask
/// for a longer validity window are clamped down to this.
pub const MAX_REG_VALIDITY_MS: u64 = 60_000;

/// A 10 s aging window applied to an entire role's cache on a `CHANGE`
/// event from one of its services. This may under-refresh indexed
/// registers, since only one entry is touched per packet, but that
/// matches the source's own behavior rather than fixing it.
pub const CHANGE_AGE_MS: u64 = 10_000;

/// Fixed cache capacity, mirroring the source's fixed-arena allocation
/// rather than an unbounded cache.
pub const CACHE_CAPACITY: usize = 64;

/// Opaque handle to a live cache entry. Stable for the entry's lifetime;
/// invalidated (and must not be reused) once the entry is freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryHandle(usize);

#[derive(Clone, Debug)]
struct Slot {
    role_idx: RoleId,
    command: u16,
    argument: u32,
    data: Vec<u8>,
    last_refresh_ms: u64,
    /// Monotonically increasing use counter; higher is more-recently-used.
    /// Used for LRU eviction instead of wall-clock time so that
    /// `mark_used` promotion is independent of the clock.
    use_seq: u64,
}

/// Time-indexed store of recent register replies. Owned exclusively by
/// the Fiber/Bus Bridge.
pub struct RegisterCache {
    slots: Vec<Option<Slot>>,
    next_use_seq: u64,
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCache {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_use_seq: 0,
        }
    }

    fn find(&self, role_idx: RoleId, command: u16, argument: u32) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|s| s.role_idx == role_idx && s.command == command && s.argument == argument)
        })
    }

    /// Looks up a cache entry by key, returning its handle if present.
    pub fn lookup(&self, role_idx: RoleId, command: u16, argument: u32) -> Option<EntryHandle> {
        self.find(role_idx, command, argument).map(EntryHandle)
    }

    pub fn data(&self, handle: EntryHandle) -> &[u8] {
        &self.slots[handle.0].as_ref().expect("dangling cache handle").data
    }

    pub fn argument(&self, handle: EntryHandle) -> u32 {
        self.slots[handle.0].as_ref().expect("dangling cache handle").argument
    }

    pub fn last_refresh_ms(&self, handle: EntryHandle) -> u64 {
        self.slots[handle.0]
            .as_ref()
            .expect("dangling cache handle")
            .last_refresh_ms
    }

    /// Allocates (or reuses, if already present) an entry for `(role_idx,
    /// command, argument)` sized to hold `data`, evicting the
    /// least-recently-used entry if the cache is at capacity. Returns the
    /// handle with `data`/`last_refresh_ms` already populated.
    ///
    /// A size change for an existing key evicts the old entry first: an
    /// entry's size is stable for its lifetime, so a different size
    /// means a new entry, not an update.
    pub fn alloc(
        &mut self,
        role_idx: RoleId,
        command: u16,
        argument: u32,
        data: &[u8],
        now_ms: u64,
    ) -> EntryHandle {
        if let Some(idx) = self.find(role_idx, command, argument) {
            let existing_len = self.slots[idx].as_ref().unwrap().data.len();
            if existing_len == data.len() {
                let slot = self.slots[idx].as_mut().unwrap();
                slot.data.copy_from_slice(data);
                slot.last_refresh_ms = now_ms;
                slot.use_seq = self.bump_use_seq();
                return EntryHandle(idx);
            }
            self.slots[idx] = None;
        }

        let idx = self.find_free_slot();
        let use_seq = self.bump_use_seq();
        self.slots[idx] = Some(Slot {
            role_idx,
            command,
            argument,
            data: data.to_vec(),
            last_refresh_ms: now_ms,
            use_seq,
        });
        EntryHandle(idx)
    }

    fn bump_use_seq(&mut self) -> u64 {
        let seq = self.next_use_seq;
        self.next_use_seq += 1;
        seq
    }

    fn find_free_slot(&mut self) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            return idx;
        }
        if self.slots.len() < CACHE_CAPACITY {
            self.slots.push(None);
            return self.slots.len() - 1;
        }
        self.evict_lru()
    }

    fn evict_lru(&mut self) -> usize {
        let idx = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map(|s| s.use_seq).unwrap_or(0))
            .map(|(idx, _)| idx)
            .expect("cache capacity is zero");
        self.slots[idx] = None;
        idx
    }

    /// Drops a single entry.
    pub fn free(&mut self, handle: EntryHandle) {
        self.slots[handle.0] = None;
    }

    /// Evicts every entry belonging to `role_idx`, e.g. when a role's
    /// binding changes and its cached replies no longer apply.
    pub fn free_role(&mut self, role_idx: RoleId) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.role_idx == role_idx) {
                *slot = None;
            }
        }
    }

    /// Promotes an entry to most-recently-used. The handle stays stable,
    /// since eviction never touches a live entry.
    pub fn mark_used(&mut self, handle: EntryHandle) -> EntryHandle {
        let seq = self.bump_use_seq();
        self.slots[handle.0].as_mut().expect("dangling cache handle").use_seq = seq;
        handle
    }

    /// Ages every entry for `role_idx` whose `last_refresh_ms` predates
    /// `cutoff_ms` down to `cutoff_ms`, forcing the next `get_register`
    /// validity check to treat it as stale while not disturbing entries
    /// that were refreshed more recently than the cutoff.
    pub fn age(&mut self, role_idx: RoleId, cutoff_ms: u64) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.role_idx == role_idx && slot.last_refresh_ms < cutoff_ms {
                slot.last_refresh_ms = cutoff_ms;
            }
        }
    }

    /// Iterates entries matching `(role_idx, command)`, starting after
    /// `prev` (or from the start if `None`), to support argument-indexed
    /// registers where several entries share a role and command but
    /// differ by argument.
    pub fn next(&self, role_idx: RoleId, command: u16, prev: Option<EntryHandle>) -> Option<EntryHandle> {
        let start = prev.map(|h| h.0 + 1).unwrap_or(0);
        self.slots[start..]
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.role_idx == role_idx && s.command == command))
            .map(|rel| EntryHandle(start + rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_lookup_round_trips() {
        let mut cache = RegisterCache::new();
        let h = cache.alloc(RoleId(0), 1, 0, &[1, 2, 3], 100);
        assert_eq!(cache.lookup(RoleId(0), 1, 0), Some(h));
        assert_eq!(cache.data(h), &[1, 2, 3]);
        assert_eq!(cache.last_refresh_ms(h), 100);
    }

    #[test]
    fn at_most_one_entry_per_key() {
        let mut cache = RegisterCache::new();
        cache.alloc(RoleId(0), 1, 0, &[1], 0);
        cache.alloc(RoleId(0), 1, 0, &[2], 1);
        let matches = (0..CACHE_CAPACITY)
            .filter(|&i| cache.lookup(RoleId(0), 1, 0) == Some(EntryHandle(i)))
            .count();
        assert!(matches <= 1);
        assert_eq!(cache.data(cache.lookup(RoleId(0), 1, 0).unwrap()), &[2]);
    }

    #[test]
    fn size_change_evicts_old_entry() {
        let mut cache = RegisterCache::new();
        let h1 = cache.alloc(RoleId(0), 1, 0, &[1, 2], 0);
        let h2 = cache.alloc(RoleId(0), 1, 0, &[1, 2, 3], 1);
        assert_ne!(h1, h2);
        assert_eq!(cache.data(h2), &[1, 2, 3]);
    }

    #[test]
    fn free_role_evicts_only_that_roles_entries() {
        let mut cache = RegisterCache::new();
        cache.alloc(RoleId(0), 1, 0, &[1], 0);
        cache.alloc(RoleId(1), 1, 0, &[2], 0);
        cache.free_role(RoleId(0));
        assert_eq!(cache.lookup(RoleId(0), 1, 0), None);
        assert!(cache.lookup(RoleId(1), 1, 0).is_some());
    }

    #[test]
    fn lru_eviction_prefers_least_recently_used() {
        let mut cache = RegisterCache::new();
        for i in 0..CACHE_CAPACITY {
            cache.alloc(RoleId(i as u32), 1, 0, &[0], 0);
        }
        // Touch every entry except role 0, making it the LRU one.
        for i in 1..CACHE_CAPACITY {
            let h = cache.lookup(RoleId(i as u32), 1, 0).unwrap();
            cache.mark_used(h);
        }
        cache.alloc(RoleId(999), 1, 0, &[9], 1);
        assert_eq!(cache.lookup(RoleId(0), 1, 0), None);
        assert!(cache.lookup(RoleId(999), 1, 0).is_some());
    }

    #[test]
    fn age_clamps_only_stale_entries() {
        let mut cache = RegisterCache::new();
        let fresh = cache.alloc(RoleId(0), 1, 0, &[1], 950);
        let stale = cache.alloc(RoleId(0), 2, 0, &[2], 100);
        cache.age(RoleId(0), 900);
        assert_eq!(cache.last_refresh_ms(fresh), 950);
        assert_eq!(cache.last_refresh_ms(stale), 900);
    }

    #[test]
    fn next_iterates_matching_keys_by_argument() {
        let mut cache = RegisterCache::new();
        cache.alloc(RoleId(0), 1, 0, &[0], 0);
        cache.alloc(RoleId(0), 1, 1, &[1], 0);
        cache.alloc(RoleId(0), 2, 0, &[9], 0);

        let first = cache.next(RoleId(0), 1, None).unwrap();
        let second = cache.next(RoleId(0), 1, Some(first)).unwrap();
        assert!(cache.next(RoleId(0), 1, Some(second)).is_none());
        assert_ne!(first, second);
    }
}

//! Sharded metric storage.
use std::{
    error::Error,
    fmt,
    hash::BuildHasherDefault,
    iter::repeat_with,
    sync::{
        atomic::{AtomicUsize, Ordering},
        PoisonError, RwLock,
    },
};

use hashbrown::{hash_map::RawEntryMut, HashMap};

use crate::{Hashable, KeyHasher};

type RegistryHashMap<K, V> = HashMap<K, V, BuildHasherDefault<KeyHasher>>;

/// The registry is at its configured capacity and cannot hold another key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityExceeded {
    /// Configured maximum number of keys.
    pub capacity: usize,
}

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registry is full ({} keys)", self.capacity)
    }
}

impl Error for CapacityExceeded {}

/// A sharded map of metric entries.
///
/// `Registry` maintains a central listing of entries mapped by a given key. Keys are spread over a
/// power-of-two number of shards by their pre-computed hash, and every shard is protected by its own
/// `RwLock`, so writers to different keys rarely contend with each other.
///
/// ## Locking
///
/// Operations on an existing entry run while holding the read side of the entry's shard lock.
/// Removal through `retain` takes the write side. An entry is therefore never removed
/// while an operation on it is in flight, and a predicate passed to `retain` observes every entry
/// of its shard at rest.
///
/// Entries themselves are only handed out by reference, so `V` must provide its own interior
/// mutability for updates.
///
/// ## Capacity
///
/// A registry may be bounded to a maximum number of keys. Once full, new keys are rejected with
/// [`CapacityExceeded`] while existing keys remain fully usable.
pub struct Registry<K, V> {
    shards: Vec<RwLock<RegistryHashMap<K, V>>>,
    shard_mask: usize,
    len: AtomicUsize,
    capacity: Option<usize>,
}

impl<K, V> Registry<K, V> {
    /// Creates a new, unbounded `Registry`.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a new `Registry` holding at most `capacity` keys, or unbounded if `None`.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let shard_count = std::cmp::max(1, num_cpus::get()).next_power_of_two();
        let shard_mask = shard_count - 1;
        let shards = repeat_with(|| RwLock::new(RegistryHashMap::default()))
            .take(shard_count)
            .collect();

        Self { shards, shard_mask, len: AtomicUsize::new(0), capacity }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if the registry holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry stored in this registry.
    ///
    /// This operation does not lock the entire registry, but proceeds directly through the shards
    /// that are kept internally. As a result, all shards will be visited, but an entry that existed
    /// at the exact moment that `visit` was called may not actually be observed if it is deleted
    /// before that shard is reached. Likewise, an entry that is added after the call to `visit`, but
    /// before `visit` finishes, may also not be observed.
    pub fn visit<F>(&self, mut collect: F)
    where
        F: FnMut(&K, &V),
    {
        for shard in &self.shards {
            let shard_read = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (key, value) in shard_read.iter() {
                collect(key, value);
            }
        }
    }

    /// Retains only the entries specified by the predicate, returning how many were removed.
    ///
    /// Removes all entries for which `f(&k, &v)` returns `false`. Each shard is held under its
    /// write lock while its entries are checked, so no operation on an entry of that shard can run
    /// between the check and the removal.
    pub fn retain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard_write = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = shard_write.len();
            shard_write.retain(|k, v| f(k, v));
            removed += before - shard_write.len();
        }

        self.len.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    /// Reserves room for one more key, failing if the registry is full.
    fn try_reserve(&self) -> Result<(), CapacityExceeded> {
        match self.capacity {
            None => {
                self.len.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(capacity) => self
                .len
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                    (len < capacity).then_some(len + 1)
                })
                .map(|_| ())
                .map_err(|_| CapacityExceeded { capacity }),
        }
    }
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Registry<K, V>
where
    K: Hashable,
{
    #[inline]
    fn get_hash_and_shard(&self, key: &K) -> (u64, &RwLock<RegistryHashMap<K, V>>) {
        let hash = key.hashable();

        // `shards` has a power-of-two length and `shard_mask` is `shards.len() - 1`, so the masked
        // hash is always in bounds.
        let shard = &self.shards[hash as usize & self.shard_mask];

        (hash, shard)
    }
}

impl<K, V> Registry<K, V>
where
    K: Clone + Eq + Hashable,
{
    /// Gets or creates the entry for the given key, then runs `op` against it.
    ///
    /// `create` is only called if the key is absent, and only if the registry has room for another
    /// key. If the registry is full, `op` is not called and [`CapacityExceeded`] is returned.
    ///
    /// `op` runs while the entry's shard is locked, so the entry cannot be removed while `op` is
    /// running.
    pub fn get_or_try_create<C, O, R>(
        &self,
        key: &K,
        create: C,
        op: O,
    ) -> Result<R, CapacityExceeded>
    where
        C: FnOnce(&K) -> V,
        O: FnOnce(&V) -> R,
    {
        let (hash, shard) = self.get_hash_and_shard(key);

        // Try and get the entry if it exists, running our operation if we succeed.
        let shard_read = shard.read().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, v)) = shard_read.raw_entry().from_key_hashed_nocheck(hash, key) {
            return Ok(op(v));
        }
        drop(shard_read);

        // Switch to using the write guard and find or create the entry, running our operation
        // while the guard is still held.
        let mut shard_write = shard.write().unwrap_or_else(PoisonError::into_inner);
        let v = match shard_write.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
            RawEntryMut::Occupied(entry) => entry.into_mut(),
            RawEntryMut::Vacant(entry) => {
                self.try_reserve()?;
                entry.insert_hashed_nocheck(hash, key.clone(), create(key)).1
            }
        };

        Ok(op(v))
    }
}

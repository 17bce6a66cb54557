// Copyright 2026 kvcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use hashbrown::HashMap;
use itertools::Itertools;
use kvcache_common::{
    error::{Error, Result},
    id::{CacheId, InstanceKey},
};
use parking_lot::Mutex;

use crate::{
    global::GlobalCache,
    handle::{AllocatedEntry, RawCacheEntry},
    instance::Instance,
    store::BlockRef,
};

/// Byte quota of a working set.
#[derive(Debug)]
pub(crate) struct WorkingSetQuota {
    id: u64,
    instance: Arc<Instance>,
    used: AtomicUsize,
    limit: usize,
    current: Mutex<Option<BlockRef>>,
    destroyed: AtomicBool,
}

impl WorkingSetQuota {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn current(&self) -> &Mutex<Option<BlockRef>> {
        &self.current
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Charge `size` bytes iff `used + size <= limit`. `used` is untouched on failure.
    pub(crate) fn try_charge(&self, size: usize) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&used| used <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| Error::quota_exceeded(used, self.limit, size))
    }

    pub(crate) fn refund(&self, size: usize) {
        let prev = self.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size, "working set quota refund underflow");
    }
}

/// Creates and destroys working sets.
#[derive(Debug, Default)]
pub(crate) struct WorkingSetManager {
    sets: Mutex<HashMap<u64, Arc<WorkingSetQuota>>>,
    next_id: AtomicU64,
}

impl WorkingSetManager {
    pub(crate) fn create(&self, instance: Arc<Instance>, limit: usize) -> Arc<WorkingSetQuota> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let quota = Arc::new(WorkingSetQuota {
            id,
            instance,
            used: AtomicUsize::new(0),
            limit,
            current: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        self.sets.lock().insert(id, quota.clone());
        quota
    }

    /// Release the quota. Entries already written age out through the normal reclaim rules.
    pub(crate) fn destroy(&self, id: u64) -> Option<Arc<WorkingSetQuota>> {
        let quota = self.sets.lock().remove(&id)?;
        quota.destroyed.store(true, Ordering::Release);
        quota.current.lock().take();
        Some(quota)
    }

    pub(crate) fn destroy_cache(&self, cache_id: CacheId) -> usize {
        let ids = self
            .sets
            .lock()
            .values()
            .filter(|quota| quota.instance.key().cache_id == cache_id)
            .map(|quota| quota.id)
            .collect_vec();
        ids.into_iter().filter_map(|id| self.destroy(id)).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.sets.lock().len()
    }
}

/// A bounded sub-cache of one tenant in one cache.
///
/// Entries written through a working set live in the same index as the owning cache, so `get` and `erase` behave
/// exactly like the cache. Allocations are charged to the working set quota and fail with
/// [`kvcache_common::error::ErrorKind::QuotaExceeded`] instead of washing once the quota is used up.
///
/// Dropping the working set destroys it.
#[derive(Debug)]
pub struct WorkingSet {
    cache: GlobalCache,
    quota: Arc<WorkingSetQuota>,
}

impl Drop for WorkingSet {
    fn drop(&mut self) {
        self.cache.destroy_working_set(&self.quota);
    }
}

impl WorkingSet {
    pub(crate) fn new(cache: GlobalCache, quota: Arc<WorkingSetQuota>) -> Self {
        Self { cache, quota }
    }

    /// The tenant and cache the working set belongs to.
    pub fn instance_key(&self) -> InstanceKey {
        self.quota.instance().key()
    }

    /// Bytes charged to the working set.
    pub fn used(&self) -> usize {
        self.quota.used()
    }

    /// Byte quota of the working set.
    pub fn limit(&self) -> usize {
        self.quota.limit()
    }

    /// Insert an entry, charging `key.len() + value.len()` bytes to the quota.
    pub fn put(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        self.put_and_fetch(key, value, overwrite).map(|_| ())
    }

    /// Insert an entry and return it pinned.
    pub fn put_and_fetch(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<RawCacheEntry> {
        let mut entry = self.alloc(key.len(), value.len())?;
        entry.key_mut().copy_from_slice(key);
        entry.value_mut().copy_from_slice(value);
        self.cache.put_kvpair(entry, overwrite)
    }

    /// Reserve space for an entry, charging `key_size + value_size` bytes to the quota.
    pub fn alloc(&self, key_size: usize, value_size: usize) -> Result<AllocatedEntry> {
        self.cache.alloc_in_working_set(&self.quota, key_size, value_size)
    }

    /// Publish an entry reserved by [`WorkingSet::alloc`].
    pub fn put_kvpair(&self, entry: AllocatedEntry, overwrite: bool) -> Result<RawCacheEntry> {
        self.cache.put_kvpair(entry, overwrite)
    }

    /// Look up an entry.
    pub fn get(&self, key: &[u8]) -> Result<RawCacheEntry> {
        let InstanceKey { cache_id, tenant_id } = self.instance_key();
        self.cache.get(cache_id, tenant_id, key)
    }

    /// Erase an entry.
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        let InstanceKey { cache_id, tenant_id } = self.instance_key();
        self.cache.erase(cache_id, tenant_id, key)
    }
}

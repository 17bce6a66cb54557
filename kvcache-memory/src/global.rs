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

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use itertools::Itertools;
use kvcache_common::{
    error::{Error, ErrorKind, Result},
    id::{CacheId, InstanceKey, TenantId},
    metrics::model::Metrics,
};
use parking_lot::Mutex;

use crate::{
    budget::MemoryBudget,
    config::GlobalCacheConfig,
    handle::{AllocatedEntry, RawCacheEntry},
    index::{hash_key, CacheIndex, IndexNode},
    instance::{CacheInfo, CacheSlot, Instance, InstanceRegistry},
    store::{BlockOwner, MemStore, ReclaimKind, Reservation, StoreStatistics},
    wash::{Maintenance, WashedBlock},
    working_set::{WorkingSet, WorkingSetManager, WorkingSetQuota},
};

/// Failed allocations retry after a sync wash at most this many times.
const SYNC_WASH_RETRIES: usize = 3;

#[derive(Debug)]
pub(crate) struct GlobalCacheInner {
    pub(crate) name: Cow<'static, str>,
    pub(crate) store: Arc<MemStore>,
    pub(crate) index: CacheIndex,
    pub(crate) instances: InstanceRegistry,
    pub(crate) working_sets: WorkingSetManager,
    pub(crate) budget: Arc<dyn MemoryBudget>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) wash_batch: usize,
    pub(crate) replace_batch: usize,

    slots: Box<[ArcSwapOption<CacheSlot>]>,
    /// Serializes registration, working set creation and priority changes.
    admin: Mutex<()>,
    working_set_limit_percentage: usize,
    closed: AtomicBool,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Drop for GlobalCacheInner {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.get_mut().take() {
            maintenance.shutdown();
        }
    }
}

fn entry_size(key_size: usize, value_size: usize) -> Result<usize> {
    key_size.checked_add(value_size).ok_or_else(|| {
        Error::invalid_argument("entry size overflows")
            .with_context("key_size", key_size)
            .with_context("value_size", value_size)
    })
}

impl GlobalCacheInner {
    fn check_open(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => Err(Error::not_initialized()),
            false => Ok(()),
        }
    }

    fn slot(&self, cache_id: CacheId) -> Result<Arc<CacheSlot>> {
        usize::try_from(cache_id)
            .ok()
            .and_then(|id| self.slots.get(id))
            .and_then(|slot| slot.load_full())
            .ok_or_else(|| Error::invalid_argument("cache is not registered").with_context("cache_id", cache_id))
    }

    fn slot_by_name(&self, name: &str) -> Result<Arc<CacheSlot>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.load_full())
            .find(|slot| slot.name() == name)
            .ok_or_else(|| Error::invalid_argument("cache is not registered").with_context("name", name))
    }

    fn registered(&self) -> Vec<Arc<CacheSlot>> {
        self.slots.iter().filter_map(|slot| slot.load_full()).collect_vec()
    }

    /// The instance of a registered cache, if the tenant has touched it.
    fn instance(&self, cache_id: CacheId, tenant_id: TenantId) -> Option<Arc<Instance>> {
        let slot = self.slot(cache_id).ok()?;
        self.instances
            .get(&InstanceKey::new(cache_id, tenant_id))
            .filter(|instance| Arc::ptr_eq(instance.slot(), &slot))
    }

    /// Account the entry of an unlinked live node as gone.
    fn release_node(&self, node: IndexNode) {
        if let Some(pin) = self.store.add_handle_ref(node.location.block) {
            self.store.release_entry(&pin);
        }
    }

    fn alloc_with_wash(&self, owner: &Arc<BlockOwner>, size: usize) -> Result<Reservation> {
        let tenant_id = owner.instance.key().tenant_id;
        let block_size = self.store.block_size();
        if size > self.store.capacity() {
            self.metrics.alloc_fail.increase(1);
            return Err(Error::out_of_memory(self.store.capacity(), self.store.allocated(), size));
        }
        let mut attempts = 0;
        loop {
            match self.store.alloc(owner, size) {
                Ok(reservation) => return Ok(reservation),
                Err(e) if e.kind() == ErrorKind::OutOfMemory && attempts < SYNC_WASH_RETRIES => {
                    attempts += 1;
                    let capacity = size.max(block_size);
                    let need = self
                        .store
                        .allocated()
                        .saturating_add(capacity)
                        .saturating_sub(self.store.capacity());
                    if let Err(wash) = self.sync_wash_mbs(tenant_id, need, size <= block_size) {
                        self.metrics.alloc_fail.increase(1);
                        return Err(e.with_source(wash));
                    }
                }
                Err(e) => {
                    self.metrics.alloc_fail.increase(1);
                    return Err(e);
                }
            }
        }
    }

    fn put_kvpair(&self, entry: AllocatedEntry, overwrite: bool) -> Result<RawCacheEntry> {
        self.check_open()?;

        // Entry locations are only meaningful in the block arena they were reserved from.
        if !Arc::ptr_eq(entry.reservation().pin.store(), &self.store) {
            return Err(Error::invalid_argument("entry is allocated from another cache")
                .with_context("instance", entry.instance_key()));
        }
        let instance = entry.reservation().owner.instance.clone();
        if !instance.is_valid() {
            return Err(Error::invalid_argument("cache has been deregistered").with_context("instance", instance.key()));
        }
        let cache_id = instance.key().cache_id;
        let key: Box<[u8]> = entry.key().into();
        let node = IndexNode {
            cache_id,
            hash: hash_key(cache_id, &key),
            key,
            location: entry.location(),
            instance,
        };

        // A failed put drops the entry, which gives its bytes back to the block.
        let old = self.index.put(&self.store, node, overwrite)?;
        let fetched = entry.publish();
        if let Some(old) = old {
            self.release_node(old);
            self.metrics.replace.increase(1);
        }
        self.metrics.put.increase(1);
        Ok(fetched)
    }
}

/// The process-wide multi-tenant cache.
///
/// A registered cache is addressed by its [`CacheId`]. Each tenant owns its own slice of every cache, which holds
/// the memory of the entries the tenant writes. Keys are shared by all tenants of a cache.
///
/// [`GlobalCache`] is cheap to clone, all clones refer to the same cache.
#[derive(Debug, Clone)]
pub struct GlobalCache {
    inner: Arc<GlobalCacheInner>,
}

impl GlobalCache {
    pub(crate) fn open(config: GlobalCacheConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new(config.name.clone(), config.metrics_registry.as_ref()));
        let store = Arc::new(MemStore::new(config.max_cache_size, config.block_size, metrics.clone()));
        let slots = (0..config.max_caches).map(|_| ArcSwapOption::empty()).collect_vec();

        let inner = Arc::new(GlobalCacheInner {
            name: config.name,
            store,
            index: CacheIndex::new(config.bucket_num),
            instances: InstanceRegistry::new(),
            working_sets: WorkingSetManager::default(),
            budget: config.memory_budget,
            metrics,
            wash_batch: config.wash_batch,
            replace_batch: config.replace_batch,
            slots: slots.into_boxed_slice(),
            admin: Mutex::new(()),
            working_set_limit_percentage: config.working_set_limit_percentage,
            closed: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        });

        if config.background_tasks {
            let maintenance = Maintenance::spawn(&inner, config.wash_interval, config.replace_interval)?;
            *inner.maintenance.lock() = Some(maintenance);
        }

        tracing::info!(
            "[global]: cache {:?} opened, capacity: {}, block size: {}, buckets: {}, max caches: {}",
            inner.name,
            config.max_cache_size,
            config.block_size,
            inner.index.bucket_num(),
            config.max_caches
        );

        Ok(Self { inner })
    }

    /// Stop the background tasks. Data operations fail with [`ErrorKind::NotInitialized`] afterwards.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(maintenance) = self.inner.maintenance.lock().take() {
            maintenance.shutdown();
        }
        tracing::info!("[global]: cache {:?} closed", self.inner.name);
    }

    /// Check if the cache has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a named cache with a priority. Higher priority caches get a larger share of memory.
    pub fn register_cache(&self, name: &str, priority: i64) -> Result<CacheId> {
        self.inner.check_open()?;
        if name.is_empty() {
            return Err(Error::invalid_argument("cache name must not be empty"));
        }
        if priority <= 0 {
            return Err(Error::invalid_argument("cache priority must be positive").with_context("priority", priority));
        }

        let _guard = self.inner.admin.lock();
        if self.inner.registered().iter().any(|slot| slot.name() == name) {
            return Err(Error::new(ErrorKind::DuplicateName, "cache name is registered").with_context("name", name));
        }
        let Some(id) = self.inner.slots.iter().position(|slot| slot.load().is_none()) else {
            return Err(Error::new(ErrorKind::TooManyCaches, "all cache ids are in use")
                .with_context("max_caches", self.inner.slots.len()));
        };
        let cache_id = id as CacheId;
        self.inner.slots[id].store(Some(Arc::new(CacheSlot::new(cache_id, name.to_string(), priority))));

        tracing::info!("[global]: register cache {name:?} with id {cache_id}, priority {priority}");
        Ok(cache_id)
    }

    /// Deregister a cache. Its entries become unreachable, its memory is reclaimed once unpinned, and its id is
    /// free for reuse.
    pub fn deregister_cache(&self, cache_id: CacheId) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.admin.lock();
        let slot = inner.slot(cache_id)?;
        inner.slots[cache_id as usize].store(None);

        let working_sets = inner.working_sets.destroy_cache(cache_id);
        let instances = inner.instances.remove_cache(cache_id);
        let nodes = inner.index.erase_if(&inner.store, |node| node.cache_id == cache_id);
        nodes.into_iter().for_each(|node| inner.release_node(node));

        let mut reclaimed = 0;
        for instance in instances.iter() {
            for block in instance.oldest_blocks(usize::MAX) {
                reclaimed += inner.store.reclaim(block, ReclaimKind::Background).unwrap_or_default();
            }
        }

        tracing::info!(
            "[global]: deregister cache {:?} ({cache_id}), instances: {}, working sets: {working_sets}, reclaimed: {reclaimed}",
            slot.name(),
            instances.len()
        );
        Ok(())
    }

    /// Change the priority of a cache. Takes effect from the next wash.
    pub fn set_priority(&self, cache_id: CacheId, priority: i64) -> Result<()> {
        if priority <= 0 {
            return Err(Error::invalid_argument("cache priority must be positive").with_context("priority", priority));
        }
        let _guard = self.inner.admin.lock();
        let slot = self.inner.slot(cache_id)?;
        slot.set_priority(priority);
        tracing::info!("[global]: set priority of cache {:?} to {priority}", slot.name());
        Ok(())
    }

    /// Id of a registered cache by name.
    pub fn get_cache_id(&self, name: &str) -> Result<CacheId> {
        self.inner.slot_by_name(name).map(|slot| slot.id())
    }

    /// Insert an entry.
    ///
    /// Fails with [`ErrorKind::EntryExists`] if a live entry of the key exists and `overwrite` is false.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::global::put"))]
    pub fn put(&self, cache_id: CacheId, tenant_id: TenantId, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        self.put_and_fetch(cache_id, tenant_id, key, value, overwrite).map(|_| ())
    }

    /// Insert an entry and return it pinned.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::global::put_and_fetch"))]
    pub fn put_and_fetch(
        &self,
        cache_id: CacheId,
        tenant_id: TenantId,
        key: &[u8],
        value: &[u8],
        overwrite: bool,
    ) -> Result<RawCacheEntry> {
        let mut entry = self.alloc(cache_id, tenant_id, key.len(), value.len())?;
        entry.key_mut().copy_from_slice(key);
        entry.value_mut().copy_from_slice(value);
        self.put_kvpair(entry, overwrite)
    }

    /// Look up an entry. The returned entry pins its block.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::global::get"))]
    pub fn get(&self, cache_id: CacheId, tenant_id: TenantId, key: &[u8]) -> Result<RawCacheEntry> {
        let inner = &self.inner;
        inner.check_open()?;
        let slot = inner.slot(cache_id)?;

        let hit = inner
            .index
            .get(&inner.store, cache_id, hash_key(cache_id, key), key)
            .and_then(|(location, pin, instance)| {
                let chunk = pin.chunk()?;
                Some((RawCacheEntry::new(pin, chunk, location), instance))
            });

        match hit {
            Some((entry, instance)) => {
                instance.record_hit();
                inner.metrics.hit.increase(1);
                Ok(entry)
            }
            None => {
                inner.instances.get_or_create(&slot, tenant_id).record_miss();
                inner.metrics.miss.increase(1);
                Err(Error::not_found())
            }
        }
    }

    /// Erase an entry. Fails with [`ErrorKind::EntryNotExist`] if there is no live entry of the key.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::global::erase"))]
    pub fn erase(&self, cache_id: CacheId, tenant_id: TenantId, key: &[u8]) -> Result<()> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.slot(cache_id)?;

        match inner.index.erase(&inner.store, cache_id, hash_key(cache_id, key), key) {
            Some(node) => {
                tracing::trace!("[global]: tenant {tenant_id} erase entry of cache {cache_id}");
                inner.release_node(node);
                inner.metrics.erase.increase(1);
                Ok(())
            }
            None => Err(Error::not_found()),
        }
    }

    /// Reserve space for an entry to be written in place and published with [`GlobalCache::put_kvpair`].
    ///
    /// Washes memory synchronously if the store is full.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::global::alloc"))]
    pub fn alloc(
        &self,
        cache_id: CacheId,
        tenant_id: TenantId,
        key_size: usize,
        value_size: usize,
    ) -> Result<AllocatedEntry> {
        let inner = &self.inner;
        inner.check_open()?;
        if key_size == 0 {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        let slot = inner.slot(cache_id)?;
        let instance = inner.instances.get_or_create(&slot, tenant_id);
        let size = entry_size(key_size, value_size)?;
        let owner = BlockOwner::new(instance, None);
        let reservation = inner.alloc_with_wash(&owner, size)?;
        Ok(AllocatedEntry::new(reservation, key_size, value_size))
    }

    /// Publish an entry reserved by [`GlobalCache::alloc`] and return it pinned.
    ///
    /// If the put fails the reserved bytes are given back to their block.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::global::put_kvpair"))]
    pub fn put_kvpair(&self, entry: AllocatedEntry, overwrite: bool) -> Result<RawCacheEntry> {
        self.inner.put_kvpair(entry, overwrite)
    }

    pub(crate) fn alloc_in_working_set(
        &self,
        quota: &Arc<WorkingSetQuota>,
        key_size: usize,
        value_size: usize,
    ) -> Result<AllocatedEntry> {
        let inner = &self.inner;
        inner.check_open()?;
        if key_size == 0 {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        if quota.is_destroyed() || !quota.instance().is_valid() {
            return Err(Error::invalid_argument("working set has been destroyed").with_context("id", quota.id()));
        }

        let size = entry_size(key_size, value_size)?;
        if let Err(e) = quota.try_charge(size) {
            inner.metrics.quota_exceeded.increase(1);
            return Err(e);
        }
        let owner = BlockOwner::new(quota.instance().clone(), Some(quota.clone()));
        match inner.alloc_with_wash(&owner, size) {
            Ok(reservation) => Ok(AllocatedEntry::new(reservation, key_size, value_size)),
            Err(e) => {
                quota.refund(size);
                Err(e)
            }
        }
    }

    pub(crate) fn destroy_working_set(&self, quota: &Arc<WorkingSetQuota>) {
        if self.inner.working_sets.destroy(quota.id()).is_some() {
            tracing::debug!(
                "[global]: destroy working set {} of {}, used: {}",
                quota.id(),
                quota.instance().key(),
                quota.used()
            );
        }
    }

    /// Create a working set of the tenant in the cache.
    ///
    /// Without an explicit limit, the limit is a percentage of the cache's priority share of the tenant budget, and
    /// never less than one block.
    pub fn create_working_set(&self, cache_id: CacheId, tenant_id: TenantId, limit: Option<usize>) -> Result<WorkingSet> {
        let inner = &self.inner;
        inner.check_open()?;
        if limit == Some(0) {
            return Err(Error::invalid_argument("working set limit must be positive"));
        }

        let _guard = inner.admin.lock();
        let slot = inner.slot(cache_id)?;
        let limit = match limit {
            Some(limit) => limit,
            None => {
                let priority_total = inner.registered().iter().map(|s| s.priority() as u128).sum::<u128>().max(1);
                let share =
                    inner.budget.tenant_limit(tenant_id) as u128 * slot.priority() as u128 / priority_total;
                let limit = share * inner.working_set_limit_percentage as u128 / 100;
                (limit as usize).max(inner.store.block_size())
            }
        };
        let instance = inner.instances.get_or_create(&slot, tenant_id);
        let quota = inner.working_sets.create(instance, limit);

        tracing::debug!(
            "[global]: create working set {} of {}, limit: {limit}",
            quota.id(),
            quota.instance().key()
        );
        Ok(WorkingSet::new(self.clone(), quota))
    }

    /// Bytes held by the tenant in the cache, blocks and index nodes included.
    pub fn size(&self, cache_id: CacheId, tenant_id: TenantId) -> usize {
        self.inner.instance(cache_id, tenant_id).map(|i| i.size()).unwrap_or_default()
    }

    /// Bytes of blocks held by the tenant in the cache.
    pub fn store_size(&self, cache_id: CacheId, tenant_id: TenantId) -> usize {
        self.inner
            .instance(cache_id, tenant_id)
            .map(|i| i.store_size())
            .unwrap_or_default()
    }

    /// Live entries of the tenant in the cache.
    pub fn count(&self, cache_id: CacheId, tenant_id: TenantId) -> usize {
        self.inner
            .instance(cache_id, tenant_id)
            .map(|i| i.item_count())
            .unwrap_or_default()
    }

    /// Lookup hits of the tenant in the cache.
    pub fn hit_count(&self, cache_id: CacheId, tenant_id: TenantId) -> u64 {
        self.inner
            .instance(cache_id, tenant_id)
            .map(|i| i.hit_count())
            .unwrap_or_default()
    }

    /// Lookup misses of the tenant in the cache.
    pub fn miss_count(&self, cache_id: CacheId, tenant_id: TenantId) -> u64 {
        self.inner
            .instance(cache_id, tenant_id)
            .map(|i| i.miss_count())
            .unwrap_or_default()
    }

    /// `hit / (hit + miss)` of the tenant in the cache, `0.0` before any lookup.
    pub fn hit_rate(&self, cache_id: CacheId, tenant_id: TenantId) -> f64 {
        self.inner
            .instance(cache_id, tenant_id)
            .map(|i| i.hit_rate())
            .unwrap_or_default()
    }

    /// Usage of every cache the tenant has touched, ordered by cache id.
    pub fn get_tenant_cache_info(&self, tenant_id: TenantId) -> Vec<CacheInfo> {
        self.inner
            .instances
            .tenant(tenant_id)
            .iter()
            .map(|i| i.info())
            .sorted_by_key(|info| info.cache_id)
            .collect_vec()
    }

    /// Usage of every instance, ordered by tenant then cache id.
    pub fn get_all_cache_info(&self) -> Vec<CacheInfo> {
        self.inner
            .instances
            .all()
            .iter()
            .map(|i| i.info())
            .sorted_by_key(|info| (info.tenant_id, info.cache_id))
            .collect_vec()
    }

    /// Log the usage of every instance and return it.
    pub fn dump(&self) -> Vec<CacheInfo> {
        let stats = self.statistics();
        tracing::info!(
            "[global]: cache {:?} allocated {} of {} bytes in {} blocks",
            self.inner.name,
            stats.allocated,
            stats.capacity,
            stats.blocks
        );
        let infos = self.get_all_cache_info();
        for info in infos.iter() {
            tracing::info!(
                "[global]: tenant: {}, cache: {:?} ({}), priority: {}, hold: {:?}, store: {}, nodes: {}, items: {}, hit: {}, miss: {}, hit rate: {:.4}",
                info.tenant_id,
                info.name,
                info.cache_id,
                info.priority,
                info.hold_size,
                info.store_size,
                info.node_size,
                info.item_count,
                info.hit_count,
                info.miss_count,
                info.hit_rate
            );
        }
        infos
    }

    /// Erase entries in bulk. Returns the live entries erased.
    ///
    /// With neither a tenant nor a name everything is erased. A tenant alone erases all caches of the tenant, a
    /// name alone erases the cache for all tenants.
    pub fn erase_cache(&self, tenant_id: Option<TenantId>, name: Option<&str>) -> Result<usize> {
        let inner = &self.inner;
        inner.check_open()?;
        let cache_id = name.map(|name| inner.slot_by_name(name)).transpose()?.map(|slot| slot.id());

        let nodes = inner.index.erase_if(&inner.store, |node| {
            cache_id.is_none_or(|id| node.cache_id == id)
                && tenant_id.is_none_or(|t| node.instance.key().tenant_id == t)
        });
        let erased = nodes.len();
        nodes.into_iter().for_each(|node| inner.release_node(node));
        inner.metrics.erase.increase(erased as _);

        tracing::info!("[global]: erase cache, tenant: {tenant_id:?}, name: {name:?}, erased: {erased}");
        Ok(erased)
    }

    /// Set or clear the hold size of the tenant in the named cache. Wash never takes the tenant below it.
    pub fn set_hold_size(&self, tenant_id: TenantId, name: &str, hold_size: Option<usize>) -> Result<()> {
        let slot = self.inner.slot_by_name(name)?;
        self.inner
            .instances
            .get_or_create(&slot, tenant_id)
            .set_hold_size(hold_size);
        tracing::info!("[global]: set hold size of tenant {tenant_id} in cache {name:?} to {hold_size:?}");
        Ok(())
    }

    /// The hold size of the tenant in the named cache.
    pub fn get_hold_size(&self, tenant_id: TenantId, name: &str) -> Result<Option<usize>> {
        let slot = self.inner.slot_by_name(name)?;
        Ok(self
            .inner
            .instance(slot.id(), tenant_id)
            .and_then(|instance| instance.hold_size()))
    }

    /// Average block bytes per live entry of the tenant in the named cache.
    pub fn get_avg_cache_item_size(&self, tenant_id: TenantId, name: &str) -> Result<usize> {
        let slot = self.inner.slot_by_name(name)?;
        Ok(self
            .inner
            .instance(slot.id(), tenant_id)
            .map(|instance| instance.avg_item_size())
            .unwrap_or_default())
    }

    /// Change the priorities of caches by name. Nothing changes unless every update is valid.
    pub fn reload_priority(&self, priorities: &[(&str, i64)]) -> Result<()> {
        let _guard = self.inner.admin.lock();
        let slots = priorities
            .iter()
            .map(|&(name, priority)| {
                if priority <= 0 {
                    return Err(Error::invalid_argument("cache priority must be positive")
                        .with_context("name", name)
                        .with_context("priority", priority));
                }
                Ok((self.inner.slot_by_name(name)?, priority))
            })
            .collect::<Result<Vec<_>>>()?;
        for (slot, priority) in slots {
            slot.set_priority(priority);
            tracing::info!("[global]: reload priority of cache {:?} to {priority}", slot.name());
        }
        Ok(())
    }

    /// Reschedule the wash task.
    pub fn reload_wash_interval(&self, interval: Duration) -> Result<()> {
        self.inner.check_open()?;
        if interval.is_zero() {
            return Err(Error::invalid_argument("wash interval must be positive"));
        }
        if let Some(maintenance) = self.inner.maintenance.lock().as_ref() {
            maintenance.reload_wash_interval(interval);
        }
        Ok(())
    }

    /// Reclaim at least `wash_size` bytes, or one block if `single`, on behalf of the tenant.
    ///
    /// Fails with [`ErrorKind::NoReclaimableMemory`] if not enough unpinned memory can be taken. Blocks reclaimed
    /// before the failure stay reclaimed.
    pub fn sync_wash_mbs(&self, tenant_id: TenantId, wash_size: usize, single: bool) -> Result<Vec<WashedBlock>> {
        self.inner.check_open()?;
        self.inner.sync_wash_mbs(tenant_id, wash_size, single)
    }

    /// Run one wash tick now. Returns the bytes reclaimed.
    pub fn wash(&self) -> usize {
        self.inner.wash()
    }

    /// Run one replace tick now. Returns the stale index nodes unlinked.
    pub fn replace(&self) -> usize {
        self.inner.replace()
    }

    /// Index bucket count.
    pub fn bucket_num(&self) -> usize {
        self.inner.index.bucket_num()
    }

    /// Live entries of the cache in one index bucket, each pinning its block.
    pub fn multi_get(&self, cache_id: CacheId, bucket: usize) -> Result<Vec<RawCacheEntry>> {
        self.inner.check_open()?;
        self.inner.slot(cache_id)?;
        Ok(self.inner.index.multi_get(&self.inner.store, bucket, Some(cache_id)))
    }

    /// Block store statistics.
    pub fn statistics(&self) -> StoreStatistics {
        self.inner.store.statistics()
    }

    /// Working sets not destroyed yet.
    pub fn working_set_count(&self) -> usize {
        self.inner.working_sets.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use kvcache_common::id::SYS_TENANT_ID;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::{budget::StaticMemoryBudget, config::GlobalCacheBuilder};

    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    fn cache(capacity: usize, block_size: usize) -> GlobalCache {
        GlobalCacheBuilder::new("test", capacity)
            .with_block_size(block_size)
            .with_bucket_num(64)
            .with_background_tasks(false)
            .build()
            .unwrap()
    }

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<GlobalCache>();
        is_send_sync_static::<WorkingSet>();
    }

    #[test_log::test]
    fn test_register() {
        let cache = GlobalCacheBuilder::new("test", MB)
            .with_block_size(64 * KB)
            .with_max_caches(2)
            .with_background_tasks(false)
            .build()
            .unwrap();

        assert_eq!(cache.register_cache("", 1).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(cache.register_cache("a", 0).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let a = cache.register_cache("a", 1).unwrap();
        assert_eq!(cache.register_cache("a", 2).unwrap_err().kind(), ErrorKind::DuplicateName);
        let b = cache.register_cache("b", 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.register_cache("c", 1).unwrap_err().kind(), ErrorKind::TooManyCaches);

        cache.deregister_cache(a).unwrap();
        assert_eq!(cache.register_cache("c", 1).unwrap(), a);
        assert_eq!(cache.deregister_cache(42).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(cache.set_priority(b, -1).unwrap_err().kind(), ErrorKind::InvalidArgument);
        cache.set_priority(b, 7).unwrap();
    }

    #[test_log::test]
    fn test_blk_cache_scenario() {
        let cache = cache(4 * MB, 64 * KB);
        let id = cache.register_cache("blk_cache", 1).unwrap();
        let value = [7u8; 64];

        cache.put(id, SYS_TENANT_ID, b"t1:100", &value, true).unwrap();
        let entry = cache.get(id, SYS_TENANT_ID, b"t1:100").unwrap();
        assert_eq!(entry.value(), &value);
        assert_eq!(entry.key(), b"t1:100");
        assert!(entry.handle().is_valid());
        drop(entry);

        cache.erase(id, SYS_TENANT_ID, b"t1:100").unwrap();
        assert!(cache.get(id, SYS_TENANT_ID, b"t1:100").unwrap_err().is_not_found());
    }

    #[test_log::test]
    fn test_put_overwrite() {
        let cache = cache(4 * MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        cache.put(id, 1, b"k", b"v1", false).unwrap();
        assert!(cache.put(id, 1, b"k", b"v2", false).unwrap_err().is_entry_exists());
        assert_eq!(cache.get(id, 1, b"k").unwrap().value(), b"v1");
        assert_eq!(cache.count(id, 1), 1);

        cache.put(id, 1, b"k", b"v3", true).unwrap();
        assert_eq!(cache.get(id, 1, b"k").unwrap().value(), b"v3");
        assert_eq!(cache.count(id, 1), 1);
    }

    #[test_log::test]
    fn test_concurrent_put_exactly_one_wins() {
        let cache = cache(16 * MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        for round in 0..64u32 {
            let key = round.to_be_bytes();
            let barrier = Arc::new(Barrier::new(2));
            let handles = [b"v1", b"v2"]
                .into_iter()
                .map(|value| {
                    let cache = cache.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        cache.put(id, 1, &key, value, false).map(|_| *value)
                    })
                })
                .collect_vec();
            let results = handles.into_iter().map(|h| h.join().unwrap()).collect_vec();

            let winners = results.iter().filter_map(|r| r.as_ref().ok()).collect_vec();
            assert_eq!(winners.len(), 1);
            assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| e.is_entry_exists()));
            assert_eq!(cache.get(id, 1, &key).unwrap().value(), winners[0]);
        }
        assert_eq!(cache.count(id, 1), 64);
    }

    #[test_log::test]
    fn test_handle_pins_block() {
        let cache = cache(MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        let entry = cache.put_and_fetch(id, 1, b"k", &[1; 128], true).unwrap();
        let block = entry.handle().block().unwrap();
        cache.erase(id, 1, b"k").unwrap();

        // Neither wash nor sync wash may take a pinned block.
        cache.wash();
        assert!(cache.sync_wash_mbs(1, 64 * KB, true).is_err());
        assert_eq!(entry.value(), &[1; 128]);
        assert!(cache.inner.store.is_live(block));

        let mut handle = entry.handle().clone();
        drop(entry);
        assert!(cache.inner.store.is_live(block));
        handle.reset();
        assert!(!handle.is_valid());

        // The last pin of a block without live entries frees it.
        assert!(!cache.inner.store.is_live(block));
        assert_eq!(cache.statistics().allocated, 0);
        assert_eq!(cache.store_size(id, 1), 0);
    }

    #[test_log::test]
    fn test_erase_idempotent() {
        let cache = cache(MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();
        cache.put(id, 1, b"a", b"1", true).unwrap();

        let before = cache.get_all_cache_info();
        assert!(cache.erase(id, 1, b"absent").unwrap_err().is_not_found());
        assert_eq!(cache.get_all_cache_info(), before);

        cache.erase(id, 1, b"a").unwrap();
        assert!(cache.erase(id, 1, b"a").unwrap_err().is_not_found());
    }

    #[test_log::test]
    fn test_alloc_put_kvpair() {
        let cache = cache(MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        let mut entry = cache.alloc(id, 2, 3, 5).unwrap();
        assert_eq!(entry.instance_key(), InstanceKey::new(id, 2));
        entry.key_mut().copy_from_slice(b"key");
        entry.value_mut().copy_from_slice(b"value");
        let fetched = cache.put_kvpair(entry, false).unwrap();
        assert_eq!(fetched.value(), b"value");

        // The loser of a put gives its bytes back.
        let allocated = cache.statistics().allocated;
        let mut entry = cache.alloc(id, 2, 3, 5).unwrap();
        entry.key_mut().copy_from_slice(b"key");
        assert!(cache.put_kvpair(entry, false).unwrap_err().is_entry_exists());
        assert_eq!(cache.count(id, 2), 1);
        assert_eq!(cache.statistics().allocated, allocated);

        // So does an entry dropped before publishing.
        drop(cache.alloc(id, 2, 3, 5).unwrap());
        assert_eq!(cache.count(id, 2), 1);

        assert_eq!(cache.alloc(id, 2, 0, 5).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test_log::test]
    fn test_put_kvpair_from_another_cache() {
        let a = cache(MB, 64 * KB);
        let b = cache(MB, 64 * KB);
        let ida = a.register_cache("a", 1).unwrap();
        let idb = b.register_cache("b", 1).unwrap();
        b.put(idb, 1, b"other", &[0; 32], true).unwrap();

        let mut entry = a.alloc(ida, 1, 4, 8).unwrap();
        entry.key_mut().copy_from_slice(b"kkkk");
        entry.value_mut().copy_from_slice(&[0xaa; 8]);
        let err = b.put_kvpair(entry, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert!(b.get(idb, 1, b"kkkk").unwrap_err().is_not_found());
        assert_eq!(b.count(idb, 1), 1);
        // The rejected entry is rolled back in the cache it was reserved from.
        assert_eq!(a.count(ida, 1), 0);

        let ws = b.create_working_set(idb, 1, Some(KB)).unwrap();
        let mut entry = a.alloc(ida, 1, 4, 8).unwrap();
        entry.key_mut().copy_from_slice(b"kkkk");
        assert_eq!(ws.put_kvpair(entry, true).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test_log::test]
    fn test_alloc_size_overflow() {
        let cache = cache(MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        assert_eq!(cache.alloc(id, 1, 1, usize::MAX).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(cache.alloc(id, 1, 1, usize::MAX - 100).unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(cache.alloc(id, 1, 1, 2 * MB).unwrap_err().kind(), ErrorKind::OutOfMemory);

        let ws = cache.create_working_set(id, 1, Some(KB)).unwrap();
        let kept = ws.alloc(8, 100).unwrap();
        assert_eq!(ws.alloc(1, usize::MAX).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(ws.alloc(8, usize::MAX - 100).unwrap_err().kind(), ErrorKind::QuotaExceeded);
        assert_eq!(ws.used(), 108);
        drop(kept);

        // Nothing was washed or leaked by the rejected requests.
        cache.put(id, 1, b"k", b"v", true).unwrap();
        assert_eq!(cache.get(id, 1, b"k").unwrap().value(), b"v");
        assert_eq!(cache.statistics().allocated, 64 * KB);
    }

    #[test_log::test]
    fn test_get_cache_id() {
        let cache = cache(MB, 64 * KB);
        let a = cache.register_cache("a", 1).unwrap();
        let b = cache.register_cache("b", 2).unwrap();

        assert_eq!(cache.get_cache_id("a").unwrap(), a);
        assert_eq!(cache.get_cache_id("b").unwrap(), b);
        assert_eq!(cache.get_cache_id("c").unwrap_err().kind(), ErrorKind::InvalidArgument);

        cache.deregister_cache(a).unwrap();
        assert_eq!(cache.get_cache_id("a").unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test_log::test]
    fn test_large_entry() {
        let cache = cache(MB, 16 * KB);
        let id = cache.register_cache("c", 1).unwrap();
        let value = vec![3u8; 100 * KB];

        cache.put(id, 1, b"large", &value, true).unwrap();
        assert_eq!(cache.get(id, 1, b"large").unwrap().value(), &value[..]);
        assert_eq!(cache.store_size(id, 1), 100 * KB + 5);
    }

    #[test_log::test]
    fn test_sync_wash_on_full_store() {
        let cache = cache(256 * KB, 16 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        // Far more than the store can hold: old blocks are washed on demand.
        for i in 0..256u32 {
            cache.put(id, 1, &i.to_be_bytes(), &[i as u8; 4 * KB], true).unwrap();
        }
        assert!(cache.statistics().allocated <= 256 * KB);
        assert_eq!(cache.get(id, 1, &255u32.to_be_bytes()).unwrap().value(), &[255u8; 4 * KB]);
        assert!(cache.get(id, 1, &0u32.to_be_bytes()).unwrap_err().is_not_found());

        assert!(cache.replace() > 0);
    }

    #[test_log::test]
    fn test_sync_wash_out_of_memory_when_pinned() {
        let cache = cache(64 * KB, 16 * KB);
        let id = cache.register_cache("c", 1).unwrap();

        let pinned = (0..4u32)
            .map(|i| cache.put_and_fetch(id, 1, &i.to_be_bytes(), &[0; 16 * KB - 4], true).unwrap())
            .collect_vec();
        let err = cache.put(id, 1, b"more", &[0; KB], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(
            err.source().unwrap().downcast_ref::<Error>().unwrap().kind(),
            ErrorKind::NoReclaimableMemory
        );

        drop(pinned);
        cache.put(id, 1, b"more", &[0; KB], true).unwrap();
    }

    #[test_log::test]
    fn test_wash_tenant_over_limit() {
        let cache = GlobalCacheBuilder::new("test", 4 * MB)
            .with_block_size(16 * KB)
            .with_bucket_num(64)
            .with_memory_budget(StaticMemoryBudget::new(4 * MB).with_tenant_limit(1, 64 * KB))
            .with_background_tasks(false)
            .build()
            .unwrap();
        let low = cache.register_cache("low", 1).unwrap();
        let high = cache.register_cache("high", 10).unwrap();

        for i in 0..8u32 {
            cache.put(low, 1, &i.to_be_bytes(), &[0; 15 * KB], true).unwrap();
            cache.put(high, 1, &i.to_be_bytes(), &[0; 15 * KB], true).unwrap();
            cache.put(low, 2, &i.to_be_bytes(), &[0; 15 * KB], true).unwrap();
        }
        assert_eq!(cache.store_size(low, 1) + cache.store_size(high, 1), 16 * 16 * KB);

        let washed = cache.wash();
        assert!(washed >= 16 * 16 * KB - 64 * KB);
        assert!(cache.store_size(low, 1) + cache.store_size(high, 1) <= 64 * KB);
        // The low priority cache pays first.
        assert!(cache.store_size(low, 1) <= cache.store_size(high, 1));
        // Other tenants are untouched.
        assert_eq!(cache.store_size(low, 2), 8 * 16 * KB);
    }

    #[test_log::test]
    fn test_hold_size() {
        let cache = GlobalCacheBuilder::new("test", 4 * MB)
            .with_block_size(16 * KB)
            .with_bucket_num(64)
            .with_memory_budget(StaticMemoryBudget::new(4 * MB).with_tenant_limit(1, 32 * KB))
            .with_background_tasks(false)
            .build()
            .unwrap();
        let id = cache.register_cache("c", 1).unwrap();

        assert_eq!(cache.get_hold_size(1, "c").unwrap(), None);
        cache.set_hold_size(1, "c", Some(96 * KB)).unwrap();
        assert_eq!(cache.get_hold_size(1, "c").unwrap(), Some(96 * KB));
        assert_eq!(cache.get_hold_size(1, "absent").unwrap_err().kind(), ErrorKind::InvalidArgument);

        for i in 0..8u32 {
            cache.put(id, 1, &i.to_be_bytes(), &[0; 15 * KB], true).unwrap();
        }
        cache.wash();
        assert_eq!(cache.store_size(id, 1), 96 * KB);

        cache.set_hold_size(1, "c", None).unwrap();
        cache.wash();
        assert!(cache.store_size(id, 1) <= 32 * KB);
    }

    #[test_log::test]
    fn test_working_set_quota() {
        let cache = cache(MB, 64 * KB);
        let id = cache.register_cache("c", 1).unwrap();
        let ws = cache.create_working_set(id, 1, Some(1024)).unwrap();
        assert_eq!(cache.working_set_count(), 1);

        let first = ws.alloc(8, 592).unwrap();
        assert_eq!(ws.used(), 600);
        let err = ws.alloc(8, 592).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(ws.used(), 600);

        // Rolled back bytes are refunded.
        drop(first);
        assert_eq!(ws.used(), 0);

        ws.put(b"k", &[1; 100], false).unwrap();
        assert_eq!(ws.get(b"k").unwrap().value(), &[1; 100]);
        assert_eq!(cache.get(id, 1, b"k").unwrap().value(), &[1; 100]);
        ws.erase(b"k").unwrap();
        assert!(ws.get(b"k").unwrap_err().is_not_found());

        drop(ws);
        assert_eq!(cache.working_set_count(), 0);
    }

    #[test_log::test]
    fn test_working_set_default_limit() {
        let cache = cache(64 * MB, 64 * KB);
        let a = cache.register_cache("a", 1).unwrap();
        cache.register_cache("b", 3).unwrap();

        let ws = cache.create_working_set(a, 1, None).unwrap();
        assert_eq!(ws.limit(), 64 * MB / 4 * 5 / 100);
        assert_eq!(cache.create_working_set(a, 1, Some(0)).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test_log::test]
    fn test_working_set_blocks_not_washed() {
        let cache = GlobalCacheBuilder::new("test", 4 * MB)
            .with_block_size(16 * KB)
            .with_bucket_num(64)
            .with_memory_budget(StaticMemoryBudget::new(4 * MB).with_tenant_limit(1, 16 * KB))
            .with_background_tasks(false)
            .build()
            .unwrap();
        let id = cache.register_cache("c", 1).unwrap();
        let ws = cache.create_working_set(id, 1, Some(MB)).unwrap();

        for i in 0..4u32 {
            ws.put(&i.to_be_bytes(), &[0; 15 * KB], true).unwrap();
        }
        assert_eq!(cache.wash(), 0);
        assert!(ws.get(&0u32.to_be_bytes()).is_ok());

        // Entries of a destroyed working set age out through the normal rules.
        drop(ws);
        assert!(cache.wash() > 0);
    }

    #[test_log::test]
    fn test_deregister_reclaims() {
        let cache = cache(MB, 16 * KB);
        let id = cache.register_cache("c", 1).unwrap();
        for i in 0..16u32 {
            cache.put(id, 1, &i.to_be_bytes(), &[0; 4 * KB], true).unwrap();
        }
        let pinned = cache.get(id, 1, &0u32.to_be_bytes()).unwrap();
        let block = pinned.handle().block().unwrap();
        assert!(cache.statistics().allocated > 0);

        cache.deregister_cache(id).unwrap();
        assert_eq!(cache.statistics().allocated, 16 * KB);
        assert!(cache.get(id, 1, &0u32.to_be_bytes()).is_err());
        assert_eq!(pinned.value(), &[0; 4 * KB]);

        drop(pinned);
        assert!(!cache.inner.store.is_live(block));
        assert_eq!(cache.statistics().allocated, 0);

        // A new cache reusing the id sees nothing of the old one.
        let reused = cache.register_cache("d", 1).unwrap();
        assert_eq!(reused, id);
        assert!(cache.get(reused, 1, &1u32.to_be_bytes()).unwrap_err().is_not_found());
        assert_eq!(cache.count(reused, 1), 0);
    }

    #[test_log::test]
    fn test_erase_cache() {
        let cache = cache(4 * MB, 16 * KB);
        let a = cache.register_cache("a", 1).unwrap();
        let b = cache.register_cache("b", 1).unwrap();
        for i in 0..4u32 {
            for (id, tenant) in [(a, 1), (a, 2), (b, 1), (b, 2)] {
                cache.put(id, tenant, &[tenant as u8, i as u8], &[0; 64], true).unwrap();
            }
        }

        assert_eq!(cache.erase_cache(Some(1), Some("a")).unwrap(), 4);
        assert_eq!(cache.count(a, 1), 0);
        assert_eq!(cache.erase_cache(None, Some("b")).unwrap(), 8);
        assert_eq!(cache.erase_cache(Some(2), None).unwrap(), 4);
        assert_eq!(cache.erase_cache(None, None).unwrap(), 0);
        assert_eq!(cache.erase_cache(None, Some("absent")).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(cache.statistics().allocated, 0);
    }

    #[test_log::test]
    fn test_diagnostics() {
        let cache = cache(MB, 16 * KB);
        let id = cache.register_cache("c", 5).unwrap();
        assert_eq!(cache.hit_rate(id, 1), 0.0);
        assert_eq!(cache.size(id, 1), 0);

        cache.put(id, 1, b"a", &[0; 99], true).unwrap();
        cache.put(id, 1, b"b", &[0; 99], true).unwrap();
        cache.get(id, 1, b"a").unwrap();
        cache.get(id, 1, b"x").unwrap_err();

        assert_eq!(cache.hit_count(id, 1), 1);
        assert_eq!(cache.miss_count(id, 1), 1);
        assert_eq!(cache.hit_rate(id, 1), 0.5);
        assert_eq!(cache.count(id, 1), 2);
        assert!(cache.size(id, 1) > cache.store_size(id, 1));
        assert_eq!(cache.get_avg_cache_item_size(1, "c").unwrap(), 16 * KB / 2);

        let infos = cache.get_tenant_cache_info(1);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "c");
        assert_eq!(infos[0].priority, 5);
        assert_eq!(cache.dump(), cache.get_all_cache_info());
        assert!(cache.get_tenant_cache_info(2).is_empty());
    }

    #[test_log::test]
    fn test_reload_priority() {
        let cache = cache(MB, 16 * KB);
        let a = cache.register_cache("a", 1).unwrap();
        cache.register_cache("b", 1).unwrap();
        cache.put(a, 1, b"k", b"v", true).unwrap();

        assert!(cache.reload_priority(&[("a", 3), ("absent", 2)]).is_err());
        assert!(cache.reload_priority(&[("a", 3), ("b", 0)]).is_err());
        assert_eq!(cache.get_tenant_cache_info(1)[0].priority, 1);

        cache.reload_priority(&[("a", 3), ("b", 2)]).unwrap();
        assert_eq!(cache.get_tenant_cache_info(1)[0].priority, 3);
    }

    #[test_log::test]
    fn test_multi_get() {
        let cache = GlobalCacheBuilder::new("test", MB)
            .with_block_size(16 * KB)
            .with_bucket_num(4)
            .with_background_tasks(false)
            .build()
            .unwrap();
        let a = cache.register_cache("a", 1).unwrap();
        let b = cache.register_cache("b", 1).unwrap();
        for i in 0..32u32 {
            cache.put(a, 1, &i.to_be_bytes(), &[1], true).unwrap();
            cache.put(b, 1, &i.to_be_bytes(), &[2], true).unwrap();
        }

        let entries = (0..cache.bucket_num())
            .flat_map(|bucket| cache.multi_get(a, bucket).unwrap())
            .collect_vec();
        assert_eq!(entries.len(), 32);
        assert!(entries.iter().all(|e| e.value() == [1]));
        assert!(cache.multi_get(a, 100).unwrap().is_empty());
    }

    #[test_log::test]
    fn test_background_tasks_and_close() {
        let cache = GlobalCacheBuilder::new("test", MB)
            .with_block_size(16 * KB)
            .with_wash_interval(Duration::from_millis(10))
            .with_replace_interval(Duration::from_millis(10))
            .with_memory_budget(StaticMemoryBudget::new(MB).with_tenant_limit(1, 32 * KB))
            .build()
            .unwrap();
        let id = cache.register_cache("c", 1).unwrap();
        for i in 0..16u32 {
            cache.put(id, 1, &i.to_be_bytes(), &[0; 15 * KB], true).unwrap();
        }
        cache.reload_wash_interval(Duration::from_millis(5)).unwrap();
        assert!(cache.reload_wash_interval(Duration::ZERO).is_err());

        let mut washed = false;
        for _ in 0..200 {
            if cache.store_size(id, 1) <= 32 * KB {
                washed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(washed);

        cache.close();
        assert!(cache.is_closed());
        assert_eq!(cache.get(id, 1, b"k").unwrap_err().kind(), ErrorKind::NotInitialized);
        assert_eq!(cache.put(id, 1, b"k", b"v", true).unwrap_err().kind(), ErrorKind::NotInitialized);
        cache.close();
    }

    fn value_of(key: u64) -> Vec<u8> {
        key.to_le_bytes().repeat(key as usize % 64 + 1)
    }

    #[test_log::test]
    fn test_global_cache_fuzzy() {
        let cache = GlobalCacheBuilder::new("test", 512 * KB)
            .with_block_size(16 * KB)
            .with_bucket_num(256)
            .with_wash_interval(Duration::from_millis(1))
            .with_replace_interval(Duration::from_millis(1))
            .with_memory_budget(StaticMemoryBudget::new(512 * KB).with_tenant_limit(3, 64 * KB))
            .build()
            .unwrap();
        let a = cache.register_cache("a", 1).unwrap();
        let b = cache.register_cache("b", 4).unwrap();

        let handles = (0..8u64)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(i);
                    let mut held = vec![];
                    for _ in 0..20000 {
                        let id = if rng.random_bool(0.5) { a } else { b };
                        let tenant = rng.random_range(1..=4u64);
                        let key = rng.random_range(0..2048u64);
                        match rng.random_range(0..10) {
                            0..=4 => match cache.get(id, tenant, &key.to_be_bytes()) {
                                Ok(entry) => {
                                    assert_eq!(entry.value(), &value_of(key)[..]);
                                    if held.len() < 4 {
                                        held.push(entry);
                                    }
                                }
                                Err(e) => assert!(e.is_not_found()),
                            },
                            5..=7 => match cache.put(id, tenant, &key.to_be_bytes(), &value_of(key), rng.random_bool(0.5)) {
                                Ok(()) => {}
                                Err(e) => assert!(
                                    matches!(e.kind(), ErrorKind::EntryExists | ErrorKind::OutOfMemory),
                                    "{e:?}"
                                ),
                            },
                            8 => match cache.erase(id, tenant, &key.to_be_bytes()) {
                                Ok(()) => {}
                                Err(e) => assert!(e.is_not_found()),
                            },
                            _ => held.clear(),
                        }
                    }
                })
            })
            .collect_vec();
        handles.into_iter().for_each(|handle| handle.join().unwrap());

        assert!(cache.statistics().allocated <= 512 * KB);

        // Every reserved byte is accounted, so erasing everything frees every block.
        cache.erase_cache(None, None).unwrap();
        let instances = cache.inner.instances.all();
        assert!(instances.iter().all(|i| i.item_count() == 0), "{:?}", cache.get_all_cache_info());
        assert_eq!(cache.statistics().allocated, 0);
        cache.close();
    }
}

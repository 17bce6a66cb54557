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
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use hashbrown::{hash_map::Entry as HashMapEntry, HashMap};
use itertools::Itertools;
use kvcache_common::id::{CacheId, InstanceKey, TenantId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::store::BlockRef;

const INSTANCE_SHARDS: usize = 16;

/// A registered cache.
#[derive(Debug)]
pub(crate) struct CacheSlot {
    id: CacheId,
    name: String,
    priority: AtomicI64,
}

impl CacheSlot {
    pub(crate) fn new(id: CacheId, name: String, priority: i64) -> Self {
        Self {
            id,
            name,
            priority: AtomicI64::new(priority),
        }
    }

    pub(crate) fn id(&self) -> CacheId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }
}

/// Usage snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    /// Registered cache id.
    pub cache_id: CacheId,
    /// Registered cache name.
    pub name: String,
    /// Tenant id.
    pub tenant_id: TenantId,
    /// Cache priority.
    pub priority: i64,
    /// Manual hold size override.
    pub hold_size: Option<usize>,
    /// Bytes of memory blocks held.
    pub store_size: usize,
    /// Bytes of index nodes.
    pub node_size: usize,
    /// Live entries.
    pub item_count: usize,
    /// Lookup hits.
    pub hit_count: u64,
    /// Lookup misses.
    pub miss_count: u64,
    /// `hit / (hit + miss)`, `0.0` before any lookup.
    pub hit_rate: f64,
}

/// Usage record of one tenant's slice of one cache.
#[derive(Debug)]
pub(crate) struct Instance {
    key: InstanceKey,
    slot: Arc<CacheSlot>,
    valid: AtomicBool,

    store_size: AtomicUsize,
    item_count: AtomicUsize,
    node_size: AtomicUsize,
    hit: AtomicU64,
    miss: AtomicU64,
    hold_size: Mutex<Option<usize>>,

    /// Blocks in allocation order, oldest first. May contain stale references.
    blocks: Mutex<VecDeque<BlockRef>>,
    current: Mutex<Option<BlockRef>>,
}

impl Instance {
    pub(crate) fn new(key: InstanceKey, slot: Arc<CacheSlot>) -> Self {
        Self {
            key,
            slot,
            valid: AtomicBool::new(true),
            store_size: AtomicUsize::new(0),
            item_count: AtomicUsize::new(0),
            node_size: AtomicUsize::new(0),
            hit: AtomicU64::new(0),
            miss: AtomicU64::new(0),
            hold_size: Mutex::new(None),
            blocks: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> InstanceKey {
        self.key
    }

    pub(crate) fn slot(&self) -> &Arc<CacheSlot> {
        &self.slot
    }

    pub(crate) fn priority(&self) -> i64 {
        self.slot.priority()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn current(&self) -> &Mutex<Option<BlockRef>> {
        &self.current
    }

    pub(crate) fn store_size(&self) -> usize {
        self.store_size.load(Ordering::Relaxed)
    }

    pub(crate) fn item_count(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    pub(crate) fn node_size(&self) -> usize {
        self.node_size.load(Ordering::Relaxed)
    }

    /// Block bytes plus index node bytes.
    pub(crate) fn size(&self) -> usize {
        self.store_size() + self.node_size()
    }

    pub(crate) fn hit_count(&self) -> u64 {
        self.hit.load(Ordering::Relaxed)
    }

    pub(crate) fn miss_count(&self) -> u64 {
        self.miss.load(Ordering::Relaxed)
    }

    pub(crate) fn hit_rate(&self) -> f64 {
        let hit = self.hit_count();
        let total = hit + self.miss_count();
        match total {
            0 => 0.0,
            total => hit as f64 / total as f64,
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hold_size(&self) -> Option<usize> {
        *self.hold_size.lock()
    }

    pub(crate) fn set_hold_size(&self, hold_size: Option<usize>) {
        *self.hold_size.lock() = hold_size;
    }

    /// Average bytes of block memory per live entry.
    pub(crate) fn avg_item_size(&self) -> usize {
        match self.item_count() {
            0 => 0,
            count => self.store_size() / count,
        }
    }

    pub(crate) fn inc_item_count(&self) {
        self.item_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_item_count(&self) {
        self.item_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add_node_size(&self, bytes: usize) {
        self.node_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_node_size(&self, bytes: usize) {
        self.node_size.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn on_block_attached(&self, block: BlockRef, capacity: usize) {
        self.store_size.fetch_add(capacity, Ordering::Relaxed);
        self.blocks.lock().push_back(block);
    }

    pub(crate) fn on_block_freed(&self, block: BlockRef, capacity: usize, live: usize) {
        self.store_size.fetch_sub(capacity, Ordering::Relaxed);
        self.item_count.fetch_sub(live, Ordering::Relaxed);
        self.forget_block(block);
    }

    pub(crate) fn forget_block(&self, block: BlockRef) {
        self.blocks.lock().retain(|b| *b != block);
    }

    /// Up to `limit` blocks, oldest first.
    pub(crate) fn oldest_blocks(&self, limit: usize) -> Vec<BlockRef> {
        self.blocks.lock().iter().take(limit).copied().collect_vec()
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    pub(crate) fn info(&self) -> CacheInfo {
        CacheInfo {
            cache_id: self.key.cache_id,
            name: self.slot.name().to_string(),
            tenant_id: self.key.tenant_id,
            priority: self.priority(),
            hold_size: self.hold_size(),
            store_size: self.store_size(),
            node_size: self.node_size(),
            item_count: self.item_count(),
            hit_count: self.hit_count(),
            miss_count: self.miss_count(),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Instances of all registered caches, sharded by key.
#[derive(Debug)]
pub(crate) struct InstanceRegistry {
    shards: Box<[RwLock<HashMap<InstanceKey, Arc<Instance>>>]>,
}

impl InstanceRegistry {
    pub(crate) fn new() -> Self {
        let shards = (0..INSTANCE_SHARDS).map(|_| RwLock::new(HashMap::new())).collect_vec();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    fn shard(&self, key: &InstanceKey) -> &RwLock<HashMap<InstanceKey, Arc<Instance>>> {
        let index = (key.tenant_id as usize).wrapping_add(key.cache_id as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Get the instance of the tenant in the cache, creating it on first access.
    ///
    /// An instance left over from a deregistered cache that reused the same id is replaced.
    pub(crate) fn get_or_create(&self, slot: &Arc<CacheSlot>, tenant_id: TenantId) -> Arc<Instance> {
        let key = InstanceKey::new(slot.id(), tenant_id);
        let shard = self.shard(&key);

        if let Some(instance) = shard.read().get(&key) {
            if Arc::ptr_eq(instance.slot(), slot) {
                return instance.clone();
            }
        }

        let mut map = shard.write();
        match map.entry(key) {
            HashMapEntry::Occupied(mut o) => {
                if Arc::ptr_eq(o.get().slot(), slot) {
                    return o.get().clone();
                }
                let instance = Arc::new(Instance::new(key, slot.clone()));
                let stale = o.insert(instance.clone());
                stale.invalidate();
                instance
            }
            HashMapEntry::Vacant(v) => {
                let instance = Arc::new(Instance::new(key, slot.clone()));
                v.insert(instance.clone());
                tracing::debug!("[instance]: create instance {key} of cache {:?}", slot.name());
                instance
            }
        }
    }

    pub(crate) fn get(&self, key: &InstanceKey) -> Option<Arc<Instance>> {
        self.shard(key).read().get(key).cloned()
    }

    /// Remove and invalidate all instances of the cache.
    pub(crate) fn remove_cache(&self, cache_id: CacheId) -> Vec<Arc<Instance>> {
        let mut removed = vec![];
        for shard in self.shards.iter() {
            shard.write().retain(|key, instance| {
                if key.cache_id == cache_id {
                    instance.invalidate();
                    removed.push(instance.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    pub(crate) fn all(&self) -> Vec<Arc<Instance>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect_vec())
            .collect_vec()
    }

    pub(crate) fn tenant(&self, tenant_id: TenantId) -> Vec<Arc<Instance>> {
        self.all()
            .into_iter()
            .filter(|instance| instance.key().tenant_id == tenant_id)
            .collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: CacheId, name: &str) -> Arc<CacheSlot> {
        Arc::new(CacheSlot::new(id, name.to_string(), 1))
    }

    #[test]
    fn test_get_or_create() {
        let registry = InstanceRegistry::new();
        let blk = slot(0, "blk_cache");

        let i1 = registry.get_or_create(&blk, 1001);
        let i2 = registry.get_or_create(&blk, 1001);
        assert!(Arc::ptr_eq(&i1, &i2));
        assert!(!Arc::ptr_eq(&i1, &registry.get_or_create(&blk, 1002)));
        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.tenant(1001).len(), 1);
    }

    #[test]
    fn test_get_or_create_contended() {
        let registry = Arc::new(InstanceRegistry::new());
        let blk = slot(0, "blk_cache");

        let handles = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let blk = blk.clone();
                std::thread::spawn(move || registry.get_or_create(&blk, 1001))
            })
            .collect_vec();
        let instances = handles.into_iter().map(|h| h.join().unwrap()).collect_vec();
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[test]
    fn test_reused_cache_id() {
        let registry = InstanceRegistry::new();
        let old = registry.get_or_create(&slot(3, "old"), 1001);
        let new = registry.get_or_create(&slot(3, "new"), 1001);
        assert!(!old.is_valid());
        assert!(new.is_valid());
        assert_eq!(new.slot().name(), "new");
    }

    #[test]
    fn test_remove_cache() {
        let registry = InstanceRegistry::new();
        let blk = slot(0, "blk_cache");
        let row = slot(1, "row_cache");
        let i = registry.get_or_create(&blk, 1001);
        registry.get_or_create(&blk, 1002);
        registry.get_or_create(&row, 1001);

        let removed = registry.remove_cache(0);
        assert_eq!(removed.len(), 2);
        assert!(!i.is_valid());
        assert!(registry.get(&InstanceKey::new(0, 1001)).is_none());
        assert!(registry.get(&InstanceKey::new(1, 1001)).is_some());
    }

    #[test]
    fn test_counters() {
        let instance = Instance::new(InstanceKey::new(0, 1001), slot(0, "blk_cache"));
        assert_eq!(instance.hit_rate(), 0.0);
        instance.record_hit();
        instance.record_hit();
        instance.record_hit();
        instance.record_miss();
        assert_eq!(instance.hit_rate(), 0.75);

        instance.inc_item_count();
        instance.inc_item_count();
        instance.add_node_size(64);
        assert_eq!(instance.avg_item_size(), 0);
        assert_eq!(instance.size(), 64);

        let info = instance.info();
        assert_eq!(info.item_count, 2);
        assert_eq!(info.hit_count, 3);
        assert_eq!(info.hold_size, None);
    }
}

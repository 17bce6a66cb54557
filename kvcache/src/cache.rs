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

use std::{fmt::Debug, marker::PhantomData, ops::Deref};

use kvcache_common::{
    code::{CacheKey, CacheValue},
    error::Result,
    id::{CacheId, TenantId},
};
use kvcache_memory::prelude::{AllocatedEntry, CacheHandle, GlobalCache, RawCacheEntry};

use crate::{iter::CacheIter, working_set::WorkingSetCache};

/// A decoded cache entry with the handle that pins its block.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    handle: CacheHandle,
}

impl<V> Deref for CacheEntry<V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<V> CacheEntry<V>
where
    V: CacheValue,
{
    pub(crate) fn decode(raw: RawCacheEntry) -> Result<Self> {
        let value = V::decode(raw.value())?;
        Ok(Self {
            value,
            handle: raw.into_handle(),
        })
    }

    /// The decoded value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The handle pinning the block the entry was read from.
    pub fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    /// Release the pin and take the value.
    pub fn into_value(self) -> V {
        self.value
    }
}

pub(crate) fn encode_into<K, V>(mut entry: AllocatedEntry, key: &K, value: &V) -> AllocatedEntry
where
    K: CacheKey,
    V: CacheValue,
{
    key.encode(entry.key_mut());
    value.encode(entry.value_mut());
    entry
}

/// A typed named cache on a [`GlobalCache`].
///
/// The cache is registered on creation and deregistered on drop. The tenant of every entry is the one its key
/// reports through [`CacheKey::tenant_id`].
pub struct KvCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    global: GlobalCache,
    cache_id: CacheId,
    name: String,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Debug for KvCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("cache_id", &self.cache_id)
            .field("name", &self.name)
            .finish()
    }
}

impl<K, V> Drop for KvCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn drop(&mut self) {
        if let Err(e) = self.global.deregister_cache(self.cache_id) {
            tracing::warn!("[kvcache]: deregister cache {:?} error: {e}", self.name);
        }
    }
}

impl<K, V> KvCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    /// Register a named cache with the given priority.
    pub fn new(global: &GlobalCache, name: impl Into<String>, priority: i64) -> Result<Self> {
        let name = name.into();
        let cache_id = global.register_cache(&name, priority)?;
        Ok(Self {
            global: global.clone(),
            cache_id,
            name,
            _marker: PhantomData,
        })
    }

    /// Registered cache id.
    pub fn cache_id(&self) -> CacheId {
        self.cache_id
    }

    /// Registered cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The global cache the cache is registered on.
    pub fn global(&self) -> &GlobalCache {
        &self.global
    }

    /// Change the priority of the cache.
    pub fn set_priority(&self, priority: i64) -> Result<()> {
        self.global.set_priority(self.cache_id, priority)
    }

    /// Insert an entry.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::cache::put"))]
    pub fn put(&self, key: &K, value: &V, overwrite: bool) -> Result<()> {
        let entry = self.alloc(key, value)?;
        self.global.put_kvpair(entry, overwrite).map(|_| ())
    }

    /// Insert an entry and return it.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::cache::put_and_fetch"))]
    pub fn put_and_fetch(&self, key: &K, value: &V, overwrite: bool) -> Result<CacheEntry<V>> {
        let entry = self.alloc(key, value)?;
        let raw = self.global.put_kvpair(entry, overwrite)?;
        CacheEntry::decode(raw)
    }

    fn alloc(&self, key: &K, value: &V) -> Result<AllocatedEntry> {
        let entry = self
            .global
            .alloc(self.cache_id, key.tenant_id(), key.encoded_len(), value.encoded_len())?;
        Ok(encode_into(entry, key, value))
    }

    /// Look up an entry.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::cache::get"))]
    pub fn get(&self, key: &K) -> Result<CacheEntry<V>> {
        let raw = self.global.get(self.cache_id, key.tenant_id(), &key.to_bytes())?;
        CacheEntry::decode(raw)
    }

    /// Erase an entry.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kvcache::cache::erase"))]
    pub fn erase(&self, key: &K) -> Result<()> {
        self.global.erase(self.cache_id, key.tenant_id(), &key.to_bytes())
    }

    /// Create a working set of the tenant in this cache.
    ///
    /// Without an explicit limit, the limit is derived from the cache share of the tenant budget.
    pub fn create_working_set(&self, tenant_id: TenantId, limit: Option<usize>) -> Result<WorkingSetCache<K, V>> {
        let ws = self.global.create_working_set(self.cache_id, tenant_id, limit)?;
        Ok(WorkingSetCache::new(ws))
    }

    /// Iterate over the live entries of the cache, bucket by bucket.
    pub fn iter(&self) -> CacheIter<'_, K, V> {
        CacheIter::new(self)
    }

    /// Bytes held by the tenant in this cache.
    pub fn size(&self, tenant_id: TenantId) -> usize {
        self.global.size(self.cache_id, tenant_id)
    }

    /// Live entries of the tenant in this cache.
    pub fn count(&self, tenant_id: TenantId) -> usize {
        self.global.count(self.cache_id, tenant_id)
    }

    /// Lookup hits of the tenant in this cache.
    pub fn hit_count(&self, tenant_id: TenantId) -> u64 {
        self.global.hit_count(self.cache_id, tenant_id)
    }

    /// Lookup misses of the tenant in this cache.
    pub fn miss_count(&self, tenant_id: TenantId) -> u64 {
        self.global.miss_count(self.cache_id, tenant_id)
    }

    /// Hit rate of the tenant in this cache.
    pub fn hit_rate(&self, tenant_id: TenantId) -> f64 {
        self.global.hit_rate(self.cache_id, tenant_id)
    }
}

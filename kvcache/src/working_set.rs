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

use std::{fmt::Debug, marker::PhantomData};

use kvcache_common::{
    code::{CacheKey, CacheValue},
    error::Result,
    id::InstanceKey,
};
use kvcache_memory::prelude::WorkingSet;

use crate::cache::{encode_into, CacheEntry};

/// A typed working set: a bounded sub-cache of one tenant in one [`KvCache`](crate::cache::KvCache).
///
/// Entries are visible through the owning cache too. Writes fail with
/// [`ErrorKind::QuotaExceeded`](kvcache_common::error::ErrorKind::QuotaExceeded) once the quota is used up.
pub struct WorkingSetCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    ws: WorkingSet,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Debug for WorkingSetCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingSetCache").field("ws", &self.ws).finish()
    }
}

impl<K, V> WorkingSetCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub(crate) fn new(ws: WorkingSet) -> Self {
        Self {
            ws,
            _marker: PhantomData,
        }
    }

    /// The tenant and cache of the working set.
    pub fn instance_key(&self) -> InstanceKey {
        self.ws.instance_key()
    }

    /// Bytes charged to the working set.
    pub fn used(&self) -> usize {
        self.ws.used()
    }

    /// Byte quota of the working set.
    pub fn limit(&self) -> usize {
        self.ws.limit()
    }

    /// Insert an entry.
    pub fn put(&self, key: &K, value: &V, overwrite: bool) -> Result<()> {
        let entry = self.ws.alloc(key.encoded_len(), value.encoded_len())?;
        self.ws.put_kvpair(encode_into(entry, key, value), overwrite).map(|_| ())
    }

    /// Insert an entry and return it.
    pub fn put_and_fetch(&self, key: &K, value: &V, overwrite: bool) -> Result<CacheEntry<V>> {
        let entry = self.ws.alloc(key.encoded_len(), value.encoded_len())?;
        let raw = self.ws.put_kvpair(encode_into(entry, key, value), overwrite)?;
        CacheEntry::decode(raw)
    }

    /// Look up an entry.
    pub fn get(&self, key: &K) -> Result<CacheEntry<V>> {
        CacheEntry::decode(self.ws.get(&key.to_bytes())?)
    }

    /// Erase an entry.
    pub fn erase(&self, key: &K) -> Result<()> {
        self.ws.erase(&key.to_bytes())
    }
}

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

use std::collections::VecDeque;

use kvcache_common::{
    code::{CacheKey, CacheValue},
    error::Result,
};
use kvcache_memory::prelude::RawCacheEntry;

use crate::cache::{CacheEntry, KvCache};

/// Iterator over the live entries of a [`KvCache`].
///
/// Entries are fetched one index bucket at a time. A fetched bucket pins the blocks of its entries until they are
/// yielded, entries of later buckets may still be washed before they are reached.
#[derive(Debug)]
pub struct CacheIter<'a, K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    cache: &'a KvCache<K, V>,
    bucket: usize,
    buffer: VecDeque<RawCacheEntry>,
    done: bool,
}

impl<'a, K, V> CacheIter<'a, K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub(crate) fn new(cache: &'a KvCache<K, V>) -> Self {
        Self {
            cache,
            bucket: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn decode(raw: RawCacheEntry) -> Result<(K, CacheEntry<V>)> {
        let key = K::decode(raw.key())?;
        let entry = CacheEntry::decode(raw)?;
        Ok((key, entry))
    }
}

impl<K, V> Iterator for CacheIter<'_, K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    type Item = Result<(K, CacheEntry<V>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(raw) = self.buffer.pop_front() {
                return Some(Self::decode(raw));
            }
            if self.done || self.bucket >= self.cache.global().bucket_num() {
                return None;
            }
            match self.cache.global().multi_get(self.cache.cache_id(), self.bucket) {
                Ok(entries) => {
                    self.buffer.extend(entries);
                    self.bucket += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

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
    hash::Hasher,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use itertools::Itertools;
use kvcache_common::{
    error::{Error, Result},
    id::CacheId,
};
use parking_lot::RwLock;
use twox_hash::XxHash64;

use crate::{
    handle::{EntryLocation, RawCacheEntry},
    instance::Instance,
    store::{BlockPin, MemStore},
};

/// Bucket count by memory ceiling, smallest level first.
const BUCKET_NUM_LEVELS: [(usize, usize); 6] = [
    (64 << 20, 1 << 10),
    (1 << 30, 1 << 14),
    (8 << 30, 1 << 17),
    (32 << 30, 1 << 20),
    (128 << 30, 1 << 22),
    (usize::MAX, 1 << 23),
];

/// Pick the index bucket count for a memory ceiling.
pub fn suitable_bucket_num(memory: usize) -> usize {
    BUCKET_NUM_LEVELS
        .iter()
        .find(|(limit, _)| memory <= *limit)
        .map(|(_, buckets)| *buckets)
        .unwrap_or(BUCKET_NUM_LEVELS[BUCKET_NUM_LEVELS.len() - 1].1)
}

pub(crate) fn hash_key(cache_id: CacheId, key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write_i64(cache_id);
    hasher.write(key);
    hasher.finish()
}

/// One mapping `(cache_id, key) -> entry location`.
#[derive(Debug)]
pub(crate) struct IndexNode {
    pub(crate) cache_id: CacheId,
    pub(crate) hash: u64,
    pub(crate) key: Box<[u8]>,
    pub(crate) location: EntryLocation,
    pub(crate) instance: Arc<Instance>,
}

impl IndexNode {
    /// Bytes charged to the instance node allocator.
    fn footprint(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }

    fn matches(&self, cache_id: CacheId, hash: u64, key: &[u8]) -> bool {
        self.hash == hash && self.cache_id == cache_id && &*self.key == key
    }

    /// The block is still at the node generation and the owner instance is not deregistered.
    fn is_live(&self, store: &MemStore) -> bool {
        self.instance.is_valid() && store.is_live(self.location.block)
    }
}

#[derive(Debug, Default)]
struct Bucket {
    nodes: RwLock<Vec<IndexNode>>,
    /// A lookup has met a stale node in this bucket.
    stale: AtomicBool,
}

/// Fixed-bucket hash index from `(cache_id, key)` to entry locations.
///
/// The bucket count never changes after construction. Each bucket is a short chain guarded by its own lock, so
/// operations on different buckets never contend.
#[derive(Debug)]
pub(crate) struct CacheIndex {
    buckets: Box<[Bucket]>,
    /// Next bucket the replace task visits.
    cursor: AtomicUsize,
}

impl CacheIndex {
    pub(crate) fn new(bucket_num: usize) -> Self {
        let buckets = (0..bucket_num.max(1)).map(|_| Bucket::default()).collect_vec();
        Self {
            buckets: buckets.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn bucket_num(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    /// Install the node.
    ///
    /// Fails with [`kvcache_common::error::ErrorKind::EntryExists`] if a live node of the same key exists and
    /// `overwrite` is false, and the bucket is left untouched. Otherwise returns the replaced node if it was live.
    pub(crate) fn put(&self, store: &MemStore, node: IndexNode, overwrite: bool) -> Result<Option<IndexNode>> {
        let mut nodes = self.bucket(node.hash).nodes.write();
        node.instance.add_node_size(node.footprint());

        match nodes
            .iter()
            .position(|n| n.matches(node.cache_id, node.hash, &node.key))
        {
            Some(pos) => {
                let live = nodes[pos].is_live(store);
                if live && !overwrite {
                    node.instance.sub_node_size(node.footprint());
                    return Err(Error::entry_exists());
                }
                let old = std::mem::replace(&mut nodes[pos], node);
                old.instance.sub_node_size(old.footprint());
                Ok(live.then_some(old))
            }
            None => {
                nodes.push(node);
                Ok(None)
            }
        }
    }

    /// Look up the key and pin the block of its entry.
    ///
    /// A node whose block has been washed is reported as a miss and left for the replace task.
    pub(crate) fn get(
        &self,
        store: &Arc<MemStore>,
        cache_id: CacheId,
        hash: u64,
        key: &[u8],
    ) -> Option<(EntryLocation, BlockPin, Arc<Instance>)> {
        let bucket = self.bucket(hash);
        let nodes = bucket.nodes.read();
        let node = nodes.iter().find(|n| n.matches(cache_id, hash, key))?;
        match node
            .instance
            .is_valid()
            .then(|| store.add_handle_ref(node.location.block))
            .flatten()
        {
            Some(pin) => Some((node.location, pin, node.instance.clone())),
            None => {
                bucket.stale.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove the node of the key. Returns it if it was live.
    pub(crate) fn erase(&self, store: &MemStore, cache_id: CacheId, hash: u64, key: &[u8]) -> Option<IndexNode> {
        let mut nodes = self.bucket(hash).nodes.write();
        let pos = nodes.iter().position(|n| n.matches(cache_id, hash, key))?;
        let node = nodes.swap_remove(pos);
        node.instance.sub_node_size(node.footprint());
        node.is_live(store).then_some(node)
    }

    /// Pinned live entries of one bucket, optionally only those of one cache.
    pub(crate) fn multi_get(
        &self,
        store: &Arc<MemStore>,
        bucket: usize,
        cache_id: Option<CacheId>,
    ) -> Vec<RawCacheEntry> {
        let Some(bucket) = self.buckets.get(bucket) else {
            return vec![];
        };
        let nodes = bucket.nodes.read();
        nodes
            .iter()
            .filter(|n| cache_id.is_none_or(|id| n.cache_id == id) && n.instance.is_valid())
            .filter_map(|n| {
                let pin = store.add_handle_ref(n.location.block)?;
                let chunk = pin.chunk()?;
                Some(RawCacheEntry::new(pin, chunk, n.location))
            })
            .collect_vec()
    }

    /// Remove all nodes matching the predicate. Returns the live ones.
    pub(crate) fn erase_if(&self, store: &MemStore, mut predicate: impl FnMut(&IndexNode) -> bool) -> Vec<IndexNode> {
        let mut erased = vec![];
        for bucket in self.buckets.iter() {
            let mut nodes = bucket.nodes.write();
            let mut i = 0;
            while i < nodes.len() {
                if predicate(&nodes[i]) {
                    let node = nodes.swap_remove(i);
                    node.instance.sub_node_size(node.footprint());
                    if node.is_live(store) {
                        erased.push(node);
                    }
                } else {
                    i += 1;
                }
            }
        }
        erased
    }

    /// Unlink stale nodes from the next `batch` buckets, wrapping around. Returns the nodes unlinked.
    pub(crate) fn replace_stale(&self, store: &MemStore, batch: usize) -> usize {
        let bucket_num = self.buckets.len();
        let batch = batch.min(bucket_num);
        let start = self.cursor.fetch_add(batch, Ordering::Relaxed) % bucket_num;

        let mut replaced = 0;
        for i in 0..batch {
            let bucket = &self.buckets[(start + i) % bucket_num];
            let marked = bucket.stale.swap(false, Ordering::Relaxed);
            if !marked && bucket.nodes.read().iter().all(|n| n.is_live(store)) {
                continue;
            }
            let mut nodes = bucket.nodes.write();
            nodes.retain(|n| {
                let live = n.is_live(store);
                if !live {
                    n.instance.sub_node_size(n.footprint());
                    replaced += 1;
                }
                live
            });
        }
        replaced
    }

    /// Nodes in the index, live or stale.
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.read().len()).sum()
    }
}

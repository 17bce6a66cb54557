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
    cell::UnsafeCell,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use kvcache_common::{
    error::{Error, Result},
    metrics::model::Metrics,
};
use parking_lot::Mutex;

use crate::{instance::Instance, working_set::WorkingSetQuota};

/// Freed standard chunks kept for reuse.
const CHUNK_POOL_CAPACITY: usize = 16;

/// Reference to a memory block at a specific generation.
///
/// A block reference becomes stale as soon as the block is reclaimed, because reclaiming bumps the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    id: u32,
    generation: u32,
}

impl BlockRef {
    /// Index of the block in the block arena.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Generation of the block when the reference was taken.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

bitflags! {
    /// State flags of a memory block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u8 {
        /// A chunk is bound to the block.
        const IN_USE = 0b00000001;
        /// The block is charged to a working set.
        const WORKING_SET = 0b00000010;
        /// The block holds a single entry larger than the standard block size.
        const LARGE = 0b00000100;
    }
}

/// Raw memory backing a block.
///
/// Entries are carved out of a chunk by bump allocation, so every byte range is written by exactly one reservation
/// before it is published, and only read afterwards.
pub(crate) struct Chunk {
    data: Box<[UnsafeCell<u8>]>,
}

// Disjoint ranges are handed out by the block cursor, see `MemBlock::reserve`.
unsafe impl Sync for Chunk {}

impl Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("len", &self.data.len()).finish()
    }
}

impl Chunk {
    fn new(size: usize) -> Self {
        let data = vec![0u8; size].into_boxed_slice();
        // Safety: `UnsafeCell<u8>` has the same in-memory representation as `u8`.
        let data = unsafe { Box::from_raw(Box::into_raw(data) as *mut [UnsafeCell<u8>]) };
        Self { data }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Raw pointer to the range `[offset, offset + len)`.
    ///
    /// Panics if the range is out of bounds.
    pub(crate) fn ptr(&self, offset: usize, len: usize) -> *mut u8 {
        let cells = &self.data[offset..offset + len];
        UnsafeCell::raw_get(cells.as_ptr())
    }
}

/// `[ generation (32 bits) | refs (32 bits) ]`
const REFS_MASK: u64 = u32::MAX as u64;

/// Ref count of an unpinned block whose last-pin free is being decided. Pins wait until it is settled.
const FREEING: u32 = u32::MAX;

fn pack(generation: u32, refs: u32) -> u64 {
    ((generation as u64) << 32) | refs as u64
}

fn generation_of(state: u64) -> u32 {
    (state >> 32) as u32
}

fn refs_of(state: u64) -> u32 {
    (state & REFS_MASK) as u32
}

/// Who is charged for a block.
#[derive(Debug)]
pub(crate) struct BlockOwner {
    pub(crate) instance: Arc<Instance>,
    pub(crate) quota: Option<Arc<WorkingSetQuota>>,
}

impl BlockOwner {
    pub(crate) fn new(instance: Arc<Instance>, quota: Option<Arc<WorkingSetQuota>>) -> Arc<Self> {
        Arc::new(Self { instance, quota })
    }

    fn current(&self) -> &Mutex<Option<BlockRef>> {
        match self.quota.as_ref() {
            Some(quota) => quota.current(),
            None => self.instance.current(),
        }
    }
}

#[derive(Debug)]
struct MemBlock {
    id: u32,
    state: AtomicU64,
    flags: AtomicU8,
    /// Entries reserved in the block and not yet erased, overwritten or rolled back.
    ///
    /// The owner instance item count moves in lockstep.
    live: AtomicUsize,
    cursor: AtomicUsize,
    /// Bytes charged to the owner working set quota.
    charged: AtomicUsize,
    capacity: AtomicUsize,
    chunk: ArcSwapOption<Chunk>,
    owner: ArcSwapOption<BlockOwner>,
}

impl MemBlock {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: AtomicU64::new(0),
            flags: AtomicU8::new(0),
            live: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            charged: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            chunk: ArcSwapOption::empty(),
            owner: ArcSwapOption::empty(),
        }
    }

    fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn generation(&self) -> u32 {
        generation_of(self.state.load(Ordering::Acquire))
    }

    fn refs(&self) -> u32 {
        refs_of(self.state.load(Ordering::Acquire))
    }

    /// Increase the ref count iff the block is still at `generation`.
    fn add_handle_ref(&self, generation: u32) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if generation_of(current) != generation {
                return false;
            }
            if refs_of(current) == FREEING {
                std::hint::spin_loop();
                current = self.state.load(Ordering::Acquire);
                continue;
            }
            debug_assert!(refs_of(current) < FREEING - 1, "block ref count overflow");
            match self
                .state
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(state) => current = state,
            }
        }
    }

    /// Increase the ref count of a block that is already pinned by the caller.
    fn inc_ref(&self) {
        let prev = self.state.fetch_add(1, Ordering::Relaxed);
        debug_assert!(refs_of(prev) > 0, "inc_ref on an unpinned block");
    }

    /// Decrease the ref count, return the state after the decrement.
    fn dec_ref(&self) -> u64 {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(refs_of(prev) > 0, "block ref count underflow");
        prev - 1
    }

    /// Move `(generation, 0)` to `(generation + 1, 0)`.
    ///
    /// Exactly one caller wins, and no pin can be taken on the old generation afterwards.
    fn try_invalidate(&self, generation: u32) -> bool {
        self.state
            .compare_exchange(
                pack(generation, 0),
                pack(generation.wrapping_add(1), 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Like [`MemBlock::try_invalidate`], but only if `cond` still holds once new pins are excluded.
    ///
    /// Entries are only reserved under a pin, so `cond` sees a block nobody can change.
    fn try_invalidate_if(&self, generation: u32, cond: impl FnOnce(&Self) -> bool) -> bool {
        if self
            .state
            .compare_exchange(
                pack(generation, 0),
                pack(generation, FREEING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let invalidate = cond(self);
        let next = match invalidate {
            true => pack(generation.wrapping_add(1), 0),
            false => pack(generation, 0),
        };
        self.state.store(next, Ordering::Release);
        invalidate
    }

    fn reserve(&self, size: usize) -> Option<usize> {
        let capacity = self.capacity.load(Ordering::Acquire);
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                cursor.checked_add(size).filter(|&cursor| cursor <= capacity)
            })
            .ok()
    }

    fn washable(&self) -> bool {
        match self.owner.load().as_ref() {
            Some(owner) => owner.quota.as_ref().is_none_or(|quota| quota.is_destroyed()),
            None => true,
        }
    }

    fn should_free(&self) -> bool {
        if self.live.load(Ordering::Acquire) == 0 {
            return true;
        }
        match self.owner.load().as_ref() {
            Some(owner) => !owner.instance.is_valid(),
            None => true,
        }
    }
}

/// Why a block is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReclaimKind {
    /// The last entry and the last handle are gone.
    Natural,
    /// Periodic wash.
    Background,
    /// On-demand wash from a failed allocation.
    Sync,
}

/// A pin on a block. The block cannot be reclaimed while any pin is alive.
pub(crate) struct BlockPin {
    store: Arc<MemStore>,
    block: BlockRef,
}

impl Debug for BlockPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPin").field("block", &self.block).finish()
    }
}

impl BlockPin {
    pub(crate) fn block(&self) -> BlockRef {
        self.block
    }

    pub(crate) fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    pub(crate) fn duplicate(&self) -> BlockPin {
        self.store.block(self.block).inc_ref();
        BlockPin {
            store: self.store.clone(),
            block: self.block,
        }
    }

    /// Chunk of the pinned block.
    pub(crate) fn chunk(&self) -> Option<Arc<Chunk>> {
        self.store.block(self.block).chunk.load_full()
    }
}

impl Drop for BlockPin {
    fn drop(&mut self) {
        self.store.release_handle_ref(self.block);
    }
}

/// Bytes reserved for one entry and not published yet.
#[derive(Debug)]
pub(crate) struct Reservation {
    pub(crate) pin: BlockPin,
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) owner: Arc<BlockOwner>,
    pub(crate) offset: usize,
    pub(crate) size: usize,
}

/// Snapshot of the store usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatistics {
    /// Memory ceiling of all blocks.
    pub capacity: usize,
    /// Bytes of chunks currently bound to blocks.
    pub allocated: usize,
    /// Blocks currently in use.
    pub blocks: usize,
    /// Standard chunk size.
    pub block_size: usize,
}

/// The memory store: a fixed arena of blocks over a pool of chunks.
pub(crate) struct MemStore {
    blocks: Box<[MemBlock]>,
    free_ids: Mutex<Vec<u32>>,
    pool: Mutex<Vec<Arc<Chunk>>>,

    block_size: usize,
    capacity: usize,
    allocated: AtomicUsize,
    in_use: AtomicUsize,

    metrics: Arc<Metrics>,
}

impl Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl MemStore {
    pub(crate) fn new(capacity: usize, block_size: usize, metrics: Arc<Metrics>) -> Self {
        // Every block holds at least `block_size` bytes, so the arena never runs out of slots before memory does.
        let slots = (capacity / block_size).max(1);
        let blocks = (0..slots as u32).map(MemBlock::new).collect::<Vec<_>>().into_boxed_slice();
        let free_ids = Mutex::new((0..slots as u32).rev().collect());
        Self {
            blocks,
            free_ids,
            pool: Mutex::new(Vec::with_capacity(CHUNK_POOL_CAPACITY)),
            block_size,
            capacity,
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            metrics,
        }
    }

    fn block(&self, block: BlockRef) -> &MemBlock {
        &self.blocks[block.id as usize]
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub(crate) fn statistics(&self) -> StoreStatistics {
        StoreStatistics {
            capacity: self.capacity,
            allocated: self.allocated(),
            blocks: self.in_use.load(Ordering::Acquire),
            block_size: self.block_size,
        }
    }

    /// Check if the block is still at the generation of the reference.
    pub(crate) fn is_live(&self, block: BlockRef) -> bool {
        let b = self.block(block);
        b.generation() == block.generation && b.flags().contains(BlockFlags::IN_USE)
    }

    /// Capacity of the block, `0` if the reference is stale.
    pub(crate) fn block_capacity(&self, block: BlockRef) -> usize {
        if self.is_live(block) {
            self.block(block).capacity.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Ref count of the block, for diagnostics.
    pub(crate) fn block_refs(&self, block: BlockRef) -> u32 {
        self.block(block).refs()
    }

    /// Pin the block iff it is still at the generation of the reference.
    pub(crate) fn add_handle_ref(self: &Arc<Self>, block: BlockRef) -> Option<BlockPin> {
        self.block(block).add_handle_ref(block.generation).then(|| BlockPin {
            store: self.clone(),
            block,
        })
    }

    /// Drop one pin. The last pin of a block without live entries frees it.
    fn release_handle_ref(&self, block: BlockRef) {
        let b = self.block(block);
        let state = b.dec_ref();
        if refs_of(state) == 0 && generation_of(state) == block.generation && b.should_free() {
            self.reclaim(block, ReclaimKind::Natural);
        }
    }

    /// Reclaim the block if it is unpinned and still at the generation of the reference.
    ///
    /// Washes skip blocks of working sets that are not destroyed yet.
    ///
    /// Returns the bytes returned to the store.
    pub(crate) fn reclaim(&self, block: BlockRef, kind: ReclaimKind) -> Option<usize> {
        let b = self.block(block);
        if !b.flags().contains(BlockFlags::IN_USE) {
            return None;
        }
        if kind != ReclaimKind::Natural && !b.washable() {
            return None;
        }
        // The last pin may have been released before another pin reserved and published an entry in the block.
        let invalidated = match kind {
            ReclaimKind::Natural => b.try_invalidate_if(block.generation, MemBlock::should_free),
            ReclaimKind::Background | ReclaimKind::Sync => b.try_invalidate(block.generation),
        };
        if !invalidated {
            return None;
        }

        // The block is exclusively owned by this call from here on.
        let flags = b.flags();
        b.flags.store(BlockFlags::empty().bits(), Ordering::Release);
        let chunk = b.chunk.swap(None);
        let owner = b.owner.swap(None);
        let live = b.live.swap(0, Ordering::AcqRel);
        let charged = b.charged.swap(0, Ordering::AcqRel);
        let capacity = b.capacity.swap(0, Ordering::AcqRel);
        b.cursor.store(0, Ordering::Release);

        if let Some(owner) = owner {
            owner.instance.on_block_freed(block, capacity, live);
            if let Some(quota) = owner.quota.as_ref() {
                quota.refund(charged);
            }
        }

        if let Some(chunk) = chunk {
            if !flags.contains(BlockFlags::LARGE) {
                let mut pool = self.pool.lock();
                if pool.len() < CHUNK_POOL_CAPACITY {
                    pool.push(chunk);
                }
            }
        }

        self.allocated.fetch_sub(capacity, Ordering::AcqRel);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.free_ids.lock().push(b.id);

        self.metrics.memory_allocated.decrease(capacity as _);
        self.metrics.memory_blocks.decrease(1);
        match kind {
            ReclaimKind::Natural => self.metrics.block_free_natural.increase(1),
            ReclaimKind::Background => self.metrics.block_wash_background.increase(1),
            ReclaimKind::Sync => self.metrics.block_wash_sync.increase(1),
        }

        tracing::trace!(
            "[store]: reclaim block {} gen {} ({kind:?}), flags: {flags:?}, capacity: {capacity}, live: {live}",
            block.id,
            block.generation
        );

        Some(capacity)
    }

    /// Bind a chunk of at least `size` bytes to a free block and return it pinned.
    fn allocate_block(self: &Arc<Self>, owner: &Arc<BlockOwner>, size: usize) -> Result<BlockPin> {
        let capacity = size.max(self.block_size);

        if self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                allocated.checked_add(capacity).filter(|&allocated| allocated <= self.capacity)
            })
            .is_err()
        {
            return Err(Error::out_of_memory(self.capacity, self.allocated(), capacity));
        }

        let Some(id) = self.free_ids.lock().pop() else {
            self.allocated.fetch_sub(capacity, Ordering::AcqRel);
            return Err(Error::out_of_memory(self.capacity, self.allocated(), capacity));
        };

        let mut flags = BlockFlags::IN_USE;
        if capacity > self.block_size {
            flags |= BlockFlags::LARGE;
        }
        if owner.quota.is_some() {
            flags |= BlockFlags::WORKING_SET;
        }

        let chunk = match flags.contains(BlockFlags::LARGE) {
            true => None,
            false => self.pool.lock().pop(),
        }
        .unwrap_or_else(|| Arc::new(Chunk::new(capacity)));

        let b = &self.blocks[id as usize];
        b.live.store(0, Ordering::Relaxed);
        b.charged.store(0, Ordering::Relaxed);
        b.cursor.store(0, Ordering::Relaxed);
        b.capacity.store(capacity, Ordering::Relaxed);
        b.chunk.store(Some(chunk));
        b.owner.store(Some(owner.clone()));
        b.flags.store(flags.bits(), Ordering::Release);
        let state = b.state.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(refs_of(state), 0, "a free block must not be pinned");

        self.in_use.fetch_add(1, Ordering::AcqRel);
        self.metrics.block_alloc.increase(1);
        self.metrics.memory_allocated.increase(capacity as _);
        self.metrics.memory_blocks.increase(1);

        Ok(BlockPin {
            store: self.clone(),
            block: BlockRef {
                id,
                generation: generation_of(state),
            },
        })
    }

    /// Reserve `size` contiguous bytes in a block of the owner, creating a new block when the current one is full.
    pub(crate) fn alloc(self: &Arc<Self>, owner: &Arc<BlockOwner>, size: usize) -> Result<Reservation> {
        let current = *owner.current().lock();
        if let Some(block) = current {
            if let Some(pin) = self.add_handle_ref(block) {
                if let Some(reservation) = self.reserve(pin, owner, size) {
                    return Ok(reservation);
                }
            }
            let mut current = owner.current().lock();
            if *current == Some(block) {
                *current = None;
            }
        }

        let pin = self.allocate_block(owner, size)?;
        let block = pin.block();
        let capacity = self.block(block).capacity.load(Ordering::Acquire);
        owner.instance.on_block_attached(block, capacity);
        if capacity > size {
            *owner.current().lock() = Some(block);
        }

        self.reserve(pin, owner, size)
            .ok_or_else(|| Error::out_of_memory(capacity, capacity, size))
    }

    fn reserve(&self, pin: BlockPin, owner: &Arc<BlockOwner>, size: usize) -> Option<Reservation> {
        let b = self.block(pin.block());
        let offset = b.reserve(size)?;
        let chunk = b.chunk.load_full()?;
        b.live.fetch_add(1, Ordering::AcqRel);
        owner.instance.inc_item_count();
        if owner.quota.is_some() {
            b.charged.fetch_add(size, Ordering::AcqRel);
        }
        Some(Reservation {
            pin,
            chunk,
            owner: owner.clone(),
            offset,
            size,
        })
    }

    /// Give the bytes of an unpublished reservation back to its block.
    ///
    /// The pin of the reservation is released when the reservation is dropped.
    pub(crate) fn rollback(&self, reservation: &Reservation) {
        let Reservation {
            pin,
            owner,
            offset,
            size,
            ..
        } = reservation;
        let b = self.block(pin.block());
        // Only the tail reservation can move the cursor back, otherwise the bytes stay dead until the block is reclaimed.
        let _ = b
            .cursor
            .compare_exchange(offset + size, *offset, Ordering::AcqRel, Ordering::Acquire);
        b.live.fetch_sub(1, Ordering::AcqRel);
        owner.instance.dec_item_count();
        if let Some(quota) = owner.quota.as_ref() {
            b.charged.fetch_sub(*size, Ordering::AcqRel);
            quota.refund(*size);
        }
    }

    /// Account one entry of the pinned block as erased or overwritten.
    pub(crate) fn release_entry(&self, pin: &BlockPin) {
        let b = self.block(pin.block());
        let prev = b.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "block live entry count underflow");
        if let Some(owner) = b.owner.load().as_ref() {
            owner.instance.dec_item_count();
        }
    }
}

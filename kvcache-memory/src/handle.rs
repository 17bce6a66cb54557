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

use std::{fmt::Debug, sync::Arc};

use kvcache_common::id::InstanceKey;

use crate::store::{BlockPin, BlockRef, Chunk, Reservation};

/// Where an entry lives: a block reference and the byte range inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryLocation {
    pub(crate) block: BlockRef,
    pub(crate) offset: usize,
    pub(crate) key_len: usize,
    pub(crate) value_len: usize,
}

/// A pinning reference to a memory block.
///
/// The block cannot be reclaimed while any valid handle references it. Cloning a valid handle takes another pin,
/// dropping or resetting it releases one.
#[derive(Debug, Default)]
pub struct CacheHandle {
    pin: Option<BlockPin>,
}

impl Clone for CacheHandle {
    fn clone(&self) -> Self {
        Self {
            pin: self.pin.as_ref().map(BlockPin::duplicate),
        }
    }
}

impl CacheHandle {
    pub(crate) fn new(pin: BlockPin) -> Self {
        Self { pin: Some(pin) }
    }

    /// Check if the handle still pins a block.
    pub fn is_valid(&self) -> bool {
        self.pin.is_some()
    }

    /// Release the pin. The handle is invalid afterwards.
    pub fn reset(&mut self) {
        self.pin = None;
    }

    /// The pinned block.
    pub fn block(&self) -> Option<BlockRef> {
        self.pin.as_ref().map(BlockPin::block)
    }
}

/// An entry read from the cache.
///
/// The entry holds a [`CacheHandle`] on its block, so the bytes stay valid for the lifetime of the entry.
pub struct RawCacheEntry {
    handle: CacheHandle,
    chunk: Arc<Chunk>,
    location: EntryLocation,
}

impl Debug for RawCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCacheEntry")
            .field("location", &self.location)
            .finish()
    }
}

impl RawCacheEntry {
    pub(crate) fn new(pin: BlockPin, chunk: Arc<Chunk>, location: EntryLocation) -> Self {
        debug_assert_eq!(pin.block(), location.block);
        Self {
            handle: CacheHandle::new(pin),
            chunk,
            location,
        }
    }

    /// Encoded key.
    pub fn key(&self) -> &[u8] {
        // Safety: the entry is published, its bytes are never written again before the block is reclaimed, and the
        // handle keeps the block from being reclaimed.
        unsafe {
            std::slice::from_raw_parts(
                self.chunk.ptr(self.location.offset, self.location.key_len),
                self.location.key_len,
            )
        }
    }

    /// Encoded value.
    pub fn value(&self) -> &[u8] {
        let offset = self.location.offset + self.location.key_len;
        // Safety: see `RawCacheEntry::key`.
        unsafe { std::slice::from_raw_parts(self.chunk.ptr(offset, self.location.value_len), self.location.value_len) }
    }

    /// The handle pinning the entry's block.
    pub fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    /// Give up access to the bytes and keep only the pin.
    pub fn into_handle(self) -> CacheHandle {
        self.handle
    }
}

/// Space reserved for an entry that is not published yet.
///
/// Fill the key and the value in place, then publish it with `put_kvpair`. Dropping an unpublished entry gives its
/// bytes back to the block right away.
pub struct AllocatedEntry {
    reservation: Reservation,
    key_len: usize,
    value_len: usize,
    published: bool,
}

impl Debug for AllocatedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedEntry")
            .field("block", &self.reservation.pin.block())
            .field("offset", &self.reservation.offset)
            .field("key_len", &self.key_len)
            .field("value_len", &self.value_len)
            .finish()
    }
}

impl Drop for AllocatedEntry {
    fn drop(&mut self) {
        if !self.published {
            self.reservation.pin.store().rollback(&self.reservation);
        }
    }
}

impl AllocatedEntry {
    pub(crate) fn new(reservation: Reservation, key_len: usize, value_len: usize) -> Self {
        debug_assert_eq!(reservation.size, key_len + value_len);
        Self {
            reservation,
            key_len,
            value_len,
            published: false,
        }
    }

    /// The instance the bytes are charged to.
    pub fn instance_key(&self) -> InstanceKey {
        self.reservation.owner.instance.key()
    }

    /// Length of the key range.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Length of the value range.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// Key range, to be filled before publishing.
    pub fn key_mut(&mut self) -> &mut [u8] {
        let ptr = self.reservation.chunk.ptr(self.reservation.offset, self.key_len);
        // Safety: the range is reserved for this entry only and stays invisible to readers until it is published.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.key_len) }
    }

    /// Value range, to be filled before publishing.
    pub fn value_mut(&mut self) -> &mut [u8] {
        let ptr = self
            .reservation
            .chunk
            .ptr(self.reservation.offset + self.key_len, self.value_len);
        // Safety: see `AllocatedEntry::key_mut`.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.value_len) }
    }

    pub(crate) fn key(&self) -> &[u8] {
        let ptr = self.reservation.chunk.ptr(self.reservation.offset, self.key_len);
        // Safety: see `AllocatedEntry::key_mut`.
        unsafe { std::slice::from_raw_parts(ptr, self.key_len) }
    }

    pub(crate) fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub(crate) fn location(&self) -> EntryLocation {
        EntryLocation {
            block: self.reservation.pin.block(),
            offset: self.reservation.offset,
            key_len: self.key_len,
            value_len: self.value_len,
        }
    }

    /// Mark the entry published and turn it into a pinned read entry.
    pub(crate) fn publish(mut self) -> RawCacheEntry {
        self.published = true;
        RawCacheEntry::new(
            self.reservation.pin.duplicate(),
            self.reservation.chunk.clone(),
            self.location(),
        )
    }
}

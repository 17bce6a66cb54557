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

pub use crate::{
    budget::{MemoryBudget, StaticMemoryBudget, MAX_RESERVED_PERCENTAGE},
    config::{
        GlobalCacheBuilder, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CACHES, DEFAULT_REPLACE_BATCH, DEFAULT_REPLACE_INTERVAL,
        DEFAULT_WASH_BATCH, DEFAULT_WASH_INTERVAL, DEFAULT_WORKING_SET_LIMIT_PERCENTAGE,
    },
    global::GlobalCache,
    handle::{AllocatedEntry, CacheHandle, RawCacheEntry},
    index::suitable_bucket_num,
    instance::CacheInfo,
    store::{BlockRef, StoreStatistics},
    wash::WashedBlock,
    working_set::WorkingSet,
};

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

//! kvcache is a process-wide, multi-tenant in-memory key-value cache.
//!
//! Named caches are registered on a shared [`GlobalCache`](crate::prelude::GlobalCache) and share its memory by
//! priority. Every tenant owns its own slice of each cache, bounded by a tenant-aware memory budget.
//!
//! [`KvCache`](crate::prelude::KvCache) is the typed entry point. Keys and values are encoded into blocks of the
//! shared store through [`CacheKey`](crate::prelude::CacheKey) and [`CacheValue`](crate::prelude::CacheValue).

mod cache;
mod iter;
mod working_set;

/// Re-exports of the public API.
pub mod prelude;

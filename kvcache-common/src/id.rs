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

use std::fmt::Display;

/// Identifier of a registered cache.
///
/// Ids are dense, start from `0`, and are recycled after the cache is deregistered.
pub type CacheId = i64;

/// Identifier of a tenant.
pub type TenantId = u64;

/// The tenant used when a key carries no tenant of its own.
pub const SYS_TENANT_ID: TenantId = 1;

/// A `(cache_id, tenant_id)` pair, identifying one tenant's slice of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    /// Registered cache id.
    pub cache_id: CacheId,
    /// Tenant id.
    pub tenant_id: TenantId,
}

impl InstanceKey {
    /// Create a new instance key.
    pub fn new(cache_id: CacheId, tenant_id: TenantId) -> Self {
        Self { cache_id, tenant_id }
    }
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.cache_id, self.tenant_id)
    }
}

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

use std::{collections::HashMap, fmt::Debug};

use kvcache_common::id::TenantId;

/// Upper bound of the reserved percentage of a tenant.
pub const MAX_RESERVED_PERCENTAGE: usize = 50;

/// Tenant-aware memory budget source.
///
/// The cache asks the budget source on every wash tick, so implementations may change their answers at runtime.
pub trait MemoryBudget: Send + Sync + Debug + 'static {
    /// The memory ceiling of the whole cache.
    fn total_limit(&self) -> usize;

    /// The bytes a tenant may hold in the cache.
    fn tenant_limit(&self, tenant_id: TenantId) -> usize;

    /// The bytes of a tenant that are never washed for other tenants.
    fn tenant_reserved(&self, tenant_id: TenantId) -> usize;
}

/// A [`MemoryBudget`] with fixed limits.
///
/// By default every tenant may use the whole ceiling and nothing is reserved.
#[derive(Debug, Clone)]
pub struct StaticMemoryBudget {
    total_limit: usize,
    default_tenant_limit: Option<usize>,
    tenant_limits: HashMap<TenantId, usize>,
    reserved_percentage: usize,
}

impl StaticMemoryBudget {
    /// Create a budget with the given memory ceiling.
    pub fn new(total_limit: usize) -> Self {
        Self {
            total_limit,
            default_tenant_limit: None,
            tenant_limits: HashMap::new(),
            reserved_percentage: 0,
        }
    }

    /// Set the limit of tenants without an explicit limit.
    pub fn with_default_tenant_limit(mut self, limit: usize) -> Self {
        self.default_tenant_limit = Some(limit);
        self
    }

    /// Set the limit of one tenant.
    pub fn with_tenant_limit(mut self, tenant_id: TenantId, limit: usize) -> Self {
        self.tenant_limits.insert(tenant_id, limit);
        self
    }

    /// Set the reserved percentage of each tenant limit, clamped to [`MAX_RESERVED_PERCENTAGE`].
    pub fn with_reserved_percentage(mut self, percentage: usize) -> Self {
        self.reserved_percentage = percentage.min(MAX_RESERVED_PERCENTAGE);
        self
    }
}

impl MemoryBudget for StaticMemoryBudget {
    fn total_limit(&self) -> usize {
        self.total_limit
    }

    fn tenant_limit(&self, tenant_id: TenantId) -> usize {
        self.tenant_limits
            .get(&tenant_id)
            .copied()
            .or(self.default_tenant_limit)
            .unwrap_or(self.total_limit)
            .min(self.total_limit)
    }

    fn tenant_reserved(&self, tenant_id: TenantId) -> usize {
        self.tenant_limit(tenant_id) / 100 * self.reserved_percentage
    }
}

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

pub use kvcache_common::{
    code::{CacheKey, CacheValue, TenantKey},
    error::{Error, ErrorKind, Result},
    id::{CacheId, InstanceKey, TenantId, SYS_TENANT_ID},
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry, RegistryOps},
};
#[cfg(feature = "prometheus")]
pub use kvcache_common::metrics::registry::prometheus::PrometheusMetricsRegistry;
pub use kvcache_memory::prelude::*;

pub use crate::{
    cache::{CacheEntry, KvCache},
    iter::CacheIter,
    working_set::WorkingSetCache,
};

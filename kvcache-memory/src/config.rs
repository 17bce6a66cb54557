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

use std::{borrow::Cow, sync::Arc, time::Duration};

use kvcache_common::{
    error::{Error, Result},
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry},
};

use crate::{
    budget::{MemoryBudget, StaticMemoryBudget},
    global::GlobalCache,
    index::suitable_bucket_num,
};

/// Default standard block size: 2 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;
/// Default max registered caches.
pub const DEFAULT_MAX_CACHES: usize = 16;
/// Default wash task interval.
pub const DEFAULT_WASH_INTERVAL: Duration = Duration::from_millis(800);
/// Default replace task interval.
pub const DEFAULT_REPLACE_INTERVAL: Duration = Duration::from_millis(800);
/// Default buckets visited per replace tick.
pub const DEFAULT_REPLACE_BATCH: usize = 50_000;
/// Default blocks examined per instance per wash tick.
pub const DEFAULT_WASH_BATCH: usize = 1024;
/// Default working set limit, in percent of the owning cache share.
pub const DEFAULT_WORKING_SET_LIMIT_PERCENTAGE: usize = 5;

/// Validated configuration of a [`GlobalCache`].
#[derive(Debug)]
pub(crate) struct GlobalCacheConfig {
    pub(crate) name: Cow<'static, str>,
    pub(crate) max_cache_size: usize,
    pub(crate) block_size: usize,
    pub(crate) bucket_num: usize,
    pub(crate) max_caches: usize,
    pub(crate) wash_interval: Duration,
    pub(crate) replace_interval: Duration,
    pub(crate) replace_batch: usize,
    pub(crate) wash_batch: usize,
    pub(crate) working_set_limit_percentage: usize,
    pub(crate) memory_budget: Arc<dyn MemoryBudget>,
    pub(crate) metrics_registry: BoxedRegistry,
    pub(crate) background_tasks: bool,
}

/// Builder of a [`GlobalCache`].
#[derive(Debug)]
pub struct GlobalCacheBuilder {
    name: Cow<'static, str>,
    max_cache_size: usize,
    block_size: usize,
    bucket_num: Option<usize>,
    max_caches: usize,
    wash_interval: Duration,
    replace_interval: Duration,
    replace_batch: usize,
    wash_batch: usize,
    working_set_limit_percentage: usize,
    memory_budget: Option<Arc<dyn MemoryBudget>>,
    metrics_registry: BoxedRegistry,
    background_tasks: bool,
}

impl GlobalCacheBuilder {
    /// Create a builder with the given name and memory ceiling.
    ///
    /// The name is used as the metrics label.
    pub fn new(name: impl Into<Cow<'static, str>>, max_cache_size: usize) -> Self {
        Self {
            name: name.into(),
            max_cache_size,
            block_size: DEFAULT_BLOCK_SIZE,
            bucket_num: None,
            max_caches: DEFAULT_MAX_CACHES,
            wash_interval: DEFAULT_WASH_INTERVAL,
            replace_interval: DEFAULT_REPLACE_INTERVAL,
            replace_batch: DEFAULT_REPLACE_BATCH,
            wash_batch: DEFAULT_WASH_BATCH,
            working_set_limit_percentage: DEFAULT_WORKING_SET_LIMIT_PERCENTAGE,
            memory_budget: None,
            metrics_registry: Box::new(NoopMetricsRegistry),
            background_tasks: true,
        }
    }

    /// Set the standard block size. Entries larger than a block get a dedicated block of their own size.
    ///
    /// The default value is 2 MiB.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the index bucket count.
    ///
    /// The default value is picked by the memory ceiling.
    pub fn with_bucket_num(mut self, bucket_num: usize) -> Self {
        self.bucket_num = Some(bucket_num);
        self
    }

    /// Set the max count of registered caches.
    ///
    /// The default value is 16.
    pub fn with_max_caches(mut self, max_caches: usize) -> Self {
        self.max_caches = max_caches;
        self
    }

    /// Set the wash task interval.
    pub fn with_wash_interval(mut self, interval: Duration) -> Self {
        self.wash_interval = interval;
        self
    }

    /// Set the replace task interval.
    pub fn with_replace_interval(mut self, interval: Duration) -> Self {
        self.replace_interval = interval;
        self
    }

    /// Set the index buckets visited by each replace tick.
    pub fn with_replace_batch(mut self, batch: usize) -> Self {
        self.replace_batch = batch;
        self
    }

    /// Set the blocks examined per instance by each wash tick.
    pub fn with_wash_batch(mut self, batch: usize) -> Self {
        self.wash_batch = batch;
        self
    }

    /// Set the default working set limit, in percent of the owning cache share of the tenant budget.
    ///
    /// The default value is 5.
    pub fn with_working_set_limit_percentage(mut self, percentage: usize) -> Self {
        self.working_set_limit_percentage = percentage;
        self
    }

    /// Set the tenant-aware memory budget source.
    ///
    /// The default budget lets every tenant use the whole ceiling with nothing reserved.
    pub fn with_memory_budget(mut self, budget: impl MemoryBudget) -> Self {
        self.memory_budget = Some(Arc::new(budget));
        self
    }

    /// Set the metrics registry.
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.metrics_registry = registry;
        self
    }

    /// Enable or disable the background wash and replace tasks.
    ///
    /// With the tasks disabled, [`GlobalCache::wash`] and [`GlobalCache::replace`] drive maintenance manually.
    pub fn with_background_tasks(mut self, enable: bool) -> Self {
        self.background_tasks = enable;
        self
    }

    fn validate(self) -> Result<GlobalCacheConfig> {
        if self.max_cache_size == 0 {
            return Err(Error::config("max cache size must be positive"));
        }
        if self.block_size == 0 || self.block_size > self.max_cache_size {
            return Err(Error::config("block size must be positive and no larger than max cache size")
                .with_context("block_size", self.block_size)
                .with_context("max_cache_size", self.max_cache_size));
        }
        if self.block_size > u32::MAX as usize {
            return Err(Error::config("block size is too large").with_context("block_size", self.block_size));
        }
        if self.max_caches == 0 {
            return Err(Error::config("max caches must be positive"));
        }
        if !(1..=100).contains(&self.working_set_limit_percentage) {
            return Err(Error::config("working set limit percentage must be in 1..=100")
                .with_context("percentage", self.working_set_limit_percentage));
        }
        if self.wash_interval.is_zero() || self.replace_interval.is_zero() {
            return Err(Error::config("task intervals must be positive"));
        }
        if self.replace_batch == 0 || self.wash_batch == 0 {
            return Err(Error::config("task batches must be positive"));
        }
        if self.bucket_num == Some(0) {
            return Err(Error::config("bucket num must be positive"));
        }

        let memory_budget = self
            .memory_budget
            .unwrap_or_else(|| Arc::new(StaticMemoryBudget::new(self.max_cache_size)));

        Ok(GlobalCacheConfig {
            bucket_num: self
                .bucket_num
                .unwrap_or_else(|| suitable_bucket_num(self.max_cache_size)),
            name: self.name,
            max_cache_size: self.max_cache_size,
            block_size: self.block_size,
            max_caches: self.max_caches,
            wash_interval: self.wash_interval,
            replace_interval: self.replace_interval,
            replace_batch: self.replace_batch,
            wash_batch: self.wash_batch,
            working_set_limit_percentage: self.working_set_limit_percentage,
            memory_budget,
            metrics_registry: self.metrics_registry,
            background_tasks: self.background_tasks,
        })
    }

    /// Build the cache and start its background tasks.
    pub fn build(self) -> Result<GlobalCache> {
        let config = self.validate()?;
        GlobalCache::open(config)
    }
}

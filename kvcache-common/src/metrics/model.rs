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

use std::borrow::Cow;

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

// FIXME: https://github.com/rust-lang/rust-analyzer/issues/17685
// #[expect(missing_docs)]
/// ... ...
#[derive(Debug)]
pub struct Metrics {
    /* data path */
    /// ... ...
    pub put: BoxedCounter,
    /// ... ...
    pub replace: BoxedCounter,
    /// ... ...
    pub hit: BoxedCounter,
    /// ... ...
    pub miss: BoxedCounter,
    /// ... ...
    pub erase: BoxedCounter,
    /// ... ...
    pub alloc_fail: BoxedCounter,
    /// ... ...
    pub quota_exceeded: BoxedCounter,

    /* block lifecycle */
    /// ... ...
    pub block_alloc: BoxedCounter,
    /// ... ...
    pub block_wash_background: BoxedCounter,
    /// ... ...
    pub block_wash_sync: BoxedCounter,
    /// ... ...
    pub block_free_natural: BoxedCounter,

    /// ... ...
    pub memory_allocated: BoxedGauge,
    /// ... ...
    pub memory_blocks: BoxedGauge,

    /* maintenance */
    /// ... ...
    pub index_replace: BoxedCounter,

    /// ... ...
    pub wash_duration: BoxedHistogram,
    /// ... ...
    pub sync_wash_duration: BoxedHistogram,
    /// ... ...
    pub replace_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &dyn RegistryOps) -> Self {
        let name = name.into();

        let kvcache_op_total =
            registry.register_counter_vec("kvcache_op_total".into(), "kvcache operations".into(), &["name", "op"]);
        let kvcache_block_total = registry.register_counter_vec(
            "kvcache_block_total".into(),
            "kvcache memory block lifecycle events".into(),
            &["name", "op"],
        );
        let kvcache_memory =
            registry.register_gauge_vec("kvcache_memory".into(), "kvcache block memory".into(), &["name", "type"]);
        let kvcache_task_duration = registry.register_histogram_vec(
            "kvcache_task_duration".into(),
            "kvcache maintenance task durations".into(),
            &["name", "task"],
        );

        let op = |op: &'static str| kvcache_op_total.counter(&[name.clone(), op.into()]);
        let block = |op: &'static str| kvcache_block_total.counter(&[name.clone(), op.into()]);
        let task = |task: &'static str| kvcache_task_duration.histogram(&[name.clone(), task.into()]);

        Self {
            put: op("put"),
            replace: op("replace"),
            hit: op("hit"),
            miss: op("miss"),
            erase: op("erase"),
            alloc_fail: op("alloc_fail"),
            quota_exceeded: op("quota_exceeded"),
            index_replace: op("index_replace"),

            block_alloc: block("alloc"),
            block_wash_background: block("wash_background"),
            block_wash_sync: block("wash_sync"),
            block_free_natural: block("free_natural"),

            memory_allocated: kvcache_memory.gauge(&[name.clone(), "allocated".into()]),
            memory_blocks: kvcache_memory.gauge(&[name.clone(), "blocks".into()]),

            wash_duration: task("wash"),
            sync_wash_duration: task("sync_wash"),
            replace_duration: task("replace"),
        }
    }

    /// Build a metrics model that reports nowhere.
    pub fn noop() -> Self {
        Self::new("test", &super::registry::noop::NoopMetricsRegistry)
    }
}

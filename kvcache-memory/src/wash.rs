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
    cmp::Reverse,
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use itertools::Itertools;
use kvcache_common::{
    error::{Error, ErrorKind, Result},
    id::{InstanceKey, TenantId},
    runtime::{maintenance_runtime, BackgroundShutdownRuntime},
};
use tokio::{
    sync::watch,
    time::{interval, Interval, MissedTickBehavior},
};

use crate::{
    global::GlobalCacheInner,
    instance::Instance,
    store::{BlockRef, MemStore, ReclaimKind},
};

/// A block reclaimed by a wash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WashedBlock {
    /// The reclaimed block, at the generation it had before the wash.
    pub block: BlockRef,
    /// Bytes returned to the store.
    pub size: usize,
    /// The instance that owned the block.
    pub instance: InstanceKey,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TenantUsage {
    pub(crate) hold: usize,
    pub(crate) limit: usize,
    pub(crate) reserved: usize,
}

impl TenantUsage {
    fn washable(&self) -> usize {
        self.hold.saturating_sub(self.reserved)
    }
}

/// Bytes to wash from each tenant.
///
/// A tenant washes what it holds over its own limit, or its share of the overflow of the whole cache weighted by
/// its washable bytes, whichever is larger. A tenant is never washed below its reserved floor.
pub(crate) fn tenant_wash_sizes(allocated: usize, total_limit: usize, tenants: &[TenantUsage]) -> Vec<usize> {
    let overflow = allocated.saturating_sub(total_limit) as u128;
    let washable_total = tenants.iter().map(|t| t.washable() as u128).sum::<u128>();

    tenants
        .iter()
        .map(|t| {
            let washable = t.washable();
            let share = match washable_total {
                0 => 0,
                total => (overflow * washable as u128).div_ceil(total) as usize,
            };
            t.hold.saturating_sub(t.limit).max(share).min(washable)
        })
        .collect_vec()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InstanceUsage {
    pub(crate) store_size: usize,
    pub(crate) priority: i64,
    pub(crate) hold_size: Option<usize>,
}

/// Split the wash size of a tenant among its instances.
///
/// Instances with a hold size keep it. The rest of the target is shared by priority. Instances over their target
/// are washed first, lowest priority first, then instances without a hold size pay the remainder, in the same order.
pub(crate) fn instance_wash_plan(wash_size: usize, instances: &[InstanceUsage]) -> Vec<usize> {
    let total = instances.iter().map(|i| i.store_size).sum::<usize>();
    let target_total = total.saturating_sub(wash_size);
    let held = instances
        .iter()
        .filter_map(|i| i.hold_size.map(|hold| hold.min(i.store_size)))
        .sum::<usize>();
    let shared = target_total.saturating_sub(held) as u128;
    let priority_total = instances
        .iter()
        .filter(|i| i.hold_size.is_none())
        .map(|i| i.priority.max(1) as u128)
        .sum::<u128>()
        .max(1);

    let targets = instances
        .iter()
        .map(|i| match i.hold_size {
            Some(hold) => hold.min(i.store_size),
            None => (shared * i.priority.max(1) as u128 / priority_total) as usize,
        })
        .collect_vec();

    let order = (0..instances.len())
        .sorted_by_key(|&i| (instances[i].priority, Reverse(instances[i].store_size)))
        .collect_vec();

    let mut plan = vec![0; instances.len()];
    let mut left = wash_size.min(total);
    for &i in order.iter() {
        let over = instances[i].store_size.saturating_sub(targets[i]).min(left);
        plan[i] = over;
        left -= over;
    }
    for &i in order.iter().filter(|&&i| instances[i].hold_size.is_none()) {
        let room = (instances[i].store_size - plan[i]).min(left);
        plan[i] += room;
        left -= room;
    }
    plan
}

/// Reclaim the oldest unpinned blocks of the instance until at least `need` bytes are freed.
///
/// Never frees more than `max` bytes and never examines more than `batch` blocks.
pub(crate) fn wash_instance(
    store: &MemStore,
    instance: &Instance,
    need: usize,
    max: usize,
    batch: usize,
    kind: ReclaimKind,
) -> Vec<WashedBlock> {
    let mut washed = vec![];
    let mut size = 0;
    for block in instance.oldest_blocks(batch) {
        if size >= need {
            break;
        }
        let capacity = store.block_capacity(block);
        if capacity == 0 || size + capacity > max {
            continue;
        }
        if let Some(freed) = store.reclaim(block, kind) {
            size += freed;
            washed.push(WashedBlock {
                block,
                size: freed,
                instance: instance.key(),
            });
        }
    }
    washed
}

fn washable_of(instance: &Instance) -> usize {
    let store_size = instance.store_size();
    match instance.hold_size() {
        Some(hold) => store_size.saturating_sub(hold),
        None => store_size,
    }
}

impl GlobalCacheInner {
    /// Run one wash tick. Returns the bytes reclaimed.
    pub(crate) fn wash(&self) -> usize {
        let now = Instant::now();

        let by_tenant = self
            .instances
            .all()
            .into_iter()
            .into_group_map_by(|instance| instance.key().tenant_id);
        let tenants = by_tenant.keys().copied().collect_vec();
        let usages = tenants
            .iter()
            .map(|&tenant_id| TenantUsage {
                hold: by_tenant[&tenant_id].iter().map(|i| i.store_size()).sum(),
                limit: self.budget.tenant_limit(tenant_id),
                reserved: self.budget.tenant_reserved(tenant_id),
            })
            .collect_vec();
        let wash_sizes = tenant_wash_sizes(self.store.allocated(), self.budget.total_limit(), &usages);

        let mut washed = 0;
        for (tenant_id, wash_size) in tenants.iter().zip(wash_sizes) {
            if wash_size == 0 {
                continue;
            }
            let instances = &by_tenant[tenant_id];
            let usages = instances
                .iter()
                .map(|i| InstanceUsage {
                    store_size: i.store_size(),
                    priority: i.priority(),
                    hold_size: i.hold_size(),
                })
                .collect_vec();
            let plan = instance_wash_plan(wash_size, &usages);

            let mut tenant_washed = 0;
            for (instance, need) in instances.iter().zip(plan) {
                if need == 0 {
                    continue;
                }
                tenant_washed += wash_instance(
                    &self.store,
                    instance,
                    need,
                    washable_of(instance),
                    self.wash_batch,
                    ReclaimKind::Background,
                )
                .iter()
                .map(|b| b.size)
                .sum::<usize>();
            }

            if tenant_washed < wash_size {
                tracing::warn!(
                    "[wash]: tenant {tenant_id} washed {tenant_washed} bytes of {wash_size} planned, remaining blocks are pinned or held"
                );
            } else {
                tracing::debug!("[wash]: tenant {tenant_id} washed {tenant_washed} bytes");
            }
            washed += tenant_washed;
        }

        let elapsed = now.elapsed();
        self.metrics.wash_duration.record(elapsed.as_secs_f64());
        tracing::trace!("[wash]: tick reclaimed {washed} bytes in {elapsed:?}");
        washed
    }

    /// Run one replace tick. Returns the stale index nodes unlinked.
    pub(crate) fn replace(&self) -> usize {
        let now = Instant::now();
        let replaced = self.index.replace_stale(&self.store, self.replace_batch);
        self.metrics.index_replace.increase(replaced as _);
        self.metrics.replace_duration.record(now.elapsed().as_secs_f64());
        if replaced > 0 {
            tracing::debug!("[replace]: unlinked {replaced} stale nodes");
        }
        replaced
    }

    /// Reclaim at least `wash_size` bytes, or exactly one block if `single`, for an allocation of the tenant.
    ///
    /// The tenant's own instances are washed first, lowest priority first. Other tenants are washed down to their
    /// reserved floor afterwards. Hold sizes and pinned blocks are never taken.
    pub(crate) fn sync_wash_mbs(&self, tenant_id: TenantId, wash_size: usize, single: bool) -> Result<Vec<WashedBlock>> {
        let now = Instant::now();
        let need = if single { 1 } else { wash_size };

        let by_tenant = self
            .instances
            .all()
            .into_iter()
            .into_group_map_by(|instance| instance.key().tenant_id);

        // (instance, max bytes to take from its tenant)
        let mut candidates: Vec<(Arc<Instance>, usize)> = vec![];
        if let Some(instances) = by_tenant.get(&tenant_id) {
            candidates.extend(
                instances
                    .iter()
                    .sorted_by_key(|i| (i.priority(), Reverse(i.store_size())))
                    .map(|i| (i.clone(), usize::MAX)),
            );
        }
        for (&other, instances) in by_tenant.iter().filter(|(t, _)| **t != tenant_id) {
            let hold = instances.iter().map(|i| i.store_size()).sum::<usize>();
            let reserved = self.budget.tenant_reserved(other);
            if hold <= reserved {
                continue;
            }
            candidates.extend(
                instances
                    .iter()
                    .sorted_by_key(|i| (i.priority(), Reverse(i.store_size())))
                    .map(|i| (i.clone(), hold - reserved)),
            );
        }
        candidates.sort_by_key(|(i, _)| i.key().tenant_id != tenant_id);

        let mut washed = vec![];
        let mut size = 0;
        let mut taken = HashMap::<TenantId, usize>::new();
        for (instance, tenant_max) in candidates {
            if size >= need {
                break;
            }
            let tenant = instance.key().tenant_id;
            let tenant_taken = taken.entry(tenant).or_default();
            let max = washable_of(&instance).min(tenant_max.saturating_sub(*tenant_taken));
            if max == 0 {
                continue;
            }
            let blocks = wash_instance(
                &self.store,
                &instance,
                need - size,
                max,
                self.wash_batch,
                ReclaimKind::Sync,
            );
            let freed = blocks.iter().map(|b| b.size).sum::<usize>();
            *tenant_taken += freed;
            size += freed;
            washed.extend(blocks);
        }

        self.metrics.sync_wash_duration.record(now.elapsed().as_secs_f64());

        if size < need {
            tracing::warn!("[wash]: sync wash for tenant {tenant_id} reclaimed {size} bytes of {need} required");
            return Err(Error::new(ErrorKind::NoReclaimableMemory, "no reclaimable memory")
                .with_context("tenant_id", tenant_id)
                .with_context("required", need)
                .with_context("reclaimed", size));
        }
        tracing::debug!(
            "[wash]: sync wash for tenant {tenant_id} reclaimed {} blocks, {size} bytes",
            washed.len()
        );
        Ok(washed)
    }
}

/// The periodic wash and replace tasks.
#[derive(Debug)]
pub(crate) struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
    wash_interval_tx: watch::Sender<Duration>,
    _runtime: BackgroundShutdownRuntime,
}

impl Maintenance {
    pub(crate) fn spawn(
        inner: &Arc<GlobalCacheInner>,
        wash_interval: Duration,
        replace_interval: Duration,
    ) -> Result<Self> {
        let runtime = maintenance_runtime(format!("kvcache-{}-maintenance", inner.name))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (wash_interval_tx, wash_interval_rx) = watch::channel(wash_interval);

        runtime.spawn(wash_loop(Arc::downgrade(inner), shutdown_rx.clone(), wash_interval_rx));
        runtime.spawn(replace_loop(Arc::downgrade(inner), shutdown_rx, replace_interval));

        tracing::info!(
            "[maintenance]: started, wash interval: {wash_interval:?}, replace interval: {replace_interval:?}"
        );

        Ok(Self {
            shutdown_tx,
            wash_interval_tx,
            _runtime: runtime,
        })
    }

    pub(crate) fn reload_wash_interval(&self, interval: Duration) {
        let _ = self.wash_interval_tx.send(interval);
    }

    pub(crate) fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        tracing::info!("[maintenance]: shutdown");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn wash_loop(
    inner: Weak<GlobalCacheInner>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut interval_rx: watch::Receiver<Duration>,
) {
    let mut ticks = ticker(*interval_rx.borrow_and_update());
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            res = interval_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                ticks = ticker(period);
                tracing::info!("[wash]: interval reloaded to {period:?}");
            }
            _ = ticks.tick() => {
                let Some(cache) = inner.upgrade() else { break };
                cache.wash();
            }
        }
    }
    tracing::info!("[wash]: task exits");
}

async fn replace_loop(inner: Weak<GlobalCacheInner>, mut shutdown_rx: watch::Receiver<bool>, period: Duration) {
    let mut ticks = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticks.tick() => {
                let Some(cache) = inner.upgrade() else { break };
                cache.replace();
            }
        }
    }
    tracing::info!("[replace]: task exits");
}

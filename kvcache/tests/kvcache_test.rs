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
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use itertools::Itertools;
use kvcache::prelude::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};

const KB: usize = 1024;
const MB: usize = 1024 * KB;

fn global(capacity: usize) -> GlobalCache {
    GlobalCacheBuilder::new("it", capacity)
        .with_block_size(64 * KB)
        .with_background_tasks(false)
        .build()
        .unwrap()
}

#[test_log::test]
fn test_blk_cache_scenario() {
    let global = global(16 * MB);
    let cache = KvCache::<String, Vec<u8>>::new(&global, "blk_cache", 1).unwrap();
    let key = "t1:100".to_string();
    let value = (0..64u8).collect_vec();

    cache.put(&key, &value, true).unwrap();
    let entry = cache.get(&key).unwrap();
    assert_eq!(*entry, value);
    assert!(entry.handle().is_valid());
    drop(entry);

    cache.erase(&key).unwrap();
    assert_eq!(cache.get(&key).unwrap_err().kind(), ErrorKind::EntryNotExist);
}

#[test_log::test]
fn test_working_set_scenario() {
    let global = global(16 * MB);
    let cache = KvCache::<u64, Vec<u8>>::new(&global, "ws_cache", 1).unwrap();
    let ws = cache.create_working_set(SYS_TENANT_ID, Some(1024)).unwrap();
    assert_eq!(ws.limit(), 1024);

    // 8 bytes of key and 592 bytes of value.
    ws.put(&1, &vec![1; 592], false).unwrap();
    assert_eq!(ws.used(), 600);

    let err = ws.put(&2, &vec![2; 592], false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(ws.used(), 600);

    assert_eq!(*ws.get(&1).unwrap(), vec![1; 592]);
    assert_eq!(*cache.get(&1).unwrap(), vec![1; 592]);
    assert!(ws.get(&2).unwrap_err().is_not_found());
}

#[test_log::test]
fn test_concurrent_put_scenario() {
    let global = global(16 * MB);
    let cache = Arc::new(KvCache::<u64, String>::new(&global, "race", 1).unwrap());

    for key in 0..32u64 {
        let barrier = Arc::new(Barrier::new(2));
        let handles = ["v1", "v2"]
            .into_iter()
            .map(|value| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.put(&key, &value.to_string(), false).map(|_| value)
                })
            })
            .collect_vec();
        let results = handles.into_iter().map(|h| h.join().unwrap()).collect_vec();

        let winners = results.iter().filter_map(|r| r.as_ref().ok()).collect_vec();
        assert_eq!(winners.len(), 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(loser.kind(), ErrorKind::EntryExists);
        assert_eq!(cache.get(&key).unwrap().value(), winners[0]);
    }
}

#[test_log::test]
fn test_handle_pinning() {
    let global = GlobalCacheBuilder::new("it", 256 * KB)
        .with_block_size(16 * KB)
        .with_background_tasks(false)
        .build()
        .unwrap();
    let cache = KvCache::<u64, Vec<u8>>::new(&global, "pin", 1).unwrap();

    let pinned = cache.put_and_fetch(&0, &vec![9; 4 * KB], true).unwrap();
    let block = pinned.handle().block().unwrap();

    // Churn through far more than the store holds; on-demand washes must skip the pinned block.
    for i in 1..512u64 {
        cache.put(&i, &vec![i as u8; 4 * KB], true).unwrap();
    }
    global.wash();

    assert_eq!(pinned.handle().block(), Some(block));
    assert_eq!(*pinned, vec![9; 4 * KB]);
    let washed = global.sync_wash_mbs(SYS_TENANT_ID, 256 * KB, false);
    assert!(washed.unwrap_or_default().iter().all(|w| w.block != block));
    assert_eq!(*pinned, vec![9; 4 * KB]);
}

#[test_log::test]
fn test_round_trip() {
    let global = global(64 * MB);
    let cache = KvCache::<u64, Vec<u8>>::new(&global, "rt", 1).unwrap();
    let mut rng = SmallRng::seed_from_u64(114514);

    let pairs = (0..1000u64)
        .map(|k| {
            let len = rng.random_range(0..2 * KB);
            (k, (0..len).map(|_| rng.random::<u8>()).collect_vec())
        })
        .collect_vec();
    for (k, v) in pairs.iter() {
        cache.put(k, v, true).unwrap();
    }
    for (k, v) in pairs.iter() {
        assert_eq!(*cache.get(k).unwrap(), *v);
    }
    assert_eq!(cache.count(SYS_TENANT_ID), 1000);
}

#[test_log::test]
fn test_erase_then_reclaim() {
    let global = global(16 * MB);
    let cache = KvCache::<u64, Vec<u8>>::new(&global, "reclaim", 1).unwrap();

    for i in 0..64u64 {
        cache.put(&i, &vec![0; KB], true).unwrap();
    }
    let allocated = global.statistics().allocated;
    assert!(allocated > 0);

    let handles = (0..64u64).map(|i| cache.get(&i).unwrap()).collect_vec();
    for i in 0..64u64 {
        cache.erase(&i).unwrap();
    }
    // Still pinned.
    assert_eq!(global.statistics().allocated, allocated);

    drop(handles);
    assert_eq!(global.statistics().allocated, 0);
}

#[test_log::test]
fn test_idempotent_erase() {
    let global = global(16 * MB);
    let cache = KvCache::<u64, u64>::new(&global, "erase", 1).unwrap();
    cache.put(&1, &1, true).unwrap();

    let before = global.get_all_cache_info();
    let stats = global.statistics();
    for _ in 0..3 {
        assert!(cache.erase(&2).unwrap_err().is_not_found());
    }
    assert_eq!(global.get_all_cache_info(), before);
    assert_eq!(global.statistics(), stats);
}

#[test_log::test]
fn test_cache_info_serialize() {
    let global = global(16 * MB);
    let cache = KvCache::<TenantKey<u64>, u64>::new(&global, "info", 3).unwrap();
    cache.put(&TenantKey::new(1001, 1), &1, true).unwrap();
    cache.get(&TenantKey::new(1001, 1)).unwrap();

    let infos = global.get_tenant_cache_info(1001);
    let json = serde_json::to_value(&infos).unwrap();
    assert_eq!(json[0]["name"], "info");
    assert_eq!(json[0]["tenant_id"], 1001);
    assert_eq!(json[0]["priority"], 3);
    assert_eq!(json[0]["hit_count"], 1);
}

#[test_log::test]
fn test_kvcache_fuzzy() {
    let global = GlobalCacheBuilder::new("fuzzy", 2 * MB)
        .with_block_size(32 * KB)
        .with_wash_interval(Duration::from_millis(2))
        .with_replace_interval(Duration::from_millis(2))
        .with_memory_budget(StaticMemoryBudget::new(2 * MB).with_default_tenant_limit(MB))
        .build()
        .unwrap();
    let cache = Arc::new(KvCache::<TenantKey<u64>, Vec<u8>>::new(&global, "fuzzy", 2).unwrap());

    let handles = (0..8u64)
        .map(|i| {
            let cache = cache.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(i);
                for _ in 0..20000 {
                    let key = TenantKey::new(rng.random_range(1..=3), rng.random_range(0..4096u64));
                    let expected = key.key.to_le_bytes().repeat(key.key as usize % 32 + 1);
                    match cache.get(&key) {
                        Ok(entry) => assert_eq!(*entry, expected),
                        Err(e) => {
                            assert!(e.is_not_found());
                            match cache.put(&key, &expected, rng.random_bool(0.5)) {
                                Ok(()) => {}
                                Err(e) => assert!(matches!(
                                    e.kind(),
                                    ErrorKind::EntryExists | ErrorKind::OutOfMemory
                                )),
                            }
                        }
                    }
                }
            })
        })
        .collect_vec();
    handles.into_iter().for_each(|h| h.join().unwrap());

    assert!(global.statistics().allocated <= 2 * MB);
    assert!((1..=3).all(|t| cache.size(t) <= 2 * MB));
    global.dump();
}

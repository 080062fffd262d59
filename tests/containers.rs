use lamellar_aggregator::containers::{GlobalCounter, GlobalHashMap, GlobalHashSet, GlobalVector};
use lamellar_aggregator::WorldBuilder;

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::thread_rng;
use serial_test::serial;

macro_rules! counter_test {
    ($num_cores:expr, $tasks:expr, $flat_combining:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<counter_ $num_cores _cores_ $tasks _tasks_combining_ $flat_combining>]() {
                let world = WorldBuilder::new()
                    .with_num_cores($num_cores)
                    .with_flat_combining($flat_combining)
                    .build();
                let results = world.run(|core| async move {
                    let counter = GlobalCounter::new(&core);
                    join_all((0..$tasks).map(|_| counter.increment(1))).await;
                    core.barrier().await;
                    (counter.read().await, counter.combiner_stats())
                });
                let expected = ($num_cores * $tasks) as i64;
                for (value, stats) in results {
                    assert_eq!(value, expected);
                    assert!(stats.max_concurrent_senders <= 1);
                    if $flat_combining {
                        assert_eq!(stats.blocked, $tasks as u64);
                        assert_eq!(stats.combining_depth.sum(), $tasks as u64);
                    } else {
                        assert_eq!(stats.operations, 0);
                    }
                }
            }
        }
    };
}

counter_test!(1, 100, true);
counter_test!(2, 500, true);
counter_test!(4, 250, true);
counter_test!(4, 250, false);

#[test]
#[serial]
fn concurrent_increments_share_flushes() {
    let world = WorldBuilder::new().with_num_cores(2).build();
    let stats = world.run(|core| async move {
        let counter = GlobalCounter::new(&core);
        join_all((0..1000).map(|_| counter.increment(2))).await;
        core.barrier().await;
        assert_eq!(counter.read().await, 4000);
        counter.combiner_stats()
    });
    for stats in stats {
        // the first increment flushes alone, the rest pile up while it is in flight
        assert!(stats.syncs < 1000, "{:?}", stats);
        assert!(stats.combining_depth.max() > 1);
    }
}

#[test]
#[serial]
fn small_batches_still_complete() {
    let world = WorldBuilder::new()
        .with_num_cores(3)
        .with_combiner_batch_size(3)
        .build();
    let values = world.run(|core| async move {
        let counter = GlobalCounter::new(&core);
        join_all((0..200).map(|i| counter.increment(i))).await;
        core.barrier().await;
        let stats = counter.combiner_stats();
        assert!(stats.max_concurrent_senders <= 1);
        counter.read().await
    });
    assert!(values.iter().all(|v| *v == 3 * 199 * 200 / 2));
}

#[test]
#[serial]
fn vector_holds_every_pushed_element_once() {
    let num_cores = 4;
    let per_core = 1000;
    let world = WorldBuilder::new()
        .with_num_cores(num_cores)
        .with_block_size(16)
        .build();
    let results = world.run(|core| async move {
        let vector = GlobalVector::<u64>::new(&core, num_cores * per_core);
        let base = (core.my_core() * per_core) as u64;
        join_all((0..per_core as u64).map(|i| vector.push(base + i))).await;
        core.barrier().await;
        let size = vector.size().await;
        let mut local_cnt = 0;
        let mut local_sum = 0;
        vector.for_each_local(|index, value| {
            assert_eq!(vector.address(index).core(), core.my_core());
            local_cnt += 1;
            local_sum += *value as i64;
        });
        assert_eq!(local_cnt, vector.local_len());
        let cnt = core.sum_reduce(local_cnt as i64).await;
        let sum = core.sum_reduce(local_sum).await;
        (size, cnt, sum)
    });
    let total = (num_cores * per_core) as i64;
    for (size, cnt, sum) in results {
        assert_eq!(size, total as usize);
        assert_eq!(cnt, total);
        assert_eq!(sum, total * (total - 1) / 2);
    }
}

#[test]
#[serial]
fn vector_pops_what_was_pushed() {
    let world = WorldBuilder::new().with_num_cores(3).build();
    let popped = world.run(|core| async move {
        let vector = GlobalVector::<usize>::new(&core, 300);
        join_all((0..100).map(|i| vector.push(core.my_core() * 100 + i))).await;
        core.barrier().await;
        let popped: Vec<usize> = join_all((0..50).map(|_| vector.pop()))
            .await
            .into_iter()
            .flatten()
            .collect();
        core.barrier().await;
        assert_eq!(vector.size().await, 150);
        popped
    });
    let mut all: Vec<usize> = popped.into_iter().flatten().collect();
    assert_eq!(all.len(), 150);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 150);
    assert!(all.iter().all(|v| *v < 300));
}

#[test]
#[serial]
fn vector_pop_on_empty_is_none() {
    let world = WorldBuilder::new().with_num_cores(2).build();
    world.run(|core| async move {
        let vector = GlobalVector::<u32>::new(&core, 10);
        assert_eq!(vector.pop().await, None);
        assert_eq!(vector.get(0).await, None);
        core.barrier().await;
        if core.my_core() == 1 {
            vector.push(7).await;
            assert_eq!(vector.get(0).await, Some(7));
        }
        core.barrier().await;
        assert_eq!(vector.size().await, 1);
    });
}

#[test]
#[serial]
fn push_and_pop_in_one_batch_cancel_out() {
    let world = WorldBuilder::new().with_num_cores(2).build();
    let stats = world.run(|core| async move {
        let vector = GlobalVector::<u32>::new(&core, 10);
        let mut stats = None;
        if core.my_core() == 1 {
            // the first push is in flight to the master while the other two meet in the next batch
            let (_, _, popped) = futures::join!(vector.push(1), vector.push(2), vector.pop());
            assert_eq!(popped, Some(2));
            stats = Some(vector.combiner_stats());
        }
        core.barrier().await;
        assert_eq!(vector.size().await, 1);
        assert_eq!(vector.get(0).await, Some(1));
        stats
    });
    let stats = stats[1].clone().unwrap();
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.syncs, 1);
    assert_eq!(stats.skipped_syncs, 1);
}

macro_rules! pop_push_test {
    ($num_cores:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<pop_then_push_keeps_every_element_ $num_cores _cores>]() {
                let world = WorldBuilder::new()
                    .with_num_cores($num_cores)
                    .with_block_size(4)
                    .with_flat_combining(false)
                    .build();
                world.run(|core| async move {
                    let vector = GlobalVector::<u32>::new(&core, 64);
                    let last = core.num_cores() - 1;
                    if core.my_core() == last {
                        for i in 0..10 {
                            vector.push(i).await;
                        }
                        // the push reuses the slot the pop frees
                        let (popped, ()) = futures::join!(vector.pop(), vector.push(100));
                        assert_eq!(popped, Some(9));
                    }
                    core.barrier().await;
                    assert_eq!(vector.size().await, 10);
                    let values = join_all((0..10).map(|i| vector.get(i))).await;
                    let expected: Vec<Option<u32>> =
                        (0..9).chain(std::iter::once(100)).map(Some).collect();
                    assert_eq!(values, expected);
                    core.barrier().await;
                });
            }
        }
    };
}

pop_push_test!(1);
pop_push_test!(2);
pop_push_test!(4);

#[test]
#[serial]
fn vector_without_combining() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_flat_combining(false)
        .build();
    world.run(|core| async move {
        let vector = GlobalVector::<u32>::new(&core, 200);
        join_all((0..100).map(|i| vector.push(i))).await;
        core.barrier().await;
        assert_eq!(vector.size().await, 200);
        assert_eq!(vector.combiner_stats().operations, 0);
    });
}

#[test]
#[serial]
fn hash_map_inserts_are_visible_everywhere() {
    let num_cores = 4;
    let per_core = 200;
    let world = WorldBuilder::new().with_num_cores(num_cores).build();
    world.run(|core| async move {
        let map = GlobalHashMap::<u64, u64>::new(&core, 97);
        let base = (core.my_core() * per_core) as u64;
        join_all((0..per_core as u64).map(|i| map.insert(base + i, (base + i) * 2))).await;
        core.barrier().await;
        assert_eq!(map.len().await, num_cores * per_core);

        let mut keys: Vec<u64> = (0..(num_cores * per_core) as u64).collect();
        keys.shuffle(&mut thread_rng());
        let found = join_all(keys.iter().map(|k| map.lookup(k))).await;
        for (k, v) in keys.iter().zip(found) {
            assert_eq!(v, Some(k * 2));
        }
        assert_eq!(map.lookup(&u64::MAX).await, None);

        let mut local = 0;
        map.for_each_local(|k, _| {
            assert_eq!(map.cell_address(k).core(), core.my_core());
            local += 1;
        });
        assert_eq!(local, map.local_len());
        core.barrier().await;
    });
}

#[test]
#[serial]
fn hash_map_last_insert_wins() {
    let world = WorldBuilder::new().with_num_cores(2).build();
    world.run(|core| async move {
        let map = GlobalHashMap::<String, usize>::new(&core, 8);
        if core.my_core() == 0 {
            join_all((0..10).map(|i| map.insert("key".to_string(), i))).await;
        }
        core.barrier().await;
        assert_eq!(map.lookup(&"key".to_string()).await, Some(9));
        assert_eq!(map.len().await, 1);
    });
}

#[test]
#[serial]
fn lookup_of_a_pending_insert_is_satisfied_locally() {
    let world = WorldBuilder::new().with_num_cores(2).build();
    let stats = world.run(|core| async move {
        let map = GlobalHashMap::<u64, u64>::new(&core, 16);
        let mut stats = None;
        if core.my_core() == 1 {
            let remote = (0..).find(|k| map.cell_address(k).core() == 0).unwrap_or(0);
            let lookup_key = remote + 1000;
            let (_, _, found) = futures::join!(
                map.insert(remote, 1),
                map.insert(remote + 1000, 5),
                map.lookup(&lookup_key)
            );
            assert_eq!(found, Some(5));
            stats = Some(map.combiner_stats());
        }
        core.barrier().await;
        stats
    });
    let stats = stats[1].clone().unwrap();
    assert_eq!(stats.satisfied, 1);
    assert_eq!(stats.blocked, 2);
}

#[test]
#[serial]
fn hash_set_deduplicates_across_cores() {
    let world = WorldBuilder::new().with_num_cores(3).build();
    world.run(|core| async move {
        let set = GlobalHashSet::<u32>::new(&core, 31);
        join_all((0..100).map(|k| set.insert(k))).await;
        core.barrier().await;
        assert_eq!(set.len().await, 100);
        assert!(set.contains(&42).await);
        assert!(!set.contains(&100).await);
        let local = core.sum_reduce(set.local_len() as i64).await;
        assert_eq!(local, 100);
    });
}

#[test]
#[serial]
fn hash_set_without_combining() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_flat_combining(false)
        .build();
    world.run(|core| async move {
        let set = GlobalHashSet::<u32>::new(&core, 7);
        set.insert(core.my_core() as u32).await;
        core.barrier().await;
        assert!(set.contains(&0).await);
        assert!(set.contains(&1).await);
        assert_eq!(set.len().await, 2);
    });
}

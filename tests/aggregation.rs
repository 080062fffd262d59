use lamellar_aggregator::{handler_id, register_handler, Core, Envelope, WorldBuilder};
use serial_test::serial;

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    // (source, sequence number) of every fifo message delivered to this core thread
    static RECEIVED: RefCell<Vec<(usize, u64)>> = RefCell::new(Vec::new());
}

static DELIVERED_SUM: AtomicU64 = AtomicU64::new(0);
static DELIVERED_CNT: AtomicU64 = AtomicU64::new(0);

fn fifo(_core: &Core, msg: Envelope<'_>) {
    let seq: u64 = msg.args_as();
    RECEIVED.with(|r| r.borrow_mut().push((msg.source, seq)));
}
register_handler!("tests::aggregation::fifo", fifo);

fn count(_core: &Core, msg: Envelope<'_>) {
    let value: u64 = msg.args_as();
    DELIVERED_SUM.fetch_add(value, Ordering::SeqCst);
    DELIVERED_CNT.fetch_add(1, Ordering::SeqCst);
}
register_handler!("tests::aggregation::count", count);

fn bounce(core: &Core, msg: Envelope<'_>) {
    let hops: u64 = msg.args_as();
    DELIVERED_CNT.fetch_add(1, Ordering::SeqCst);
    if hops > 0 {
        let next = (core.my_core() + 1) % core.num_cores();
        core.send_am(next, handler_id("tests::aggregation::bounce"), &(hops - 1));
    }
}
register_handler!("tests::aggregation::bounce", bounce);

fn take_received() -> Vec<(usize, u64)> {
    RECEIVED.with(|r| std::mem::take(&mut *r.borrow_mut()))
}

/// every core receives `n` messages from every other core, in the order they were sent
fn check_fifo(received: &[(usize, u64)], my_core: usize, num_cores: usize, n: u64) {
    assert_eq!(received.len() as u64, n * (num_cores as u64 - 1));
    for src in (0..num_cores).filter(|c| *c != my_core) {
        let seqs: Vec<u64> = received
            .iter()
            .filter(|(s, _)| *s == src)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (0..n).collect::<Vec<_>>(), "from core {}", src);
    }
}

macro_rules! fifo_test {
    ($num_cores:expr, $target_size:expr, $aggregation:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<per_destination_fifo_ $num_cores _cores_ $target_size _bytes_aggregation_ $aggregation>]() {
                let n = 500;
                let world = WorldBuilder::new()
                    .with_num_cores($num_cores)
                    .with_target_size($target_size)
                    .with_aggregation($aggregation)
                    .build();
                world.run(|core| async move {
                    let fifo = handler_id("tests::aggregation::fifo");
                    for seq in 0..n {
                        for dst in (0..core.num_cores()).filter(|d| *d != core.my_core()) {
                            core.send_am(dst, fifo, &seq);
                        }
                        if seq % 64 == 0 {
                            core.yield_now().await;
                        }
                    }
                    core.barrier().await;
                    check_fifo(&take_received(), core.my_core(), core.num_cores(), n);
                });
            }
        }
    };
}

fifo_test!(2, 4096, true);
fifo_test!(4, 4096, true);
fifo_test!(4, 64, true);
fifo_test!(3, 4096, false);

#[test]
#[serial]
fn every_message_is_delivered_exactly_once() {
    DELIVERED_SUM.store(0, Ordering::SeqCst);
    DELIVERED_CNT.store(0, Ordering::SeqCst);
    let num_cores = 4;
    let n = 1000u64;
    let world = WorldBuilder::new().with_num_cores(num_cores).build();
    world.run(|core| async move {
        let id = handler_id("tests::aggregation::count");
        for i in 0..n {
            // loopback included
            core.send_am((i as usize) % core.num_cores(), id, &i);
        }
    });
    assert_eq!(DELIVERED_CNT.load(Ordering::SeqCst), n * num_cores as u64);
    assert_eq!(
        DELIVERED_SUM.load(Ordering::SeqCst),
        num_cores as u64 * n * (n - 1) / 2
    );
}

#[test]
#[serial]
fn barrier_waits_for_messages_sent_by_handlers() {
    DELIVERED_CNT.store(0, Ordering::SeqCst);
    let world = WorldBuilder::new().with_num_cores(3).build();
    let seen = world.run(|core| async move {
        if core.my_core() == 0 {
            core.send_am(1, handler_id("tests::aggregation::bounce"), &20u64);
        }
        core.barrier().await;
        DELIVERED_CNT.load(Ordering::SeqCst)
    });
    assert!(seen.iter().all(|s| *s == 21), "{:?}", seen);
}

#[test]
#[serial]
fn explicit_flush_sends_one_buffer() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_target_size(1 << 20)
        .with_autoflush_ticks(60_000_000)
        .with_flush_on_idle(false)
        .build();
    world.run(|core| async move {
        if core.my_core() == 0 {
            let fifo = handler_id("tests::aggregation::fifo");
            for seq in 0..10u64 {
                core.send_am(1, fifo, &seq);
            }
            let aggregator = core.aggregator();
            assert_eq!(aggregator.pending_records(1), 10);
            assert_eq!(aggregator.stats().transport_sends, 0);
            assert!(core.flush(1));
            assert!(!core.flush(1));
            let stats = aggregator.stats();
            assert_eq!(stats.transport_sends, 1);
            assert_eq!(stats.requested_flushes, 1);
            assert_eq!(stats.records_per_flush.max(), 10);
            assert_eq!(aggregator.pending_records(1), 0);
        }
        core.barrier().await;
        if core.my_core() == 1 {
            check_fifo(&take_received(), 1, 2, 10);
        }
    });
}

#[test]
#[serial]
fn full_buffers_are_flushed() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_target_size(256)
        .with_autoflush_ticks(60_000_000)
        .with_flush_on_idle(false)
        .build();
    world.run(|core| async move {
        if core.my_core() == 0 {
            let fifo = handler_id("tests::aggregation::fifo");
            for seq in 0..100u64 {
                core.send_am_with_payload(1, fifo, &seq, &[0u8; 16]);
            }
            let stats = core.aggregator_stats();
            assert!(stats.capacity_flushes > 0);
            assert!(stats.aggregated_sizes.max() <= 256 + 64);
            assert!(core.aggregator().pending_bytes(1) < 256);
        }
        core.barrier().await;
        if core.my_core() == 1 {
            check_fifo(&take_received(), 1, 2, 100);
        }
    });
}

#[test]
#[serial]
fn old_records_time_out() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_target_size(1 << 20)
        .with_autoflush_ticks(200)
        .with_flush_on_idle(false)
        .build();
    world.run(|core| async move {
        if core.my_core() == 0 {
            core.send_am(1, handler_id("tests::aggregation::fifo"), &0u64);
            while core.aggregator().pending_records(1) > 0 {
                core.yield_now().await;
            }
            let stats = core.aggregator_stats();
            assert_eq!(stats.timeout_flushes, 1);
            assert!(stats.oldest_wait_ticks.max() >= 200);
        }
        core.barrier().await;
        take_received();
    });
}

#[test]
#[serial]
fn records_are_forwarded_through_their_route() {
    let n = 300;
    let world = WorldBuilder::new().with_num_cores(3).build();
    let stats = world.run(|core| async move {
        if core.my_core() == 0 {
            core.aggregator().set_route(2, 1);
            assert_eq!(core.aggregator().route(2), 1);
            let fifo = handler_id("tests::aggregation::fifo");
            for seq in 0..n {
                core.send_am(2, fifo, &seq);
            }
        }
        core.barrier().await;
        let received = take_received();
        if core.my_core() == 2 {
            let seqs: Vec<u64> = received.iter().map(|(_, seq)| *seq).collect();
            assert!(received.iter().all(|(src, _)| *src == 0));
            assert_eq!(seqs, (0..n).collect::<Vec<_>>());
        } else {
            assert!(received.is_empty());
        }
        core.aggregator_stats()
    });
    assert_eq!(stats[1].messages_forwarded, n);
    assert_eq!(stats[0].messages_forwarded, 0);
}

#[test]
#[serial]
fn routes_change_after_a_barrier() {
    let n = 100;
    let world = WorldBuilder::new().with_num_cores(3).build();
    let stats = world.run(|core| async move {
        let fifo = handler_id("tests::aggregation::fifo");
        if core.my_core() == 0 {
            core.aggregator().set_route(2, 1);
            for seq in 0..n {
                core.send_am(2, fifo, &seq);
            }
        }
        core.barrier().await;
        if core.my_core() == 0 {
            core.aggregator().set_route(2, 2);
            for seq in n..2 * n {
                core.send_am(2, fifo, &seq);
            }
        }
        core.barrier().await;
        let received = take_received();
        if core.my_core() == 2 {
            let seqs: Vec<u64> = received.iter().map(|(_, seq)| *seq).collect();
            assert_eq!(seqs, (0..2 * n).collect::<Vec<_>>());
        }
        core.aggregator_stats()
    });
    assert_eq!(stats[1].messages_forwarded, n);
}

#[test]
#[serial]
#[should_panic(expected = "records already went out via 1")]
fn changing_a_route_in_use_is_fatal() {
    let world = WorldBuilder::new().with_num_cores(3).build();
    world.run(|core| async move {
        if core.my_core() == 0 {
            let fifo = handler_id("tests::aggregation::fifo");
            core.aggregator().set_route(2, 1);
            core.send_am(2, fifo, &0u64);
            // a direct record could overtake the one forwarded by core 1
            core.aggregator().set_route(2, 2);
            core.send_am(2, fifo, &1u64);
        }
        core.barrier().await;
    });
}

#[test]
#[serial]
fn idle_cores_flush_their_buffers() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_target_size(1 << 20)
        .with_autoflush_ticks(60_000_000)
        .with_flush_on_idle(true)
        .build();
    world.run(|core| async move {
        if core.my_core() == 0 {
            let fifo = handler_id("tests::aggregation::fifo");
            for seq in 0..5u64 {
                core.send_am(1, fifo, &seq);
            }
            assert_eq!(core.aggregator().pending_records(1), 5);
            // core 1 only joins once the records arrive, so core 0 runs out of work first
            core.sum_reduce(0).await;
            let stats = core.aggregator_stats();
            assert!(stats.idle_flushes > 0, "{:?}", stats);
            assert_eq!(stats.timeout_flushes, 0);
            assert_eq!(stats.requested_flushes, 0);
        } else {
            while RECEIVED.with(|r| r.borrow().len()) < 5 {
                core.yield_now().await;
            }
            core.sum_reduce(0).await;
            check_fifo(&take_received(), 1, 2, 5);
        }
    });
}

#[test]
#[serial]
fn disabled_aggregation_sends_every_record_alone() {
    let world = WorldBuilder::new()
        .with_num_cores(2)
        .with_aggregation(false)
        .build();
    world.run(|core| async move {
        if core.my_core() == 1 {
            for seq in 0..25u64 {
                core.send_am(0, handler_id("tests::aggregation::fifo"), &seq);
            }
            let stats = core.aggregator_stats();
            assert_eq!(stats.immediate_sends, 25);
            assert_eq!(stats.messages_aggregated, 0);
            assert_eq!(core.aggregator().pending_records(0), 0);
        }
        core.barrier().await;
        if core.my_core() == 0 {
            check_fifo(&take_received(), 0, 2, 25);
        }
    });
}

#[test]
#[serial]
#[should_panic(expected = "unknown handler id")]
fn unknown_handler_ids_are_fatal() {
    let world = WorldBuilder::new().with_num_cores(2).build();
    world.run(|core| async move {
        if core.my_core() == 0 {
            core.send(1, 0, &[], &[]);
        }
    });
}

use crate::active_messaging::{handler_id, register_uncounted_handler, Envelope, HandlerId};
use crate::lamellar_core::Core;
use crate::wait_queue::WaitQueue;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Instant;

const ROOT: usize = 0;

#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct CollectiveArgs {
    epoch: u64,
    values: Vec<i64>,
}

/// Per core state of the collectives, core 0 acts as the root of every reduction
#[derive(Debug, Default)]
pub(crate) struct Barrier {
    next_epoch: Cell<u64>,
    // root only: epoch -> (arrived cores, partial sums)
    arrivals: RefCell<HashMap<u64, (usize, Vec<i64>)>>,
    releases: RefCell<HashMap<u64, Vec<i64>>>,
    waiters: WaitQueue,
    barrier_cnt: Cell<usize>,
}

lazy_static! {
    static ref ARRIVE_ID: HandlerId = handler_id("lamellar::collective_arrive");
    static ref RELEASE_ID: HandlerId = handler_id("lamellar::collective_release");
}

fn collective_arrive(core: &Core, msg: Envelope<'_>) {
    let args: CollectiveArgs = msg.args_as();
    let state = core.barrier_state();
    let complete = {
        let mut arrivals = state.arrivals.borrow_mut();
        let entry = arrivals
            .entry(args.epoch)
            .or_insert_with(|| (0, vec![0; args.values.len()]));
        if entry.1.len() != args.values.len() {
            fatal!(
                "core {} joined collective {} with {} values, expected {}",
                msg.source,
                args.epoch,
                args.values.len(),
                entry.1.len()
            );
        }
        entry.0 += 1;
        for (sum, v) in entry.1.iter_mut().zip(args.values.iter()) {
            *sum += v;
        }
        if entry.0 == core.num_cores() {
            arrivals.remove(&args.epoch)
        } else {
            None
        }
    };
    if let Some((_, sums)) = complete {
        let release = CollectiveArgs {
            epoch: args.epoch,
            values: sums,
        };
        for dst in 0..core.num_cores() {
            core.send_am(dst, *RELEASE_ID, &release);
        }
        core.flush_all();
    }
}
register_uncounted_handler!("lamellar::collective_arrive", collective_arrive);

fn collective_release(core: &Core, msg: Envelope<'_>) {
    let args: CollectiveArgs = msg.args_as();
    let state = core.barrier_state();
    state
        .releases
        .borrow_mut()
        .insert(args.epoch, args.values);
    state.waiters.broadcast();
}
register_uncounted_handler!("lamellar::collective_release", collective_release);

impl Barrier {
    pub(crate) fn new() -> Barrier {
        Barrier::default()
    }

    /// Element wise sum of `values` over every core, every core gets the result.
    ///
    /// Collective: every core must make the same sequence of calls.
    pub(crate) async fn all_reduce_sum(&self, core: &Core, values: Vec<i64>) -> Vec<i64> {
        let epoch = self.next_epoch.get();
        self.next_epoch.set(epoch + 1);
        core.send_am(ROOT, *ARRIVE_ID, &CollectiveArgs { epoch, values });
        core.flush(ROOT);
        loop {
            if let Some(values) = self.releases.borrow_mut().remove(&epoch) {
                return values;
            }
            self.waiters.wait().await;
        }
    }

    /// Wait until every core has entered the barrier and every counted message sent before
    /// has been delivered, including messages sent by the handlers of those messages.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) async fn barrier(&self, core: &Core) {
        let barrier_id = self.barrier_cnt.get();
        self.barrier_cnt.set(barrier_id + 1);
        let mut s = Instant::now();
        let mut previous = None;
        let mut waves = 0;
        loop {
            core.flush_all();
            let (sent, delivered) = core.aggregator().counted_messages();
            let totals = self
                .all_reduce_sum(core, vec![sent as i64, delivered as i64])
                .await;
            waves += 1;
            let totals = (totals[0], totals[1]);
            // equal and unchanged over two consecutive waves means nothing was in flight
            if totals.0 == totals.1 && previous == Some(totals) {
                core.aggregator().quiesced();
                tracing::trace!(
                    "core {} left barrier {} after {} waves",
                    core.my_core(),
                    barrier_id,
                    waves
                );
                return;
            }
            previous = Some(totals);
            if s.elapsed().as_secs_f64() > core.deadlock_timeout() {
                tracing::warn!(
                    "[WARNING] Potential deadlock detected in barrier {} on core {}.\n\
                    Barrier is a collective operation requiring all cores to enter the barrier call.\n\
                    {} messages sent, {} delivered after {} waves.\n\
                    The deadlock timeout can be set via the LAMELLAR_DEADLOCK_TIMEOUT environment variable, the current timeout is {} seconds",
                    barrier_id,
                    core.my_core(),
                    totals.0,
                    totals.1,
                    waves,
                    core.deadlock_timeout()
                );
                s = Instant::now();
            }
        }
    }

    /// drop any parked waiters, used at teardown
    pub(crate) fn clear(&self) {
        self.waiters.broadcast();
        self.arrivals.borrow_mut().clear();
        self.releases.borrow_mut().clear();
    }
}

use crate::active_messaging::aggregator::{Aggregator, AggregatorConfig};
use crate::active_messaging::delegate::{self, ReplyTable};
use crate::active_messaging::HandlerId;
use crate::barrier::Barrier;
use crate::global_address::BlockCyclic;
use crate::lamellae::{Lamellae, LamellaeComm};
use crate::scheduler::{CoreScheduler, CoreTask};
use crate::stats::AggregatorStats;
use crate::symmetric::{ReplyTo, SymmetricId, SymmetricObject, SymmetricRegistry};

use futures::Future;
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// tasks polled between two rounds of message progress
const TASKS_PER_ROUND: usize = 64;
const MAX_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Settings shared by every core of a world
#[derive(Debug, Clone)]
pub(crate) struct CoreSettings {
    pub(crate) aggregator: AggregatorConfig,
    pub(crate) flat_combining: bool,
    pub(crate) combiner_batch_size: usize,
    pub(crate) block_size: usize,
    pub(crate) deadlock_timeout: f64,
}

/// Marker payload used to unwind cores once another core of the job has panicked
#[derive(Debug)]
pub(crate) struct JobAborted;

struct CoreInner {
    my_core: usize,
    num_cores: usize,
    aggregator: Aggregator,
    scheduler: CoreScheduler,
    symmetric: SymmetricRegistry,
    replies: ReplyTable,
    barrier: Barrier,
    settings: CoreSettings,
    abort: Arc<AtomicBool>,
}

/// The runtime handle of one core.
///
/// A core is a single thread running many cooperative tasks. The handle is cheap to clone and is
/// passed to every task and every active message handler of the core; it is not `Send`.
#[derive(Clone)]
pub struct Core {
    inner: Rc<CoreInner>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Core[{}/{}]", self.inner.my_core, self.inner.num_cores)
    }
}

impl Core {
    pub(crate) fn new(lamellae: Lamellae, settings: CoreSettings, abort: Arc<AtomicBool>) -> Core {
        let my_core = lamellae.my_core();
        let num_cores = lamellae.num_cores();
        Core {
            inner: Rc::new(CoreInner {
                my_core,
                num_cores,
                aggregator: Aggregator::new(lamellae, settings.aggregator.clone()),
                scheduler: CoreScheduler::new(),
                symmetric: SymmetricRegistry::new(),
                replies: ReplyTable::new(),
                barrier: Barrier::new(),
                settings,
                abort,
            }),
        }
    }

    /// Returns the id of this core (roughly equivalent to MPI Rank)
    pub fn my_core(&self) -> usize {
        self.inner.my_core
    }

    /// Returns the number of cores in the job
    pub fn num_cores(&self) -> usize {
        self.inner.num_cores
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.inner.aggregator
    }

    pub fn aggregator_stats(&self) -> AggregatorStats {
        self.inner.aggregator.stats()
    }

    /// Whether containers route their operations through a flat combiner
    pub fn flat_combining(&self) -> bool {
        self.inner.settings.flat_combining
    }

    /// Number of distinct operations a combining batch holds before it reports full
    pub fn combiner_batch_size(&self) -> usize {
        self.inner.settings.combiner_batch_size
    }

    /// The layout distributed containers of this world use
    pub fn block_cyclic(&self) -> BlockCyclic {
        BlockCyclic::new(self.inner.settings.block_size, self.inner.num_cores)
    }

    pub(crate) fn deadlock_timeout(&self) -> f64 {
        self.inner.settings.deadlock_timeout
    }

    pub(crate) fn replies(&self) -> &ReplyTable {
        &self.inner.replies
    }

    pub(crate) fn barrier_state(&self) -> &Barrier {
        &self.inner.barrier
    }

    //----------------------------------------------------------------------------
    // active messages

    /// Send an active message to `dst`.
    ///
    /// The message is buffered and will be delivered exactly once, after the messages
    /// previously sent to `dst` from this core. Sending to this core runs the handler right away.
    pub fn send(&self, dst: usize, handler: HandlerId, args: &[u8], payload: &[u8]) {
        self.send_tagged(dst, handler, 0, args, payload)
    }

    /// [send][Core::send] with an explicit tag word
    pub fn send_tagged(&self, dst: usize, handler: HandlerId, tag: u64, args: &[u8], payload: &[u8]) {
        self.inner
            .aggregator
            .send_tagged(self, dst, handler, tag, args, payload)
    }

    /// Serialize `args` and send them to `dst`
    pub fn send_am<A: Serialize + ?Sized>(&self, dst: usize, handler: HandlerId, args: &A) {
        self.send_am_with_payload(dst, handler, args, &[])
    }

    pub fn send_am_with_payload<A: Serialize + ?Sized>(
        &self,
        dst: usize,
        handler: HandlerId,
        args: &A,
        payload: &[u8],
    ) {
        match crate::serialize(args) {
            Ok(args) => self.send(dst, handler, &args, payload),
            Err(e) => fatal!("failed to encode active message arguments: {}", e),
        }
    }

    /// Hand the buffer holding messages for `dst` to the transport
    pub fn flush(&self, dst: usize) -> bool {
        self.inner.aggregator.flush(dst)
    }

    pub fn flush_all(&self) -> usize {
        self.inner.aggregator.flush_all()
    }

    //----------------------------------------------------------------------------
    // tasks

    /// Spawn a task on this core, the returned handle cancels the task when dropped
    pub fn spawn<F>(&self, task: F) -> CoreTask<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.inner.scheduler.spawn(task)
    }

    /// Spawn a task on this core and let it run to completion on its own
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.scheduler.spawn(task).detach()
    }

    /// Let the other tasks of this core run
    pub async fn yield_now(&self) {
        futures_lite::future::yield_now().await
    }

    /// Global barrier with message quiescence.
    ///
    /// Returns once every core has entered the barrier and every message sent before it
    /// (and every message those messages caused) has been delivered.
    /// Collective: every core must call it, in the same order as other collectives.
    pub async fn barrier(&self) {
        self.inner.barrier.barrier(self).await
    }

    /// Sum `value` over all cores. Collective.
    pub async fn sum_reduce(&self, value: i64) -> i64 {
        let sums = self.inner.barrier.all_reduce_sum(self, vec![value]).await;
        sums[0]
    }

    //----------------------------------------------------------------------------
    // symmetric objects and delegate calls

    /// Allocate a symmetric object, every core must allocate the same objects in the same order
    pub fn alloc_symmetric<T, F>(&self, init: F) -> Rc<T>
    where
        T: SymmetricObject,
        F: FnOnce(SymmetricId) -> T,
    {
        self.inner.symmetric.alloc_with(init)
    }

    /// This core's instance of a symmetric object
    pub fn symmetric<T: 'static>(&self, id: SymmetricId) -> Option<Rc<T>> {
        self.inner.symmetric.get_as::<T>(id)
    }

    pub(crate) fn symmetric_object(&self, id: SymmetricId) -> Option<Rc<dyn SymmetricObject>> {
        self.inner.symmetric.get(id)
    }

    /// Send raw request bytes to `object` on `dst` and wait for the raw reply
    pub async fn call_raw(&self, dst: usize, object: SymmetricId, body: &[u8]) -> Vec<u8> {
        delegate::call_raw(self, dst, object, body).await
    }

    /// Send a request to `object` on `dst` and wait for its reply
    pub async fn call<Req, Resp>(&self, dst: usize, object: SymmetricId, request: &Req) -> Resp
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = match crate::serialize(request) {
            Ok(body) => body,
            Err(e) => fatal!("failed to encode request: {}", e),
        };
        let reply = delegate::call_raw(self, dst, object, &body).await;
        match crate::deserialize(&reply) {
            Ok(reply) => reply,
            Err(e) => fatal!("malformed reply from core {}: {}", dst, e),
        }
    }

    /// Send a request to `object` on `dst` without waiting for, or receiving, a reply
    pub fn post<Req: Serialize + ?Sized>(&self, dst: usize, object: SymmetricId, request: &Req) {
        match crate::serialize(request) {
            Ok(body) => delegate::post_raw(self, dst, object, &body),
            Err(e) => fatal!("failed to encode request: {}", e),
        }
    }

    /// Answer a request whose object returned [Response::Deferred][crate::Response::Deferred]
    pub fn reply<T: Serialize + ?Sized>(&self, reply_to: ReplyTo, value: &T) {
        match crate::serialize(value) {
            Ok(data) => delegate::reply(self, reply_to, &data),
            Err(e) => fatal!("failed to encode reply: {}", e),
        }
    }

    //----------------------------------------------------------------------------
    // progress

    fn check_abort(&self) {
        if self.inner.abort.load(Ordering::Relaxed) {
            tracing::debug!("core {} stopping, another core panicked", self.inner.my_core);
            std::panic::resume_unwind(Box::new(JobAborted));
        }
    }

    /// Drive this core until `task` completes: run ready tasks, poll the aggregator,
    /// and when there is nothing to do flush on idle or sleep on the transport.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn block_on<F>(&self, task: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        self.submit(async move {
            let res = task.await;
            *slot.borrow_mut() = Some(res);
        });
        let aggregator = &self.inner.aggregator;
        let scheduler = &self.inner.scheduler;
        loop {
            self.check_abort();
            let ran = scheduler.run_ready(TASKS_PER_ROUND);
            let progressed = aggregator.poll(self);
            if let Some(res) = result.borrow_mut().take() {
                return res;
            }
            if ran == 0 && progressed == 0 && scheduler.is_idle() {
                if aggregator.idle_flush_poll() == 0 {
                    let wait = aggregator
                        .next_timeout()
                        .map_or(MAX_IDLE_WAIT, |t| t.min(MAX_IDLE_WAIT));
                    aggregator.wait_for_message(wait);
                }
            }
        }
    }

    /// Break the reference cycles between the core and its tasks and objects
    pub(crate) fn shutdown(&self) {
        let stats = self.inner.aggregator.stats();
        tracing::debug!(
            "core {} shutting down: {} tasks spawned ({} completed), {} transport sends, {} bytes, {:.3} MB sent, {} replies outstanding\n{:?}",
            self.inner.my_core,
            self.inner.scheduler.num_spawned(),
            self.inner.scheduler.num_completed(),
            stats.transport_sends,
            stats.transport_bytes,
            self.inner.aggregator.MB_sent(),
            self.inner.replies.outstanding(),
            stats
        );
        self.inner.barrier.clear();
        self.inner.replies.clear();
        self.inner.symmetric.clear();
        self.inner.scheduler.shutdown();
    }
}

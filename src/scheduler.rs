use async_task::{Builder, Runnable};
use crossbeam::queue::SegQueue;
use futures::Future;
use std::cell::Cell;
use std::sync::Arc;
use tracing::{trace_span, Instrument};

/// Handle to a task spawned on a core, awaiting it yields the task's output.
///
/// Dropping the handle cancels the task, use [detach][async_task::Task::detach] to let it run to completion.
pub type CoreTask<T> = async_task::Task<T, usize>;

/// A single-worker cooperative executor.
///
/// Every task spawned here is polled on the thread that owns the core, so tasks are free to hold
/// `Rc`s and `RefCell`s. Wakers may still be invoked from any thread, which only pushes the task
/// back onto the ready queue.
#[derive(Debug)]
pub(crate) struct CoreScheduler {
    ready: Arc<SegQueue<Runnable<usize>>>,
    next_task_id: Cell<usize>,
    completed: Arc<std::sync::atomic::AtomicUsize>,
}

impl CoreScheduler {
    pub(crate) fn new() -> CoreScheduler {
        CoreScheduler {
            ready: Arc::new(SegQueue::new()),
            next_task_id: Cell::new(0),
            completed: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F) -> CoreTask<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let task_id = self.next_task_id.get();
        self.next_task_id.set(task_id + 1);
        let ready = self.ready.clone();
        let completed = self.completed.clone();
        let schedule = move |runnable| ready.push(runnable);
        let (runnable, task) = Builder::new().metadata(task_id).spawn_local(
            move |_task_id| {
                async move {
                    let res = task.await;
                    completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    res
                }
                .instrument(trace_span!("Core Task", task_id = task_id))
            },
            schedule,
        );
        runnable.schedule();
        task
    }

    /// Poll at most `max` ready tasks, returns how many were polled
    pub(crate) fn run_ready(&self, max: usize) -> usize {
        let mut ran = 0;
        while ran < max {
            match self.ready.pop() {
                Some(runnable) => {
                    runnable.run();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    pub(crate) fn num_spawned(&self) -> usize {
        self.next_task_id.get()
    }

    pub(crate) fn num_completed(&self) -> usize {
        self.completed.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Drop every task that is still queued, used at teardown to release the
    /// references those tasks hold back into the core
    pub(crate) fn shutdown(&self) {
        while let Some(runnable) = self.ready.pop() {
            drop(runnable);
        }
    }
}

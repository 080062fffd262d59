use crate::active_messaging::aggregator::AggregatorConfig;
use crate::config;
use crate::lamellae::{create_lamellae, Backend};
use crate::lamellar_core::{Core, CoreSettings, JobAborted};

use futures::Future;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

type PanicPayload = Box<dyn Any + Send + 'static>;

/// A job of `num_cores` cores.
///
/// A world does not own any thread by itself, [run][World::run] launches one thread per core,
/// drives them until every core is done and tears them down again.
#[derive(Debug, Clone)]
pub struct World {
    backend: Backend,
    num_cores: usize,
    settings: CoreSettings,
    pin_cores: bool,
}

impl World {
    /// Returns the number of cores a [run][World::run] launches
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn aggregator_config(&self) -> &AggregatorConfig {
        &self.settings.aggregator
    }

    /// Run `main` on every core and return the per-core results, indexed by core.
    ///
    /// Each core gets its own [Core] handle, runs the future `main` returns and then enters a
    /// final barrier, so every message sent during the run has been delivered before this returns.
    /// A panic on any core stops the whole job and is re-raised here.
    ///
    /// # Examples
    ///```
    /// use lamellar_aggregator::WorldBuilder;
    ///
    /// let world = WorldBuilder::new().with_num_cores(2).build();
    /// let ids = world.run(|core| async move { core.my_core() });
    /// assert_eq!(ids, vec![0, 1]);
    ///```
    pub fn run<F, Fut, R>(&self, main: F) -> Vec<R>
    where
        F: Fn(Core) -> Fut + Sync,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let lamellaes = create_lamellae(self.backend, self.num_cores);
        let abort = Arc::new(AtomicBool::new(false));
        let failure: Mutex<Option<(usize, PanicPayload)>> = Mutex::new(None);
        let core_ids = if self.pin_cores {
            match core_affinity::get_core_ids() {
                Some(ids) if !ids.is_empty() => ids,
                _ => {
                    tracing::warn!("unable to read the cpu list, core threads will not be pinned");
                    vec![]
                }
            }
        } else {
            vec![]
        };
        tracing::debug!(
            "launching {} cores on the {:?} lamellae",
            self.num_cores,
            self.backend
        );

        let results: Vec<Option<R>> = thread::scope(|scope| {
            let handles: Vec<_> = lamellaes
                .into_iter()
                .enumerate()
                .map(|(i, lamellae)| {
                    let main = &main;
                    let failure = &failure;
                    let abort = abort.clone();
                    let settings = self.settings.clone();
                    let cpu = if core_ids.is_empty() {
                        None
                    } else {
                        Some(core_ids[i % core_ids.len()])
                    };
                    let builder = thread::Builder::new().name(format!("lamellar_core_{}", i));
                    let spawned = builder.spawn_scoped(scope, move || {
                        if let Some(cpu) = cpu {
                            core_affinity::set_for_current(cpu);
                        }
                        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            tracing::trace_span!("core", core = i).in_scope(|| {
                                let core = Core::new(lamellae, settings, abort.clone());
                                let task = main(core.clone());
                                let core2 = core.clone();
                                let res = core.block_on(async move {
                                    let res = task.await;
                                    core2.barrier().await;
                                    res
                                });
                                core.shutdown();
                                res
                            })
                        }));
                        match outcome {
                            Ok(res) => Some(res),
                            Err(payload) => {
                                if !payload.is::<JobAborted>() && !abort.swap(true, Ordering::SeqCst)
                                {
                                    *failure.lock() = Some((i, payload));
                                }
                                None
                            }
                        }
                    });
                    match spawned {
                        Ok(handle) => handle,
                        Err(e) => fatal!("failed to launch the thread of core {}: {}", i, e),
                    }
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(res) => res,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        });

        if let Some((core, payload)) = failure.into_inner() {
            tracing::error!("core {} panicked, the job has been aborted", core);
            std::panic::resume_unwind(payload);
        }
        results.into_iter().flatten().collect()
    }
}

/// An implementation of the Builder design pattern, used to construct an instance of a World.
///
/// Every setting starts from its `LAMELLAR_*` environment variable.
///
/// # Examples
///
///```
/// use lamellar_aggregator::{Backend, WorldBuilder};
///
/// let world = WorldBuilder::new()
///                 .with_lamellae(Backend::Local)
///                 .with_num_cores(8)
///                 .with_target_size(1 << 16)
///                 .build();
///```
#[derive(Debug, Clone)]
pub struct WorldBuilder {
    backend: Backend,
    num_cores: usize,
    settings: CoreSettings,
    pin_cores: bool,
}

impl Default for WorldBuilder {
    fn default() -> Self {
        WorldBuilder::new()
    }
}

impl WorldBuilder {
    /// Construct a new world builder
    pub fn new() -> WorldBuilder {
        let config = config();
        WorldBuilder {
            backend: Default::default(),
            num_cores: config.num_cores,
            settings: CoreSettings {
                aggregator: AggregatorConfig::default(),
                flat_combining: config.flat_combining,
                combiner_batch_size: config.combiner_batch_size,
                block_size: config.block_size,
                deadlock_timeout: config.deadlock_timeout,
            },
            pin_cores: config.pin_cores.unwrap_or(false),
        }
    }

    /// Specify the lamellae backend to use for this execution
    pub fn with_lamellae(mut self, lamellae: Backend) -> WorldBuilder {
        self.backend = lamellae;
        self
    }

    pub fn with_num_cores(mut self, num_cores: usize) -> WorldBuilder {
        self.num_cores = num_cores;
        self
    }

    /// Block size of the layout containers use
    pub fn with_block_size(mut self, block_size: usize) -> WorldBuilder {
        self.settings.block_size = block_size;
        self
    }

    pub fn with_flat_combining(mut self, enabled: bool) -> WorldBuilder {
        self.settings.flat_combining = enabled;
        self
    }

    pub fn with_combiner_batch_size(mut self, batch_size: usize) -> WorldBuilder {
        self.settings.combiner_batch_size = batch_size;
        self
    }

    pub fn with_aggregator_config(mut self, aggregator: AggregatorConfig) -> WorldBuilder {
        self.settings.aggregator = aggregator;
        self
    }

    pub fn with_target_size(mut self, target_size: usize) -> WorldBuilder {
        self.settings.aggregator.target_size = target_size;
        self
    }

    pub fn with_autoflush_ticks(mut self, ticks: u64) -> WorldBuilder {
        self.settings.aggregator.autoflush_ticks = ticks;
        self
    }

    /// Turn aggregation off to hand every record to the transport on its own
    pub fn with_aggregation(mut self, enabled: bool) -> WorldBuilder {
        self.settings.aggregator.aggregation_enabled = enabled;
        self
    }

    pub fn with_flush_on_idle(mut self, enabled: bool) -> WorldBuilder {
        self.settings.aggregator.flush_on_idle = enabled;
        self
    }

    pub fn with_pin_cores(mut self, pin: bool) -> WorldBuilder {
        self.pin_cores = pin;
        self
    }

    /// Instantiate a World
    pub fn build(self) -> World {
        if self.num_cores == 0 {
            fatal!("a world needs at least one core");
        }
        if self.settings.block_size == 0 {
            fatal!("the block size of a world must be positive");
        }
        if self.settings.combiner_batch_size == 0 {
            fatal!("the combiner batch size of a world must be positive");
        }
        tracing::trace!("built world: {:?}", self);
        World {
            backend: self.backend,
            num_cores: self.num_cores,
            settings: self.settings,
            pin_cores: self.pin_cores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_are_indexed_by_core() {
        let world = WorldBuilder::new().with_num_cores(3).build();
        let res = world.run(|core| async move { core.my_core() * 10 + core.num_cores() });
        assert_eq!(res, vec![3, 13, 23]);
    }

    #[test]
    fn a_world_can_run_more_than_once() {
        let world = WorldBuilder::new().with_num_cores(2).build();
        for _ in 0..3 {
            let res = world.run(|core| async move { core.sum_reduce(1).await });
            assert_eq!(res, vec![2, 2]);
        }
    }

    #[test]
    #[should_panic(expected = "core 1 gives up")]
    fn a_panic_on_one_core_aborts_the_job() {
        let world = WorldBuilder::new().with_num_cores(2).build();
        world.run(|core| async move {
            if core.my_core() == 1 {
                panic!("core {} gives up", core.my_core());
            }
            // never completes, core 1 is gone
            core.barrier().await;
        });
    }

    #[test]
    #[should_panic(expected = "at least one core")]
    fn zero_cores_is_fatal() {
        WorldBuilder::new().with_num_cores(0).build();
    }
}

use crate::flat_combining::{Combinable, FcStatus, FlatCombiner};
use crate::lamellar_core::Core;
use crate::symmetric::{Request, Response, SymmetricId, SymmetricObject};
use crate::stats::CombinerStats;

use async_trait::async_trait;
use std::cell::Cell;
use std::rc::Rc;

const MASTER: usize = 0;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy)]
enum CounterRequest {
    Add(i64),
    Read,
}

/// Deltas of one batch, merged into a single `Add`
struct CounterBatch {
    core: Core,
    id: SymmetricId,
    delta: i64,
    ops: usize,
    batch_size: usize,
}

#[async_trait(?Send)]
impl Combinable for CounterBatch {
    async fn sync(&mut self) {
        let _: () = self
            .core
            .call(MASTER, self.id, &CounterRequest::Add(self.delta))
            .await;
    }
    fn clear(&mut self) {
        self.delta = 0;
        self.ops = 0;
    }
    fn is_full(&self) -> bool {
        self.ops >= self.batch_size
    }
    fn clone_fresh(&self) -> Self {
        CounterBatch {
            core: self.core.clone(),
            id: self.id,
            delta: 0,
            ops: 0,
            batch_size: self.batch_size,
        }
    }
}

struct CounterShard {
    id: SymmetricId,
    // only meaningful on the master core
    value: Cell<i64>,
    combiner: FlatCombiner<CounterBatch>,
}

impl SymmetricObject for CounterShard {
    fn handle_request(&self, core: &Core, request: Request) -> Response {
        if core.my_core() != MASTER {
            fatal!("counter {} request delivered to core {}", self.id, core.my_core());
        }
        match request.body_as::<CounterRequest>() {
            CounterRequest::Add(delta) => {
                self.value.set(self.value.get() + delta);
                Response::ready(&())
            }
            CounterRequest::Read => Response::ready(&self.value.get()),
        }
    }
}

/// A single integer kept on core 0, incremented from anywhere.
///
/// Concurrent increments on one core are merged into one message per batch.
#[derive(Clone)]
pub struct GlobalCounter {
    core: Core,
    shard: Rc<CounterShard>,
}

impl std::fmt::Debug for GlobalCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GlobalCounter[{}]", self.shard.id)
    }
}

impl GlobalCounter {
    /// Collective
    pub fn new(core: &Core) -> GlobalCounter {
        let shard = core.alloc_symmetric(|id| CounterShard {
            id,
            value: Cell::new(0),
            combiner: FlatCombiner::new(CounterBatch {
                core: core.clone(),
                id,
                delta: 0,
                ops: 0,
                batch_size: core.combiner_batch_size(),
            }),
        });
        GlobalCounter {
            core: core.clone(),
            shard,
        }
    }

    pub fn id(&self) -> SymmetricId {
        self.shard.id
    }

    /// Add `delta`, returns once the addition is visible on the master core
    pub async fn increment(&self, delta: i64) {
        if self.core.flat_combining() {
            self.shard
                .combiner
                .combine(|batch| {
                    batch.delta += delta;
                    batch.ops += 1;
                    FcStatus::Blocked
                })
                .await;
        } else {
            let _: () = self
                .core
                .call(MASTER, self.shard.id, &CounterRequest::Add(delta))
                .await;
        }
    }

    pub async fn read(&self) -> i64 {
        self.core
            .call(MASTER, self.shard.id, &CounterRequest::Read)
            .await
    }

    pub fn combiner_stats(&self) -> CombinerStats {
        self.shard.combiner.stats()
    }
}

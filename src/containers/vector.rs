//! A distributed vector with a fixed capacity.
//!
//! Elements live in a block-cyclic array spread over every core, the current size is kept by the
//! master (core 0). Pushes and pops issued on one core are combined: a push and a pop that meet in
//! the same batch cancel out locally, whatever is left is sent to the master as one `Push` and
//! one `Pop` request. The master reserves indices and moves elements to and from their owning cores.
use super::{result_cell, ResultCell};
use crate::active_messaging::delegate::{self, ReplyFuture};
use crate::flat_combining::{Combinable, FcStatus, FlatCombiner};
use crate::global_address::{BlockCyclic, GlobalAddress};
use crate::lamellar_core::Core;
use crate::stats::CombinerStats;
use crate::symmetric::{Request, Response, SymmetricId, SymmetricObject};

use async_trait::async_trait;
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const MASTER: usize = 0;

#[derive(Serialize, Deserialize, Debug)]
#[serde(bound = "T: Serialize + DeserializeOwned")]
enum VectorRequest<T> {
    // to the master
    Push(Vec<T>),
    Pop(usize),
    Get(usize),
    Size,
    // to the owner of the elements, indices are local offsets
    Put(Vec<(usize, T)>),
    Take(Vec<usize>),
    Read(usize),
}

/// Element types a [GlobalVector] can hold
pub trait VectorElement: Serialize + DeserializeOwned + Clone + 'static {}
impl<T: Serialize + DeserializeOwned + Clone + 'static> VectorElement for T {}

struct VectorBatch<T> {
    core: Core,
    id: SymmetricId,
    pushes: Vec<T>,
    pops: Vec<ResultCell<T>>,
    batch_size: usize,
}

#[async_trait(?Send)]
impl<T: VectorElement> Combinable for VectorBatch<T> {
    async fn sync(&mut self) {
        if !self.pushes.is_empty() {
            let values = std::mem::take(&mut self.pushes);
            let _start: usize = self
                .core
                .call(MASTER, self.id, &VectorRequest::Push(values))
                .await;
        }
        if !self.pops.is_empty() {
            let popped: Vec<Option<T>> = self
                .core
                .call(
                    MASTER,
                    self.id,
                    &VectorRequest::<T>::Pop(self.pops.len()),
                )
                .await;
            for (cell, value) in self.pops.iter().zip(popped) {
                *cell.borrow_mut() = value;
            }
        }
    }
    fn clear(&mut self) {
        self.pushes.clear();
        self.pops.clear();
    }
    fn is_full(&self) -> bool {
        self.pushes.len() + self.pops.len() >= self.batch_size
    }
    fn clone_fresh(&self) -> Self {
        VectorBatch {
            core: self.core.clone(),
            id: self.id,
            pushes: Vec::new(),
            pops: Vec::new(),
            batch_size: self.batch_size,
        }
    }
    fn is_empty(&self) -> bool {
        self.pushes.is_empty() && self.pops.is_empty()
    }
}

struct VectorShard<T: VectorElement> {
    id: SymmetricId,
    layout: BlockCyclic,
    capacity: usize,
    // master only
    size: Cell<usize>,
    storage: RefCell<Vec<Option<T>>>,
    combiner: FlatCombiner<VectorBatch<T>>,
}

impl<T: VectorElement> VectorShard<T> {
    fn address(&self, index: usize) -> GlobalAddress<T> {
        GlobalAddress::linear(self.layout, index)
    }

    fn check_master(&self, core: &Core) {
        if core.my_core() != MASTER {
            fatal!("vector {} master request delivered to core {}", self.id, core.my_core());
        }
    }

    fn local_slot<R>(&self, local: usize, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        let mut storage = self.storage.borrow_mut();
        match storage.get_mut(local) {
            Some(slot) => f(slot),
            None => fatal!(
                "vector {} local offset {} out of range ({} slots)",
                self.id,
                local,
                storage.len()
            ),
        }
    }

    fn push_on_master(&self, core: &Core, values: Vec<T>) -> usize {
        let start = self.size.get();
        if start + values.len() > self.capacity {
            fatal!(
                "vector {} overflow: {} + {} elements exceeds the capacity of {}",
                self.id,
                start,
                values.len(),
                self.capacity
            );
        }
        self.size.set(start + values.len());
        let by_owner = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let (owner, local) = self.address(start + i).decompose();
                (owner, (local, v))
            })
            .into_group_map();
        // puts go out before any later take of the same slots, the channel to the owner is FIFO
        for (owner, items) in by_owner {
            core.post(owner, self.id, &VectorRequest::Put(items));
        }
        start
    }

    /// Hands `request` to the owner right away, so it is ordered before anything the master
    /// sends to that owner afterwards
    fn send_now(&self, core: &Core, owner: usize, request: &VectorRequest<T>) -> ReplyFuture {
        let body = match crate::serialize(request) {
            Ok(body) => body,
            Err(e) => fatal!("failed to encode a vector request: {}", e),
        };
        delegate::call_raw(core, owner, self.id, &body)
    }

    fn pop_on_master(&self, core: &Core, request: &Request, count: usize) -> Response {
        let size = self.size.get();
        let taken = count.min(size);
        self.size.set(size - taken);
        // most recently pushed first
        let by_owner = (size - taken..size)
            .rev()
            .enumerate()
            .map(|(pos, index)| {
                let (owner, local) = self.address(index).decompose();
                (owner, (pos, local))
            })
            .into_group_map();
        // the takes must leave before the handler returns, a push handled next reuses the slots
        let pending: Vec<(Vec<usize>, ReplyFuture)> = by_owner
            .into_iter()
            .map(|(owner, slots)| {
                let (positions, locals): (Vec<usize>, Vec<usize>) = slots.into_iter().unzip();
                let reply = self.send_now(core, owner, &VectorRequest::Take(locals));
                (positions, reply)
            })
            .collect();
        let core2 = core.clone();
        let reply_to = request.reply_to;
        core.submit(async move {
            let mut values: Vec<Option<T>> = vec![None; count];
            for (positions, reply) in pending {
                let bytes = reply.await;
                let taken: Vec<Option<T>> = match crate::deserialize(&bytes) {
                    Ok(taken) => taken,
                    Err(e) => fatal!("failed to decode taken vector slots: {}", e),
                };
                for (pos, value) in positions.into_iter().zip(taken) {
                    values[pos] = value;
                }
            }
            core2.reply(reply_to, &values);
        });
        Response::Deferred
    }

    fn get_on_master(&self, core: &Core, request: &Request, index: usize) -> Response {
        if index >= self.size.get() {
            return Response::ready(&Option::<T>::None);
        }
        let (owner, local) = self.address(index).decompose();
        let reply = self.send_now(core, owner, &VectorRequest::Read(local));
        let core2 = core.clone();
        let reply_to = request.reply_to;
        core.submit(async move {
            let bytes = reply.await;
            let value: Option<T> = match crate::deserialize(&bytes) {
                Ok(value) => value,
                Err(e) => fatal!("failed to decode a vector slot: {}", e),
            };
            core2.reply(reply_to, &value);
        });
        Response::Deferred
    }
}

impl<T: VectorElement> SymmetricObject for VectorShard<T> {
    fn handle_request(&self, core: &Core, request: Request) -> Response {
        match request.body_as::<VectorRequest<T>>() {
            VectorRequest::Push(values) => {
                self.check_master(core);
                Response::ready(&self.push_on_master(core, values))
            }
            VectorRequest::Pop(count) => {
                self.check_master(core);
                self.pop_on_master(core, &request, count)
            }
            VectorRequest::Get(index) => {
                self.check_master(core);
                self.get_on_master(core, &request, index)
            }
            VectorRequest::Size => {
                self.check_master(core);
                Response::ready(&self.size.get())
            }
            VectorRequest::Put(items) => {
                for (local, value) in items {
                    self.local_slot(local, |slot| *slot = Some(value));
                }
                Response::ready(&())
            }
            VectorRequest::Take(locals) => {
                let values: Vec<Option<T>> = locals
                    .into_iter()
                    .map(|local| self.local_slot(local, |slot| slot.take()))
                    .collect();
                Response::ready(&values)
            }
            VectorRequest::Read(local) => {
                Response::ready(&self.local_slot(local, |slot| slot.clone()))
            }
        }
    }
}

/// A distributed vector of at most `capacity` elements
pub struct GlobalVector<T: VectorElement> {
    core: Core,
    shard: Rc<VectorShard<T>>,
}

impl<T: VectorElement> Clone for GlobalVector<T> {
    fn clone(&self) -> Self {
        GlobalVector {
            core: self.core.clone(),
            shard: self.shard.clone(),
        }
    }
}

impl<T: VectorElement> std::fmt::Debug for GlobalVector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GlobalVector[{}, capacity {}]",
            self.shard.id, self.shard.capacity
        )
    }
}

impl<T: VectorElement> GlobalVector<T> {
    /// Collective
    pub fn new(core: &Core, capacity: usize) -> GlobalVector<T> {
        let layout = core.block_cyclic();
        let local_len = layout.local_len(core.my_core(), capacity);
        let shard = core.alloc_symmetric(|id| VectorShard {
            id,
            layout,
            capacity,
            size: Cell::new(0),
            storage: RefCell::new(vec![None; local_len]),
            combiner: FlatCombiner::new(VectorBatch {
                core: core.clone(),
                id,
                pushes: Vec::new(),
                pops: Vec::new(),
                batch_size: core.combiner_batch_size(),
            }),
        });
        GlobalVector {
            core: core.clone(),
            shard,
        }
    }

    pub fn id(&self) -> SymmetricId {
        self.shard.id
    }

    pub fn capacity(&self) -> usize {
        self.shard.capacity
    }

    /// Address of element `index`
    pub fn address(&self, index: usize) -> GlobalAddress<T> {
        self.shard.address(index)
    }

    /// Append `value`, pushing past the capacity is fatal
    pub async fn push(&self, value: T) {
        if !self.core.flat_combining() {
            let _start: usize = self
                .core
                .call(MASTER, self.shard.id, &VectorRequest::Push(vec![value]))
                .await;
            return;
        }
        self.shard
            .combiner
            .combine(move |batch| {
                if let Some(pop) = batch.pops.pop() {
                    *pop.borrow_mut() = Some(value);
                    FcStatus::Matched
                } else {
                    batch.pushes.push(value);
                    FcStatus::Blocked
                }
            })
            .await;
    }

    /// Remove the most recently pushed element, None if the vector is empty
    pub async fn pop(&self) -> Option<T> {
        if !self.core.flat_combining() {
            let mut popped: Vec<Option<T>> = self
                .core
                .call(MASTER, self.shard.id, &VectorRequest::<T>::Pop(1))
                .await;
            return popped.pop().flatten();
        }
        let cell = result_cell();
        let mut matched = None;
        self.shard
            .combiner
            .combine(|batch| {
                if let Some(value) = batch.pushes.pop() {
                    matched = Some(value);
                    FcStatus::Matched
                } else {
                    batch.pops.push(cell.clone());
                    FcStatus::Blocked
                }
            })
            .await;
        let popped = cell.borrow_mut().take();
        matched.or(popped)
    }

    /// Read element `index`, None past the current size
    pub async fn get(&self, index: usize) -> Option<T> {
        self.core
            .call(MASTER, self.shard.id, &VectorRequest::<T>::Get(index))
            .await
    }

    /// Current number of elements, as seen by the master
    pub async fn size(&self) -> usize {
        self.core
            .call(MASTER, self.shard.id, &VectorRequest::<T>::Size)
            .await
    }

    /// Visit every element stored on this core.
    ///
    /// Only meaningful once pushes and pops have quiesced, e.g. after a barrier.
    pub fn for_each_local(&self, mut f: impl FnMut(usize, &T)) {
        let storage = self.shard.storage.borrow();
        let my_core = self.core.my_core();
        for (local, slot) in storage.iter().enumerate() {
            if let Some(value) = slot {
                f(self.shard.layout.index_of(my_core, local), value);
            }
        }
    }

    /// Number of elements stored on this core
    pub fn local_len(&self) -> usize {
        self.shard
            .storage
            .borrow()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn combiner_stats(&self) -> CombinerStats {
        self.shard.combiner.stats()
    }
}

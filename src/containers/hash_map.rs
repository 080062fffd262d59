//! A distributed hash map.
//!
//! The map is an array of `capacity` cells distributed block-cyclically over the cores, a key
//! lives in cell `hash(key) % capacity`. Each cell chains the entries that hash to it.
//!
//! Inserts and lookups issued on one core are combined per batch: the last insert of a key wins,
//! a lookup of a key with a pending insert is answered from the batch, and concurrent lookups of
//! the same key share a single remote request. A flush sends one request per owning core.
use super::{result_cell, ResultCell};
use crate::flat_combining::{Combinable, FcStatus, FlatCombiner};
use crate::global_address::{BlockCyclic, GlobalAddress};
use crate::lamellar_core::Core;
use crate::stats::CombinerStats;
use crate::symmetric::{Request, Response, SymmetricId, SymmetricObject};

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Key types a [GlobalHashMap] accepts
pub trait MapKey: Serialize + DeserializeOwned + Hash + Eq + Clone + 'static {}
impl<K: Serialize + DeserializeOwned + Hash + Eq + Clone + 'static> MapKey for K {}

/// Value types a [GlobalHashMap] accepts
pub trait MapValue: Serialize + DeserializeOwned + Clone + 'static {}
impl<V: Serialize + DeserializeOwned + Clone + 'static> MapValue for V {}

#[derive(Serialize, Deserialize, Debug)]
#[serde(bound = "K: Serialize + DeserializeOwned, V: Serialize + DeserializeOwned")]
enum MapRequest<K, V> {
    /// applied in order: inserts first, then lookups, answers hold one entry per lookup
    Batch {
        inserts: Vec<(usize, K, V)>,
        lookups: Vec<(usize, K)>,
    },
    Len,
}

/// Cell of `key` in a map of `capacity` cells.
///
/// `DefaultHasher::new()` is keyed with zeros, so every core agrees on it.
fn cell_of<K: Hash>(key: &K, capacity: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % capacity as u64) as usize
}

struct OwnerBatch<K, V> {
    inserts: Vec<(usize, K, V)>,
    lookups: Vec<(usize, K)>,
    cells: Vec<ResultCell<V>>,
}

impl<K, V> OwnerBatch<K, V> {
    fn new() -> OwnerBatch<K, V> {
        OwnerBatch {
            inserts: Vec::new(),
            lookups: Vec::new(),
            cells: Vec::new(),
        }
    }
}

struct MapBatch<K, V> {
    core: Core,
    id: SymmetricId,
    layout: BlockCyclic,
    capacity: usize,
    inserts: IndexMap<K, V>,
    lookups: IndexMap<K, ResultCell<V>>,
    batch_size: usize,
}

impl<K: MapKey, V: MapValue> MapBatch<K, V> {
    fn owner(&self, key: &K) -> (usize, usize) {
        GlobalAddress::<Vec<(K, V)>>::linear(self.layout, cell_of(key, self.capacity)).decompose()
    }
}

#[async_trait(?Send)]
impl<K: MapKey, V: MapValue> Combinable for MapBatch<K, V> {
    async fn sync(&mut self) {
        let mut per_owner: IndexMap<usize, OwnerBatch<K, V>> = IndexMap::new();
        for (key, value) in std::mem::take(&mut self.inserts) {
            let (owner, local) = self.owner(&key);
            per_owner
                .entry(owner)
                .or_insert_with(OwnerBatch::new)
                .inserts
                .push((local, key, value));
        }
        for (key, cell) in std::mem::take(&mut self.lookups) {
            let (owner, local) = self.owner(&key);
            let batch = per_owner.entry(owner).or_insert_with(OwnerBatch::new);
            batch.lookups.push((local, key));
            batch.cells.push(cell);
        }
        let core = &self.core;
        let id = self.id;
        join_all(per_owner.into_iter().map(|(owner, batch)| async move {
            let request = MapRequest::Batch {
                inserts: batch.inserts,
                lookups: batch.lookups,
            };
            let found: Vec<Option<V>> = core.call(owner, id, &request).await;
            for (cell, value) in batch.cells.iter().zip(found) {
                *cell.borrow_mut() = value;
            }
        }))
        .await;
    }
    fn clear(&mut self) {
        self.inserts.clear();
        self.lookups.clear();
    }
    fn is_full(&self) -> bool {
        self.inserts.len() + self.lookups.len() >= self.batch_size
    }
    fn clone_fresh(&self) -> Self {
        MapBatch {
            core: self.core.clone(),
            id: self.id,
            layout: self.layout,
            capacity: self.capacity,
            inserts: IndexMap::new(),
            lookups: IndexMap::new(),
            batch_size: self.batch_size,
        }
    }
    fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.lookups.is_empty()
    }
}

struct MapShard<K: MapKey, V: MapValue> {
    id: SymmetricId,
    layout: BlockCyclic,
    capacity: usize,
    cells: RefCell<Vec<Vec<(K, V)>>>,
    combiner: FlatCombiner<MapBatch<K, V>>,
}

impl<K: MapKey, V: MapValue> MapShard<K, V> {
    fn chain<'a>(&self, cells: &'a mut [Vec<(K, V)>], local: usize) -> &'a mut Vec<(K, V)> {
        let num_cells = cells.len();
        match cells.get_mut(local) {
            Some(chain) => chain,
            None => fatal!(
                "hash map {} cell {} out of range ({} local cells)",
                self.id,
                local,
                num_cells
            ),
        }
    }

    fn apply(&self, inserts: Vec<(usize, K, V)>, lookups: Vec<(usize, K)>) -> Vec<Option<V>> {
        let mut cells = self.cells.borrow_mut();
        for (local, key, value) in inserts {
            let chain = self.chain(&mut cells, local);
            match chain.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => chain.push((key, value)),
            }
        }
        lookups
            .into_iter()
            .map(|(local, key)| {
                self.chain(&mut cells, local)
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone())
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.cells.borrow().iter().map(|chain| chain.len()).sum()
    }
}

impl<K: MapKey, V: MapValue> SymmetricObject for MapShard<K, V> {
    fn handle_request(&self, _core: &Core, request: Request) -> Response {
        match request.body_as::<MapRequest<K, V>>() {
            MapRequest::Batch { inserts, lookups } => {
                Response::ready(&self.apply(inserts, lookups))
            }
            MapRequest::Len => Response::ready(&self.len()),
        }
    }
}

/// A distributed hash map with a fixed number of cells
pub struct GlobalHashMap<K: MapKey, V: MapValue> {
    core: Core,
    shard: Rc<MapShard<K, V>>,
}

impl<K: MapKey, V: MapValue> Clone for GlobalHashMap<K, V> {
    fn clone(&self) -> Self {
        GlobalHashMap {
            core: self.core.clone(),
            shard: self.shard.clone(),
        }
    }
}

impl<K: MapKey, V: MapValue> std::fmt::Debug for GlobalHashMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GlobalHashMap[{}, {} cells]",
            self.shard.id, self.shard.capacity
        )
    }
}

impl<K: MapKey, V: MapValue> GlobalHashMap<K, V> {
    /// Collective, `capacity` is the number of cells of the whole map
    pub fn new(core: &Core, capacity: usize) -> GlobalHashMap<K, V> {
        if capacity == 0 {
            fatal!("a hash map needs at least one cell");
        }
        let layout = core.block_cyclic();
        let local_cells = layout.local_len(core.my_core(), capacity);
        let shard = core.alloc_symmetric(|id| MapShard {
            id,
            layout,
            capacity,
            cells: RefCell::new(vec![Vec::new(); local_cells]),
            combiner: FlatCombiner::new(MapBatch {
                core: core.clone(),
                id,
                layout,
                capacity,
                inserts: IndexMap::new(),
                lookups: IndexMap::new(),
                batch_size: core.combiner_batch_size(),
            }),
        });
        GlobalHashMap {
            core: core.clone(),
            shard,
        }
    }

    pub fn id(&self) -> SymmetricId {
        self.shard.id
    }

    /// Address of the cell holding `key`
    pub fn cell_address(&self, key: &K) -> GlobalAddress<Vec<(K, V)>> {
        GlobalAddress::linear(self.shard.layout, cell_of(key, self.shard.capacity))
    }

    async fn direct(&self, inserts: Vec<(K, V)>, lookups: Vec<K>) -> Vec<Option<V>> {
        let key = match (inserts.first(), lookups.first()) {
            (Some((k, _)), _) | (None, Some(k)) => k,
            (None, None) => return vec![],
        };
        let (owner, local) = self.cell_address(key).decompose();
        let request = MapRequest::Batch {
            inserts: inserts.into_iter().map(|(k, v)| (local, k, v)).collect(),
            lookups: lookups.into_iter().map(|k| (local, k)).collect(),
        };
        self.core.call(owner, self.shard.id, &request).await
    }

    /// Insert or overwrite `key`, returns once the entry is stored in its cell
    pub async fn insert(&self, key: K, value: V) {
        if !self.core.flat_combining() {
            self.direct(vec![(key, value)], vec![]).await;
            return;
        }
        self.shard
            .combiner
            .combine(move |batch| {
                batch.inserts.insert(key, value);
                FcStatus::Blocked
            })
            .await;
    }

    /// The value stored for `key`, None if there is none
    pub async fn lookup(&self, key: &K) -> Option<V> {
        if !self.core.flat_combining() {
            return self.direct(vec![], vec![key.clone()]).await.pop().flatten();
        }
        let mut satisfied = None;
        let mut pending = None;
        self.shard
            .combiner
            .combine(|batch| {
                if let Some(value) = batch.inserts.get(key) {
                    satisfied = Some(value.clone());
                    return FcStatus::Satisfied;
                }
                let cell = batch
                    .lookups
                    .entry(key.clone())
                    .or_insert_with(result_cell)
                    .clone();
                pending = Some(cell);
                FcStatus::Blocked
            })
            .await;
        match (satisfied, pending) {
            (Some(value), _) => Some(value),
            (None, Some(cell)) => cell.borrow().clone(),
            (None, None) => None,
        }
    }

    /// Total number of entries, summed over every core
    pub async fn len(&self) -> usize {
        let request = MapRequest::<K, V>::Len;
        let lens: Vec<usize> = join_all(
            (0..self.core.num_cores()).map(|core| self.core.call(core, self.shard.id, &request)),
        )
        .await;
        lens.into_iter().sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Visit the entries stored on this core
    pub fn for_each_local(&self, mut f: impl FnMut(&K, &V)) {
        for chain in self.shard.cells.borrow().iter() {
            for (k, v) in chain {
                f(k, v);
            }
        }
    }

    /// Number of entries stored on this core
    pub fn local_len(&self) -> usize {
        self.shard.len()
    }

    pub fn combiner_stats(&self) -> CombinerStats {
        self.shard.combiner.stats()
    }
}

use super::hash_map::{GlobalHashMap, MapKey};
use crate::lamellar_core::Core;
use crate::stats::CombinerStats;
use crate::symmetric::SymmetricId;

/// A distributed hash set, a [GlobalHashMap] without values
pub struct GlobalHashSet<K: MapKey> {
    map: GlobalHashMap<K, ()>,
}

impl<K: MapKey> Clone for GlobalHashSet<K> {
    fn clone(&self) -> Self {
        GlobalHashSet {
            map: self.map.clone(),
        }
    }
}

impl<K: MapKey> std::fmt::Debug for GlobalHashSet<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GlobalHashSet[{}]", self.map.id())
    }
}

impl<K: MapKey> GlobalHashSet<K> {
    /// Collective
    pub fn new(core: &Core, capacity: usize) -> GlobalHashSet<K> {
        GlobalHashSet {
            map: GlobalHashMap::new(core, capacity),
        }
    }

    pub fn id(&self) -> SymmetricId {
        self.map.id()
    }

    pub async fn insert(&self, key: K) {
        self.map.insert(key, ()).await
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.map.lookup(key).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.map.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.map.is_empty().await
    }

    /// Visit the keys stored on this core
    pub fn for_each_local(&self, mut f: impl FnMut(&K)) {
        self.map.for_each_local(|k, _| f(k))
    }

    pub fn local_len(&self) -> usize {
        self.map.local_len()
    }

    pub fn combiner_stats(&self) -> CombinerStats {
        self.map.combiner_stats()
    }
}

//! Distributed containers built on symmetric objects and flat combining.
//!
//! Every container is created collectively: all cores call `new` in the same order, each getting
//! its own instance of the same symmetric object. Operations issued by the tasks of a core are
//! combined by that core's [FlatCombiner][crate::FlatCombiner] unless `LAMELLAR_FLAT_COMBINING` is
//! turned off, in which case every operation is a delegate call of its own.
pub mod counter;
pub mod hash_map;
pub mod hash_set;
pub mod vector;

pub use counter::GlobalCounter;
pub use hash_map::GlobalHashMap;
pub use hash_set::GlobalHashSet;
pub use vector::GlobalVector;

use std::cell::RefCell;
use std::rc::Rc;

/// Where a combined operation finds its answer once the batch it joined is flushed
pub(crate) type ResultCell<T> = Rc<RefCell<Option<T>>>;

pub(crate) fn result_cell<T>() -> ResultCell<T> {
    Rc::new(RefCell::new(None))
}

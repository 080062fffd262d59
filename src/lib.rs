//! Lamellar Aggregator is a small PGAS style runtime focused on very fine-grained communication.
//!
//! A job is a set of *cores*, each one an OS thread running a single-worker cooperative executor.
//! Tasks on a core talk to other cores exclusively through active messages, which are packed into
//! one buffer per destination by the [Aggregator] and handed to the transport (a "lamellae") in bulk.
//!
//! On top of the aggregator sits the [FlatCombiner]: many tasks on the same core submit small
//! operations against a shared accumulator, one of them becomes the combiner for the batch and
//! synchronizes it with the rest of the job while the others sleep.
//! The distributed [containers] show how the two fit together.
//!
//! # Example
//! ```
//! use lamellar_aggregator::{containers::GlobalCounter, WorldBuilder};
//!
//! let world = WorldBuilder::new().with_num_cores(4).build();
//! let totals = world.run(|core| async move {
//!     let counter = GlobalCounter::new(&core);
//!     for _ in 0..100 {
//!         counter.increment(1).await;
//!     }
//!     core.barrier().await;
//!     counter.read().await
//! });
//! assert!(totals.iter().all(|t| *t == 400));
//! ```

#[macro_use]
extern crate lazy_static;

#[doc(hidden)]
pub extern crate inventory;

#[doc(hidden)]
pub extern crate serde;

#[doc(hidden)]
pub extern crate tracing;

pub use async_trait::async_trait;

/// Log an unrecoverable condition and panic the current core.
///
/// The world observes the panic, stops every other core, and re-raises it from `World::run`.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
        panic!($($arg)+)
    }};
}

pub mod active_messaging;
mod barrier;
pub mod containers;
mod env_var;
pub mod flat_combining;
pub mod global_address;
mod lamellae;
mod lamellar_core;
mod lamellar_world;
mod scheduler;
pub mod stats;
pub mod symmetric;
mod wait_queue;

pub use crate::active_messaging::{
    aggregator::{Aggregator, AggregatorConfig},
    handler_id, Envelope, HandlerId,
};
pub use crate::env_var::{config, Config};
pub use crate::flat_combining::{Combinable, FcStatus, FlatCombiner};
pub use crate::global_address::{AddressError, BlockCyclic, GlobalAddress};
pub use crate::lamellae::{Backend, TransportError};
pub use crate::lamellar_core::Core;
pub use crate::lamellar_world::{World, WorldBuilder};
pub use crate::scheduler::CoreTask;
pub use crate::stats::{AggregatorStats, CombinerStats, FlushKind, Histogram};
pub use crate::symmetric::{ReplyTo, Request, Response, SymmetricId, SymmetricObject};

#[doc(hidden)]
pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

#[doc(hidden)]
pub fn serialized_size<T: ?Sized>(obj: &T) -> Result<usize, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialized_size(obj)? as usize)
}

#[doc(hidden)]
pub fn serialize_into<T: ?Sized, W: std::io::Write>(buf: W, obj: &T) -> Result<(), anyhow::Error>
where
    T: serde::Serialize,
{
    bincode::serialize_into(buf, obj)?;
    Ok(())
}

#[doc(hidden)]
pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}

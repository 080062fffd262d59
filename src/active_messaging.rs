//! Active messages: a handler id plus argument and payload bytes, executed on the destination core.
//!
//! Handlers are plain functions registered at link time with [register_handler!][crate::register_handler].
//! Their ids come from sorting the registered names, so every core of a job (and every process
//! built from the same binary) agrees on them without any exchange.
//!
//! ```
//! use lamellar_aggregator::{register_handler, Core, Envelope};
//!
//! fn hello(core: &Core, msg: Envelope<'_>) {
//!     let from: usize = msg.args_as();
//!     println!("core {} says hello to core {}", from, core.my_core());
//! }
//! register_handler!("hello", hello);
//! ```
use crate::lamellar_core::Core;

use serde::de::DeserializeOwned;
use std::collections::HashMap;

pub mod aggregator;
pub(crate) mod delegate;

/// Deterministic index of a registered handler
pub type HandlerId = u32;

/// Signature of a registered handler
pub type HandlerFn = fn(&Core, Envelope<'_>);

pub(crate) const HANDLER_ID_START: HandlerId = 1;

/// A received active message, borrowed from the aggregated buffer it arrived in
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    /// the core that issued the message
    pub source: usize,
    /// free form word supplied by the sender
    pub tag: u64,
    pub args: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Deserialize the argument bytes, a malformed message is fatal
    pub fn args_as<T: DeserializeOwned>(&self) -> T {
        match crate::deserialize(self.args) {
            Ok(args) => args,
            Err(e) => fatal!(
                "malformed active message arguments from core {}: {}",
                self.source,
                e
            ),
        }
    }

    /// Deserialize the payload bytes, a malformed message is fatal
    pub fn payload_as<T: DeserializeOwned>(&self) -> T {
        match crate::deserialize(self.payload) {
            Ok(payload) => payload,
            Err(e) => fatal!(
                "malformed active message payload from core {}: {}",
                self.source,
                e
            ),
        }
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub struct RegisteredHandler {
    pub name: &'static str,
    pub exec: HandlerFn,
    /// counted handlers take part in quiescence detection, runtime control traffic does not
    pub counted: bool,
}
crate::inventory::collect!(RegisteredHandler);

lazy_static! {
    pub(crate) static ref HANDLER_IDS: HashMap<&'static str, HandlerId> = {
        let mut names = vec![];
        for handler in crate::inventory::iter::<RegisteredHandler> {
            names.push(handler.name);
        }
        names.sort();
        let mut cnt = HANDLER_ID_START;
        let mut temp = HashMap::new();
        let mut duplicates = vec![];
        for name in names {
            if !temp.contains_key(&name) {
                temp.insert(name, cnt);
                cnt += 1;
            } else {
                duplicates.push(name);
            }
        }
        if duplicates.len() > 0 {
            panic!(
                "duplicate registered handlers {:?}, handlers must have unique names",
                duplicates
            );
        }
        temp
    };
}

lazy_static! {
    pub(crate) static ref HANDLER_EXECS: HashMap<HandlerId, &'static RegisteredHandler> = {
        let mut temp = HashMap::new();
        for handler in crate::inventory::iter::<RegisteredHandler> {
            if let Some(id) = HANDLER_IDS.get(&handler.name) {
                temp.insert(*id, handler);
            }
        }
        temp
    };
}

/// Look up the id of a registered handler.
///
/// Asking for a name that was never registered is fatal.
pub fn handler_id(name: &str) -> HandlerId {
    match try_handler_id(name) {
        Some(id) => id,
        None => fatal!("no active message handler registered as {:?}", name),
    }
}

pub fn try_handler_id(name: &str) -> Option<HandlerId> {
    HANDLER_IDS.get(name).copied()
}

pub(crate) fn registered_handler(id: HandlerId) -> Option<&'static RegisteredHandler> {
    HANDLER_EXECS.get(&id).copied()
}

/// Register a function as an active message handler.
///
/// The first argument is the handler's unique name, the second a `fn(&Core, Envelope<'_>)`.
/// Handlers run on the destination core's thread, between tasks, and must not block.
#[macro_export]
macro_rules! register_handler {
    ($name:expr, $exec:expr) => {
        $crate::inventory::submit! {
            $crate::active_messaging::RegisteredHandler {
                name: $name,
                exec: $exec,
                counted: true,
            }
        }
    };
}

// runtime control traffic, excluded from quiescence counts
macro_rules! register_uncounted_handler {
    ($name:expr, $exec:expr) => {
        crate::inventory::submit! {
            crate::active_messaging::RegisteredHandler {
                name: $name,
                exec: $exec,
                counted: false,
            }
        }
    };
}
pub(crate) use register_uncounted_handler;

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_core: &Core, _msg: Envelope<'_>) {}
    register_handler!("active_messaging::tests::noop_b", noop);
    register_handler!("active_messaging::tests::noop_a", noop);

    #[test]
    fn ids_follow_name_order() {
        let a = handler_id("active_messaging::tests::noop_a");
        let b = handler_id("active_messaging::tests::noop_b");
        assert!(a >= HANDLER_ID_START);
        assert!(a < b);
        assert!(registered_handler(a).unwrap().counted);
    }

    #[test]
    fn unknown_names_have_no_id() {
        assert_eq!(try_handler_id("active_messaging::tests::missing"), None);
    }

    #[test]
    #[should_panic]
    fn unknown_name_is_fatal() {
        handler_id("active_messaging::tests::missing");
    }
}

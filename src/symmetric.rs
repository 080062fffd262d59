//! Symmetric objects: allocated collectively, one instance per core, all sharing one id.
//!
//! Because every core allocates in the same order, the id of an object is the same everywhere
//! and can be put on the wire to address "the instance of this object on core X".
//! Requests addressed to an object arrive through [handle_request][SymmetricObject::handle_request].
use crate::lamellar_core::Core;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

pub type SymmetricId = usize;

/// Where the answer to a request has to go
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyTo {
    pub core: usize,
    pub request_id: u64,
}

impl ReplyTo {
    /// posted requests carry request id 0 and expect no answer
    pub fn wants_reply(&self) -> bool {
        self.request_id != 0
    }
}

#[derive(Debug)]
pub struct Request {
    pub source: usize,
    pub reply_to: ReplyTo,
    pub body: Vec<u8>,
}

impl Request {
    pub fn body_as<T: DeserializeOwned>(&self) -> T {
        match crate::deserialize(&self.body) {
            Ok(body) => body,
            Err(e) => fatal!("malformed request from core {}: {}", self.source, e),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    /// the reply bytes, sent back right away
    Ready(Vec<u8>),
    /// the object will call [Core::reply] itself later
    Deferred,
}

impl Response {
    pub fn ready<T: Serialize + ?Sized>(value: &T) -> Response {
        match crate::serialize(value) {
            Ok(data) => Response::Ready(data),
            Err(e) => fatal!("failed to encode response: {}", e),
        }
    }
}

pub trait SymmetricObject: Any {
    fn handle_request(&self, core: &Core, request: Request) -> Response;
}

struct Entry {
    object: Rc<dyn SymmetricObject>,
    any: Rc<dyn Any>,
}

#[derive(Default)]
pub(crate) struct SymmetricRegistry {
    objects: RefCell<Vec<Option<Entry>>>,
}

impl std::fmt::Debug for SymmetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let objects = self.objects.borrow();
        write!(
            f,
            "SymmetricRegistry[{} live of {}]",
            objects.iter().filter(|o| o.is_some()).count(),
            objects.len()
        )
    }
}

impl SymmetricRegistry {
    pub(crate) fn new() -> SymmetricRegistry {
        SymmetricRegistry::default()
    }

    pub(crate) fn alloc_with<T, F>(&self, init: F) -> Rc<T>
    where
        T: SymmetricObject,
        F: FnOnce(SymmetricId) -> T,
    {
        let id = {
            let mut objects = self.objects.borrow_mut();
            objects.push(None);
            objects.len() - 1
        };
        // init may allocate further objects, the slot is reserved already
        let object = Rc::new(init(id));
        self.objects.borrow_mut()[id] = Some(Entry {
            object: object.clone(),
            any: object.clone(),
        });
        object
    }

    pub(crate) fn get(&self, id: SymmetricId) -> Option<Rc<dyn SymmetricObject>> {
        self.objects
            .borrow()
            .get(id)
            .and_then(|e| e.as_ref())
            .map(|e| e.object.clone())
    }

    pub(crate) fn get_as<T: 'static>(&self, id: SymmetricId) -> Option<Rc<T>> {
        let any = self
            .objects
            .borrow()
            .get(id)
            .and_then(|e| e.as_ref())
            .map(|e| e.any.clone())?;
        any.downcast::<T>().ok()
    }

    pub(crate) fn clear(&self) {
        let objects: Vec<_> = self.objects.borrow_mut().drain(..).collect();
        drop(objects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(SymmetricId);
    impl SymmetricObject for Echo {
        fn handle_request(&self, _core: &Core, request: Request) -> Response {
            Response::Ready(request.body)
        }
    }

    #[test]
    fn ids_are_assigned_in_allocation_order() {
        let registry = SymmetricRegistry::new();
        let a = registry.alloc_with(Echo);
        let b = registry.alloc_with(Echo);
        assert_eq!((a.0, b.0), (0, 1));
        assert!(registry.get(1).is_some());
        assert_eq!(registry.get_as::<Echo>(0).map(|e| e.0), Some(0));
        assert!(registry.get_as::<String>(0).is_none());
        assert!(registry.get(5).is_none());
        let c = registry.alloc_with(Echo);
        assert_eq!(c.0, 2);
    }

    #[test]
    fn reply_to_zero_wants_no_reply() {
        assert!(!ReplyTo { core: 1, request_id: 0 }.wants_reply());
        assert!(ReplyTo { core: 1, request_id: 9 }.wants_reply());
    }
}

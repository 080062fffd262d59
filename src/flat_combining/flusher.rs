use crate::wait_queue::WaitQueue;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Who is responsible for flushing a flusher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sender {
    /// the task whose operation retired the flusher
    Caller,
    /// a waiter elected by the previous flush
    Waiter,
}

/// Generation checked index into a [FlusherArena]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlusherId {
    index: usize,
    generation: u64,
}

/// One batch of combined operations
#[derive(Debug)]
pub(crate) struct Flusher<T> {
    pub(crate) acc: RefCell<T>,
    pub(crate) waiters: WaitQueue,
    sender: Cell<Option<Sender>>,
    generation: Cell<u64>,
    /// blocked operations recorded in this batch
    pub(crate) ops: Cell<usize>,
    /// tasks currently inside flush for this flusher
    pub(crate) senders: Cell<usize>,
}

impl<T> Flusher<T> {
    fn new(acc: T) -> Flusher<T> {
        Flusher {
            acc: RefCell::new(acc),
            waiters: WaitQueue::new(),
            sender: Cell::new(None),
            generation: Cell::new(0),
            ops: Cell::new(0),
            senders: Cell::new(0),
        }
    }

    pub(crate) fn sender(&self) -> Option<Sender> {
        self.sender.get()
    }

    pub(crate) fn has_sender(&self) -> bool {
        self.sender.get().is_some()
    }

    pub(crate) fn set_sender(&self, sender: Sender) {
        if let Some(existing) = self.sender.get() {
            fatal!(
                "flusher already has a sender ({:?}), refusing {:?}",
                existing,
                sender
            );
        }
        self.sender.set(Some(sender));
    }
}

/// Owner of every flusher a combiner ever created, retired ones are recycled
#[derive(Debug)]
pub(crate) struct FlusherArena<T> {
    slots: RefCell<Vec<Rc<Flusher<T>>>>,
    free: RefCell<Vec<usize>>,
}

impl<T> FlusherArena<T> {
    pub(crate) fn new() -> FlusherArena<T> {
        FlusherArena {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
        }
    }

    /// Take a flusher off the free list, or create one with `make` if the list is empty
    pub(crate) fn alloc(&self, make: impl FnOnce() -> T) -> FlusherId {
        if let Some(index) = self.free.borrow_mut().pop() {
            let generation = self.slots.borrow()[index].generation.get();
            return FlusherId { index, generation };
        }
        let mut slots = self.slots.borrow_mut();
        slots.push(Rc::new(Flusher::new(make())));
        FlusherId {
            index: slots.len() - 1,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: FlusherId) -> Rc<Flusher<T>> {
        let flusher = match self.slots.borrow().get(id.index) {
            Some(flusher) => flusher.clone(),
            None => fatal!("flusher index {} out of range", id.index),
        };
        if flusher.generation.get() != id.generation {
            fatal!(
                "stale flusher id {:?}, slot is at generation {}",
                id,
                flusher.generation.get()
            );
        }
        flusher
    }

    pub(crate) fn is_live(&self, id: FlusherId) -> bool {
        self.slots
            .borrow()
            .get(id.index)
            .map_or(false, |f| f.generation.get() == id.generation)
    }

    /// Return a flushed flusher to the free list, ids handed out for it go stale
    pub(crate) fn release(&self, id: FlusherId, reset: impl FnOnce(&mut T)) {
        let flusher = self.get(id);
        reset(&mut flusher.acc.borrow_mut());
        flusher.sender.set(None);
        flusher.ops.set(0);
        flusher.generation.set(id.generation + 1);
        self.free.borrow_mut().push(id.index);
    }

    /// flushers ever created
    pub(crate) fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_flushers_are_recycled() {
        let arena = FlusherArena::<Vec<u32>>::new();
        let a = arena.alloc(Vec::new);
        arena.get(a).acc.borrow_mut().push(1);
        arena.release(a, |acc| acc.clear());
        assert!(!arena.is_live(a));
        assert_eq!(arena.free_len(), 1);
        let b = arena.alloc(Vec::new);
        assert_eq!(arena.len(), 1);
        assert!(arena.is_live(b));
        assert_ne!(a, b);
        assert!(arena.get(b).acc.borrow().is_empty());
    }

    #[test]
    #[should_panic]
    fn stale_ids_are_fatal() {
        let arena = FlusherArena::<u32>::new();
        let a = arena.alloc(|| 0);
        arena.release(a, |_| {});
        arena.get(a);
    }

    #[test]
    #[should_panic]
    fn second_sender_is_fatal() {
        let arena = FlusherArena::<u32>::new();
        let a = arena.get(arena.alloc(|| 0));
        a.set_sender(Sender::Caller);
        a.set_sender(Sender::Waiter);
    }
}

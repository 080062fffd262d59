use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Why a waiter was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// woken alone by [WaitQueue::signal]
    Elected,
    /// woken together with every other waiter by [WaitQueue::broadcast]
    Released,
}

#[derive(Debug, Default)]
struct WaitSlot {
    reason: Cell<Option<WakeReason>>,
    waker: RefCell<Option<Waker>>,
}

impl WaitSlot {
    fn wake(&self, reason: WakeReason) {
        self.reason.set(Some(reason));
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// A FIFO list of suspended tasks living on one core.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    slots: RefCell<VecDeque<Rc<WaitSlot>>>,
}

impl WaitQueue {
    pub(crate) fn new() -> WaitQueue {
        WaitQueue::default()
    }

    /// Enqueue the caller, it is part of the queue as soon as this returns
    pub(crate) fn wait(&self) -> Wait {
        let slot = Rc::new(WaitSlot::default());
        self.slots.borrow_mut().push_back(slot.clone());
        Wait { slot }
    }

    /// number of waiters that are still waiting
    pub(crate) fn len(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|s| Rc::strong_count(s) > 1)
            .count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the oldest live waiter alone, returns false if there was none
    pub(crate) fn signal(&self) -> bool {
        loop {
            let slot = self.slots.borrow_mut().pop_front();
            match slot {
                // a slot only the queue still references belongs to a dropped wait
                Some(slot) if Rc::strong_count(&slot) == 1 => continue,
                Some(slot) => {
                    slot.wake(WakeReason::Elected);
                    return true;
                }
                None => return false,
            }
        }
    }

    /// Wake every waiter, returns how many were woken
    pub(crate) fn broadcast(&self) -> usize {
        let slots: Vec<_> = self.slots.borrow_mut().drain(..).collect();
        let mut woken = 0;
        for slot in slots {
            if Rc::strong_count(&slot) > 1 {
                slot.wake(WakeReason::Released);
                woken += 1;
            }
        }
        woken
    }
}

#[derive(Debug)]
pub(crate) struct Wait {
    slot: Rc<WaitSlot>,
}

impl Future for Wait {
    type Output = WakeReason;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WakeReason> {
        match self.slot.reason.get() {
            Some(reason) => Poll::Ready(reason),
            None => {
                *self.slot.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn signal_wakes_oldest_only() {
        let queue = WaitQueue::new();
        let mut first = queue.wait();
        let mut second = queue.wait();
        assert_eq!(queue.len(), 2);
        assert_eq!((&mut first).now_or_never(), None);
        assert!(queue.signal());
        assert_eq!((&mut first).now_or_never(), Some(WakeReason::Elected));
        assert_eq!((&mut second).now_or_never(), None);
        assert_eq!(queue.broadcast(), 1);
        assert_eq!(second.now_or_never(), Some(WakeReason::Released));
        assert!(!queue.signal());
    }

    #[test]
    fn dropped_waiters_are_skipped() {
        let queue = WaitQueue::new();
        let dropped = queue.wait();
        let kept = queue.wait();
        drop(dropped);
        assert_eq!(queue.len(), 1);
        assert!(queue.signal());
        assert_eq!(kept.now_or_never(), Some(WakeReason::Elected));
    }
}

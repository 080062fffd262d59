//! Request/reply active messages addressed to symmetric objects.
use super::{handler_id, Envelope, HandlerId};
use crate::lamellar_core::Core;
use crate::symmetric::{ReplyTo, Request, Response, SymmetricId};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct RequestArgs {
    object: SymmetricId,
    request_id: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct ReplyArgs {
    request_id: u64,
}

lazy_static! {
    static ref REQUEST_ID: HandlerId = handler_id("lamellar::delegate_request");
    static ref REPLY_ID: HandlerId = handler_id("lamellar::delegate_reply");
}

fn delegate_request(core: &Core, msg: Envelope<'_>) {
    let args: RequestArgs = msg.args_as();
    let object = match core.symmetric_object(args.object) {
        Some(object) => object,
        None => fatal!(
            "core {} got a request from core {} for unknown symmetric object {}",
            core.my_core(),
            msg.source,
            args.object
        ),
    };
    let reply_to = ReplyTo {
        core: msg.source,
        request_id: args.request_id,
    };
    let request = Request {
        source: msg.source,
        reply_to,
        body: msg.payload.to_vec(),
    };
    match object.handle_request(core, request) {
        Response::Ready(data) => {
            if reply_to.wants_reply() {
                reply(core, reply_to, &data);
            }
        }
        Response::Deferred => {}
    }
}
crate::register_handler!("lamellar::delegate_request", delegate_request);

fn delegate_reply(core: &Core, msg: Envelope<'_>) {
    let args: ReplyArgs = msg.args_as();
    core.replies().complete(args.request_id, msg.payload.to_vec());
}
crate::register_handler!("lamellar::delegate_reply", delegate_reply);

struct PendingReply {
    data: Option<Vec<u8>>,
    waker: Option<Waker>,
}

/// Requests of this core that are still waiting for their reply
pub(crate) struct ReplyTable {
    next_id: Cell<u64>,
    pending: RefCell<HashMap<u64, PendingReply>>,
}

impl std::fmt::Debug for ReplyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplyTable[{} pending]", self.pending.borrow().len())
    }
}

impl ReplyTable {
    pub(crate) fn new() -> ReplyTable {
        ReplyTable {
            next_id: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
        }
    }

    fn register(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.pending.borrow_mut().insert(
            id,
            PendingReply {
                data: None,
                waker: None,
            },
        );
        id
    }

    pub(crate) fn complete(&self, request_id: u64, data: Vec<u8>) {
        let waker = {
            let mut pending = self.pending.borrow_mut();
            match pending.get_mut(&request_id) {
                Some(entry) if entry.data.is_none() => {
                    entry.data = Some(data);
                    entry.waker.take()
                }
                Some(_) => fatal!("duplicate reply for request {}", request_id),
                None => fatal!("reply for unknown request {}", request_id),
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_reply(&self, request_id: u64, cx: &mut Context<'_>) -> Poll<Vec<u8>> {
        let mut pending = self.pending.borrow_mut();
        let ready = match pending.get_mut(&request_id) {
            Some(entry) if entry.data.is_some() => true,
            Some(entry) => {
                entry.waker = Some(cx.waker().clone());
                false
            }
            None => fatal!("polled reply of unknown request {}", request_id),
        };
        if ready {
            match pending.remove(&request_id).and_then(|entry| entry.data) {
                Some(data) => Poll::Ready(data),
                None => fatal!("reply of request {} vanished", request_id),
            }
        } else {
            Poll::Pending
        }
    }

    /// requests still waiting for their reply
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.borrow().len()
    }

    pub(crate) fn clear(&self) {
        self.pending.borrow_mut().clear();
    }
}

/// Resolves to the reply bytes of a request
#[derive(Debug)]
pub(crate) struct ReplyFuture {
    core: Core,
    request_id: u64,
}

impl Future for ReplyFuture {
    type Output = Vec<u8>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<u8>> {
        self.core.replies().poll_reply(self.request_id, cx)
    }
}

/// Send `body` to the instance of `object` on `dst` and return a future for its reply
pub(crate) fn call_raw(core: &Core, dst: usize, object: SymmetricId, body: &[u8]) -> ReplyFuture {
    let request_id = core.replies().register();
    let args = RequestArgs { object, request_id };
    core.send_am_with_payload(dst, *REQUEST_ID, &args, body);
    ReplyFuture {
        core: core.clone(),
        request_id,
    }
}

/// Send `body` to the instance of `object` on `dst`, no reply is produced
pub(crate) fn post_raw(core: &Core, dst: usize, object: SymmetricId, body: &[u8]) {
    let args = RequestArgs {
        object,
        request_id: 0,
    };
    core.send_am_with_payload(dst, *REQUEST_ID, &args, body);
}

pub(crate) fn reply(core: &Core, reply_to: ReplyTo, data: &[u8]) {
    if !reply_to.wants_reply() {
        return;
    }
    let args = ReplyArgs {
        request_id: reply_to.request_id,
    };
    core.send_am_with_payload(reply_to.core, *REPLY_ID, &args, data);
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process rendezvous backend for host-based kernels and tests
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - endpoint(): create a caller/receiver pair for one server thread
//!   - Endpoint::call(): synchronous call, copies `tag.words()` words each way
//!   - Receiver::recv(): next incoming call with its reply handle
//!   - ReplyHandle::reply(): answer one call exactly once
//!   - serve(): dispatch loop until every endpoint is dropped
//!
//! SECURITY INVARIANTS:
//!   - Only the transferred words are copied; stale buffer contents never leak to the peer
//!   - Every call gets its own reply channel, a reply can never reach another caller
//!
//! ERROR CONDITIONS:
//!   - IpcError::Disconnected: receiver dropped, or the server dropped the reply handle
//!   - IpcError::WouldBlock: non-blocking call with no server waiting, or empty receive queue
//!   - IpcError::Timeout: no reply (or request) within the requested duration
//!
//! DEPENDENCIES:
//!   - std::sync::mpsc: request/reply channels
//!   - parking_lot::Mutex: shared receive side
//!
//! TEST SCENARIOS:
//!   - call_roundtrip(): request words reach the server, reply words come back
//!   - non_blocking_call_without_server(): send phase fails with WouldBlock
//!   - reply_timeout(): slow server yields Timeout
//!   - dropped_reply_handle(): caller sees Disconnected
//!   - serve_stops_on_disconnect(): serve() returns once all endpoints are gone

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;

use nexus_abi::Rights;
use nexus_utcb::{Limits, Utcb};
use parking_lot::Mutex;

use crate::{dispatch, Caller, Interface, IpcError, MsgTag, Result, Wait};

struct Request {
    tag: MsgTag,
    caller: Caller,
    msg: Box<Utcb>,
    reply: Sender<(MsgTag, Box<Utcb>)>,
}

/// Creates a caller/receiver pair for one server.
pub fn endpoint() -> (Endpoint, Receiver) {
    let (tx, rx) = mpsc::channel();
    let waiting = Arc::new(AtomicUsize::new(0));
    (
        Endpoint { tx, waiting: Arc::clone(&waiting) },
        Receiver { rx: Mutex::new(rx), waiting },
    )
}

/// Caller side of a server; cloned into every gate bound to it.
#[derive(Clone)]
pub struct Endpoint {
    tx: Sender<Request>,
    waiting: Arc<AtomicUsize>,
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint").field("waiting", &self.waiting.load(Ordering::Relaxed)).finish()
    }
}

fn recv_with<T>(rx: &mpsc::Receiver<T>, wait: Wait) -> Result<T> {
    let try_once = |rx: &mpsc::Receiver<T>| {
        rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => IpcError::WouldBlock,
            TryRecvError::Disconnected => IpcError::Disconnected,
        })
    };
    match wait {
        Wait::Blocking => rx.recv().map_err(|_| IpcError::Disconnected),
        Wait::NonBlocking => try_once(rx),
        Wait::Timeout(timeout) if timeout.is_zero() => try_once(rx),
        Wait::Timeout(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => IpcError::Timeout,
            RecvTimeoutError::Disconnected => IpcError::Disconnected,
        }),
    }
}

impl Endpoint {
    /// Sends the first `tag.words()` words of `utcb` and waits for the reply, which is copied
    /// back into `utcb`.
    ///
    /// `Wait::NonBlocking` fails with `WouldBlock` unless a server is waiting in `recv`; once
    /// the request is delivered the caller waits for the reply like a blocking call.
    pub fn call(
        &self,
        label: u64,
        rights: Rights,
        tag: MsgTag,
        utcb: &mut Utcb,
        wait: Wait,
    ) -> Result<MsgTag> {
        if wait.is_non_blocking() && self.waiting.load(Ordering::Acquire) == 0 {
            return Err(IpcError::WouldBlock);
        }
        let mut msg = Box::new(Utcb::new());
        msg.copy_words_from(utcb, tag.words());
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Request { tag, caller: Caller { label, rights }, msg, reply: reply_tx })
            .map_err(|_| IpcError::Disconnected)?;
        let reply_wait = if wait.is_non_blocking() { Wait::Blocking } else { wait };
        let (rtag, rmsg) = recv_with(&reply_rx, reply_wait)?;
        utcb.copy_words_from(&rmsg, rtag.words());
        Ok(rtag)
    }
}

/// Receive side of a server.
pub struct Receiver {
    rx: Mutex<mpsc::Receiver<Request>>,
    waiting: Arc<AtomicUsize>,
}

impl Receiver {
    /// Waits for the next call.
    pub fn recv(&self, wait: Wait) -> Result<Incoming> {
        let rx = self.rx.lock();
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let next = recv_with(&*rx, wait);
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        let req = next?;
        Ok(Incoming {
            tag: req.tag,
            caller: req.caller,
            utcb: req.msg,
            reply: ReplyHandle { tx: req.reply },
        })
    }
}

/// One received call.
pub struct Incoming {
    /// Request tag (protocol id and word count).
    pub tag: MsgTag,
    /// Gate label and invoked rights.
    pub caller: Caller,
    /// Copy of the transferred words.
    pub utcb: Box<Utcb>,
    /// Answer channel of this call.
    pub reply: ReplyHandle,
}

impl Incoming {
    /// Dispatches the call to `iface` and sends the reply.
    pub fn dispatch<I: Interface>(mut self, iface: &mut I, limits: Limits) -> Result<()> {
        let rtag = dispatch(iface, self.caller, self.tag, &mut self.utcb, limits);
        self.reply.reply(rtag, &self.utcb)
    }
}

/// Reply capability of one call. Can be stored and answered later; dropping it unanswered
/// fails the caller with `Disconnected`.
pub struct ReplyHandle {
    tx: Sender<(MsgTag, Box<Utcb>)>,
}

impl ReplyHandle {
    /// Sends the first `tag.words()` words of `utcb` back to the caller.
    pub fn reply(self, tag: MsgTag, utcb: &Utcb) -> Result<()> {
        let mut msg = Box::new(Utcb::new());
        msg.copy_words_from(utcb, tag.words());
        self.tx.send((tag, msg)).map_err(|_| IpcError::Disconnected)
    }
}

/// Serves calls on `receiver` until every [`Endpoint`] is gone.
///
/// A caller that gave up before the reply (timeout) only costs a log line.
pub fn serve<I: Interface>(receiver: &Receiver, iface: &mut I, limits: Limits) -> Result<()> {
    loop {
        match receiver.recv(Wait::Blocking) {
            Ok(incoming) => {
                if let Err(err) = incoming.dispatch(iface, limits) {
                    log::warn!("ipc: reply to protocol {} dropped: {}", I::PROTOCOL, err);
                }
            }
            Err(IpcError::Disconnected) => {
                log::debug!("ipc: protocol {} endpoint closed", I::PROTOCOL);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
}

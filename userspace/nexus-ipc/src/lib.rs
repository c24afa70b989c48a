// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: IPC runtime: message tags, call primitive and RPC dispatcher
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (dispatcher) + host backend tests
//!
//! PUBLIC API:
//!   - MsgTag: protocol/status label plus transferred word count
//!   - Wait: wait behaviour of a call or receive
//!   - IpcError: communication failures (distinct from application statuses)
//!   - Interface / Call / dispatch(): opcode routing over a transfer buffer
//!   - request() / reply(): client-side message framing helpers
//!   - endpoint() / Endpoint / Receiver / serve(): host rendezvous backend
//!
//! WIRE:
//!   - request: tag label = protocol id, word 0 = opcode, then arguments
//!   - reply:   tag label = status, word 0 = status, then outputs (success only)
//!
//! DEPENDENCIES:
//!   - nexus-utcb: transfer buffer and string codec
//!   - std::sync::mpsc + parking_lot::Mutex: host rendezvous

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;
use core::time::Duration;

use nexus_abi::{Rights, Status};
use nexus_utcb::{InStr, Limits, MsgReader, MsgWriter, OutStr, Utcb};

pub use nexus_utcb;

/// Result type returned by IPC operations.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Message tag travelling next to the transfer buffer.
///
/// On requests the label is the protocol id of the invoked interface, on replies it is the
/// status word. `words` is the number of message words the kernel copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgTag {
    label: i64,
    words: usize,
}

impl MsgTag {
    /// Creates a tag.
    pub const fn new(label: i64, words: usize) -> Self {
        Self { label, words }
    }

    /// Protocol id (request) or status (reply).
    pub const fn label(&self) -> i64 {
        self.label
    }

    /// Number of transferred words.
    pub const fn words(&self) -> usize {
        self.words
    }

    /// Reply status carried by the tag.
    pub const fn status(&self) -> Status {
        self.label
    }

    /// Returns `true` when a reply tag carries a negative status.
    pub const fn has_error(&self) -> bool {
        self.label < 0
    }
}

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}

/// Errors produced by the call primitive itself. Application failures travel as statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// Operation could not progress without blocking.
    WouldBlock,
    /// The caller exceeded the requested timeout.
    Timeout,
    /// The opposite endpoint disconnected.
    Disconnected,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for IpcError {}

/// Decoding view of one incoming call.
///
/// Strings handed out borrow the receiving buffer for `'a`; handlers see the call through an
/// anonymous lifetime, so nothing decoded here can outlive the handler invocation.
pub struct Call<'a> {
    label: u64,
    rights: Rights,
    opcode: u64,
    utcb: &'a Utcb,
    reader: MsgReader<'a>,
}

impl<'a> Call<'a> {
    /// Label of the gate the call arrived through.
    pub fn label(&self) -> u64 {
        self.label
    }

    /// Rights of the capability the caller invoked.
    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// Operation code (request word 0).
    pub fn opcode(&self) -> u64 {
        self.opcode
    }

    /// Fails with `PermissionDenied` unless the invoked capability carries `needed`.
    pub fn require(&self, needed: Rights) -> nexus_abi::Result<()> {
        if self.rights.contains(needed) {
            Ok(())
        } else {
            Err(nexus_abi::Error::PermissionDenied)
        }
    }

    /// Returns `true` when `view` lies in the buffer of this call.
    pub fn contains(&self, view: &[u8]) -> bool {
        self.utcb.contains(view)
    }

    /// Next argument word.
    pub fn word(&mut self) -> nexus_abi::Result<u64> {
        self.reader.get_word()
    }

    /// Next input string.
    pub fn in_str(&mut self) -> nexus_abi::Result<&'a [u8]> {
        self.reader.get_in_str()
    }

    /// Next optional input string.
    pub fn opt_in_str(&mut self) -> nexus_abi::Result<Option<&'a [u8]>> {
        self.reader.get_opt_in_str()
    }

    /// Next output capacity announcement.
    pub fn out_str(&mut self) -> nexus_abi::Result<OutStr> {
        self.reader.get_out_request()
    }

    /// Next optional output capacity announcement.
    pub fn opt_out_str(&mut self) -> nexus_abi::Result<Option<OutStr>> {
        self.reader.get_opt_out_request()
    }
}

/// Server-side interface reachable through the dispatcher.
pub trait Interface {
    /// Protocol id expected in the request tag.
    const PROTOCOL: i64;

    /// Handles one call. `Ok(status)` returns `status` (>= 0) together with whatever was
    /// written to `reply`; `Err` returns the negative status and drops the outputs.
    fn handle(&mut self, call: &mut Call<'_>, reply: &mut MsgWriter<'_>)
        -> nexus_abi::Result<Status>;
}

/// Identity of the capability a call arrived through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Gate label.
    pub label: u64,
    /// Rights of the invoked capability.
    pub rights: Rights,
}

/// Decodes the request in `utcb`, runs the handler and leaves the reply in `utcb`.
///
/// The handler writes into a scratch buffer, so an argument view and the reply never alias.
pub fn dispatch<I: Interface>(
    iface: &mut I,
    caller: Caller,
    tag: MsgTag,
    utcb: &mut Utcb,
    limits: Limits,
) -> MsgTag {
    let mut scratch = Utcb::new();
    let (status, words) = run(iface, caller, tag, utcb, &mut scratch, limits);
    if status < 0 {
        log::trace!("ipc: protocol {} failed with {}", tag.label(), status);
        utcb.set_head(status as u64);
        return MsgTag::new(status, 1);
    }
    scratch.set_head(status as u64);
    utcb.copy_words_from(&scratch, words);
    MsgTag::new(status, words)
}

fn run<I: Interface>(
    iface: &mut I,
    caller: Caller,
    tag: MsgTag,
    utcb: &Utcb,
    scratch: &mut Utcb,
    limits: Limits,
) -> (Status, usize) {
    if tag.label() != I::PROTOCOL {
        return (nexus_abi::Error::BadProtocol.status(), 0);
    }
    let mut reader = utcb.reader(tag.words(), limits);
    let opcode = match reader.get_word() {
        Ok(opcode) => opcode,
        Err(err) => return (err.status(), 0),
    };
    let mut call = Call { label: caller.label, rights: caller.rights, opcode, utcb, reader };
    let mut reply = scratch.writer();
    if let Err(err) = reply.put_word(0) {
        return (err.status(), 0);
    }
    match iface.handle(&mut call, &mut reply) {
        Ok(status) if status >= 0 => (status, reply.words()),
        Ok(status) => (status, 0),
        Err(err) => (err.status(), 0),
    }
}

/// Frames a request: opcode word followed by whatever `args` writes.
pub fn request(
    utcb: &mut Utcb,
    protocol: i64,
    opcode: u64,
    args: impl FnOnce(&mut MsgWriter<'_>) -> nexus_abi::Result<()>,
) -> nexus_abi::Result<MsgTag> {
    let mut w = utcb.writer();
    w.put_word(opcode)?;
    args(&mut w)?;
    Ok(MsgTag::new(protocol, w.words()))
}

/// Splits a reply into its status and a reader positioned on the outputs.
pub fn reply(tag: MsgTag, utcb: &Utcb, limits: Limits) -> nexus_abi::Result<(Status, MsgReader<'_>)> {
    let mut r = utcb.reader(tag.words(), limits);
    let status = r.get_word()? as Status;
    Ok((status, r))
}

/// Convenience wrapper turning a string literal into an input parameter.
pub fn in_str(value: &str) -> InStr<'_> {
    InStr::from(value)
}

mod host;
pub use host::{endpoint, serve, Endpoint, Incoming, Receiver, ReplyHandle};

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Shared fixtures for the end-to-end tests: a string-parameter test server behind an IPC gate
//! and the start-up recipe booted through init.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use neuron::{CapIdx, Client, Create, Kernel, KernelConfig, ThreadParams, ROOT_FACTORY_CAP, ROOT_TASK_CAP};
use nexus_abi::{Error, Rights, Status};
use nexus_ipc::{Call, Interface, MsgTag, Wait};
use nexus_utcb::{InStr, MsgWriter};
use parking_lot::Mutex;

/// Protocol id of the string test interface.
pub const STRINGS_PROTOCOL: i64 = 0x5354;

/// Label of the gate the string server listens on.
pub const STRINGS_LABEL: u64 = 0x1234;

/// Opcodes of the string test interface.
pub mod op {
    /// `in_simple_str(String)`.
    pub const IN_SIMPLE: u64 = 0;
    /// `out_simple_str(String &)`.
    pub const OUT_SIMPLE: u64 = 1;
    /// `in_opt_str(bool, Opt<String>)`.
    pub const IN_OPT: u64 = 2;
    /// `out_opt_str(bool, Opt<String &>)`.
    pub const OUT_OPT: u64 = 3;
    /// Replies with the invoked rights as status and the gate label as output word.
    pub const WHOAMI: u64 = 4;
}

/// Handler-side record of the last call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captured {
    /// Last saved input string, terminator stripped.
    pub string: Vec<u8>,
    /// Declared size of the last string parameter (length or capacity).
    pub size: usize,
    /// Value returned by the output operations.
    pub reply: Vec<u8>,
}

struct StringHandler {
    captured: Arc<Mutex<Captured>>,
}

impl StringHandler {
    fn save(&self, value: &[u8]) -> Status {
        let mut captured = self.captured.lock();
        captured.size = value.len() + 1;
        captured.string = value.to_vec();
        0
    }
}

impl Interface for StringHandler {
    const PROTOCOL: i64 = STRINGS_PROTOCOL;

    fn handle(&mut self, call: &mut Call<'_>, reply: &mut MsgWriter<'_>) -> nexus_abi::Result<Status> {
        match call.opcode() {
            op::IN_SIMPLE => {
                let value = call.in_str()?;
                if !call.contains(value) {
                    return Ok(1);
                }
                Ok(self.save(value))
            }
            op::OUT_SIMPLE => {
                let out = call.out_str()?;
                let value = {
                    let mut captured = self.captured.lock();
                    captured.size = out.capacity();
                    captured.reply.clone()
                };
                reply.put_out_str(out, &value)?;
                Ok(0)
            }
            op::IN_OPT => {
                let valid = call.word()? != 0;
                let value = call.opt_in_str()?;
                match (valid, value) {
                    (true, Some(value)) => Ok(self.save(value)),
                    (true, None) => Err(Error::InvalidArgument),
                    (false, _) => Ok(0),
                }
            }
            op::OUT_OPT => {
                let valid = call.word()? != 0;
                let out = call.opt_out_str()?.ok_or(Error::InvalidArgument)?;
                let value = {
                    let mut captured = self.captured.lock();
                    captured.size = out.capacity();
                    captured.reply.clone()
                };
                reply.put_opt_out_str(out, valid.then_some(value.as_slice()))?;
                Ok(0)
            }
            op::WHOAMI => {
                reply.put_word(call.label())?;
                Ok(Status::from(call.rights().bits()))
            }
            _ => Err(Error::UnknownOpcode),
        }
    }
}

/// String test server running on its own thread behind an IPC gate of a fresh kernel.
pub struct StringServer {
    kernel: Kernel,
    thread: CapIdx,
    gate: CapIdx,
    captured: Arc<Mutex<Captured>>,
    server: Option<JoinHandle<()>>,
}

impl StringServer {
    /// Boots a kernel, creates a server thread plus a gate to it and starts serving.
    pub fn start() -> Self {
        let kernel = Kernel::boot(KernelConfig::default());
        let root = kernel.root_task();
        let (thread, gate) = {
            let mut c = Client::new(&kernel, root);
            let thread = c
                .create(ROOT_FACTORY_CAP, &Create::Thread(ThreadParams::new(ROOT_TASK_CAP)))
                .expect("create server thread");
            let gate = c
                .create(ROOT_FACTORY_CAP, &Create::Gate { thread, label: STRINGS_LABEL })
                .expect("create gate");
            (thread, gate)
        };
        let receiver = kernel.take_receiver(root, thread).expect("server receiver");
        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut handler = StringHandler { captured: Arc::clone(&captured) };
        let limits = kernel.limits();
        log::debug!("e2e: string server on gate {gate} (label {STRINGS_LABEL:#x})");
        let server = thread::spawn(move || {
            nexus_ipc::serve(&receiver, &mut handler, limits).expect("string server loop");
        });
        Self { kernel, thread, gate, captured, server: Some(server) }
    }

    /// The kernel the server lives in.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Gate slot in the root task.
    pub fn gate(&self) -> CapIdx {
        self.gate
    }

    /// Client calling through the gate from the root task.
    pub fn client(&self) -> StringClient<'_> {
        self.client_for(self.gate)
    }

    /// Client calling through another gate slot of the root task.
    pub fn client_for(&self, gate: CapIdx) -> StringClient<'_> {
        StringClient { inner: Client::new(&self.kernel, self.kernel.root_task()), gate }
    }

    /// Snapshot of what the handler recorded.
    pub fn captured(&self) -> Captured {
        self.captured.lock().clone()
    }

    /// Value the output operations hand back.
    pub fn set_reply(&self, value: &[u8]) {
        self.captured.lock().reply = value.to_vec();
    }
}

impl Drop for StringServer {
    fn drop(&mut self) {
        let root = self.kernel.root_task();
        // dropping the last endpoint ends the serve loop
        for (what, slot) in [("gate", self.gate), ("thread", self.thread)] {
            if let Err(err) = self.kernel.delete(root, slot) {
                log::warn!("e2e: string server {what} in slot {slot} not deleted: {err}");
            }
        }
        if let Some(server) = self.server.take() {
            if server.join().is_err() {
                log::error!("e2e: string server thread panicked");
            }
        }
    }
}

/// Client-side stubs of the string test interface.
pub struct StringClient<'k> {
    inner: Client<'k>,
    gate: CapIdx,
}

impl<'k> StringClient<'k> {
    /// Underlying call context.
    pub fn raw(&mut self) -> &mut Client<'k> {
        &mut self.inner
    }

    /// Gate slot used by the stubs.
    pub fn gate(&self) -> CapIdx {
        self.gate
    }

    fn call(
        &mut self,
        opcode: u64,
        args: impl FnOnce(&mut MsgWriter<'_>) -> nexus_abi::Result<()>,
    ) -> Result<MsgTag, Status> {
        let tag = nexus_ipc::request(self.inner.utcb(), STRINGS_PROTOCOL, opcode, args).map_err(Error::status)?;
        let rtag = self.inner.call(self.gate, tag, Wait::Blocking).expect("gate call");
        if rtag.has_error() {
            return Err(rtag.status());
        }
        Ok(rtag)
    }

    /// Sends one input string; returns the status.
    pub fn in_simple_str(&mut self, value: InStr<'_>) -> Status {
        self.call(op::IN_SIMPLE, |w| w.put_in_str(value)).map_or_else(|status| status, |tag| tag.status())
    }

    /// Sends an optional input string after the validity word.
    pub fn in_opt_str(&mut self, valid: bool, value: Option<InStr<'_>>) -> Status {
        self.call(op::IN_OPT, |w| {
            w.put_word(u64::from(valid))?;
            w.put_opt_in_str(value)
        })
        .map_or_else(|status| status, |tag| tag.status())
    }

    /// Offers `buf` as output; returns the status and the reported length.
    pub fn out_simple_str(&mut self, buf: &mut [u8]) -> (Status, Option<usize>) {
        let rtag = match self.call(op::OUT_SIMPLE, |w| w.put_out_request(buf.len())) {
            Ok(rtag) => rtag,
            Err(status) => return (status, None),
        };
        let limits = self.inner.kernel().limits();
        let (status, mut out) = nexus_ipc::reply(rtag, self.inner.utcb(), limits).expect("reply frame");
        (status, Some(out.get_out_str(buf).expect("output string")))
    }

    /// Offers `buf` as optional output; the length is `None` when the server left it unset.
    pub fn out_opt_str(&mut self, valid: bool, buf: &mut [u8]) -> (Status, Option<usize>) {
        let rtag = match self.call(op::OUT_OPT, |w| {
            w.put_word(u64::from(valid))?;
            w.put_opt_out_request(Some(buf.len()))
        }) {
            Ok(rtag) => rtag,
            Err(status) => return (status, None),
        };
        let limits = self.inner.kernel().limits();
        let (status, mut out) = nexus_ipc::reply(rtag, self.inner.utcb(), limits).expect("reply frame");
        (status, out.get_opt_out_str(buf).expect("optional output string"))
    }

    /// Rights the server saw and the label of the gate.
    pub fn whoami(&mut self) -> (Rights, u64) {
        let rtag = self.call(op::WHOAMI, |_| Ok(())).expect("whoami");
        let limits = self.inner.kernel().limits();
        let (status, mut out) = nexus_ipc::reply(rtag, self.inner.utcb(), limits).expect("reply frame");
        (Rights::from_word(status as u64), out.get_word().expect("label word"))
    }
}

/// Boots the start-up recipes shipped with init.
pub fn start_system() -> nexus_init::System {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../source/init/nexus-init/recipes");
    let recipe = nexus_init::Recipe::load(&dir).expect("load start recipes");
    let system = nexus_init::boot(&recipe).expect("boot start recipes");
    log::debug!("e2e: booted {} task(s) from {}", system.tasks().len(), dir.display());
    system
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Client stubs for the kernel object interfaces
//! OWNERS: @kernel-cap-team
//! STATUS: Functional
//! PUBLIC API: Client (per-thread call context), RpcError
//!
//! Every stub frames its request in the client's transfer buffer, invokes the capability
//! through `Kernel::invoke` and decodes the reply, exactly as a user task would.

use nexus_abi::proto::{self, NO_CAP};
use nexus_abi::{check_status, Rights, Status};
use nexus_ipc::{IpcError, MsgTag, Wait};
use nexus_ns::Lookup;
use nexus_utcb::{InStr, MsgWriter, Utcb};

use crate::cap::CapIdx;
use crate::iface::encode_create;
use crate::kernel::{Create, Kernel};
use crate::object::ObjectRef;

/// Failure of a stub call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The call primitive failed.
    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),
    /// The callee answered with a negative status (or the request could not be framed).
    #[error("status: {0}")]
    Status(nexus_abi::Error),
}

impl From<nexus_abi::Error> for RpcError {
    fn from(err: nexus_abi::Error) -> Self {
        Self::Status(err)
    }
}

impl RpcError {
    /// Application error carried by this failure, if any.
    pub fn status(&self) -> Option<nexus_abi::Error> {
        match self {
            Self::Status(err) => Some(*err),
            Self::Ipc(_) => None,
        }
    }
}

/// Result alias for stub calls.
pub type Result<T> = core::result::Result<T, RpcError>;

/// Call context of one thread: the task it runs in plus its transfer buffer.
pub struct Client<'k> {
    kernel: &'k Kernel,
    task: ObjectRef,
    utcb: Utcb,
}

impl<'k> Client<'k> {
    /// Context for a thread of `task`.
    pub fn new(kernel: &'k Kernel, task: ObjectRef) -> Self {
        Self { kernel, task, utcb: Utcb::new() }
    }

    /// Task this client acts for.
    pub fn task(&self) -> ObjectRef {
        self.task
    }

    /// Kernel this client talks to.
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// Transfer buffer, for hand-built messages.
    pub fn utcb(&mut self) -> &mut Utcb {
        &mut self.utcb
    }

    /// Raw call: sends the first `tag.words()` words of the buffer to `cap`.
    pub fn call(&mut self, cap: CapIdx, tag: MsgTag, wait: Wait) -> nexus_ipc::Result<MsgTag> {
        self.kernel.invoke(self.task, cap, tag, &mut self.utcb, wait)
    }

    /// Frames `opcode` + `args`, calls `cap` and returns the status with the first output word.
    fn rpc(
        &mut self,
        cap: CapIdx,
        protocol: i64,
        opcode: u64,
        wait: Wait,
        args: impl FnOnce(&mut MsgWriter<'_>) -> nexus_abi::Result<()>,
    ) -> Result<(Status, Option<u64>)> {
        let tag = nexus_ipc::request(&mut self.utcb, protocol, opcode, args)?;
        let rtag = self.call(cap, tag, wait)?;
        let (status, mut outputs) = nexus_ipc::reply(rtag, &self.utcb, self.kernel.limits())?;
        check_status(status)?;
        Ok((status, outputs.get_word().ok()))
    }

    fn rpc_slot(
        &mut self,
        cap: CapIdx,
        protocol: i64,
        opcode: u64,
        wait: Wait,
        args: impl FnOnce(&mut MsgWriter<'_>) -> nexus_abi::Result<()>,
    ) -> Result<CapIdx> {
        let (_, word) = self.rpc(cap, protocol, opcode, wait, args)?;
        let word = word.ok_or(nexus_abi::Error::MessageTooShort)?;
        CapIdx::try_from(word).map_err(|_| RpcError::Status(nexus_abi::Error::InvalidCapability))
    }

    /// `Factory::create`.
    pub fn create(&mut self, factory: CapIdx, what: &Create) -> Result<CapIdx> {
        self.rpc_slot(factory, proto::FACTORY, proto::factory::CREATE, Wait::Blocking, |w| {
            encode_create(w, what)
        })
    }

    /// `Task::map`: maps slot `src` of this task into `dst_task`, rights clamped.
    pub fn map(&mut self, dst_task: CapIdx, src: CapIdx, rights: Rights) -> Result<CapIdx> {
        self.rpc_slot(dst_task, proto::TASK, proto::task::MAP, Wait::Blocking, |w| {
            w.put_word(u64::from(src))?;
            w.put_word(rights.to_word())
        })
    }

    /// `Task::unmap`: clears slot `cap` of `task`.
    pub fn unmap(&mut self, task: CapIdx, cap: CapIdx) -> Result<()> {
        self.rpc(task, proto::TASK, proto::task::UNMAP, Wait::Blocking, |w| w.put_word(u64::from(cap)))
            .map(drop)
    }

    /// `Task::delete`: deletes the object in slot `cap` of this task.
    pub fn delete(&mut self, task: CapIdx, cap: CapIdx) -> Result<()> {
        self.rpc(task, proto::TASK, proto::task::DELETE, Wait::Blocking, |w| w.put_word(u64::from(cap)))
            .map(drop)
    }

    /// `Task::cap_valid`: checks slot `cap` of `task`.
    pub fn cap_valid(&mut self, task: CapIdx, cap: CapIdx) -> Result<bool> {
        let (status, _) =
            self.rpc(task, proto::TASK, proto::task::CAP_VALID, Wait::Blocking, |w| w.put_word(u64::from(cap)))?;
        Ok(status == 1)
    }

    /// `Namespace::query`; installs the result in this task.
    pub fn query(&mut self, ns: CapIdx, name: &str, lookup: Lookup) -> Result<CapIdx> {
        let flags = match lookup {
            Lookup::Blocking => 0,
            Lookup::NonBlocking => proto::namespace::NON_BLOCKING,
        };
        self.rpc_slot(ns, proto::NAMESPACE, proto::namespace::QUERY, Wait::Blocking, |w| {
            w.put_word(flags)?;
            w.put_in_str(InStr::from(name))
        })
    }

    /// `Namespace::register`; `cap = None` announces a placeholder.
    pub fn register(
        &mut self,
        ns: CapIdx,
        name: &str,
        cap: Option<CapIdx>,
        rights: Rights,
        overwrite: bool,
    ) -> Result<()> {
        let flags = if overwrite { proto::namespace::OVERWRITE } else { 0 };
        self.rpc(ns, proto::NAMESPACE, proto::namespace::REGISTER, Wait::Blocking, |w| {
            w.put_word(flags)?;
            w.put_word(cap.map_or(NO_CAP, u64::from))?;
            w.put_word(rights.to_word())?;
            w.put_in_str(InStr::from(name))
        })
        .map(drop)
    }

    /// `Namespace::unlink`.
    pub fn unlink(&mut self, ns: CapIdx, name: &str) -> Result<()> {
        self.rpc(ns, proto::NAMESPACE, proto::namespace::UNLINK, Wait::Blocking, |w| {
            w.put_in_str(InStr::from(name))
        })
        .map(drop)
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel object interfaces (task, factory, namespace) served over the RPC path
//! OWNERS: @kernel-cap-team
//! PUBLIC API: none (used by Kernel::invoke); Create wire encoding shared with rpc
//! INVARIANTS: Names are copied out of the transfer buffer before they reach the namespace;
//!             rights come from the invoked capability, never from the message

use nexus_abi::proto::{self, NO_CAP};
use nexus_abi::{Error, ObjectKind, Result, Rights, SchedParam, Status};
use nexus_ipc::{Call, Interface};
use nexus_ns::Lookup;
use nexus_utcb::MsgWriter;

use crate::cap::{CapIdx, Capability};
use crate::kernel::{Create, Kernel, ThreadParams};
use crate::object::ObjectRef;

fn slot(word: u64) -> Result<CapIdx> {
    CapIdx::try_from(word).map_err(|_| Error::InvalidCapability)
}

fn opt_slot(word: u64) -> Result<Option<CapIdx>> {
    if word == NO_CAP {
        Ok(None)
    } else {
        slot(word).map(Some)
    }
}

fn opt_word(cap: Option<CapIdx>) -> u64 {
    cap.map_or(NO_CAP, u64::from)
}

fn name<'a>(call: &mut Call<'a>) -> Result<&'a str> {
    core::str::from_utf8(call.in_str()?).map_err(|_| Error::InvalidArgument)
}

fn u32_word(word: u64) -> Result<u32> {
    u32::try_from(word).map_err(|_| Error::InvalidArgument)
}

/// Writes the arguments of a factory `CREATE` request.
pub(crate) fn encode_create(w: &mut MsgWriter<'_>, what: &Create) -> Result<()> {
    w.put_word(what.kind().to_word())?;
    match *what {
        Create::Factory | Create::Task | Create::Namespace => Ok(()),
        Create::Gate { thread, label } => {
            w.put_word(u64::from(thread))?;
            w.put_word(label)
        }
        Create::Thread(p) => {
            for word in [
                u64::from(p.task),
                p.entry_pc,
                p.stack_sp,
                opt_word(p.pager),
                opt_word(p.scheduler),
                u64::from(p.sched.prio),
                u64::from(p.sched.quantum_us),
                p.sched.affinity,
            ] {
                w.put_word(word)?;
            }
            Ok(())
        }
    }
}

fn decode_create(call: &mut Call<'_>) -> Result<Create> {
    let kind = ObjectKind::from_word(call.word()?).ok_or(Error::InvalidArgument)?;
    Ok(match kind {
        ObjectKind::Factory => Create::Factory,
        ObjectKind::Task => Create::Task,
        ObjectKind::Namespace => Create::Namespace,
        ObjectKind::Gate => Create::Gate { thread: slot(call.word()?)?, label: call.word()? },
        ObjectKind::Thread => Create::Thread(ThreadParams {
            task: slot(call.word()?)?,
            entry_pc: call.word()?,
            stack_sp: call.word()?,
            pager: opt_slot(call.word()?)?,
            scheduler: opt_slot(call.word()?)?,
            sched: SchedParam {
                prio: u32_word(call.word()?)?,
                quantum_us: u32_word(call.word()?)?,
                affinity: call.word()?,
            },
        }),
    })
}

/// Task object: capability mapping, unmapping, deletion and validity checks. Mapping into
/// and unmapping from the invoked task need `WRITE` on its capability.
pub(crate) struct TaskInterface<'k> {
    kernel: &'k Kernel,
    caller: ObjectRef,
    target: ObjectRef,
}

impl<'k> TaskInterface<'k> {
    pub(crate) fn new(kernel: &'k Kernel, caller: ObjectRef, target: ObjectRef) -> Self {
        Self { kernel, caller, target }
    }
}

impl Interface for TaskInterface<'_> {
    const PROTOCOL: i64 = proto::TASK;

    fn handle(&mut self, call: &mut Call<'_>, reply: &mut MsgWriter<'_>) -> Result<Status> {
        match call.opcode() {
            proto::task::MAP => {
                call.require(Rights::WRITE)?;
                let src = slot(call.word()?)?;
                let rights = Rights::from_word(call.word()?);
                let dst = self.kernel.map_into(self.caller, src, self.target, rights)?;
                reply.put_word(u64::from(dst))?;
                Ok(0)
            }
            proto::task::UNMAP => {
                call.require(Rights::WRITE)?;
                self.kernel.unmap(self.target, slot(call.word()?)?)?;
                Ok(0)
            }
            proto::task::DELETE => {
                self.kernel.delete(self.caller, slot(call.word()?)?)?;
                Ok(0)
            }
            proto::task::CAP_VALID => {
                let cap = slot(call.word()?)?;
                Ok(Status::from(self.kernel.cap_valid(self.target, cap)))
            }
            _ => Err(Error::UnknownOpcode),
        }
    }
}

/// Factory object: object creation.
pub(crate) struct FactoryInterface<'k> {
    kernel: &'k Kernel,
    caller: ObjectRef,
    factory: Capability,
}

impl<'k> FactoryInterface<'k> {
    pub(crate) fn new(kernel: &'k Kernel, caller: ObjectRef, factory: Capability) -> Self {
        Self { kernel, caller, factory }
    }
}

impl Interface for FactoryInterface<'_> {
    const PROTOCOL: i64 = proto::FACTORY;

    fn handle(&mut self, call: &mut Call<'_>, reply: &mut MsgWriter<'_>) -> Result<Status> {
        match call.opcode() {
            proto::factory::CREATE => {
                call.require(Rights::SPECIAL)?;
                let what = decode_create(call)?;
                let cap = self.kernel.create_with(self.caller, self.factory, what)?;
                reply.put_word(u64::from(cap))?;
                Ok(0)
            }
            _ => Err(Error::UnknownOpcode),
        }
    }
}

/// Namespace object: query, register, unlink.
pub(crate) struct NamespaceInterface<'k> {
    kernel: &'k Kernel,
    caller: ObjectRef,
    ns: Capability,
    lookup: Lookup,
}

impl<'k> NamespaceInterface<'k> {
    pub(crate) fn new(kernel: &'k Kernel, caller: ObjectRef, ns: Capability, lookup: Lookup) -> Self {
        Self { kernel, caller, ns, lookup }
    }
}

impl Interface for NamespaceInterface<'_> {
    const PROTOCOL: i64 = proto::NAMESPACE;

    fn handle(&mut self, call: &mut Call<'_>, reply: &mut MsgWriter<'_>) -> Result<Status> {
        match call.opcode() {
            proto::namespace::QUERY => {
                let flags = call.word()?;
                let name = name(call)?;
                let lookup = if flags & proto::namespace::NON_BLOCKING != 0 {
                    Lookup::NonBlocking
                } else {
                    self.lookup
                };
                let cap = self.kernel.query_with(self.caller, self.ns, name, lookup)?;
                reply.put_word(u64::from(cap))?;
                Ok(0)
            }
            proto::namespace::REGISTER => {
                let flags = call.word()?;
                let cap = opt_slot(call.word()?)?;
                let rights = Rights::from_word(call.word()?);
                let name = name(call)?;
                let overwrite = flags & proto::namespace::OVERWRITE != 0;
                self.kernel.register_with(self.caller, self.ns, name, cap, rights, overwrite)?;
                Ok(0)
            }
            proto::namespace::UNLINK => {
                let name = name(call)?;
                self.kernel.unlink_with(self.ns, name)?;
                Ok(0)
            }
            _ => Err(Error::UnknownOpcode),
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel object operations: creation, delegation, revocation, name resolution
//! OWNERS: @kernel-cap-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + nexus-e2e
//! PUBLIC API: Kernel, KernelConfig, Create, ThreadParams, ThreadInfo, ROOT_TASK_CAP, ROOT_FACTORY_CAP
//! DEPENDS_ON: object::Arena, cap::CapTable, nexus_ns::Namespace, nexus_ipc
//! INVARIANTS:
//!   - Lock order: arena, then one task table at a time
//!   - Rights are checked before any state changes; failed operations leave no trace
//!   - Deletion happens under the arena write lock, so `cap_valid` never sees a half-deleted
//!     object
//!   - Blocking namespace queries wait with no kernel lock held

use std::sync::Arc;

use nexus_abi::{Error, ObjectKind, Result, Rights, SchedParam};
use nexus_ipc::{dispatch, Caller, MsgTag, Receiver, Wait};
use nexus_ns::{Lookup, Namespace};
use nexus_utcb::{Limits, Utcb, DEFAULT_MAX_STRING_LEN};
use spin::{Mutex, RwLock};

use crate::cap::{CapIdx, CapTable, Capability};
use crate::iface::{FactoryInterface, NamespaceInterface, TaskInterface};
use crate::object::{Arena, GateObject, Object, ObjectRef, TaskObject, ThreadObject};

/// Slot of the root task's own task capability.
pub const ROOT_TASK_CAP: CapIdx = 0;
/// Slot of the root factory in the root task.
pub const ROOT_FACTORY_CAP: CapIdx = 1;

/// Kernel limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Capability slots per task.
    pub cap_slots: usize,
    /// Largest accepted string parameter, terminator included.
    pub max_string_len: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { cap_slots: 64, max_string_len: DEFAULT_MAX_STRING_LEN }
    }
}

impl KernelConfig {
    /// Decode limits derived from this configuration.
    pub fn limits(&self) -> Limits {
        Limits { max_string_len: self.max_string_len }
    }
}

/// Parameters of a new thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadParams {
    /// Task the thread runs in.
    pub task: CapIdx,
    /// Initial program counter.
    pub entry_pc: u64,
    /// Initial stack pointer.
    pub stack_sp: u64,
    /// Optional pager.
    pub pager: Option<CapIdx>,
    /// Optional scheduler.
    pub scheduler: Option<CapIdx>,
    /// Scheduling parameters.
    pub sched: SchedParam,
}

impl ThreadParams {
    /// Thread in `task` with no pager, no scheduler and default parameters.
    pub fn new(task: CapIdx) -> Self {
        Self { task, entry_pc: 0, stack_sp: 0, pager: None, scheduler: None, sched: SchedParam::default() }
    }
}

/// What a factory should create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Create {
    /// Another factory.
    Factory,
    /// A task with an empty capability table.
    Task,
    /// An empty namespace.
    Namespace,
    /// A gate delivering to `thread`, tagged with `label`.
    Gate {
        /// Server thread capability.
        thread: CapIdx,
        /// Label delivered with each call.
        label: u64,
    },
    /// A thread.
    Thread(ThreadParams),
}

impl Create {
    /// Kind of the object this request produces.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Factory => ObjectKind::Factory,
            Self::Task => ObjectKind::Task,
            Self::Namespace => ObjectKind::Namespace,
            Self::Gate { .. } => ObjectKind::Gate,
            Self::Thread(_) => ObjectKind::Thread,
        }
    }
}

/// Recorded state of a thread object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Owning task.
    pub task: ObjectRef,
    /// Initial program counter.
    pub entry_pc: u64,
    /// Initial stack pointer.
    pub stack_sp: u64,
    /// Pager object, if any.
    pub pager: Option<ObjectRef>,
    /// Scheduler object, if any.
    pub scheduler: Option<ObjectRef>,
    /// Scheduling parameters.
    pub sched: SchedParam,
}

fn table_of(arena: &Arena, task: ObjectRef) -> Result<&Mutex<CapTable>> {
    match arena.get(task) {
        Some(Object::Task(t)) => Ok(&t.caps),
        _ => Err(Error::InvalidCapability),
    }
}

fn live(arena: &Arena, task: ObjectRef, cap: CapIdx) -> Result<(Capability, &Object)> {
    let cap = table_of(arena, task)?.lock().get(cap)?;
    let object = arena.resolve(&cap).ok_or(Error::InvalidCapability)?;
    Ok((cap, object))
}

fn live_opt(arena: &Arena, task: ObjectRef, cap: Option<CapIdx>) -> Result<Option<Capability>> {
    cap.map(|cap| live(arena, task, cap).map(|(cap, _)| cap)).transpose()
}

enum Target {
    Gate { endpoint: nexus_ipc::Endpoint, label: u64, rights: Rights },
    Task(Capability),
    Factory(Capability),
    Namespace(Capability),
}

/// Kernel core: object registry plus the operations tasks perform on it.
pub struct Kernel {
    config: KernelConfig,
    objects: RwLock<Arena>,
    root: ObjectRef,
}

impl Kernel {
    /// Boots a kernel with one root task holding its own task capability
    /// ([`ROOT_TASK_CAP`]) and a full-rights factory ([`ROOT_FACTORY_CAP`]).
    pub fn boot(config: KernelConfig) -> Self {
        let config = KernelConfig { cap_slots: config.cap_slots.max(2), ..config };
        let mut arena = Arena::default();
        let factory = arena.insert(Object::Factory);
        let root = arena.insert(Object::Task(TaskObject {
            caps: Mutex::new(CapTable::with_capacity(config.cap_slots)),
        }));
        if let Some(Object::Task(task)) = arena.get(root) {
            let mut caps = task.caps.lock();
            let own = Capability { object: root, kind: ObjectKind::Task, rights: Rights::all() };
            let fac = Capability { object: factory, kind: ObjectKind::Factory, rights: Rights::all() };
            let placed = caps.set(ROOT_TASK_CAP, own).and_then(|()| caps.set(ROOT_FACTORY_CAP, fac));
            debug_assert!(placed.is_ok(), "root table has at least two slots");
        }
        log::info!("cap: kernel up, {} slots per task, strings up to {} bytes", config.cap_slots, config.max_string_len);
        Self { config, objects: RwLock::new(arena), root }
    }

    /// Root task created at boot.
    pub fn root_task(&self) -> ObjectRef {
        self.root
    }

    /// Active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Decode limits applied to kernel interfaces.
    pub fn limits(&self) -> Limits {
        self.config.limits()
    }

    /// Number of live kernel objects.
    pub fn live_objects(&self) -> usize {
        self.objects.read().live()
    }

    /// Reads slot `cap` of `task` and checks that the object is still alive.
    pub fn lookup(&self, task: ObjectRef, cap: CapIdx) -> Result<Capability> {
        let arena = self.objects.read();
        live(&arena, task, cap).map(|(cap, _)| cap)
    }

    /// Returns `true` when slot `cap` of `task` refers to a live object.
    pub fn cap_valid(&self, task: ObjectRef, cap: CapIdx) -> bool {
        self.lookup(task, cap).is_ok()
    }

    /// Occupied slots of `task` (dangling ones included), for diagnostics.
    pub fn slots(&self, task: ObjectRef) -> Result<Vec<(CapIdx, Capability)>> {
        let arena = self.objects.read();
        let slots = table_of(&arena, task)?.lock().iter().collect();
        Ok(slots)
    }

    /// Creates an object through the factory in slot `factory` of `task`; requires `SPECIAL`.
    pub fn create(&self, task: ObjectRef, factory: CapIdx, what: Create) -> Result<CapIdx> {
        let cap = self.lookup(task, factory)?;
        self.create_with(task, cap, what)
    }

    pub(crate) fn create_with(&self, task: ObjectRef, factory: Capability, what: Create) -> Result<CapIdx> {
        let mut arena = self.objects.write();
        match arena.resolve(&factory) {
            Some(Object::Factory) => {}
            Some(_) => return Err(Error::BadProtocol),
            None => return Err(Error::InvalidCapability),
        }
        if !factory.rights.contains(Rights::SPECIAL) {
            log::debug!("cap: create {:?} denied, factory lacks SPECIAL", what.kind());
            return Err(Error::PermissionDenied);
        }
        table_of(&arena, task)?;
        let object = self.build(&arena, task, what)?;
        let kind = object.kind();
        let r = arena.insert(object);
        let cap = Capability { object: r, kind, rights: Rights::all() };
        let slot = table_of(&arena, task).and_then(|t| t.lock().allocate(cap).map_err(Error::from));
        match slot {
            Ok(slot) => {
                log::debug!("cap: created {kind:?} {r:?} in slot {slot}");
                Ok(slot)
            }
            Err(err) => {
                arena.remove(r);
                Err(err)
            }
        }
    }

    fn build(&self, arena: &Arena, task: ObjectRef, what: Create) -> Result<Object> {
        Ok(match what {
            Create::Factory => Object::Factory,
            Create::Task => Object::Task(TaskObject {
                caps: Mutex::new(CapTable::with_capacity(self.config.cap_slots)),
            }),
            Create::Namespace => Object::Namespace(Arc::new(Namespace::new())),
            Create::Gate { thread, label } => match live(arena, task, thread)? {
                (cap, Object::Thread(t)) => {
                    Object::Gate(GateObject { thread: cap.object, endpoint: t.endpoint.clone(), label })
                }
                _ => return Err(Error::InvalidCapability),
            },
            Create::Thread(params) => {
                let owner = match live(arena, task, params.task)? {
                    (cap, Object::Task(_)) => cap.object,
                    _ => return Err(Error::InvalidCapability),
                };
                let pager = live_opt(arena, task, params.pager)?;
                let scheduler = live_opt(arena, task, params.scheduler)?;
                let (endpoint, receiver) = nexus_ipc::endpoint();
                Object::Thread(ThreadObject {
                    task: owner,
                    entry_pc: params.entry_pc,
                    stack_sp: params.stack_sp,
                    pager,
                    scheduler,
                    sched: params.sched,
                    endpoint,
                    receiver: Mutex::new(Some(receiver)),
                })
            }
        })
    }

    /// Maps slot `src` of `task` into the task in slot `dst_task`, with rights clamped to
    /// `rights ∩ source rights`; requires `WRITE` on `dst_task`. Returns the new slot in the
    /// destination.
    pub fn map(&self, task: ObjectRef, src: CapIdx, dst_task: CapIdx, rights: Rights) -> Result<CapIdx> {
        let dst = self.lookup(task, dst_task)?;
        if dst.kind != ObjectKind::Task {
            return Err(Error::BadProtocol);
        }
        if !dst.rights.contains(Rights::WRITE) {
            return Err(Error::PermissionDenied);
        }
        self.map_into(task, src, dst.object, rights)
    }

    pub(crate) fn map_into(&self, task: ObjectRef, src: CapIdx, dst: ObjectRef, rights: Rights) -> Result<CapIdx> {
        let arena = self.objects.read();
        let derived = table_of(&arena, task)?.lock().derive(src, rights)?;
        arena.resolve(&derived).ok_or(Error::InvalidCapability)?;
        let slot = table_of(&arena, dst)?.lock().allocate(derived)?;
        log::trace!("cap: map {:?} -> {dst:?} slot {slot}, rights {:?}", derived.object, derived.rights);
        Ok(slot)
    }

    /// Clears slot `cap` of `task` without touching the object.
    pub fn unmap(&self, task: ObjectRef, cap: CapIdx) -> Result<()> {
        let arena = self.objects.read();
        table_of(&arena, task)?.lock().take(cap)?;
        Ok(())
    }

    /// Deletes the object in slot `cap` of `task`; requires `DELETE`. Every slot referring to
    /// the object, in every task, becomes invalid. A deleted namespace wakes its waiters with
    /// `NamespaceDestroyed`.
    pub fn delete(&self, task: ObjectRef, cap: CapIdx) -> Result<()> {
        let removed = {
            let mut arena = self.objects.write();
            live(&arena, task, cap)?;
            let cap = table_of(&arena, task)?.lock().require(cap, Rights::DELETE).map_err(|err| {
                log::debug!("cap: delete in slot {cap} denied, slot lacks DELETE");
                Error::from(err)
            })?;
            log::debug!("cap: delete {:?} ({:?})", cap.object, cap.kind);
            arena.remove(cap.object)
        };
        if let Some(Object::Namespace(ns)) = removed {
            ns.destroy();
        }
        Ok(())
    }

    fn namespace_of(&self, cap: &Capability) -> Result<Arc<Namespace<Capability>>> {
        match self.objects.read().resolve(cap) {
            Some(Object::Namespace(ns)) => Ok(Arc::clone(ns)),
            Some(_) => Err(Error::BadProtocol),
            None => Err(Error::InvalidCapability),
        }
    }

    /// Binds `name` in the namespace in slot `ns`; requires `WRITE` on `ns`.
    ///
    /// `cap = None` announces a placeholder. The stored capability carries
    /// `rights ∩ rights of cap`.
    pub fn register(
        &self,
        task: ObjectRef,
        ns: CapIdx,
        name: &str,
        cap: Option<CapIdx>,
        rights: Rights,
        overwrite: bool,
    ) -> Result<()> {
        let ns = self.lookup(task, ns)?;
        self.register_with(task, ns, name, cap, rights, overwrite)
    }

    pub(crate) fn register_with(
        &self,
        task: ObjectRef,
        ns: Capability,
        name: &str,
        cap: Option<CapIdx>,
        rights: Rights,
        overwrite: bool,
    ) -> Result<()> {
        let namespace = self.namespace_of(&ns)?;
        if !ns.rights.contains(Rights::WRITE) {
            log::debug!("ns: register {name:?} denied, namespace slot lacks WRITE");
            return Err(Error::PermissionDenied);
        }
        let item = match cap {
            Some(cap) => Some(self.lookup(task, cap)?.restrict(rights)),
            None => None,
        };
        match item {
            Some(item) => namespace.register(name, item, overwrite)?,
            None => namespace.reserve(name, overwrite)?,
        }
        Ok(())
    }

    /// Resolves `name` in the namespace in slot `ns` and installs the result in `task`.
    ///
    /// A blocking query on a placeholder waits until the name is registered, unlinked or the
    /// namespace is deleted.
    pub fn query(&self, task: ObjectRef, ns: CapIdx, name: &str, lookup: Lookup) -> Result<CapIdx> {
        let ns = self.lookup(task, ns)?;
        self.query_with(task, ns, name, lookup)
    }

    pub(crate) fn query_with(&self, task: ObjectRef, ns: Capability, name: &str, lookup: Lookup) -> Result<CapIdx> {
        let namespace = self.namespace_of(&ns)?;
        let found = namespace.query(name, lookup)?;
        let arena = self.objects.read();
        if arena.resolve(&found).is_none() {
            log::debug!("ns: {name:?} refers to a deleted object");
            return Err(Error::InvalidCapability);
        }
        let slot = table_of(&arena, task)?.lock().allocate(found)?;
        Ok(slot)
    }

    /// Removes `name` from the namespace in slot `ns`; requires `WRITE`.
    pub fn unlink(&self, task: ObjectRef, ns: CapIdx, name: &str) -> Result<()> {
        let ns = self.lookup(task, ns)?;
        self.unlink_with(ns, name)
    }

    pub(crate) fn unlink_with(&self, ns: Capability, name: &str) -> Result<()> {
        let namespace = self.namespace_of(&ns)?;
        if !ns.rights.contains(Rights::WRITE) {
            return Err(Error::PermissionDenied);
        }
        namespace.unlink(name)?;
        Ok(())
    }

    /// Names bound in the namespace in slot `ns`, in order.
    pub fn names(&self, task: ObjectRef, ns: CapIdx) -> Result<Vec<String>> {
        let ns = self.lookup(task, ns)?;
        Ok(self.namespace_of(&ns)?.names())
    }

    /// Hands out the receive side of the thread in slot `thread`, once.
    pub fn take_receiver(&self, task: ObjectRef, thread: CapIdx) -> Result<Receiver> {
        let arena = self.objects.read();
        let receiver = match live(&arena, task, thread)? {
            (_, Object::Thread(t)) => t.receiver.lock().take(),
            _ => return Err(Error::BadProtocol),
        };
        receiver.ok_or(Error::AlreadyExists)
    }

    /// Recorded parameters of the thread in slot `thread`.
    pub fn thread_info(&self, task: ObjectRef, thread: CapIdx) -> Result<ThreadInfo> {
        let arena = self.objects.read();
        match live(&arena, task, thread)? {
            (_, Object::Thread(t)) => Ok(ThreadInfo {
                task: t.task,
                entry_pc: t.entry_pc,
                stack_sp: t.stack_sp,
                pager: t.pager.map(|c| c.object),
                scheduler: t.scheduler.map(|c| c.object),
                sched: t.sched,
            }),
            _ => Err(Error::BadProtocol),
        }
    }

    /// The call primitive: invokes the object in slot `cap` of `task` with the message in
    /// `utcb` and leaves the reply there.
    ///
    /// Gates forward to their server thread; task, factory and namespace objects are served by
    /// the kernel in the calling thread. Invalid capabilities and objects without an interface
    /// answer with a negative status; `Err` is reserved for transport failures.
    pub fn invoke(
        &self,
        task: ObjectRef,
        cap: CapIdx,
        tag: MsgTag,
        utcb: &mut Utcb,
        wait: Wait,
    ) -> nexus_ipc::Result<MsgTag> {
        let target = {
            let arena = self.objects.read();
            match live(&arena, task, cap) {
                Err(err) => return Ok(fail(utcb, err)),
                Ok((cap, Object::Gate(gate))) => {
                    if arena.get(gate.thread).is_none() {
                        return Ok(fail(utcb, Error::InvalidCapability));
                    }
                    Target::Gate { endpoint: gate.endpoint.clone(), label: gate.label, rights: cap.rights }
                }
                Ok((cap, Object::Task(_))) => Target::Task(cap),
                Ok((cap, Object::Factory)) => Target::Factory(cap),
                Ok((cap, Object::Namespace(_))) => Target::Namespace(cap),
                Ok((_, Object::Thread(_))) => return Ok(fail(utcb, Error::BadProtocol)),
            }
        };
        let limits = self.limits();
        let reply = match target {
            Target::Gate { endpoint, label, rights } => {
                return endpoint.call(label, rights, tag, utcb, wait).map_err(|err| {
                    log::trace!("ipc: gate {label:#x} call failed: {err}");
                    err
                });
            }
            Target::Task(cap) => {
                let mut iface = TaskInterface::new(self, task, cap.object);
                dispatch(&mut iface, Caller { label: 0, rights: cap.rights }, tag, utcb, limits)
            }
            Target::Factory(cap) => {
                let mut iface = FactoryInterface::new(self, task, cap);
                dispatch(&mut iface, Caller { label: 0, rights: cap.rights }, tag, utcb, limits)
            }
            Target::Namespace(cap) => {
                let lookup = if wait.is_non_blocking() { Lookup::NonBlocking } else { Lookup::Blocking };
                let mut iface = NamespaceInterface::new(self, task, cap, lookup);
                dispatch(&mut iface, Caller { label: 0, rights: cap.rights }, tag, utcb, limits)
            }
        };
        Ok(reply)
    }
}

fn fail(utcb: &mut Utcb, err: Error) -> MsgTag {
    let status = err.status();
    utcb.set_head(status as u64);
    MsgTag::new(status, 1)
}

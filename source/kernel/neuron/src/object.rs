// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel object registry (generation-checked arena)
//! OWNERS: @kernel-cap-team
//! PUBLIC API: ObjectRef, Generation, Object, TaskObject, ThreadObject, GateObject, Arena
//! INVARIANTS:
//!   - The arena is the only owner of kernel objects; capabilities hold `ObjectRef`s
//!   - Removing an object bumps the slot generation, so every outstanding `ObjectRef` to it
//!     stops resolving, in every task, at once
//!   - Generations never repeat for a slot until the counter wraps

use std::sync::Arc;

use nexus_abi::{ObjectKind, SchedParam};
use nexus_ipc::{Endpoint, Receiver};
use nexus_ns::Namespace;
use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::cap::{CapTable, Capability};

/// Occupancy generation of an arena slot; bumped every time the slot's object is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u32);

impl Generation {
    const fn first() -> Self {
        Self(0)
    }

    /// Generation of the next occupant. Wraps after `u32::MAX` removals of one slot.
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Raw value, for diagnostics and tests.
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Weak reference to an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    index: u32,
    generation: Generation,
}

const_assert_eq!(core::mem::size_of::<ObjectRef>(), 8);

impl ObjectRef {
    /// Builds a reference from raw parts. Only meaningful for references previously handed out
    /// by the arena; anything else simply fails to resolve.
    pub const fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation: Generation(generation) }
    }

    /// Arena slot index.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the reference was issued for.
    pub const fn generation(self) -> Generation {
        self.generation
    }
}

/// Protection domain: owns a capability table.
pub struct TaskObject {
    /// Capability table of the task.
    pub caps: Mutex<CapTable>,
}

/// Thread bound to a task, with the endpoint its gates deliver to.
pub struct ThreadObject {
    /// Owning task.
    pub task: ObjectRef,
    /// Initial program counter.
    pub entry_pc: u64,
    /// Initial stack pointer.
    pub stack_sp: u64,
    /// Pager capability, if any.
    pub pager: Option<Capability>,
    /// Scheduler capability, if any.
    pub scheduler: Option<Capability>,
    /// Recorded scheduling parameters.
    pub sched: SchedParam,
    /// Send side of the thread's receive queue.
    pub endpoint: Endpoint,
    /// Receive side, handed once to the code running as this thread.
    pub receiver: Mutex<Option<Receiver>>,
}

/// IPC gate bound to a server thread.
pub struct GateObject {
    /// Server thread.
    pub thread: ObjectRef,
    /// Endpoint of the server thread.
    pub endpoint: Endpoint,
    /// Label delivered with every call through this gate.
    pub label: u64,
}

/// Kernel object stored in the arena.
pub enum Object {
    /// Object factory.
    Factory,
    /// Task.
    Task(TaskObject),
    /// Thread.
    Thread(ThreadObject),
    /// IPC gate.
    Gate(GateObject),
    /// Name directory holding capabilities.
    Namespace(Arc<Namespace<Capability>>),
}

impl Object {
    /// ABI kind of the object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Factory => ObjectKind::Factory,
            Self::Task(_) => ObjectKind::Task,
            Self::Thread(_) => ObjectKind::Thread,
            Self::Gate(_) => ObjectKind::Gate,
            Self::Namespace(_) => ObjectKind::Namespace,
        }
    }
}

struct Entry {
    generation: Generation,
    object: Option<Object>,
}

/// Generation-checked object arena.
#[derive(Default)]
pub struct Arena {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl Arena {
    /// Stores `object` and returns a fresh reference to it.
    pub fn insert(&mut self, object: Object) -> ObjectRef {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.object = Some(object);
            return ObjectRef { index, generation: entry.generation };
        }
        let index = self.entries.len() as u32;
        let generation = Generation::first();
        self.entries.push(Entry { generation, object: Some(object) });
        ObjectRef { index, generation }
    }

    /// Resolves a reference; `None` once the object was removed.
    pub fn get(&self, r: ObjectRef) -> Option<&Object> {
        self.entries
            .get(r.index as usize)
            .filter(|entry| entry.generation == r.generation)
            .and_then(|entry| entry.object.as_ref())
    }

    /// Resolves a capability, checking that the object is alive and of the recorded kind.
    pub fn resolve(&self, cap: &Capability) -> Option<&Object> {
        self.get(cap.object).filter(|object| object.kind() == cap.kind)
    }

    /// Removes the object and invalidates every reference to it.
    pub fn remove(&mut self, r: ObjectRef) -> Option<Object> {
        let entry = self.entries.get_mut(r.index as usize)?;
        if entry.generation != r.generation {
            return None;
        }
        let object = entry.object.take()?;
        entry.generation = entry.generation.next();
        self.free.push(r.index);
        Some(object)
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|entry| entry.object.is_some()).count()
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task capability table and rights delegation
//! OWNERS: @kernel-cap-team
//! PUBLIC API: CapTable, Capability{object,kind,rights}, CapIdx, CapError
//! DEPENDS_ON: object::ObjectRef, nexus_abi::Rights
//! INVARIANTS: Slots are weak references (object + generation); derived rights never exceed
//!             the source rights; the table never grows past its configured size

use core::fmt;

use nexus_abi::{ObjectKind, Rights};

use crate::object::ObjectRef;

/// Index of a slot in a task's capability table.
pub type CapIdx = u32;

/// Capability descriptor stored in a slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    /// Referenced object; dangling once the object is deleted.
    pub object: ObjectRef,
    /// Kind of the referenced object.
    pub kind: ObjectKind,
    /// Rights held through this slot.
    pub rights: Rights,
}

impl Capability {
    /// Copy of this capability restricted to `requested`. Rights outside the source are
    /// silently dropped.
    pub fn restrict(self, requested: Rights) -> Self {
        Self { rights: self.rights & requested, ..self }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("object", &self.object)
            .field("kind", &self.kind)
            .field("rights", &self.rights.bits())
            .finish()
    }
}

/// Errors produced when manipulating the capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// Provided slot is out of range or empty.
    InvalidSlot,
    /// Insufficient rights for the requested operation.
    PermissionDenied,
    /// No free capability slots are available in the table.
    NoSpace,
}

impl From<CapError> for nexus_abi::Error {
    fn from(err: CapError) -> Self {
        match err {
            CapError::InvalidSlot => Self::InvalidCapability,
            CapError::PermissionDenied => Self::PermissionDenied,
            CapError::NoSpace => Self::NoSpace,
        }
    }
}

/// Per-task capability table.
#[derive(Default, Clone, Debug)]
pub struct CapTable {
    slots: Vec<Option<Capability>>,
}

impl CapTable {
    /// Creates an empty table sized for `slots` entries.
    pub fn with_capacity(slots: usize) -> Self {
        Self { slots: vec![None; slots] }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` for a zero-sized table.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inserts or overwrites a slot.
    pub fn set(&mut self, slot: CapIdx, cap: Capability) -> Result<(), CapError> {
        let entry = self.slots.get_mut(slot as usize).ok_or(CapError::InvalidSlot)?;
        *entry = Some(cap);
        Ok(())
    }

    /// Allocates the first free slot and inserts `cap`, returning the slot index.
    pub fn allocate(&mut self, cap: Capability) -> Result<CapIdx, CapError> {
        let index = self.slots.iter().position(Option::is_none).ok_or(CapError::NoSpace)?;
        self.slots[index] = Some(cap);
        Ok(index as CapIdx)
    }

    /// Returns a capability without consuming it.
    pub fn get(&self, slot: CapIdx) -> Result<Capability, CapError> {
        self.slots.get(slot as usize).and_then(|entry| *entry).ok_or(CapError::InvalidSlot)
    }

    /// Removes and returns the capability stored in `slot`.
    pub fn take(&mut self, slot: CapIdx) -> Result<Capability, CapError> {
        let entry = self.slots.get_mut(slot as usize).ok_or(CapError::InvalidSlot)?;
        entry.take().ok_or(CapError::InvalidSlot)
    }

    /// Derives a capability for delegation; rights are clamped to the source.
    pub fn derive(&self, slot: CapIdx, rights: Rights) -> Result<Capability, CapError> {
        Ok(self.get(slot)?.restrict(rights))
    }

    /// Fetches `slot` and checks that it carries `needed`.
    pub fn require(&self, slot: CapIdx, needed: Rights) -> Result<Capability, CapError> {
        let cap = self.get(slot)?;
        if cap.rights.contains(needed) {
            Ok(cap)
        } else {
            Err(CapError::PermissionDenied)
        }
    }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (CapIdx, Capability)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.map(|cap| (index as CapIdx, cap)))
    }
}

#[cfg(test)]
mod tests_prop;

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for capability table
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic. Ensures rights delegation and slot ops are sound.
//!
//! TEST_SCOPE:
//!   - Capability slot set/get roundtrip behavior
//!   - Rights derivation: intersection only (no escalation)
//!   - Allocation respects the table bound
//!
//! TEST_SCENARIOS:
//!   - set_and_get_roundtrip(): set then get returns the same capability
//!   - derive_never_amplifies(): derived rights are the intersection of source and request
//!   - require_matches_subset(): require() succeeds iff the slot holds the needed rights
//!   - allocate_until_full(): allocation fills the lowest free slot, then fails with NoSpace

use super::{CapError, CapTable, Capability};
use crate::object::ObjectRef;
use nexus_abi::{ObjectKind, Rights};
use proptest::prelude::*;

fn arb_rights() -> impl Strategy<Value = Rights> {
    any::<u8>().prop_map(Rights::from_bits_truncate)
}

fn arb_kind() -> impl Strategy<Value = ObjectKind> {
    prop_oneof![
        Just(ObjectKind::Factory),
        Just(ObjectKind::Task),
        Just(ObjectKind::Thread),
        Just(ObjectKind::Gate),
        Just(ObjectKind::Namespace),
    ]
}

fn arb_capability() -> impl Strategy<Value = Capability> {
    (any::<u32>(), any::<u32>(), arb_kind(), arb_rights()).prop_map(|(index, generation, kind, rights)| {
        Capability { object: ObjectRef::from_raw(index, generation), kind, rights }
    })
}

proptest! {
    #[test]
    fn set_and_get_roundtrip(slot in 0u32..32, cap in arb_capability()) {
        let mut table = CapTable::with_capacity(64);
        table.set(slot, cap).unwrap();
        prop_assert_eq!(table.get(slot).unwrap(), cap);
        prop_assert_eq!(table.take(slot).unwrap(), cap);
        prop_assert_eq!(table.get(slot), Err(CapError::InvalidSlot));
    }

    #[test]
    fn derive_never_amplifies(cap in arb_capability(), requested in arb_rights()) {
        let mut table = CapTable::with_capacity(4);
        table.set(0, cap).unwrap();
        let derived = table.derive(0, requested).unwrap();
        prop_assert_eq!(derived.object, cap.object);
        prop_assert_eq!(derived.kind, cap.kind);
        prop_assert_eq!(derived.rights, cap.rights & requested);
        prop_assert!(cap.rights.contains(derived.rights));
    }

    #[test]
    fn require_matches_subset(cap in arb_capability(), needed in arb_rights()) {
        let mut table = CapTable::with_capacity(4);
        table.set(2, cap).unwrap();
        let result = table.require(2, needed);
        if cap.rights.contains(needed) {
            prop_assert_eq!(result, Ok(cap));
        } else {
            prop_assert_eq!(result, Err(CapError::PermissionDenied));
        }
    }

    #[test]
    fn allocate_until_full(size in 1usize..16, cap in arb_capability()) {
        let mut table = CapTable::with_capacity(size);
        for expected in 0..size {
            prop_assert_eq!(table.allocate(cap), Ok(expected as u32));
        }
        prop_assert_eq!(table.allocate(cap), Err(CapError::NoSpace));
        table.take(0).unwrap();
        prop_assert_eq!(table.allocate(cap), Ok(0));
        prop_assert_eq!(table.iter().count(), size);
    }
}

#[test]
fn out_of_range_slot() {
    let mut table = CapTable::with_capacity(2);
    let cap = Capability {
        object: ObjectRef::from_raw(0, 0),
        kind: ObjectKind::Task,
        rights: Rights::all(),
    };
    assert_eq!(table.set(2, cap), Err(CapError::InvalidSlot));
    assert_eq!(table.get(u32::MAX), Err(CapError::InvalidSlot));
}

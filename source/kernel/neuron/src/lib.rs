// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON capability core: object registry, capability tables, kernel interfaces
//! OWNERS: @kernel-cap-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + proptest (cap), nexus-e2e integration tests
//!
//! PUBLIC API:
//!   - Kernel: boot, create, map, unmap, delete, cap_valid, register, query, unlink, invoke
//!   - KernelConfig: per-task slot count and string limit
//!   - Create / ThreadParams: factory requests
//!   - rpc::Client: stubs for the task, factory and namespace interfaces
//!   - cap::{CapTable, Capability, CapIdx}, object::ObjectRef
//!
//! INVARIANTS:
//!   - Objects are owned by one arena; capability slots are generation-checked weak references
//!   - Delegation (map, register) never amplifies rights
//!   - Deleting an object revokes every slot referring to it, in every task

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

pub mod cap;
mod iface;
mod kernel;
pub mod object;
pub mod rpc;

pub use cap::{CapIdx, CapTable, Capability};
pub use kernel::{
    Create, Kernel, KernelConfig, ThreadInfo, ThreadParams, ROOT_FACTORY_CAP, ROOT_TASK_CAP,
};
pub use nexus_ns::Lookup;
pub use object::{Generation, ObjectRef};
pub use rpc::{Client, RpcError};

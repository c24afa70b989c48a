// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rights probes a started task can run against its own capabilities
//! OWNERS: @init-team
//! PUBLIC API: has_permission_w(), has_permission_s(), has_permission_d()
//!
//! Each probe tries the operation the right guards and reports `false` on `PermissionDenied`;
//! every other failure is returned as an error.

use neuron::{CapIdx, Client, Create, RpcError};
use nexus_abi::{Error, Rights};

fn denied(err: &RpcError) -> bool {
    err.status() == Some(Error::PermissionDenied)
}

/// Name the write probe registers.
pub const DUMMY_NAME: &str = "dummy";

/// `true` if `ns` allows registering: announces a placeholder named [`DUMMY_NAME`].
pub fn has_permission_w(client: &mut Client<'_>, ns: CapIdx) -> Result<bool, RpcError> {
    match client.register(ns, DUMMY_NAME, None, Rights::empty(), false) {
        Ok(()) => Ok(true),
        Err(err) if denied(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

/// `true` if `factory` carries `SPECIAL`: creates a namespace through it and deletes it again
/// via `task` (the caller's own task capability).
pub fn has_permission_s(client: &mut Client<'_>, task: CapIdx, factory: CapIdx) -> Result<bool, RpcError> {
    match client.create(factory, &Create::Namespace) {
        Ok(ns) => {
            client.delete(task, ns)?;
            Ok(true)
        }
        Err(err) if denied(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

/// `true` if `cap` carries `DELETE`.
///
/// Maps a copy of `cap` into the caller's task, deletes the original and reports whether the
/// copy went stale with it. A successful probe destroys the object.
pub fn has_permission_d(client: &mut Client<'_>, task: CapIdx, cap: CapIdx) -> Result<bool, RpcError> {
    let copy = client.map(task, cap, Rights::all())?;
    if !client.cap_valid(task, copy)? {
        return Err(RpcError::Status(Error::InvalidCapability));
    }
    match client.delete(task, cap) {
        Ok(()) => {}
        Err(err) if denied(&err) => {
            client.unmap(task, copy)?;
            return Ok(false);
        }
        Err(err) => return Err(err),
    }
    let survived = client.cap_valid(task, copy)?;
    client.unmap(task, copy)?;
    Ok(!survived)
}

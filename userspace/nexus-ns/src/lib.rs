// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Name directory object used by the kernel core and by tests.
//!
//! A [`Namespace`] maps names to capabilities or to placeholders. Placeholders are
//! announced names whose capability is not known yet: blocking queries park on them until a
//! registration resolves the name, the name is unlinked, or the namespace is destroyed. Every
//! waiter on one placeholder observes the same outcome.
//!
//! The namespace is generic over the capability representation so the kernel can store its
//! own capability items while tests use plain values.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Result alias for namespace operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by namespace operations.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The name is already bound and overwriting was not requested.
    #[error("name already registered")]
    AlreadyExists,
    /// The name is not bound (or was unlinked while waiting).
    #[error("name not found")]
    NotFound,
    /// The name is a placeholder and the query was non-blocking.
    #[error("name not resolved yet")]
    WouldBlock,
    /// The namespace was destroyed.
    #[error("namespace destroyed")]
    Destroyed,
    /// Names must be non-empty.
    #[error("invalid name")]
    InvalidName,
}

impl From<Error> for nexus_abi::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::AlreadyExists => Self::AlreadyExists,
            Error::NotFound => Self::NotFound,
            Error::WouldBlock => Self::WouldBlock,
            Error::Destroyed => Self::NamespaceDestroyed,
            Error::InvalidName => Self::InvalidArgument,
        }
    }
}

/// How a query treats placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Wait until the placeholder is resolved.
    Blocking,
    /// Fail with [`Error::WouldBlock`] on a placeholder.
    NonBlocking,
}

/// Snapshot of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<C> {
    /// Name bound to a capability.
    Resolved(C),
    /// Name announced, capability pending.
    Placeholder,
}

/// One-shot broadcast cell shared by every waiter of a placeholder.
struct Pending<C> {
    outcome: Mutex<Option<Result<C>>>,
    ready: Condvar,
}

impl<C: Clone> Pending<C> {
    fn new() -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(None), ready: Condvar::new() })
    }

    /// Publishes the outcome once; later publications are ignored.
    fn publish(&self, outcome: Result<C>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Result<C> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

enum Slot<C> {
    Resolved(C),
    Pending(Arc<Pending<C>>),
}

struct State<C> {
    entries: BTreeMap<String, Slot<C>>,
    destroyed: bool,
}

/// Name directory with placeholder support.
pub struct Namespace<C> {
    state: Mutex<State<C>>,
}

impl<C: Clone> Default for Namespace<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(Error::InvalidName)
    } else {
        Ok(())
    }
}

impl<C: Clone> Namespace<C> {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self { state: Mutex::new(State { entries: BTreeMap::new(), destroyed: false }) }
    }

    /// Binds `name` to `cap`.
    ///
    /// A placeholder under `name` is resolved and its waiters woken with `cap`. An existing
    /// resolved binding is replaced only when `overwrite` is set.
    pub fn register(&self, name: &str, cap: C, overwrite: bool) -> Result<()> {
        check_name(name)?;
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        if let Some(Slot::Resolved(_)) = state.entries.get(name) {
            if !overwrite {
                return Err(Error::AlreadyExists);
            }
        }
        if let Some(Slot::Pending(waiters)) =
            state.entries.insert(name.to_string(), Slot::Resolved(cap.clone()))
        {
            log::debug!("ns: resolved placeholder {name}");
            waiters.publish(Ok(cap));
        }
        Ok(())
    }

    /// Announces `name` without a capability.
    ///
    /// Reserving an existing placeholder is a no-op; a resolved binding is turned back into a
    /// placeholder only when `overwrite` is set.
    pub fn reserve(&self, name: &str, overwrite: bool) -> Result<()> {
        check_name(name)?;
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        match state.entries.get(name) {
            Some(Slot::Pending(_)) => Ok(()),
            Some(Slot::Resolved(_)) if !overwrite => Err(Error::AlreadyExists),
            _ => {
                state.entries.insert(name.to_string(), Slot::Pending(Pending::new()));
                log::trace!("ns: placeholder {name}");
                Ok(())
            }
        }
    }

    /// Resolves `name`. Blocking queries wait on placeholders without holding the namespace
    /// lock.
    pub fn query(&self, name: &str, lookup: Lookup) -> Result<C> {
        check_name(name)?;
        let waiters = {
            let state = self.state.lock();
            if state.destroyed {
                return Err(Error::Destroyed);
            }
            match state.entries.get(name) {
                None => return Err(Error::NotFound),
                Some(Slot::Resolved(cap)) => return Ok(cap.clone()),
                Some(Slot::Pending(_)) if lookup == Lookup::NonBlocking => {
                    return Err(Error::WouldBlock)
                }
                Some(Slot::Pending(waiters)) => Arc::clone(waiters),
            }
        };
        log::trace!("ns: waiting for {name}");
        waiters.wait()
    }

    /// Removes `name`. Waiters on a removed placeholder fail with [`Error::NotFound`].
    pub fn unlink(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        match state.entries.remove(name) {
            None => Err(Error::NotFound),
            Some(Slot::Resolved(_)) => Ok(()),
            Some(Slot::Pending(waiters)) => {
                waiters.publish(Err(Error::NotFound));
                Ok(())
            }
        }
    }

    /// Snapshot of the binding under `name`.
    pub fn entry(&self, name: &str) -> Option<Entry<C>> {
        let state = self.state.lock();
        state.entries.get(name).map(|slot| match slot {
            Slot::Resolved(cap) => Entry::Resolved(cap.clone()),
            Slot::Pending(_) => Entry::Placeholder,
        })
    }

    /// Bound names in order.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Tears the namespace down; every pending waiter fails with [`Error::Destroyed`] and
    /// later operations fail the same way. Idempotent.
    pub fn destroy(&self) {
        let entries = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            core::mem::take(&mut state.entries)
        };
        let mut woken = 0usize;
        for slot in entries.into_values() {
            if let Slot::Pending(waiters) = slot {
                waiters.publish(Err(Error::Destroyed));
                woken += 1;
            }
        }
        log::debug!("ns: destroyed, {woken} placeholder(s) poisoned");
    }

    /// Returns `true` once [`Namespace::destroy`] ran.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

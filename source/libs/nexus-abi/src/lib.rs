// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions exposed to kernel and userland crates
//! OWNERS: @runtime
//! PUBLIC API: Status, Error, Rights, ObjectKind, SchedParam, proto::*
//! DEPENDS_ON: no_std, bitflags
//! INVARIANTS: Error codes are stable and pairwise distinct; statuses are negative errno values

use core::fmt;

/// Signed status word carried in the first reply word. `0` is success, negative values are
/// errors, positive values are operation specific.
pub type Status = i64;

/// Result type returned by ABI helpers.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced across the call boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// Message (or declared payload) does not fit the transferred words or the buffer capacity.
    MessageTooShort,
    /// String length outside `[1, max_string_len]`.
    InvalidLength,
    /// Input string is missing its final zero byte.
    NotTerminated,
    /// Caller lacks the rights required by the operation.
    PermissionDenied,
    /// Operation could not progress without blocking.
    WouldBlock,
    /// Name or object does not exist.
    NotFound,
    /// Capability slot is empty or refers to a deleted object.
    InvalidCapability,
    /// Namespace was destroyed while the caller waited on it.
    NamespaceDestroyed,
    /// Opcode is not implemented by the receiving interface.
    UnknownOpcode,
    /// Message tag names a protocol the receiver does not speak.
    BadProtocol,
    /// Capability table has no free slot.
    NoSpace,
    /// Name already bound.
    AlreadyExists,
    /// Argument word outside its domain.
    InvalidArgument,
}

impl Error {
    /// Positive error number associated with this error.
    pub const fn errno(self) -> i64 {
        match self {
            Self::PermissionDenied => 1,
            Self::NotFound => 2,
            Self::InvalidCapability => 9,
            Self::WouldBlock => 11,
            Self::AlreadyExists => 17,
            Self::InvalidArgument => 22,
            Self::NoSpace => 28,
            Self::UnknownOpcode => 38,
            Self::BadProtocol => 71,
            Self::NotTerminated => 84,
            Self::NamespaceDestroyed => 125,
            Self::InvalidLength => 1003,
            Self::MessageTooShort => 1001,
        }
    }

    /// Status word reporting this error (`-errno`).
    pub const fn status(self) -> Status {
        -self.errno()
    }

    /// Decodes a negative status word. Returns `None` for success/positive statuses and for
    /// error numbers this ABI does not define.
    pub const fn from_status(status: Status) -> Option<Self> {
        if status >= 0 {
            return None;
        }
        match status.wrapping_neg() {
            1 => Some(Self::PermissionDenied),
            2 => Some(Self::NotFound),
            9 => Some(Self::InvalidCapability),
            11 => Some(Self::WouldBlock),
            17 => Some(Self::AlreadyExists),
            22 => Some(Self::InvalidArgument),
            28 => Some(Self::NoSpace),
            38 => Some(Self::UnknownOpcode),
            71 => Some(Self::BadProtocol),
            84 => Some(Self::NotTerminated),
            125 => Some(Self::NamespaceDestroyed),
            1001 => Some(Self::MessageTooShort),
            1003 => Some(Self::InvalidLength),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MessageTooShort => "message too short",
            Self::InvalidLength => "invalid string length",
            Self::NotTerminated => "string not terminated",
            Self::PermissionDenied => "permission denied",
            Self::WouldBlock => "operation would block",
            Self::NotFound => "not found",
            Self::InvalidCapability => "invalid capability",
            Self::NamespaceDestroyed => "namespace destroyed",
            Self::UnknownOpcode => "unknown opcode",
            Self::BadProtocol => "bad protocol",
            Self::NoSpace => "no free capability slot",
            Self::AlreadyExists => "already exists",
            Self::InvalidArgument => "invalid argument",
        };
        f.write_str(text)
    }
}

/// Splits a reply status into success value or error.
///
/// Unknown negative statuses are reported as [`Error::InvalidArgument`].
pub const fn check_status(status: Status) -> Result<u64> {
    if status >= 0 {
        return Ok(status as u64);
    }
    match Error::from_status(status) {
        Some(err) => Err(err),
        None => Err(Error::InvalidArgument),
    }
}

bitflags::bitflags! {
    /// Rights mask attached to a capability slot. Read access is implicit for every valid
    /// capability and therefore has no bit.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rights: u8 {
        /// Privileged operations, e.g. creating objects through a factory.
        const SPECIAL = 1 << 0;
        /// Mutating operations, e.g. registering names in a namespace.
        const WRITE = 1 << 1;
        /// Holder may delete the referenced object.
        const DELETE = 1 << 3;
    }
}

impl Rights {
    /// Parses a mode string such as `"rw"` or `"rwsd"`. `r` is accepted and implies nothing.
    pub fn from_mode(mode: &str) -> Option<Self> {
        let mut rights = Self::empty();
        for ch in mode.chars() {
            match ch {
                'r' | 'R' => {}
                'w' | 'W' => rights |= Self::WRITE,
                's' | 'S' => rights |= Self::SPECIAL,
                'd' | 'D' => rights |= Self::DELETE,
                _ => return None,
            }
        }
        Some(rights)
    }

    /// Packs the mask into a message word.
    pub const fn to_word(self) -> u64 {
        self.bits() as u64
    }

    /// Unpacks a mask from a message word; unknown bits are dropped.
    pub const fn from_word(word: u64) -> Self {
        Self::from_bits_truncate(word as u8)
    }
}

/// Kinds of kernel objects a factory can create.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Object factory.
    Factory,
    /// Task (protection domain with its own capability table).
    Task,
    /// Thread bound to a task.
    Thread,
    /// IPC gate bound to a server endpoint.
    Gate,
    /// Name directory.
    Namespace,
}

impl ObjectKind {
    /// Wire representation used by the factory protocol.
    pub const fn to_word(self) -> u64 {
        match self {
            Self::Factory => 1,
            Self::Task => 2,
            Self::Thread => 3,
            Self::Gate => 4,
            Self::Namespace => 5,
        }
    }

    /// Parses the factory protocol representation.
    pub const fn from_word(word: u64) -> Option<Self> {
        match word {
            1 => Some(Self::Factory),
            2 => Some(Self::Task),
            3 => Some(Self::Thread),
            4 => Some(Self::Gate),
            5 => Some(Self::Namespace),
            _ => None,
        }
    }
}

/// Scheduling parameters handed to the scheduler when a thread is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedParam {
    /// Static priority.
    pub prio: u32,
    /// Time slice in microseconds; `0` selects the scheduler default.
    pub quantum_us: u32,
    /// CPU affinity bitmap; `0` means any CPU.
    pub affinity: u64,
}

impl SchedParam {
    /// Parameters with the given priority and scheduler defaults otherwise.
    pub const fn with_prio(prio: u32) -> Self {
        Self { prio, quantum_us: 0, affinity: 0 }
    }
}

impl Default for SchedParam {
    fn default() -> Self {
        Self::with_prio(1)
    }
}

/// Protocol identifiers and opcodes of the kernel object interfaces.
///
/// Protocol ids travel in the message tag; opcodes are the first request word.
pub mod proto {
    /// Task interface: capability mapping and deletion.
    pub const TASK: i64 = -11;
    /// Factory interface: object creation.
    pub const FACTORY: i64 = -6;
    /// Namespace interface: name resolution and registration.
    pub const NAMESPACE: i64 = 0x4001;

    /// Argument word meaning "no capability" wherever a slot is optional.
    pub const NO_CAP: u64 = u64::MAX;

    /// Task opcodes.
    pub mod task {
        /// `MAP(src_cap, rights) -> dst_slot`, sent to the destination task. `src_cap` is a
        /// slot of the caller.
        pub const MAP: u64 = 0;
        /// `UNMAP(cap)`: drops one slot of the invoked task.
        pub const UNMAP: u64 = 1;
        /// `DELETE(cap)`: destroys the object in the caller's slot `cap`.
        pub const DELETE: u64 = 2;
        /// `CAP_VALID(cap) -> 0|1`.
        pub const CAP_VALID: u64 = 3;
    }

    /// Factory opcodes.
    pub mod factory {
        /// `CREATE(kind, args...) -> slot`.
        ///
        /// Arguments by kind: factory, task and namespace take none; gate takes
        /// `(thread_cap, label)`; thread takes `(task_cap, entry_pc, stack_sp, pager|NO_CAP,
        /// scheduler|NO_CAP, prio, quantum_us, affinity)`.
        pub const CREATE: u64 = 0;
    }

    /// Namespace opcodes and flags.
    pub mod namespace {
        /// `QUERY(flags, name) -> slot`.
        pub const QUERY: u64 = 0;
        /// `REGISTER(flags, cap|NO_CAP, rights, name)`.
        pub const REGISTER: u64 = 1;
        /// `UNLINK(name)`.
        pub const UNLINK: u64 = 2;

        /// Query flag: fail with `WouldBlock` instead of waiting on a placeholder.
        pub const NON_BLOCKING: u64 = 0x20;
        /// Register flag: replace an existing resolved entry.
        pub const OVERWRITE: u64 = 0x1;
        /// Register argument meaning "no capability": reserve a placeholder.
        pub const NO_CAP: u64 = super::NO_CAP;
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Init: boots the capability kernel from a launch recipe and starts tasks
//! OWNERS: @init-team @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests per module (tempfile for recipe loading) + nexus-e2e start_env
//!
//! PUBLIC API:
//!   - Recipe: TOML launch description (limits, boot objects, tasks)
//!   - boot(): kernel + started tasks as a `System`
//!   - Environment: argv, environment variables and named capabilities of a task
//!   - probe: rights probes (write, special, delete)
//!
//! DEPENDS_ON: neuron (kernel core and client stubs), nexus-abi (rights)

use std::path::PathBuf;

use thiserror::Error;

mod environment;
mod loader;
pub mod probe;
pub mod recipe;

pub use environment::Environment;
pub use loader::{boot, System};
pub use recipe::Recipe;

/// Errors surfaced while loading a recipe or starting its tasks.
#[derive(Debug, Error)]
pub enum InitError {
    /// Failed to access a file or directory of the recipe tree.
    #[error("failed to access {path}: {source}")]
    Io {
        /// Location associated with the error.
        path: PathBuf,
        /// Underlying operating system error.
        source: std::io::Error,
    },
    /// TOML parsing failed.
    #[error("failed to parse recipe {path}: {source}")]
    Parse {
        /// Location of the malformed recipe.
        path: PathBuf,
        /// Error returned by the TOML deserializer.
        source: toml::de::Error,
    },
    /// Recipe parsed but refers to things that do not exist.
    #[error("invalid recipe {path}: {reason}")]
    InvalidRecipe {
        /// Location of the recipe.
        path: PathBuf,
        /// Human readable description of the issue.
        reason: String,
    },
    /// The same definition appeared twice while merging recipe files.
    #[error("duplicate definition of {0}")]
    Duplicate(String),
    /// A task referenced a boot object that was never created.
    #[error("boot object {0} not available")]
    Unresolved(String),
    /// A kernel operation failed during start-up.
    #[error("{step}: {source}")]
    Kernel {
        /// What init was doing.
        step: String,
        /// Failure reported by the kernel.
        source: neuron::RpcError,
    },
}

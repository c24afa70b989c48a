// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Launch recipes: kernel limits, boot objects and the tasks to start
//! OWNERS: @init-team
//! STATUS: Functional
//! TEST_COVERAGE: unit tests below (tempfile-backed)
//!
//! A recipe is a TOML document:
//!
//! ```toml
//! [limits]
//! cap_slots = 64
//! max_string_len = 65535
//!
//! [objects]
//! logger = "namespace"
//! alloc = "factory"
//!
//! [[task]]
//! cmdline = "rom/hello arg1 arg2"
//! env = { LANG = "C" }
//!
//! [task.caps]
//! alloc = { object = "alloc", mode = "rws" }
//! svc = { namespace = { log = { object = "logger" }, later = "announced" } }
//! ```
//!
//! A directory of `*.toml` files is merged in file-name order; an object defined twice or two
//! `[limits]` tables are rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use neuron::{Create, KernelConfig};
use nexus_abi::Rights;
use serde::{Deserialize, Deserializer};

use crate::InitError;

/// Capability names every task receives implicitly.
pub const RESERVED_CAPS: [&str; 2] = ["task", "rom"];

/// Rights parsed from a mode string (`r`, `w`, `s`, `d` letters).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mode(pub Rights);

impl Mode {
    /// Read-only: no rights beyond invocation.
    pub const READ: Self = Self(Rights::empty());
    /// Read-write.
    pub const READ_WRITE: Self = Self(Rights::WRITE);

    /// Rights granted by this mode.
    pub fn rights(self) -> Rights {
        self.0
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Rights::from_mode(&raw)
            .map(Mode)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid mode {raw:?}, expected letters from \"rwsd\"")))
    }
}

fn read_write() -> Mode {
    Mode::READ_WRITE
}

fn read_only() -> Mode {
    Mode::READ
}

/// `[limits]` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Capability slots per task.
    pub cap_slots: usize,
    /// Largest string parameter kernel interfaces accept, terminator included.
    pub max_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        let config = KernelConfig::default();
        Self { cap_slots: config.cap_slots, max_string_len: config.max_string_len }
    }
}

/// Kind of a boot object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootObject {
    /// An object factory.
    Factory,
    /// An empty task.
    Task,
    /// An empty namespace.
    Namespace,
}

impl BootObject {
    /// Factory request creating this object.
    pub fn create(self) -> Create {
        match self {
            Self::Factory => Create::Factory,
            Self::Task => Create::Task,
            Self::Namespace => Create::Namespace,
        }
    }
}

/// Reference to a boot object plus the rights to hand out.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    /// Name in the `[objects]` table.
    pub object: String,
    /// Rights, `"rw"` when omitted.
    #[serde(default = "read_write")]
    pub mode: Mode,
}

/// Entry of an inline namespace.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NamespaceEntry {
    /// A string value announces the name without binding anything yet.
    Placeholder(String),
    /// A bound boot object.
    Object(Binding),
}

/// Namespace created for one task and filled from the recipe.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineNamespace {
    /// Entries by name.
    pub namespace: BTreeMap<String, NamespaceEntry>,
    /// Rights of the task on the namespace, `"r"` when omitted.
    #[serde(default = "read_only")]
    pub mode: Mode,
}

/// Value of a `[task.caps]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CapSpec {
    /// A boot object.
    Object(Binding),
    /// A fresh namespace.
    Namespace(InlineNamespace),
}

/// One `[[task]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    /// Program name followed by whitespace separated arguments.
    pub cmdline: String,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Named capabilities.
    #[serde(default)]
    pub caps: BTreeMap<String, CapSpec>,
}

impl TaskSpec {
    /// Command line split on whitespace; the first element is the program name.
    pub fn argv(&self) -> Vec<String> {
        self.cmdline.split_whitespace().map(str::to_owned).collect()
    }
}

/// A complete launch description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    /// Kernel limits; defaults when absent.
    #[serde(default)]
    pub limits: Option<Limits>,
    /// Boot objects by name, created by the root task before any task starts.
    #[serde(default)]
    pub objects: BTreeMap<String, BootObject>,
    /// Tasks in start order.
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
    /// File or directory the recipe was read from.
    #[serde(skip)]
    pub origin: PathBuf,
}

impl Recipe {
    /// Parses and validates a recipe; `origin` only labels errors.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, InitError> {
        let mut recipe: Recipe =
            toml::from_str(text).map_err(|source| InitError::Parse { path: origin.to_path_buf(), source })?;
        recipe.origin = origin.to_path_buf();
        recipe.check()?;
        Ok(recipe)
    }

    /// Loads a recipe file, or every `*.toml` file of a directory merged in name order.
    pub fn load(path: &Path) -> Result<Self, InitError> {
        if !path.is_dir() {
            let text = fs::read_to_string(path).map_err(|source| InitError::Io { path: path.to_path_buf(), source })?;
            return Self::from_toml(&text, path);
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(path).map_err(|source| InitError::Io { path: path.to_path_buf(), source })? {
            let entry = entry.map_err(|source| InitError::Io { path: path.to_path_buf(), source })?;
            let file_path = entry.path();
            if file_path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                continue;
            }
            files.push(file_path);
        }
        files.sort();

        let mut merged = Recipe { origin: path.to_path_buf(), ..Recipe::default() };
        for file_path in files {
            let text =
                fs::read_to_string(&file_path).map_err(|source| InitError::Io { path: file_path.clone(), source })?;
            let part: Recipe =
                toml::from_str(&text).map_err(|source| InitError::Parse { path: file_path.clone(), source })?;
            log::debug!("init: recipe part {} ({} tasks)", file_path.display(), part.tasks.len());
            merged.merge(part)?;
        }
        merged.check()?;
        Ok(merged)
    }

    fn merge(&mut self, part: Recipe) -> Result<(), InitError> {
        if let Some(limits) = part.limits {
            if self.limits.replace(limits).is_some() {
                return Err(InitError::Duplicate("[limits]".into()));
            }
        }
        for (name, object) in part.objects {
            if self.objects.insert(name.clone(), object).is_some() {
                return Err(InitError::Duplicate(format!("object {name}")));
            }
        }
        self.tasks.extend(part.tasks);
        Ok(())
    }

    fn check(&self) -> Result<(), InitError> {
        self.validate().map_err(|reason| InitError::InvalidRecipe { path: self.origin.clone(), reason })
    }

    /// Checks cross references the TOML schema cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let limits = self.limits.unwrap_or_default();
        if limits.max_string_len == 0 {
            return Err("max_string_len must be at least 1".into());
        }
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.cmdline.trim().is_empty() {
                return Err(format!("task #{idx}: empty cmdline"));
            }
            for (name, cap) in &task.caps {
                if RESERVED_CAPS.contains(&name.as_str()) {
                    return Err(format!("task #{idx}: capability name {name:?} is reserved"));
                }
                match cap {
                    CapSpec::Object(binding) => self.known(idx, &binding.object)?,
                    CapSpec::Namespace(ns) => {
                        for entry in ns.namespace.values() {
                            if let NamespaceEntry::Object(binding) = entry {
                                self.known(idx, &binding.object)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn known(&self, idx: usize, object: &str) -> Result<(), String> {
        if self.objects.contains_key(object) {
            Ok(())
        } else {
            Err(format!("task #{idx}: unknown object {object:?}"))
        }
    }

    /// Kernel configuration derived from `[limits]`.
    pub fn kernel_config(&self) -> KernelConfig {
        let limits = self.limits.unwrap_or_default();
        KernelConfig { cap_slots: limits.cap_slots, max_string_len: limits.max_string_len }
    }
}

impl fmt::Display for BootObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Factory => "factory",
            Self::Task => "task",
            Self::Namespace => "namespace",
        };
        f.write_str(name)
    }
}

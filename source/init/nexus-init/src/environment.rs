// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Start-up environment handed to a launched task
//! OWNERS: @init-team
//! PUBLIC API: Environment

use std::collections::BTreeMap;

use neuron::{CapIdx, Client, Kernel, ObjectRef};

/// What a task sees at start: its arguments, environment variables and named capabilities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    task: ObjectRef,
    argv: Vec<String>,
    envp: BTreeMap<String, String>,
    caps: BTreeMap<String, CapIdx>,
}

impl Environment {
    pub(crate) fn new(
        task: ObjectRef,
        argv: Vec<String>,
        envp: BTreeMap<String, String>,
        caps: BTreeMap<String, CapIdx>,
    ) -> Self {
        Self { task, argv, envp, caps }
    }

    /// Task object the environment belongs to.
    pub fn task(&self) -> ObjectRef {
        self.task
    }

    /// Call context for a thread of this task.
    pub fn client<'k>(&self, kernel: &'k Kernel) -> Client<'k> {
        Client::new(kernel, self.task)
    }

    /// Full argument vector, program name first.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Program name (`argv[0]`).
    pub fn program_name(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// Arguments after the program name.
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }

    /// Value of an environment variable.
    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.envp.get(key).map(String::as_str)
    }

    /// All environment variables, ordered by name.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.envp.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Slot of the capability bound to `name` in this task.
    pub fn get_cap(&self, name: &str) -> Option<CapIdx> {
        self.caps.get(name).copied()
    }

    /// Names of all bound capabilities, ordered.
    pub fn cap_names(&self) -> impl Iterator<Item = &str> {
        self.caps.keys().map(String::as_str)
    }
}

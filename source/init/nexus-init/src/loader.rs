// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boots a kernel from a recipe and starts its tasks
//! OWNERS: @init-team
//! STATUS: Functional
//! TEST_COVERAGE: unit tests below + nexus-e2e start_env
//! PUBLIC API: System, boot()
//! INVARIANTS:
//!   - All setup goes through the root task's factory and task capabilities over the RPC path
//!   - Every task receives `task` (its own task capability) and a read-only `rom` namespace
//!   - Rights handed to a task never exceed the rights in its recipe entry

use std::collections::BTreeMap;

use neuron::{CapIdx, Client, Create, Kernel, RpcError, ROOT_FACTORY_CAP, ROOT_TASK_CAP};
use nexus_abi::Rights;

use crate::environment::Environment;
use crate::recipe::{CapSpec, InlineNamespace, NamespaceEntry, Recipe, TaskSpec};
use crate::InitError;

/// A booted kernel together with the environments of the tasks it started.
pub struct System {
    kernel: Kernel,
    tasks: Vec<Environment>,
}

impl System {
    /// The kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Started tasks, in recipe order.
    pub fn tasks(&self) -> &[Environment] {
        &self.tasks
    }

    /// First task whose program name is `program`.
    pub fn task(&self, program: &str) -> Option<&Environment> {
        self.tasks.iter().find(|env| env.program_name() == program)
    }
}

/// Boots a kernel with the recipe's limits, creates its boot objects and starts every task.
pub fn boot(recipe: &Recipe) -> Result<System, InitError> {
    recipe
        .validate()
        .map_err(|reason| InitError::InvalidRecipe { path: recipe.origin.clone(), reason })?;
    let kernel = Kernel::boot(recipe.kernel_config());
    let tasks = start_all(&kernel, recipe)?;
    log::info!("init: {} task(s) started, {} kernel objects live", tasks.len(), kernel.live_objects());
    Ok(System { kernel, tasks })
}

fn start_all(kernel: &Kernel, recipe: &Recipe) -> Result<Vec<Environment>, InitError> {
    let mut launcher = Launcher::new(kernel, recipe)?;
    let mut tasks = Vec::with_capacity(recipe.tasks.len());
    for spec in &recipe.tasks {
        tasks.push(launcher.start(spec)?);
    }
    Ok(tasks)
}

fn step(what: impl Into<String>) -> impl FnOnce(RpcError) -> InitError {
    let step = what.into();
    move |source| InitError::Kernel { step, source }
}

struct Launcher<'k> {
    root: Client<'k>,
    objects: BTreeMap<String, CapIdx>,
    rom: CapIdx,
}

impl<'k> Launcher<'k> {
    fn new(kernel: &'k Kernel, recipe: &Recipe) -> Result<Self, InitError> {
        let mut root = Client::new(kernel, kernel.root_task());
        let mut objects = BTreeMap::new();
        for (name, object) in &recipe.objects {
            let slot =
                root.create(ROOT_FACTORY_CAP, &object.create()).map_err(step(format!("create {object} {name}")))?;
            log::debug!("init: boot object {name} ({object}) in slot {slot}");
            objects.insert(name.clone(), slot);
        }
        let rom = root.create(ROOT_FACTORY_CAP, &Create::Namespace).map_err(step("create rom"))?;
        for (name, &slot) in &objects {
            root.register(rom, name, Some(slot), Rights::empty(), false).map_err(step(format!("rom entry {name}")))?;
        }
        Ok(Self { root, objects, rom })
    }

    fn object(&self, name: &str) -> Result<CapIdx, InitError> {
        self.objects.get(name).copied().ok_or_else(|| InitError::Unresolved(name.to_string()))
    }

    fn start(&mut self, spec: &TaskSpec) -> Result<Environment, InitError> {
        let argv = spec.argv();
        let program = argv.first().cloned().unwrap_or_default();
        let child =
            self.root.create(ROOT_FACTORY_CAP, &Create::Task).map_err(step(format!("create task {program}")))?;
        let task = self
            .root
            .kernel()
            .lookup(self.root.task(), child)
            .map_err(|err| InitError::Kernel { step: format!("{program}: resolve task"), source: err.into() })?
            .object;

        let mut caps = BTreeMap::new();
        let own = self.root.map(child, child, Rights::all()).map_err(step(format!("{program}: map task")))?;
        caps.insert("task".to_string(), own);
        let rom = self.root.map(child, self.rom, Rights::empty()).map_err(step(format!("{program}: map rom")))?;
        caps.insert("rom".to_string(), rom);

        for (name, cap) in &spec.caps {
            let slot = match cap {
                CapSpec::Object(binding) => {
                    let src = self.object(&binding.object)?;
                    self.root.map(child, src, binding.mode.rights())
                }
                CapSpec::Namespace(inline) => {
                    let ns = self.namespace(&program, name, inline)?;
                    self.root.map(child, ns, inline.mode.rights())
                }
            }
            .map_err(step(format!("{program}: map {name}")))?;
            caps.insert(name.clone(), slot);
        }

        // the root keeps no reference to the child beyond its own slot
        self.root.unmap(ROOT_TASK_CAP, child).map_err(step(format!("{program}: release task slot")))?;
        log::info!("init: start {program} ({} args, {} caps)", argv.len().saturating_sub(1), caps.len());
        Ok(Environment::new(task, argv, spec.env.clone(), caps))
    }

    fn namespace(&mut self, program: &str, name: &str, inline: &InlineNamespace) -> Result<CapIdx, InitError> {
        let ns = self
            .root
            .create(ROOT_FACTORY_CAP, &Create::Namespace)
            .map_err(step(format!("{program}: create namespace {name}")))?;
        for (key, entry) in &inline.namespace {
            let result = match entry {
                NamespaceEntry::Object(binding) => {
                    let src = self.object(&binding.object)?;
                    self.root.register(ns, key, Some(src), binding.mode.rights(), false)
                }
                NamespaceEntry::Placeholder(_) => self.root.register(ns, key, None, Rights::empty(), false),
            };
            result.map_err(step(format!("{program}: {name}/{key}")))?;
        }
        Ok(ns)
    }
}

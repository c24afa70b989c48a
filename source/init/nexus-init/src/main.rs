// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Init binary: loads a launch recipe (file or directory), boots the kernel and reports the
//! environment of every started task.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use nexus_init::{boot, InitError, Recipe};

const DEFAULT_RECIPES: &str = "source/init/nexus-init/recipes";

fn run(path: PathBuf) -> Result<(), InitError> {
    log::info!("init: start, recipes from {}", path.display());
    let recipe = Recipe::load(&path)?;
    let system = boot(&recipe)?;
    for env in system.tasks() {
        let caps: Vec<_> = env.cap_names().collect();
        log::info!("init: up {} args={:?} caps={caps:?}", env.program_name(), env.args());
        for (key, value) in env.vars() {
            log::debug!("init:   {key}={value}");
        }
    }
    log::info!("init: ready");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let path = std::env::args_os().nth(1).map_or_else(|| PathBuf::from(DEFAULT_RECIPES), PathBuf::from);
    match run(path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("init: fatal error: {err}");
            ExitCode::FAILURE
        }
    }
}

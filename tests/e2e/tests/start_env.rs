// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task start-up through init's recipe loader
//! INTENT: A started task sees its argv, environment and capabilities with exactly the
//!         rights its recipe entry grants
//! DEPS: nexus-init (recipes, environment, probes), neuron (kernel)
//! TESTS: argv, environment, inline namespace with placeholder, read-only rom,
//!        write/special/delete rights probes

use neuron::Lookup;
use nexus_abi::Error;
use nexus_e2e::start_system;
use nexus_init::probe::{has_permission_d, has_permission_s, has_permission_w};
use nexus_init::Environment;

fn test_start(system: &nexus_init::System) -> &Environment {
    system.task("rom/test_start").expect("test_start task")
}

#[test]
fn receives_params() {
    let system = start_system();
    let env = test_start(&system);
    assert_eq!(env.argv().len(), 4);
    assert_eq!(env.program_name(), "rom/test_start");
    assert_eq!(env.args(), ["arg1", "arg2", "-arg3"]);
}

#[test]
fn receives_environment() {
    let system = start_system();
    let env = test_start(&system);
    assert_eq!(env.vars().count(), 2);
    assert_eq!(env.getenv("ENV_VAR1"), Some("env_var1"));
    assert_eq!(env.getenv("ENV_VAR2"), Some("env_var2"));
}

#[test]
fn received_namespace() {
    let system = start_system();
    let env = test_start(&system);
    let k = system.kernel();
    let mut c = env.client(k);
    let ns = env.get_cap("test_namespace").expect("namespace cap");
    assert!(k.cap_valid(env.task(), ns));

    for (name, reference) in [("name1", "dummy_cap1"), ("name2", "dummy_cap2")] {
        let got = c.query(ns, name, Lookup::Blocking).unwrap_or_else(|err| panic!("query {name}: {err}"));
        let reference = env.get_cap(reference).expect("reference cap");
        assert_eq!(
            k.lookup(env.task(), got).unwrap().object,
            k.lookup(env.task(), reference).unwrap().object,
            "{name} resolves to the expected object"
        );
    }
    let err = c.query(ns, "name_ph", Lookup::NonBlocking).unwrap_err();
    assert_eq!(err.status(), Some(Error::WouldBlock), "name_ph is a placeholder");
}

#[test]
fn received_readonly_rom() {
    let system = start_system();
    let env = test_start(&system);
    let mut c = env.client(system.kernel());
    let rom = env.get_cap("rom").expect("rom cap");
    assert!(!has_permission_w(&mut c, rom).unwrap(), "rom is read-only");
}

#[test]
fn correct_write_permissions() {
    let system = start_system();
    let env = test_start(&system);
    let mut c = env.client(system.kernel());
    assert!(has_permission_w(&mut c, env.get_cap("test_w").unwrap()).unwrap());
    assert!(!has_permission_w(&mut c, env.get_cap("test_no_w").unwrap()).unwrap());
}

#[test]
fn correct_special_permissions() {
    let system = start_system();
    let env = test_start(&system);
    let mut c = env.client(system.kernel());
    let task = env.get_cap("task").unwrap();
    assert!(has_permission_s(&mut c, task, env.get_cap("test_s").unwrap()).unwrap());
    assert!(!has_permission_s(&mut c, task, env.get_cap("test_no_s").unwrap()).unwrap());
}

#[test]
fn correct_delete_permissions() {
    let system = start_system();
    let env = test_start(&system);
    let mut c = env.client(system.kernel());
    let task = env.get_cap("task").unwrap();
    assert!(has_permission_d(&mut c, task, env.get_cap("test_d").unwrap()).unwrap());
    assert!(!has_permission_d(&mut c, task, env.get_cap("test_no_d").unwrap()).unwrap());
}

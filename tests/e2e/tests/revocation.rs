// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability revocation and namespace waits across tasks and threads
//! INTENT: Deletion invalidates every copy at once; placeholders release all blocked
//!         queriers together
//! DEPS: neuron (kernel, client stubs), nexus-ns via neuron
//! TESTS: delete across tasks, unmap vs delete, blocked queriers woken by register,
//!        by unlink and by namespace deletion

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use neuron::{Client, Create, Kernel, KernelConfig, Lookup, ROOT_FACTORY_CAP, ROOT_TASK_CAP};
use nexus_abi::{Error, Rights};

const WAITERS: usize = 4;

fn kernel() -> Kernel {
    Kernel::boot(KernelConfig::default())
}

#[test]
fn delete_revokes_copies_in_every_task() {
    let k = kernel();
    let mut root = Client::new(&k, k.root_task());
    let ns = root.create(ROOT_FACTORY_CAP, &Create::Namespace).unwrap();
    let mut children = Vec::new();
    for _ in 0..3 {
        let child = root.create(ROOT_FACTORY_CAP, &Create::Task).unwrap();
        let copy = root.map(child, ns, Rights::WRITE).unwrap();
        children.push((k.lookup(root.task(), child).unwrap().object, copy));
    }
    for &(task, copy) in &children {
        assert!(k.cap_valid(task, copy));
    }
    root.delete(ROOT_TASK_CAP, ns).unwrap();
    for &(task, copy) in &children {
        assert!(!k.cap_valid(task, copy), "copy in {task:?} is revoked");
        let mut c = Client::new(&k, task);
        let err = c.register(copy, "x", None, Rights::empty(), false).unwrap_err();
        assert_eq!(err.status(), Some(Error::InvalidCapability));
    }
}

#[test]
fn child_cannot_delete_through_weak_copy() {
    let k = kernel();
    let mut root = Client::new(&k, k.root_task());
    let ns = root.create(ROOT_FACTORY_CAP, &Create::Namespace).unwrap();
    let child = root.create(ROOT_FACTORY_CAP, &Create::Task).unwrap();
    let child_ref = k.lookup(root.task(), child).unwrap().object;
    let own = root.map(child, child, Rights::all()).unwrap();
    let weak = root.map(child, ns, Rights::WRITE).unwrap();

    let mut c = Client::new(&k, child_ref);
    assert_eq!(c.delete(own, weak).unwrap_err().status(), Some(Error::PermissionDenied));
    assert!(k.cap_valid(root.task(), ns));
    c.unmap(own, weak).unwrap();
    assert!(!k.cap_valid(child_ref, weak));
    assert!(k.cap_valid(root.task(), ns), "unmap only drops the child's slot");
}

#[test]
fn register_wakes_every_blocked_querier() {
    let k = kernel();
    let mut root = Client::new(&k, k.root_task());
    let ns = root.create(ROOT_FACTORY_CAP, &Create::Namespace).unwrap();
    root.register(ns, "svc", None, Rights::empty(), false).unwrap();
    let target = root.create(ROOT_FACTORY_CAP, &Create::Factory).unwrap();
    let expected = k.lookup(root.task(), target).unwrap().object;

    let barrier = Barrier::new(WAITERS + 1);
    thread::scope(|s| {
        let (k, barrier) = (&k, &barrier);
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                s.spawn(move || {
                    let mut c = Client::new(k, k.root_task());
                    barrier.wait();
                    c.query(ns, "svc", Lookup::Blocking)
                })
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        root.register(ns, "svc", Some(target), Rights::SPECIAL, false).unwrap();
        for handle in handles {
            let slot = handle.join().unwrap().expect("query resolved");
            let cap = k.lookup(k.root_task(), slot).unwrap();
            assert_eq!(cap.object, expected);
            assert_eq!(cap.rights, Rights::SPECIAL);
        }
    });
}

#[test]
fn unlink_releases_blocked_queriers_with_not_found() {
    let k = kernel();
    let mut root = Client::new(&k, k.root_task());
    let ns = root.create(ROOT_FACTORY_CAP, &Create::Namespace).unwrap();
    root.register(ns, "svc", None, Rights::empty(), false).unwrap();

    let barrier = Barrier::new(WAITERS + 1);
    thread::scope(|s| {
        let (k, barrier) = (&k, &barrier);
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                s.spawn(move || {
                    let mut c = Client::new(k, k.root_task());
                    barrier.wait();
                    c.query(ns, "svc", Lookup::Blocking)
                })
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        root.unlink(ns, "svc").unwrap();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert_eq!(err.status(), Some(Error::NotFound));
        }
    });
}

#[test]
fn namespace_deletion_releases_blocked_queriers() {
    let k = kernel();
    let mut root = Client::new(&k, k.root_task());
    let ns = root.create(ROOT_FACTORY_CAP, &Create::Namespace).unwrap();
    root.register(ns, "svc", None, Rights::empty(), false).unwrap();

    let barrier = Barrier::new(WAITERS + 1);
    thread::scope(|s| {
        let (k, barrier) = (&k, &barrier);
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                s.spawn(move || {
                    let mut c = Client::new(k, k.root_task());
                    barrier.wait();
                    c.query(ns, "svc", Lookup::Blocking)
                })
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        root.delete(ROOT_TASK_CAP, ns).unwrap();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            // a querier scheduled after the deletion finds its slot dead instead
            assert!(matches!(err.status(), Some(Error::NamespaceDestroyed | Error::InvalidCapability)), "{err}");
        }
    });
    assert!(!k.cap_valid(k.root_task(), ns));
}

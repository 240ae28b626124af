//! Integration tests for concurrent class database resolution

use std::sync::{Arc, Barrier};
use std::thread;

use gdbind_core::{BridgeError, DispatchError, ExtensionClass, Runtime, RuntimeOptions};
use gdbind_sdk::mock::MockHost;
use gdbind_sdk::InitLevel;

const THREADS: usize = 16;

fn setup() -> (Arc<MockHost>, Arc<Runtime>) {
    let host = Arc::new(MockHost::new());
    let runtime = Runtime::new(host.clone(), RuntimeOptions::default()).unwrap();
    runtime.initialize(InitLevel::Scene).unwrap();
    (host, runtime)
}

#[test]
fn test_same_key_resolved_once() {
    let (host, runtime) = setup();
    let expected = host.define_method("Node", "add_child", 0x3c1, 1, |_| {});
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                runtime.method_bind("Node", "add_child", 0x3c1).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
    assert_eq!(host.method_lookups("Node", "add_child"), 1);
    assert_eq!(runtime.registry().native_lookups(), 1);
}

#[test]
fn test_distinct_keys_resolved_independently() {
    let (host, runtime) = setup();
    let binds: Vec<_> = (0..THREADS)
        .map(|i| host.define_method("Node", &format!("method_{}", i), i as i64, 0, |_| {}))
        .collect();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    runtime
                        .method_bind("Node", &format!("method_{}", i), i as i64)
                        .unwrap();
                }
                runtime.method_bind("Node", &format!("method_{}", i), i as i64).unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), binds[i]);
        assert_eq!(host.method_lookups("Node", &format!("method_{}", i)), 1);
    }
    assert_eq!(runtime.registry().cached_methods(), THREADS);
}

#[test]
fn test_concurrent_construct_and_release() {
    let (host, runtime) = setup();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let scope = runtime.scope();
                for _ in 0..8 {
                    let handle = runtime.construct("RefCounted").unwrap();
                    scope.register(handle).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(host.class_lookups("RefCounted"), 1);
    assert_eq!(runtime.arena().live_handles(), 0);
    assert_eq!(host.stats().constructed, THREADS * 8);
    assert_eq!(host.stats().invalid_frees, 0);
}

#[test]
fn test_concurrent_registration_of_one_name() {
    struct Marker;

    let (host, runtime) = setup();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                runtime.register_extension_class(
                    ExtensionClass::builder::<Marker>("Marker", "Node").constructor(|| Marker),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert!(matches!(
            err,
            BridgeError::Dispatch(DispatchError::AlreadyRegistered(_))
        ));
    }
    assert!(host.is_registered("Marker"));
    assert!(runtime.is_registered("Marker"));
}

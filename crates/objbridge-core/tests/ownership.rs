use std::thread;
use std::time::{Duration, Instant};

use objbridge_core::{
    BridgeError, ClosureHandle, CollectionHandle, FinalizerMode, HostStruct, HostValue, Nullability, Ownership,
};
use objbridge_foreign::ForeignRuntime;
use objbridge_layout::{ClosureSignature, ValueType};

mod common;
use common::{populate, FixtureObjects, PLAIN};

#[test]
fn owned_handle_releases_exactly_once() {
    let (runtime, bridge) = common::bridge();
    let obj = runtime.new_object();
    unsafe { runtime.retain(obj) };

    let handle = bridge.references().adopt(obj, Nullability::NonNull).unwrap();
    assert_eq!(handle.ownership(), Ownership::Owned);
    assert_eq!(runtime.retain_count(obj), Some(2));

    bridge.release(&handle).unwrap();
    assert_eq!(runtime.retain_count(obj), Some(1));

    match bridge.release(&handle) {
        Err(BridgeError::DoubleRelease { raw }) => assert_eq!(raw, obj),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(runtime.retain_count(obj), Some(1));
    unsafe { runtime.release(obj) };
}

#[test]
fn borrowed_handles_are_released_by_their_scope_only() {
    let (runtime, bridge) = common::bridge();
    let obj = runtime.new_object();
    let handle = {
        let mut scope = bridge.scope();
        let handle = scope.wrap(obj, Ownership::Borrowed, Nullability::NonNull).unwrap();
        assert!(matches!(bridge.release(&handle), Err(BridgeError::NotOwned { .. })));
        assert_eq!(runtime.retain_count(obj), Some(2));
        handle
    };
    assert_eq!(runtime.retain_count(obj), Some(1));
    assert!(matches!(bridge.references().raw(&handle), Err(BridgeError::StaleHandle { .. })));
    unsafe { runtime.release(obj) };
}

#[test]
fn writing_a_stale_handle_is_rejected_before_any_change() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let memory = populate(&layout, &objects);

    let stale: HostStruct = {
        let mut scope = bridge.scope();
        bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap()
    };
    let baseline = objects.counts(&runtime);
    let mut copy = vec![0u8; layout.size()];
    assert!(matches!(
        bridge.write_struct(&stale, &mut copy, Ownership::Owned),
        Err(BridgeError::StaleHandle { .. })
    ));
    assert!(copy.iter().all(|b| *b == 0));
    assert_eq!(objects.counts(&runtime), baseline);
    objects.release(&runtime);
}

#[test]
fn concurrent_reads_return_counts_to_baseline() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let baseline = objects.counts(&runtime);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let memory = populate(&layout, &objects);

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..100 {
                    let mut scope = bridge.scope();
                    let value = bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap();
                    let mut copy = vec![0u8; layout.size()];
                    bridge.write_struct(&value, &mut copy, Ownership::Borrowed).unwrap();
                    assert_eq!(copy, memory);
                }
            });
        }
    });

    assert_eq!(objects.counts(&runtime), baseline);
    assert_eq!(bridge.references().live_handles(), 0);
    objects.release(&runtime);
    assert_eq!(runtime.stats().live_objects, 0);
}

#[test]
fn distinct_handles_over_one_object_own_their_own_counts() {
    let (runtime, bridge) = common::bridge();
    let obj = runtime.new_object();
    let mut scope = bridge.scope();
    let first = scope.wrap(obj, Ownership::Borrowed, Nullability::NonNull).unwrap();
    let second = scope.wrap(obj, Ownership::Borrowed, Nullability::NonNull).unwrap();
    assert!(first.same_reference(&second));
    assert_ne!(first, second);
    assert_eq!(runtime.retain_count(obj), Some(3));
    scope.close().unwrap();
    assert_eq!(runtime.retain_count(obj), Some(1));
    unsafe { runtime.release(obj) };
}

#[test]
fn dropped_owners_wait_for_manual_reclamation() {
    let (runtime, bridge) = common::bridge_with(FinalizerMode::Manual);
    let obj = runtime.new_object();
    unsafe { runtime.retain(obj) };

    let owner = bridge.own(bridge.references().adopt(obj, Nullability::NonNull).unwrap()).unwrap();
    drop(owner);
    assert_eq!(runtime.retain_count(obj), Some(2));
    assert_eq!(bridge.reclaim(), 1);
    assert_eq!(runtime.retain_count(obj), Some(1));
    assert_eq!(bridge.reclaim(), 0);
    unsafe { runtime.release(obj) };
}

#[test]
fn dropped_owners_are_reclaimed_by_the_thread() {
    let (runtime, bridge) = common::bridge_with(FinalizerMode::Thread);
    let objects: Vec<_> = (0..32).map(|_| runtime.new_object()).collect();

    thread::scope(|s| {
        for chunk in objects.chunks(8) {
            let bridge = &bridge;
            s.spawn(move || {
                for obj in chunk {
                    unsafe { bridge.references().runtime().retain(*obj) };
                    let handle = bridge.references().adopt(*obj, Nullability::NonNull).unwrap();
                    drop(bridge.own(handle).unwrap());
                }
            });
        }
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while objects.iter().any(|obj| runtime.retain_count(*obj) != Some(1)) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    for obj in &objects {
        assert_eq!(runtime.retain_count(*obj), Some(1));
        unsafe { runtime.release(*obj) };
    }
    assert_eq!(bridge.references().live_handles(), 0);
}

#[test]
fn explicit_release_wins_over_reclamation() {
    let (runtime, bridge) = common::bridge();
    let obj = runtime.new_object();
    unsafe { runtime.retain(obj) };
    let owner = bridge.own(bridge.references().adopt(obj, Nullability::NonNull).unwrap()).unwrap();
    owner.release().unwrap();
    assert_eq!(runtime.retain_count(obj), Some(1));
    assert_eq!(bridge.reclaim(), 0);
    assert_eq!(runtime.retain_count(obj), Some(1));
    unsafe { runtime.release(obj) };
}

#[test]
fn owned_handles_transfer_into_owned_destinations() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let layout = bridge.describe(&PLAIN.into()).unwrap();

    // Build a value out of Owned handles, each adopting a fresh count.
    let mut value = HostStruct::new(PLAIN);
    {
        let mut scope = bridge.scope();
        let read = bridge.read_struct(&mut scope, &PLAIN.into(), &populate(&layout, &objects)).unwrap();
        for (name, field) in read.fields() {
            let raw = objects.by_field(name);
            unsafe { runtime.retain(raw) };
            let owned = bridge.references().adopt(raw, Nullability::NonNull).unwrap();
            let rebuilt: HostValue = match field {
                HostValue::Object(_) => owned.into(),
                HostValue::Closure(closure) => ClosureHandle::new(owned, closure.signature().clone()).into(),
                HostValue::Collection(collection) => CollectionHandle::new(owned, collection.kind()).into(),
                HostValue::Scalar(scalar) => (*scalar).into(),
            };
            value.set(name.clone(), rebuilt);
        }
    }

    let mut memory = vec![0u8; layout.size()];
    bridge.write_struct(&value, &mut memory, Ownership::Owned).unwrap();
    // Counts moved into the memory; the handles are spent.
    for (_, field) in value.fields() {
        let handle = field.handle().unwrap();
        assert!(!bridge.references().is_live(handle));
        assert!(matches!(bridge.release(handle), Err(BridgeError::DoubleRelease { .. })));
    }
    for field in layout.fields() {
        let raw = common::get_field(&memory, &layout, &field.name);
        assert_eq!(runtime.retain_count(raw), Some(2));
        unsafe { runtime.release(raw) };
    }
    objects.release(&runtime);
    assert_eq!(runtime.stats().live_objects, 0);
}

#[test]
fn dropping_the_bridge_releases_forgotten_owned_handles() {
    let (runtime, bridge) = common::bridge();
    let closure = bridge
        .closures()
        .expose_host_closure(ClosureSignature::nullary(ValueType::Void), |_, _| Ok(None))
        .unwrap();
    let obj = runtime.new_object();
    let wrapped = {
        let mut scope = bridge.scope();
        scope.wrap(obj, Ownership::Owned, Nullability::NonNull).unwrap()
    };
    assert_eq!(bridge.references().owned_handles(), 2);
    drop(closure);
    drop(wrapped);

    // Nothing was queued: the handles were dropped, not owned by an `OwnedRef`.
    assert_eq!(bridge.reclaim(), 0);
    assert_eq!(runtime.stats().live_objects, 2);
    drop(bridge);
    assert!(!runtime.is_live(obj));
    assert_eq!(runtime.stats().live_objects, 0);
}

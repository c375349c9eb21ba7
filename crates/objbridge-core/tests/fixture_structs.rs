use std::mem::size_of;

use objbridge_core::{BridgeError, HostValue, Ownership, ScalarValue};
use objbridge_foreign::RawRef;
use objbridge_layout::{CollectionKind, StructTypeId};

mod common;
use common::{get_field, populate, set_field, FixtureObjects, BLOCK_RESULT, PLAIN, WITHOUT_BLOCK, WITH_ANY};

const PTR: usize = size_of::<usize>();

#[test]
fn read_then_write_is_bit_identical() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let baseline = objects.counts(&runtime);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let memory = populate(&layout, &objects);

    {
        let mut scope = bridge.scope();
        let value = bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap();
        assert_eq!(value.len(), 7);

        let mut copy = vec![0u8; layout.size()];
        bridge.write_struct(&value, &mut copy, Ownership::Borrowed).unwrap();
        assert_eq!(copy, memory);
    }

    assert_eq!(objects.counts(&runtime), baseline);
    assert_eq!(bridge.references().live_handles(), 0);
    objects.release(&runtime);
    assert_eq!(runtime.stats().live_objects, 0);
}

#[test]
fn fields_come_back_with_their_kinds() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let memory = populate(&layout, &objects);

    {
        let mut scope = bridge.scope();
        let value = bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap();
        let names: Vec<&str> = value.fields().iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["nsString", "object", "block", "array", "mutableArray", "set", "dictionary"]);

        let ns_string = value.object("nsString").unwrap();
        let raw = bridge.references().raw(ns_string).unwrap();
        assert_eq!(runtime.string_value(raw).as_deref(), Some("hello"));
        assert_eq!(ns_string.ownership(), Ownership::Borrowed);

        assert_eq!(value.collection("array").unwrap().kind(), CollectionKind::Array);
        assert_eq!(value.collection("mutableArray").unwrap().kind(), CollectionKind::MutableArray);
        assert_eq!(value.collection("set").unwrap().kind(), CollectionKind::Set);
        assert_eq!(value.collection("dictionary").unwrap().kind(), CollectionKind::Dictionary);

        let block = value.closure("block").unwrap();
        assert_eq!(block.arity(), 0);
        let result = bridge.invoke(&mut scope, block, &[]).unwrap();
        assert_eq!(result, Some(HostValue::Scalar(ScalarValue::I32(BLOCK_RESULT))));

        // Each bridged field holds exactly one extra count while the scope is open.
        assert_eq!(runtime.retain_count(objects.ns_string), Some(2));
        assert_eq!(runtime.retain_count(objects.array), Some(2));
    }
    assert_eq!(runtime.retain_count(objects.ns_string), Some(1));
    objects.release(&runtime);
}

#[test]
fn any_field_shifts_everything_by_one_pointer() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let plain = bridge.describe(&PLAIN.into()).unwrap();
    let with_any = bridge.describe(&WITH_ANY.into()).unwrap();
    assert_eq!(with_any.size(), plain.size() + PTR);
    assert_eq!(with_any.field("any").unwrap().byte_offset, 0);
    for field in plain.fields() {
        assert_eq!(with_any.field(&field.name).unwrap().byte_offset, field.byte_offset + PTR);
    }

    let baseline = objects.counts(&runtime);
    let memory = populate(&with_any, &objects);
    {
        let mut scope = bridge.scope();
        let value = bridge.read_struct(&mut scope, &WITH_ANY.into(), &memory).unwrap();
        assert_eq!(value.len(), 8);
        assert_eq!(bridge.references().raw(value.object("any").unwrap()).unwrap(), objects.any);
        assert_eq!(bridge.references().raw(value.object("nsString").unwrap()).unwrap(), objects.ns_string);

        let mut copy = vec![0u8; with_any.size()];
        bridge.write_struct(&value, &mut copy, Ownership::Borrowed).unwrap();
        assert_eq!(copy, memory);
    }
    assert_eq!(objects.counts(&runtime), baseline);
    objects.release(&runtime);
}

#[test]
fn struct_without_block_has_no_block_field() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let layout = bridge.describe(&WITHOUT_BLOCK.into()).unwrap();
    assert_eq!(layout.size(), 6 * PTR);
    assert_eq!(layout.field("array").unwrap().byte_offset, 2 * PTR);

    let memory = populate(&layout, &objects);
    {
        let mut scope = bridge.scope();
        let value = bridge.read_struct(&mut scope, &WITHOUT_BLOCK.into(), &memory).unwrap();
        assert_eq!(value.len(), 6);
        assert!(value.get("block").is_none());
    }
    objects.release(&runtime);
}

#[test]
fn null_nullable_object_reads_as_the_empty_handle() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let mut memory = populate(&layout, &objects);
    set_field(&mut memory, &layout, "object", RawRef::NULL);
    set_field(&mut memory, &layout, "block", RawRef::NULL);
    set_field(&mut memory, &layout, "set", RawRef::NULL);

    {
        let mut scope = bridge.scope();
        let value = bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap();
        assert!(value.object("object").unwrap().is_empty());
        assert!(value.closure("block").unwrap().is_null());
        assert!(value.collection("set").unwrap().is_null());

        let null_block = value.closure("block").unwrap();
        assert!(matches!(bridge.invoke(&mut scope, null_block, &[]), Err(BridgeError::Invocation(_))));

        let mut copy = vec![0xFFu8; layout.size()];
        bridge.write_struct(&value, &mut copy, Ownership::Borrowed).unwrap();
        assert_eq!(get_field(&copy, &layout, "object"), RawRef::NULL);
        assert_eq!(copy, memory);
    }
    objects.release(&runtime);
}

#[test]
fn null_non_nullable_object_is_rejected() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let baseline = objects.counts(&runtime);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let mut memory = populate(&layout, &objects);
    set_field(&mut memory, &layout, "nsString", RawRef::NULL);

    {
        let mut scope = bridge.scope();
        match bridge.read_struct(&mut scope, &PLAIN.into(), &memory) {
            Err(BridgeError::UnexpectedNull { field }) => assert_eq!(field, "nsString"),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(objects.counts(&runtime), baseline);
    objects.release(&runtime);
}

#[test]
fn reading_leaves_collections_untouched() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let element_counts: Vec<_> = objects.elements.iter().map(|e| runtime.retain_count(*e)).collect();
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let memory = populate(&layout, &objects);

    let mut scope = bridge.scope();
    let value = bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap();
    assert_eq!(runtime.stats().element_reads, 0);
    let after_read: Vec<_> = objects.elements.iter().map(|e| runtime.retain_count(*e)).collect();
    assert_eq!(after_read, element_counts);

    let dictionary = value.collection("dictionary").unwrap();
    let (key, entry) = dictionary.entry(&mut scope, 0).unwrap();
    assert_eq!(runtime.stats().element_reads, 1);
    assert_eq!(bridge.references().raw(&key).unwrap(), objects.elements[0]);
    assert_eq!(bridge.references().raw(&entry).unwrap(), objects.elements[1]);

    let set = value.collection("set").unwrap();
    assert_eq!(set.len(bridge.references()).unwrap(), 2);
    assert_eq!(set.elements(&mut scope).unwrap().len(), 2);
    assert_eq!(runtime.stats().element_reads, 3);

    scope.close().unwrap();
    let after_close: Vec<_> = objects.elements.iter().map(|e| runtime.retain_count(*e)).collect();
    assert_eq!(after_close, element_counts);
    objects.release(&runtime);
}

#[test]
fn owned_write_stores_plus_one_references() {
    let (runtime, bridge) = common::bridge();
    let objects = FixtureObjects::new(&runtime, &bridge);
    let layout = bridge.describe(&PLAIN.into()).unwrap();
    let memory = populate(&layout, &objects);

    let mut copy = vec![0u8; layout.size()];
    {
        let mut scope = bridge.scope();
        let value = bridge.read_struct(&mut scope, &PLAIN.into(), &memory).unwrap();
        bridge.write_struct(&value, &mut copy, Ownership::Owned).unwrap();
    }
    assert_eq!(copy, memory);
    // The copy owns one count of each field's object.
    for field in layout.fields() {
        let raw = get_field(&copy, &layout, &field.name);
        assert_eq!(runtime.retain_count(raw), Some(2), "field {}", field.name);
        unsafe { objbridge_foreign::ForeignRuntime::release(&runtime, raw) };
    }
    objects.release(&runtime);
    assert_eq!(runtime.stats().live_objects, 0);
}

#[test]
fn unknown_types_and_short_buffers_are_reported() {
    let (_runtime, bridge) = common::bridge();
    let mut scope = bridge.scope();
    let err = bridge.read_struct(&mut scope, &StructTypeId::new("CStructNobodyDeclared"), &[]).unwrap_err();
    assert!(matches!(err, BridgeError::UnknownType(_)));

    let err = bridge.read_struct(&mut scope, &PLAIN.into(), &[0u8; PTR]).unwrap_err();
    assert!(matches!(err, BridgeError::OutOfBounds { available, .. } if available == PTR));
}

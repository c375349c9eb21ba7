use std::path::Path;
use std::sync::Arc;

use objbridge_core::{Bridge, BridgeConfig, HostValue, Ownership, ScalarValue};
use objbridge_foreign::{ArcRuntime, ForeignRuntime, RawRef};
use objbridge_layout::{
    ClosureSignature, CollectionKind, FieldKind, LayoutTable, ScalarKind, StructLayout, ValueType,
};

use super::{find_layout, load_project};
use crate::error::CliError;

/// What a successful round trip exercised.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RoundTripReport {
    pub fields: usize,
    pub bytes: usize,
    pub objects: usize,
    pub retains: usize,
    pub releases: usize,
}

pub fn handle_roundtrip(project: &Path, type_name: &str) -> Result<(), CliError> {
    let (config, table) = load_project(project)?;
    let report = round_trip(table, &config.bridge, type_name)?;
    println!(
        "{}: {} field(s), {} byte(s) bit-identical; {} object(s) back at baseline after {} retain(s) and {} release(s)",
        type_name, report.fields, report.bytes, report.objects, report.retains, report.releases
    );
    Ok(())
}

pub(crate) fn round_trip(
    table: LayoutTable,
    config: &BridgeConfig,
    type_name: &str,
) -> Result<RoundTripReport, CliError> {
    let layout = find_layout(&table, type_name)?;
    let runtime = ArcRuntime::new();
    let bridge = Bridge::new(Arc::new(runtime.clone()), table, config)?;

    let mut objects = Vec::new();
    let memory = populate(&runtime, &bridge, &layout, &mut objects)?;
    let baseline: Vec<_> = objects.iter().map(|raw| runtime.retain_count(*raw)).collect();
    let before = runtime.stats();

    let mut copy = vec![0u8; layout.size()];
    let outcome = {
        let mut scope = bridge.scope();
        bridge
            .read_struct(&mut scope, layout.type_id(), &memory)
            .and_then(|value| bridge.write_struct(&value, &mut copy, Ownership::Borrowed))
            .and_then(|()| scope.close())
    };
    let after = runtime.stats();
    let counts: Vec<_> = objects.iter().map(|raw| runtime.retain_count(*raw)).collect();

    // SAFETY: each object carries the one count `populate` handed us.
    for raw in &objects {
        unsafe { runtime.release(*raw) };
    }
    drop(bridge);

    let fail = |reason: String| CliError::RoundTrip { type_id: layout.type_id().clone(), reason };
    outcome?;
    if copy != memory {
        let first = copy.iter().zip(&memory).position(|(a, b)| a != b).unwrap_or_default();
        return Err(fail(format!("written bytes differ from the source starting at byte {}", first)));
    }
    if counts != baseline {
        let moved = counts.iter().zip(&baseline).filter(|(a, b)| a != b).count();
        return Err(fail(format!("{} object(s) did not return to their baseline count", moved)));
    }
    let leaked = runtime.stats().live_objects;
    if leaked != 0 {
        return Err(fail(format!("{} object(s) still alive after release", leaked)));
    }

    Ok(RoundTripReport {
        fields: layout.fields().len(),
        bytes: layout.size(),
        objects: objects.len(),
        retains: after.retains - before.retains,
        releases: after.releases - before.releases,
    })
}

/// Fills a buffer for `layout`: scalars get a per-field byte pattern and every
/// reference field a fresh object. Every created object is pushed to `objects`
/// with one count owned by the caller.
fn populate(
    runtime: &ArcRuntime,
    bridge: &Bridge,
    layout: &StructLayout,
    objects: &mut Vec<RawRef>,
) -> Result<Vec<u8>, CliError> {
    let mut memory = vec![0u8; layout.size()];
    for (index, field) in layout.fields().iter().enumerate() {
        let slot = &mut memory[field.byte_offset..field.end()];
        let raw = match &field.kind {
            FieldKind::Scalar(ScalarKind::Bool) => {
                slot[0] = 1;
                continue;
            }
            FieldKind::Scalar(_) => {
                slot.fill(index as u8 + 1);
                continue;
            }
            FieldKind::ObjectRef | FieldKind::NullableObjectRef => runtime.new_string(&field.name),
            FieldKind::ClosureRef(signature) => stub_block(bridge, signature)?,
            FieldKind::CollectionRef(kind) => {
                let elements = [runtime.new_string("first"), runtime.new_string("second")];
                objects.extend(elements);
                // SAFETY: both elements were just created and are live.
                unsafe {
                    match kind {
                        CollectionKind::Array => runtime.new_array(&elements),
                        CollectionKind::MutableArray => runtime.new_mutable_array(&elements),
                        CollectionKind::Set => runtime.new_set(&elements),
                        CollectionKind::Dictionary => runtime.new_dictionary(&[(elements[0], elements[1])]),
                    }
                }
            }
        };
        slot.copy_from_slice(&raw.addr().to_ne_bytes());
        objects.push(raw);
    }
    Ok(memory)
}

/// A block with the field's signature that answers zero.
fn stub_block(bridge: &Bridge, signature: &ClosureSignature) -> Result<RawRef, CliError> {
    let result = signature.result();
    let block = bridge.expose_host_function(signature.clone(), move |_, _| {
        Ok(match result {
            ValueType::Void | ValueType::Object => None,
            ValueType::Scalar(kind) => Some(HostValue::Scalar(ScalarValue::read(kind, &[0u8; 8][..kind.size_bytes()]))),
        })
    })?;
    Ok(block)
}

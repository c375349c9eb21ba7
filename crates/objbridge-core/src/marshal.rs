//! Struct Marshaller: C struct bytes to [`HostStruct`] and back.
//!
//! Reads walk the descriptor table in order and never look past a
//! collection's handle. Writes check the whole value against the layout
//! before a single byte or count changes, then fill the fields into a staged
//! copy of the struct so padding bytes keep whatever the destination held.

use std::collections::HashSet;
use std::mem::size_of;
use std::sync::Arc;

use objbridge_foreign::RawRef;
use objbridge_layout::{FieldDescriptor, FieldKind, StructLayout};

use crate::closure::ClosureBridge;
use crate::collection::CollectionHandle;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Scope;
use crate::reference::{BridgedHandle, Nullability, Ownership, ReferenceBridge};
use crate::value::{HostStruct, HostValue, ScalarValue};

#[derive(Clone)]
pub struct Marshaller {
    references: Arc<ReferenceBridge>,
    closures: ClosureBridge,
}

enum Planned<'v> {
    Scalar(ScalarValue),
    Reference(&'v BridgedHandle),
}

impl Marshaller {
    pub fn new(closures: ClosureBridge) -> Self {
        Marshaller { references: closures.references().clone(), closures }
    }

    /// Reads a struct out of `memory`. Every reference comes back Borrowed in
    /// `scope`.
    pub fn read_struct(&self, scope: &mut Scope<'_>, memory: &[u8], layout: &StructLayout) -> BridgeResult<HostStruct> {
        check_bounds(layout, memory.len())?;
        let mut value = HostStruct::with_capacity(layout.type_id().clone(), layout.fields().len());
        for field in layout.fields() {
            let bytes = &memory[field.byte_offset..field.end()];
            let field_value = self.read_field(scope, field, bytes).map_err(|err| in_field(err, field))?;
            value.push(field.name.clone(), field_value);
        }
        log::trace!("read {} ({} fields)", layout.type_id(), layout.fields().len());
        Ok(value)
    }

    fn read_field(&self, scope: &mut Scope<'_>, field: &FieldDescriptor, bytes: &[u8]) -> BridgeResult<HostValue> {
        let nullability = Nullability::from_nullable(field.kind.is_nullable());
        Ok(match &field.kind {
            FieldKind::Scalar(kind) => HostValue::Scalar(ScalarValue::read(*kind, bytes)),
            FieldKind::ObjectRef | FieldKind::NullableObjectRef => {
                HostValue::Object(scope.wrap(read_reference(bytes), Ownership::Borrowed, nullability)?)
            }
            FieldKind::ClosureRef(signature) => HostValue::Closure(self.closures.wrap_foreign(
                read_reference(bytes),
                signature.clone(),
                Ownership::Borrowed,
                scope,
            )?),
            FieldKind::CollectionRef(kind) => {
                let handle = scope.wrap(read_reference(bytes), Ownership::Borrowed, nullability)?;
                HostValue::Collection(CollectionHandle::new(handle, *kind))
            }
        })
    }

    /// Reads a struct from raw C memory.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `layout.size()` bytes.
    pub unsafe fn read_struct_raw(
        &self,
        scope: &mut Scope<'_>,
        ptr: *const u8,
        layout: &StructLayout,
    ) -> BridgeResult<HostStruct> {
        let memory = std::slice::from_raw_parts(ptr, layout.size());
        self.read_struct(scope, memory, layout)
    }

    /// Writes `value` into `memory`.
    ///
    /// With an Owned destination every reference is stored +1: Owned handles
    /// hand over their count and become invalid, Borrowed handles are retained
    /// once more. With a Borrowed destination references are stored +0 and
    /// the host keeps its handles.
    pub fn write_struct(
        &self,
        value: &HostStruct,
        memory: &mut [u8],
        layout: &StructLayout,
        destination: Ownership,
    ) -> BridgeResult<()> {
        let plan = self.plan_write(value, memory.len(), layout, destination)?;
        let references = self.gather(&plan, destination)?;

        let mut staged = memory[..layout.size()].to_vec();
        for (field, planned) in &plan {
            if let Planned::Scalar(scalar) = planned {
                scalar.write(&mut staged[field.byte_offset..field.end()]);
            }
        }
        for (field, raw) in references {
            staged[field.byte_offset..field.end()].copy_from_slice(&raw.addr().to_ne_bytes());
        }
        memory[..layout.size()].copy_from_slice(&staged);
        log::trace!("wrote {} ({:?} destination)", layout.type_id(), destination);
        Ok(())
    }

    /// Produces the reference stored in every reference field. A handle can
    /// still go stale after planning; if one does, the counts gathered so far
    /// are given back before the error is returned.
    fn gather<'l>(
        &self,
        plan: &[(&'l FieldDescriptor, Planned<'_>)],
        destination: Ownership,
    ) -> BridgeResult<Vec<(&'l FieldDescriptor, RawRef)>> {
        let mut gathered = Vec::new();
        for (field, planned) in plan {
            let Planned::Reference(handle) = planned else {
                continue;
            };
            let raw = match destination {
                Ownership::Owned => self.references.unwrap(handle),
                Ownership::Borrowed => self.references.unwrap_unretained(handle),
            };
            match raw {
                Ok(raw) => gathered.push((*field, raw)),
                Err(err) => {
                    if destination == Ownership::Owned {
                        for (_, raw) in gathered {
                            self.references.release_unstored(raw);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(gathered)
    }

    /// Writes a struct into raw C memory.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `layout.size()` bytes.
    pub unsafe fn write_struct_raw(
        &self,
        value: &HostStruct,
        ptr: *mut u8,
        layout: &StructLayout,
        destination: Ownership,
    ) -> BridgeResult<()> {
        let memory = std::slice::from_raw_parts_mut(ptr, layout.size());
        self.write_struct(value, memory, layout, destination)
    }

    /// Everything that can fail, checked up front.
    fn plan_write<'l, 'v>(
        &self,
        value: &'v HostStruct,
        available: usize,
        layout: &'l StructLayout,
        destination: Ownership,
    ) -> BridgeResult<Vec<(&'l FieldDescriptor, Planned<'v>)>> {
        check_bounds(layout, available)?;
        let mismatch = |reason: String| BridgeError::LayoutMismatch { type_id: layout.type_id().clone(), reason };

        if let Some((name, _)) = value.fields().iter().find(|(name, _)| layout.field(name).is_none()) {
            return Err(mismatch(format!("no field named `{}`", name)));
        }

        let mut transferred = HashSet::new();
        let mut plan = Vec::with_capacity(layout.fields().len());
        for field in layout.fields() {
            let field_value = value.get(&field.name).ok_or_else(|| mismatch(format!("missing field `{}`", field.name)))?;
            field_value
                .check_kind(&field.kind)
                .map_err(|reason| mismatch(format!("field `{}`: {}", field.name, reason)))?;

            let planned = match field_value {
                HostValue::Scalar(scalar) => Planned::Scalar(*scalar),
                other => {
                    let handle = match other.handle() {
                        Some(handle) => handle,
                        None => return Err(mismatch(format!("field `{}` holds no reference", field.name))),
                    };
                    if handle.is_empty() && !field.kind.is_nullable() {
                        return Err(BridgeError::UnexpectedNull { field: field.name.clone() });
                    }
                    if !self.references.is_live(handle) {
                        return Err(BridgeError::StaleHandle { raw: handle.address() });
                    }
                    if destination == Ownership::Owned && handle.ownership() == Ownership::Owned {
                        if let Some(key) = handle.key() {
                            if !transferred.insert(key) {
                                return Err(mismatch(format!(
                                    "field `{}` reuses an owned handle that is already transferred",
                                    field.name
                                )));
                            }
                        }
                    }
                    Planned::Reference(handle)
                }
            };
            plan.push((field, planned));
        }
        Ok(plan)
    }
}

fn check_bounds(layout: &StructLayout, available: usize) -> BridgeResult<()> {
    if available < layout.size() {
        return Err(BridgeError::OutOfBounds { type_id: layout.type_id().clone(), needed: layout.size(), available });
    }
    Ok(())
}

fn read_reference(bytes: &[u8]) -> RawRef {
    let mut word = [0u8; size_of::<usize>()];
    word.copy_from_slice(bytes);
    RawRef::from_addr(usize::from_ne_bytes(word))
}

fn in_field(err: BridgeError, field: &FieldDescriptor) -> BridgeError {
    match err {
        BridgeError::UnexpectedNull { .. } => BridgeError::UnexpectedNull { field: field.name.clone() },
        other => other,
    }
}

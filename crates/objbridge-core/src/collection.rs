//! Opaque collection handles.
//!
//! Reading a struct never walks a collection. Elements only cross into the
//! host through the accessors here, and each one is wrapped Borrowed in the
//! caller's scope like any other reference.

use objbridge_foreign::ForeignError;
use objbridge_layout::CollectionKind;

use crate::error::BridgeResult;
use crate::lifetime::Scope;
use crate::reference::{BridgedHandle, Nullability, Ownership, ReferenceBridge};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionHandle {
    handle: BridgedHandle,
    kind: CollectionKind,
}

impl CollectionHandle {
    pub fn new(handle: BridgedHandle, kind: CollectionKind) -> Self {
        CollectionHandle { handle, kind }
    }

    pub fn handle(&self) -> &BridgedHandle {
        &self.handle
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// True for a null collection field.
    pub fn is_null(&self) -> bool {
        self.handle.is_empty()
    }

    /// Element count (entry count for dictionaries). A null collection is empty.
    pub fn len(&self, bridge: &ReferenceBridge) -> BridgeResult<usize> {
        let raw = bridge.raw(&self.handle)?;
        if raw.is_null() {
            return Ok(0);
        }
        // SAFETY: `raw` resolved through a live handle, which holds a count.
        Ok(unsafe { bridge.runtime().collection_len(raw)? })
    }

    /// Element `index` of an array or set.
    pub fn element(&self, scope: &mut Scope<'_>, index: usize) -> BridgeResult<BridgedHandle> {
        if self.kind == CollectionKind::Dictionary {
            return Err(ForeignError::Unsupported("element access on a dictionary").into());
        }
        let bridge = scope.bridge();
        let raw = bridge.raw(&self.handle)?;
        if raw.is_null() {
            return Err(ForeignError::IndexOutOfRange { index, len: 0 }.into());
        }
        // SAFETY: as in `len`.
        let element = unsafe { bridge.runtime().collection_element(raw, index)? };
        scope.wrap(element, Ownership::Borrowed, Nullability::NonNull)
    }

    /// Key and value of dictionary entry `index`.
    pub fn entry(&self, scope: &mut Scope<'_>, index: usize) -> BridgeResult<(BridgedHandle, BridgedHandle)> {
        if self.kind != CollectionKind::Dictionary {
            return Err(ForeignError::Unsupported("entry access on a non-dictionary").into());
        }
        let bridge = scope.bridge();
        let raw = bridge.raw(&self.handle)?;
        if raw.is_null() {
            return Err(ForeignError::IndexOutOfRange { index, len: 0 }.into());
        }
        // SAFETY: as in `len`.
        let (key, value) = unsafe { bridge.runtime().dictionary_entry(raw, index)? };
        let key = scope.wrap(key, Ownership::Borrowed, Nullability::NonNull)?;
        let value = scope.wrap(value, Ownership::Borrowed, Nullability::NonNull)?;
        Ok((key, value))
    }

    /// Every element of an array or set, each wrapped individually.
    pub fn elements(&self, scope: &mut Scope<'_>) -> BridgeResult<Vec<BridgedHandle>> {
        let len = self.len(scope.bridge())?;
        (0..len).map(|index| self.element(scope, index)).collect()
    }

    /// Every entry of a dictionary, each key and value wrapped individually.
    pub fn entries(&self, scope: &mut Scope<'_>) -> BridgeResult<Vec<(BridgedHandle, BridgedHandle)>> {
        let len = self.len(scope.bridge())?;
        (0..len).map(|index| self.entry(scope, index)).collect()
    }
}

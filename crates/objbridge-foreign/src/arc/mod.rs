//! In-process reference-counted object runtime.
//!
//! Every object sits behind a hidden header holding an atomic count. The
//! runtime also keeps the set of live addresses so that tests and tools can
//! inspect counts through safe, validated accessors.

mod object;
mod pool;

use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::BlockLiteral;
use crate::{ForeignError, ForeignKind, ForeignRuntime, RawRef};
use object::{
    allocate, header, instance, release_object, retain_object, BlockBody, HeapState, Instance,
    InstanceBody,
};

/// Counter snapshot of an [`ArcRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub live_objects: usize,
    pub retains: usize,
    pub releases: usize,
    pub autoreleases: usize,
    /// Element or entry reads through the collection accessors.
    pub element_reads: usize,
}

#[derive(Clone, Default)]
pub struct ArcRuntime {
    heap: Arc<HeapState>,
}

impl ArcRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_object(&self) -> RawRef {
        allocate(&self.heap, ForeignKind::Object, InstanceBody::new(ForeignKind::Object, Instance::Plain))
    }

    pub fn new_string(&self, value: &str) -> RawRef {
        allocate(
            &self.heap,
            ForeignKind::String,
            InstanceBody::new(ForeignKind::String, Instance::String(value.to_string())),
        )
    }

    /// Creates an array retaining each element.
    ///
    /// # Safety
    /// Every element must be a live, non-null object of this runtime.
    pub unsafe fn new_array(&self, elements: &[RawRef]) -> RawRef {
        self.new_elements(ForeignKind::Array, elements.to_vec())
    }

    /// # Safety
    /// As for [`ArcRuntime::new_array`].
    pub unsafe fn new_mutable_array(&self, elements: &[RawRef]) -> RawRef {
        self.new_elements(ForeignKind::MutableArray, elements.to_vec())
    }

    /// Creates a set; duplicate references are stored once.
    ///
    /// # Safety
    /// As for [`ArcRuntime::new_array`].
    pub unsafe fn new_set(&self, elements: &[RawRef]) -> RawRef {
        let mut unique: Vec<RawRef> = Vec::with_capacity(elements.len());
        for element in elements {
            if !unique.contains(element) {
                unique.push(*element);
            }
        }
        self.new_elements(ForeignKind::Set, unique)
    }

    /// # Safety
    /// Every key and value must be a live, non-null object of this runtime.
    pub unsafe fn new_dictionary(&self, entries: &[(RawRef, RawRef)]) -> RawRef {
        for (key, value) in entries {
            retain_object(*key);
            retain_object(*value);
        }
        allocate(
            &self.heap,
            ForeignKind::Dictionary,
            InstanceBody::new(ForeignKind::Dictionary, Instance::Entries(RwLock::new(entries.to_vec()))),
        )
    }

    unsafe fn new_elements(&self, kind: ForeignKind, elements: Vec<RawRef>) -> RawRef {
        for element in &elements {
            retain_object(*element);
        }
        allocate(&self.heap, kind, InstanceBody::new(kind, Instance::Elements(RwLock::new(elements))))
    }

    /// Appends to a mutable array, retaining `element`.
    pub fn push(&self, array: RawRef, element: RawRef) -> Result<(), ForeignError> {
        let live = self.heap.live.lock();
        for candidate in [array, element] {
            if !live.contains(&candidate.addr()) {
                return Err(ForeignError::NotAnObject(candidate));
            }
        }
        // SAFETY: both checked live under the lock, which also blocks their destruction.
        unsafe {
            let kind = header(array).kind;
            if kind != ForeignKind::MutableArray {
                return Err(ForeignError::WrongKind { reference: array, actual: kind, expected: "mutable array" });
            }
            if let Instance::Elements(elements) = &instance(array).value {
                retain_object(element);
                elements.write().push(element);
            }
        }
        Ok(())
    }

    /// Current count of `raw`, or `None` if it is not a live object.
    pub fn retain_count(&self, raw: RawRef) -> Option<usize> {
        let live = self.heap.live.lock();
        if !live.contains(&raw.addr()) {
            return None;
        }
        // SAFETY: live and pinned by the lock.
        Some(unsafe { header(raw) }.refcount.load(Ordering::Acquire))
    }

    pub fn is_live(&self, raw: RawRef) -> bool {
        self.heap.live.lock().contains(&raw.addr())
    }

    /// Contents of a string object.
    pub fn string_value(&self, raw: RawRef) -> Option<String> {
        let live = self.heap.live.lock();
        if !live.contains(&raw.addr()) {
            return None;
        }
        // SAFETY: live and pinned by the lock; strings are instances.
        unsafe {
            if header(raw).kind != ForeignKind::String {
                return None;
            }
            match &instance(raw).value {
                Instance::String(value) => Some(value.clone()),
                _ => None,
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.heap.live.lock().len(),
            retains: self.heap.retains.load(Ordering::Relaxed),
            releases: self.heap.releases.load(Ordering::Relaxed),
            autoreleases: self.heap.autoreleases.load(Ordering::Relaxed),
            element_reads: self.heap.element_reads.load(Ordering::Relaxed),
        }
    }

    /// Runs `f` inside an autorelease pool drained when `f` returns or unwinds.
    pub fn autorelease_pool<R>(&self, f: impl FnOnce() -> R) -> R {
        let _pool = pool::PoolGuard::push();
        f()
    }

    pub fn pool_depth(&self) -> usize {
        pool::depth()
    }

    unsafe fn checked_instance(
        &self,
        raw: RawRef,
        expected: &'static str,
        accept: impl Fn(ForeignKind) -> bool,
    ) -> Result<&InstanceBody, ForeignError> {
        if raw.is_null() {
            return Err(ForeignError::NullReference(raw));
        }
        let kind = header(raw).kind;
        if !accept(kind) {
            return Err(ForeignError::WrongKind { reference: raw, actual: kind, expected });
        }
        Ok(instance(raw))
    }
}

impl ForeignRuntime for ArcRuntime {
    unsafe fn retain(&self, obj: RawRef) -> RawRef {
        retain_object(obj)
    }

    unsafe fn release(&self, obj: RawRef) {
        release_object(obj)
    }

    unsafe fn autorelease(&self, obj: RawRef) -> RawRef {
        self.heap.autoreleases.fetch_add(1, Ordering::Relaxed);
        if !pool::push(obj) {
            log::warn!("{:?} autoreleased with no pool in place, just leaking", obj);
        }
        obj
    }

    unsafe fn kind_of(&self, obj: RawRef) -> Option<ForeignKind> {
        Some(header(obj).kind)
    }

    unsafe fn collection_len(&self, collection: RawRef) -> Result<usize, ForeignError> {
        let body = self.checked_instance(collection, "collection", ForeignKind::is_collection)?;
        Ok(match &body.value {
            Instance::Elements(elements) => elements.read().len(),
            Instance::Entries(entries) => entries.read().len(),
            _ => 0,
        })
    }

    unsafe fn collection_element(&self, collection: RawRef, index: usize) -> Result<RawRef, ForeignError> {
        let body = self.checked_instance(collection, "array or set", |kind| {
            matches!(kind, ForeignKind::Array | ForeignKind::MutableArray | ForeignKind::Set)
        })?;
        self.heap.element_reads.fetch_add(1, Ordering::Relaxed);
        match &body.value {
            Instance::Elements(elements) => {
                let elements = elements.read();
                elements
                    .get(index)
                    .copied()
                    .ok_or(ForeignError::IndexOutOfRange { index, len: elements.len() })
            }
            _ => Err(ForeignError::Unsupported("element access on a non-element collection")),
        }
    }

    unsafe fn dictionary_entry(
        &self,
        dictionary: RawRef,
        index: usize,
    ) -> Result<(RawRef, RawRef), ForeignError> {
        let body = self.checked_instance(dictionary, "dictionary", |kind| kind == ForeignKind::Dictionary)?;
        self.heap.element_reads.fetch_add(1, Ordering::Relaxed);
        match &body.value {
            Instance::Entries(entries) => {
                let entries = entries.read();
                entries
                    .get(index)
                    .copied()
                    .ok_or(ForeignError::IndexOutOfRange { index, len: entries.len() })
            }
            _ => Err(ForeignError::Unsupported("entry access on a non-dictionary")),
        }
    }

    fn make_block(
        &self,
        invoke: *const c_void,
        state: Box<dyn Any + Send + Sync>,
    ) -> Result<RawRef, ForeignError> {
        if invoke.is_null() {
            return Err(ForeignError::Unsupported("block without an invoke function"));
        }
        Ok(allocate(
            &self.heap,
            ForeignKind::Block,
            BlockBody::new(BlockLiteral::heap(invoke), state),
        ))
    }
}

use std::any::Any;
use std::collections::HashSet;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::block::BlockLiteral;
use crate::{ForeignKind, RawRef};

/// State shared by every object of one runtime: counters and the set of live
/// addresses used to validate references handed back by callers.
#[derive(Default)]
pub(crate) struct HeapState {
    pub(crate) live: Mutex<HashSet<usize>>,
    pub(crate) retains: AtomicUsize,
    pub(crate) releases: AtomicUsize,
    pub(crate) autoreleases: AtomicUsize,
    pub(crate) element_reads: AtomicUsize,
}

/// Hidden prefix in front of every object. Objects are handed out as pointers
/// to the body that follows, so a block reference points straight at its
/// `BlockLiteral` as the block ABI requires.
#[repr(C, align(16))]
pub(crate) struct ObjectHeader {
    pub(crate) refcount: AtomicUsize,
    pub(crate) kind: ForeignKind,
    heap: Arc<HeapState>,
    dispose: unsafe fn(*mut ObjectHeader),
}

#[repr(C)]
struct ArcCell<T> {
    header: ObjectHeader,
    body: T,
}

pub(crate) const BODY_OFFSET: usize = mem::size_of::<ObjectHeader>();

/// Body of every non-block object. The first word mirrors an `isa` slot.
#[repr(C)]
pub(crate) struct InstanceBody {
    isa: usize,
    pub(crate) value: Instance,
}

pub(crate) enum Instance {
    Plain,
    String(String),
    /// Arrays, mutable arrays and sets. Each element holds one count.
    Elements(RwLock<Vec<RawRef>>),
    /// Dictionary entries. Keys and values each hold one count.
    Entries(RwLock<Vec<(RawRef, RawRef)>>),
}

impl Drop for InstanceBody {
    fn drop(&mut self) {
        match &mut self.value {
            Instance::Elements(elements) => {
                for element in elements.get_mut().drain(..) {
                    // SAFETY: the collection owned one count of each element.
                    unsafe { release_object(element) };
                }
            }
            Instance::Entries(entries) => {
                for (key, value) in entries.get_mut().drain(..) {
                    // SAFETY: as above, for both key and value.
                    unsafe {
                        release_object(key);
                        release_object(value);
                    }
                }
            }
            Instance::Plain | Instance::String(_) => {}
        }
    }
}

#[repr(C)]
pub(crate) struct BlockBody {
    pub(crate) literal: BlockLiteral,
    /// Dropped with the block.
    _state: Box<dyn Any + Send + Sync>,
}

impl BlockBody {
    pub(crate) fn new(literal: BlockLiteral, state: Box<dyn Any + Send + Sync>) -> Self {
        BlockBody { literal, _state: state }
    }
}

unsafe fn dispose_cell<T>(header: *mut ObjectHeader) {
    // SAFETY: header is the first field of a repr(C) ArcCell<T> allocated by `allocate`.
    drop(Box::from_raw(header as *mut ArcCell<T>));
}

/// Allocates an object with a count of one and registers it as live.
pub(crate) fn allocate<T>(heap: &Arc<HeapState>, kind: ForeignKind, body: T) -> RawRef {
    debug_assert!(mem::align_of::<T>() <= mem::align_of::<ObjectHeader>());
    let cell = Box::new(ArcCell {
        header: ObjectHeader {
            refcount: AtomicUsize::new(1),
            kind,
            heap: Arc::clone(heap),
            dispose: dispose_cell::<T>,
        },
        body,
    });
    debug_assert_eq!(memoffset::offset_of!(ArcCell<T>, body), BODY_OFFSET);
    let cell = Box::into_raw(cell);
    // SAFETY: cell was just allocated.
    let body = unsafe { ptr::addr_of_mut!((*cell).body) } as *mut std::ffi::c_void;
    let raw = RawRef::from_ptr(body);
    heap.live.lock().insert(raw.addr());
    log::trace!("allocated {:?} at {:?}", kind, raw);
    raw
}

impl InstanceBody {
    pub(crate) fn new(kind: ForeignKind, value: Instance) -> Self {
        InstanceBody { isa: kind as usize + 1, value }
    }
}

/// # Safety
/// `raw` must be a live object allocated by [`allocate`].
pub(crate) unsafe fn header<'a>(raw: RawRef) -> &'a ObjectHeader {
    &*((raw.as_ptr() as *mut u8).sub(BODY_OFFSET) as *const ObjectHeader)
}

/// # Safety
/// `raw` must be a live non-block object allocated by [`allocate`].
pub(crate) unsafe fn instance<'a>(raw: RawRef) -> &'a InstanceBody {
    &*(raw.as_ptr() as *const InstanceBody)
}

/// # Safety
/// `raw` must be a live object allocated by [`allocate`].
pub(crate) unsafe fn retain_object(raw: RawRef) -> RawRef {
    let header = header(raw);
    header.refcount.fetch_add(1, Ordering::Relaxed);
    header.heap.retains.fetch_add(1, Ordering::Relaxed);
    raw
}

/// # Safety
/// `raw` must be a live object allocated by [`allocate`] and the caller must
/// own one of its counts.
pub(crate) unsafe fn release_object(raw: RawRef) {
    let header_ptr = (raw.as_ptr() as *mut u8).sub(BODY_OFFSET) as *mut ObjectHeader;
    let header = &*header_ptr;
    header.heap.releases.fetch_add(1, Ordering::Relaxed);
    if header.refcount.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    fence(Ordering::Acquire);
    // Unregister before freeing so validated lookups never see a dead object.
    header.heap.live.lock().remove(&raw.addr());
    log::trace!("destroying {:?} at {:?}", header.kind, raw);
    (header.dispose)(header_ptr);
}

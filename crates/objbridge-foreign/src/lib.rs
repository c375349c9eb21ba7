//! The foreign object runtime as seen from the bridge.
//!
//! The bridge never touches reference counts itself; it goes through
//! [`ForeignRuntime`], which mirrors the `retain` / `release` / `autorelease`
//! entry points of a reference-counted object runtime plus the few extra
//! capabilities the bridge needs (class tests, opaque collection access, and
//! heap block creation for host trampolines).
//!
//! [`ArcRuntime`] is an in-process implementation with atomic counts,
//! per-thread autorelease pools and the four collection classes.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;

use thiserror::Error;

mod arc;
pub mod block;

pub use arc::{ArcRuntime, HeapStats};
pub use block::{BlockDescriptor, BlockLiteral};

/// A raw pointer into the foreign object heap.
///
/// Copying a `RawRef` never changes a reference count; ownership is tracked
/// by whoever holds it.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawRef(*mut c_void);

// SAFETY: The foreign runtime's counts are atomic and its objects may be
// referenced from any thread; a RawRef is just an address.
unsafe impl Send for RawRef {}
unsafe impl Sync for RawRef {}

impl RawRef {
    pub const NULL: RawRef = RawRef(std::ptr::null_mut());

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        RawRef(ptr)
    }

    pub fn from_addr(addr: usize) -> Self {
        RawRef(addr as *mut c_void)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for RawRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawRef({:#x})", self.addr())
    }
}

/// The runtime classes the bridge can tell apart.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignKind {
    Object = 0,
    String = 1,
    Block = 2,
    Array = 3,
    MutableArray = 4,
    Set = 5,
    Dictionary = 6,
}

impl ForeignKind {
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            ForeignKind::Array | ForeignKind::MutableArray | ForeignKind::Set | ForeignKind::Dictionary
        )
    }
}

/// Errors reported by the foreign runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForeignError {
    #[error("Reference {0:?} is null")]
    NullReference(RawRef),

    #[error("Reference {0:?} is not a live object of this runtime")]
    NotAnObject(RawRef),

    #[error("Object {reference:?} is a {actual:?}, expected {expected}")]
    WrongKind {
        reference: RawRef,
        actual: ForeignKind,
        expected: &'static str,
    },

    #[error("Index {index} is out of range for a collection of {len} elements")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Operation not supported by this runtime: {0}")]
    Unsupported(&'static str),
}

/// Capability surface of a reference-counted foreign object runtime.
///
/// Implementations must be safe to call concurrently from different threads:
/// reference counts are assumed atomic.
pub trait ForeignRuntime: Send + Sync {
    /// Increments the count of `obj` and returns it.
    ///
    /// # Safety
    /// `obj` must be a live, non-null object of this runtime.
    unsafe fn retain(&self, obj: RawRef) -> RawRef;

    /// Decrements the count of `obj`, destroying it when the count hits zero.
    ///
    /// # Safety
    /// `obj` must be a live, non-null object of this runtime and the caller
    /// must own one of its counts.
    unsafe fn release(&self, obj: RawRef);

    /// Hands one owned count of `obj` to the current autorelease pool.
    ///
    /// # Safety
    /// Same as [`ForeignRuntime::release`].
    unsafe fn autorelease(&self, obj: RawRef) -> RawRef;

    /// The class of `obj`, if the runtime can tell.
    ///
    /// # Safety
    /// `obj` must be a live, non-null object of this runtime.
    unsafe fn kind_of(&self, obj: RawRef) -> Option<ForeignKind> {
        let _ = obj;
        None
    }

    /// Number of elements (entries for dictionaries).
    ///
    /// # Safety
    /// `collection` must be a live collection object of this runtime.
    unsafe fn collection_len(&self, collection: RawRef) -> Result<usize, ForeignError>;

    /// Element `index` of an array or set, +0 (kept alive by the collection).
    ///
    /// # Safety
    /// `collection` must be a live collection object of this runtime.
    unsafe fn collection_element(&self, collection: RawRef, index: usize) -> Result<RawRef, ForeignError>;

    /// Key and value of entry `index`, both +0.
    ///
    /// # Safety
    /// `dictionary` must be a live dictionary object of this runtime.
    unsafe fn dictionary_entry(
        &self,
        dictionary: RawRef,
        index: usize,
    ) -> Result<(RawRef, RawRef), ForeignError>;

    /// Creates a heap block whose `invoke` slot is `invoke`. The block owns
    /// `state` and drops it when destroyed. Returned at +1.
    fn make_block(
        &self,
        invoke: *const c_void,
        state: Box<dyn Any + Send + Sync>,
    ) -> Result<RawRef, ForeignError>;
}

//! Block literal ABI.
//!
//! A block reference points at a `BlockLiteral`; calling it means calling
//! `invoke` with the block itself as the first argument followed by the
//! declared parameters.

use std::ffi::c_void;
use std::mem;

use crate::RawRef;

/// Set on blocks that live on the heap and are freed when their count drops.
pub const BLOCK_NEEDS_FREE: i32 = 1 << 24;

#[repr(C)]
#[derive(Debug)]
pub struct BlockDescriptor {
    pub reserved: usize,
    pub size: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct BlockLiteral {
    pub isa: *const c_void,
    pub flags: i32,
    pub reserved: i32,
    pub invoke: *const c_void,
    pub descriptor: *const BlockDescriptor,
}

pub(crate) static HEAP_BLOCK_DESCRIPTOR: BlockDescriptor = BlockDescriptor {
    reserved: 0,
    size: mem::size_of::<BlockLiteral>(),
};

impl BlockLiteral {
    pub(crate) fn heap(invoke: *const c_void) -> Self {
        BlockLiteral {
            isa: std::ptr::null(),
            flags: BLOCK_NEEDS_FREE,
            reserved: 0,
            invoke,
            descriptor: &HEAP_BLOCK_DESCRIPTOR,
        }
    }
}

/// Reads the `invoke` slot of a block.
///
/// # Safety
/// `block` must point at a live block literal.
pub unsafe fn invoke_ptr(block: RawRef) -> *const c_void {
    let literal = block.as_ptr() as *const BlockLiteral;
    std::ptr::read(std::ptr::addr_of!((*literal).invoke))
}

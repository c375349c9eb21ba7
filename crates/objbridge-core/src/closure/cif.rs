//! libffi call interfaces for block signatures.
//!
//! A block is called as `invoke(block, args...)`, so every interface here has
//! a leading pointer parameter ahead of the signature's own parameters.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;

use libffi::middle::{Arg, Cif, Type};
use objbridge_layout::{ClosureSignature, ScalarKind, ValueType};

use crate::value::ScalarValue;

thread_local! {
    static TLS_CIF_CACHE: RefCell<HashMap<ClosureSignature, Rc<Cif>>> = RefCell::new(HashMap::new());
}

/// The cached interface for `signature`, built on first use on this thread.
///
/// The cache is not borrowed while the caller uses the interface, so a host
/// function may invoke further blocks from inside a trampoline.
pub(crate) fn cached_block_cif(signature: &ClosureSignature) -> Rc<Cif> {
    TLS_CIF_CACHE.with(|cache| {
        let mut map = cache.borrow_mut();
        map.entry(signature.clone())
            .or_insert_with(|| {
                log::trace!("building call interface for {}", signature);
                Rc::new(block_cif(signature))
            })
            .clone()
    })
}

/// A fresh interface; closures take ownership of theirs.
pub(crate) fn block_cif(signature: &ClosureSignature) -> Cif {
    let params = std::iter::once(Type::pointer())
        .chain(signature.params().iter().map(|param| ffi_type(*param)))
        .collect::<Vec<_>>();
    Cif::new(params, ffi_type(signature.result()))
}

pub(crate) fn ffi_type(value: ValueType) -> Type {
    match value {
        ValueType::Void => Type::void(),
        ValueType::Object => Type::pointer(),
        ValueType::Scalar(kind) => match kind {
            ScalarKind::I8 => Type::i8(),
            ScalarKind::U8 | ScalarKind::Bool => Type::u8(),
            ScalarKind::I16 => Type::i16(),
            ScalarKind::U16 => Type::u16(),
            ScalarKind::I32 => Type::i32(),
            ScalarKind::U32 => Type::u32(),
            ScalarKind::I64 => Type::i64(),
            ScalarKind::U64 => Type::u64(),
            ScalarKind::F32 => Type::f32(),
            ScalarKind::F64 => Type::f64(),
            ScalarKind::Pointer => Type::pointer(),
        },
    }
}

/// Argument storage that outlives the `Arg`s pointing into it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FfiArgValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl FfiArgValue {
    pub(crate) fn from_scalar(value: ScalarValue) -> Self {
        match value {
            ScalarValue::I8(v) => FfiArgValue::I8(v),
            ScalarValue::U8(v) => FfiArgValue::U8(v),
            ScalarValue::I16(v) => FfiArgValue::I16(v),
            ScalarValue::U16(v) => FfiArgValue::U16(v),
            ScalarValue::I32(v) => FfiArgValue::I32(v),
            ScalarValue::U32(v) => FfiArgValue::U32(v),
            ScalarValue::I64(v) => FfiArgValue::I64(v),
            ScalarValue::U64(v) => FfiArgValue::U64(v),
            ScalarValue::F32(v) => FfiArgValue::F32(v),
            ScalarValue::F64(v) => FfiArgValue::F64(v),
            ScalarValue::Bool(v) => FfiArgValue::U8(v as u8),
            ScalarValue::Pointer(v) => FfiArgValue::Pointer(v as *mut c_void),
        }
    }

    pub(crate) fn as_arg(&self) -> Arg {
        match self {
            FfiArgValue::I8(v) => Arg::new(v),
            FfiArgValue::U8(v) => Arg::new(v),
            FfiArgValue::I16(v) => Arg::new(v),
            FfiArgValue::U16(v) => Arg::new(v),
            FfiArgValue::I32(v) => Arg::new(v),
            FfiArgValue::U32(v) => Arg::new(v),
            FfiArgValue::I64(v) => Arg::new(v),
            FfiArgValue::U64(v) => Arg::new(v),
            FfiArgValue::F32(v) => Arg::new(v),
            FfiArgValue::F64(v) => Arg::new(v),
            FfiArgValue::Pointer(v) => Arg::new(v),
        }
    }
}

/// Reads argument `slot` of kind `kind` as passed to a libffi closure.
///
/// # Safety
/// `slot` must point at a value of the C type `kind` maps to.
pub(crate) unsafe fn read_scalar_arg(kind: ScalarKind, slot: *const c_void) -> ScalarValue {
    match kind {
        ScalarKind::I8 => ScalarValue::I8(*(slot as *const i8)),
        ScalarKind::U8 => ScalarValue::U8(*(slot as *const u8)),
        ScalarKind::I16 => ScalarValue::I16(*(slot as *const i16)),
        ScalarKind::U16 => ScalarValue::U16(*(slot as *const u16)),
        ScalarKind::I32 => ScalarValue::I32(*(slot as *const i32)),
        ScalarKind::U32 => ScalarValue::U32(*(slot as *const u32)),
        ScalarKind::I64 => ScalarValue::I64(*(slot as *const i64)),
        ScalarKind::U64 => ScalarValue::U64(*(slot as *const u64)),
        ScalarKind::F32 => ScalarValue::F32(*(slot as *const f32)),
        ScalarKind::F64 => ScalarValue::F64(*(slot as *const f64)),
        ScalarKind::Bool => ScalarValue::Bool(*(slot as *const u8) != 0),
        ScalarKind::Pointer => ScalarValue::Pointer(*(slot as *const usize)),
    }
}

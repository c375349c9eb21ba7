//! Host functions callable as foreign blocks.
//!
//! Each exposed function gets its own libffi closure whose code pointer is
//! installed as the block's `invoke`. The block object owns the closure and
//! the boxed host function, so both die with the block's last release.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use libffi::low::ffi_cif;
use libffi::middle::Closure;
use objbridge_foreign::RawRef;
use objbridge_layout::{ClosureSignature, ScalarKind, ValueType};

use super::cif::{block_cif, read_scalar_arg};
use super::record_fault;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Scope;
use crate::reference::{Nullability, Ownership, ReferenceBridge};
use crate::value::{HostValue, ScalarValue};

/// A host function as seen by the foreign side.
pub type HostFunction =
    dyn Fn(&mut Scope<'_>, &[HostValue]) -> BridgeResult<Option<HostValue>> + Send + Sync;

struct HostThunk {
    references: Arc<ReferenceBridge>,
    signature: ClosureSignature,
    function: Box<HostFunction>,
}

enum Return {
    Void,
    Register(u64),
    F32(f32),
    F64(f64),
}

impl HostThunk {
    /// # Safety
    /// `args` must be the argument array libffi passes to a closure built
    /// from `block_cif(&self.signature)`.
    unsafe fn call(&self, args: *const *const c_void) -> BridgeResult<Return> {
        let mut scope = self.references.scope();
        let mut values = Vec::with_capacity(self.signature.arity());
        for (index, param) in self.signature.params().iter().enumerate() {
            // Slot 0 is the block itself.
            let slot = *args.add(index + 1);
            values.push(match param {
                ValueType::Scalar(kind) => HostValue::Scalar(read_scalar_arg(*kind, slot)),
                ValueType::Object => {
                    let raw = RawRef::from_ptr(*(slot as *const *mut c_void));
                    HostValue::Object(scope.wrap(raw, Ownership::Borrowed, Nullability::Nullable)?)
                }
                ValueType::Void => unreachable!("signatures reject void parameters"),
            });
        }

        let result = (self.function)(&mut scope, &values)?;
        let encoded = self.encode_result(result)?;
        scope.close()?;
        Ok(encoded)
    }

    fn encode_result(&self, result: Option<HostValue>) -> BridgeResult<Return> {
        let mismatch = |found: String| BridgeError::SignatureMismatch { expected: self.signature.clone(), found };
        match (self.signature.result(), result) {
            (ValueType::Void, None) => Ok(Return::Void),
            (ValueType::Scalar(ScalarKind::F32), Some(HostValue::Scalar(ScalarValue::F32(v)))) => Ok(Return::F32(v)),
            (ValueType::Scalar(ScalarKind::F64), Some(HostValue::Scalar(ScalarValue::F64(v)))) => Ok(Return::F64(v)),
            (ValueType::Scalar(kind), Some(HostValue::Scalar(value))) if value.kind() == kind => {
                Ok(Return::Register(value.to_register()))
            }
            (ValueType::Object, None) => Ok(Return::Register(0)),
            (ValueType::Object, Some(value)) => {
                let handle = match &value {
                    HostValue::Object(handle) => handle,
                    HostValue::Closure(closure) => closure.handle(),
                    HostValue::Collection(collection) => collection.handle(),
                    HostValue::Scalar(_) => return Err(mismatch(format!("host function returned {}", value.describe()))),
                };
                let raw = self.references.autorelease(handle)?;
                Ok(Return::Register(raw.addr() as u64))
            }
            (_, Some(value)) => Err(mismatch(format!("host function returned {}", value.describe()))),
            (_, None) => Err(mismatch("host function returned nothing".to_string())),
        }
    }
}

/// Owned by the block. Field order matters: the closure must go before the
/// thunk it points into.
struct Trampoline {
    _closure: Closure<'static>,
    _thunk: Box<HostThunk>,
}

// SAFETY: the closure's code and cif are immutable after construction, and
// the thunk it points at is Send + Sync.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

unsafe extern "C" fn host_block_entry(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    thunk: &HostThunk,
) {
    // Nothing may unwind into foreign frames.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| thunk.call(args)));
    let message = match outcome {
        Ok(Ok(ret)) => {
            match ret {
                Return::Void => {}
                Return::Register(bits) => *result = bits,
                Return::F32(v) => *(result as *mut u64 as *mut f32) = v,
                Return::F64(v) => *(result as *mut u64 as *mut f64) = v,
            }
            return;
        }
        Ok(Err(err)) => err.to_string(),
        Err(_) => "host function panicked".to_string(),
    };
    log::error!("host block {} failed: {}", thunk.signature, message);
    if thunk.signature.result() != ValueType::Void {
        *result = 0;
    }
    record_fault(message);
}

pub(super) fn expose(
    references: &Arc<ReferenceBridge>,
    signature: ClosureSignature,
    function: Box<HostFunction>,
) -> BridgeResult<RawRef> {
    let cif = block_cif(&signature);
    let thunk = Box::new(HostThunk { references: references.clone(), signature, function });
    // SAFETY: the thunk is boxed and stored next to the closure in the same
    // Trampoline, which drops the closure first.
    let userdata: &'static HostThunk = unsafe { &*(thunk.as_ref() as *const HostThunk) };
    let closure = Closure::new(cif, host_block_entry, userdata);
    let invoke = *closure.code_ptr() as *const c_void;
    log::debug!("exposing host function {} at {:p}", userdata.signature, invoke);

    let trampoline = Trampoline { _closure: closure, _thunk: thunk };
    Ok(references.runtime().make_block(invoke, Box::new(trampoline))?)
}

//! Closure Bridge: foreign blocks as typed host handles, and host functions
//! as foreign blocks.
//!
//! A block stays an opaque handle plus its recorded signature until it is
//! invoked. Calls go through libffi with the block pointer as the hidden
//! first argument, exactly as compiled block call sites do.

mod cif;
mod trampoline;

use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use libffi::middle::CodePtr;
use objbridge_foreign::{block, ForeignError, ForeignKind, RawRef};
use objbridge_layout::{ClosureSignature, ScalarKind, ValueType};

use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Scope;
use crate::reference::{BridgedHandle, Nullability, Ownership, ReferenceBridge};
use crate::value::{HostValue, ScalarValue};
use cif::{cached_block_cif, FfiArgValue};

pub use trampoline::HostFunction;

/// A foreign block with the signature its call site expects.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClosureHandle {
    handle: BridgedHandle,
    signature: Arc<ClosureSignature>,
}

impl ClosureHandle {
    pub fn new(handle: BridgedHandle, signature: Arc<ClosureSignature>) -> Self {
        ClosureHandle { handle, signature }
    }

    pub fn handle(&self) -> &BridgedHandle {
        &self.handle
    }

    pub fn signature(&self) -> &Arc<ClosureSignature> {
        &self.signature
    }

    pub fn arity(&self) -> usize {
        self.signature.arity()
    }

    pub fn is_null(&self) -> bool {
        self.handle.is_empty()
    }
}

impl fmt::Debug for ClosureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClosureHandle({:?}, {})", self.handle, self.signature)
    }
}

thread_local! {
    /// Set by a host trampoline that failed; checked by `invoke` after the call.
    static LAST_FAULT: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub(crate) fn record_fault(message: String) {
    LAST_FAULT.with(|fault| *fault.borrow_mut() = Some(message));
}

fn take_fault() -> Option<String> {
    LAST_FAULT.with(|fault| fault.borrow_mut().take())
}

#[derive(Clone)]
pub struct ClosureBridge {
    references: Arc<ReferenceBridge>,
}

impl ClosureBridge {
    pub fn new(references: Arc<ReferenceBridge>) -> Self {
        ClosureBridge { references }
    }

    pub fn references(&self) -> &Arc<ReferenceBridge> {
        &self.references
    }

    /// Wraps a foreign block. Null wraps to a null closure handle.
    pub fn wrap_foreign(
        &self,
        raw: RawRef,
        signature: Arc<ClosureSignature>,
        hint: Ownership,
        scope: &mut Scope<'_>,
    ) -> BridgeResult<ClosureHandle> {
        if !raw.is_null() {
            // SAFETY: non-null references handed to the bridge are live.
            let kind = unsafe { self.references.runtime().kind_of(raw) };
            if let Some(kind) = kind.filter(|kind| *kind != ForeignKind::Block) {
                return Err(ForeignError::WrongKind {
                    reference: raw,
                    actual: kind,
                    expected: "block",
                }
                .into());
            }
        }
        let handle = self.references.wrap(raw, hint, Nullability::Nullable, scope)?;
        Ok(ClosureHandle::new(handle, signature))
    }

    /// Calls a foreign block with host arguments.
    ///
    /// Object results come back +0 and are wrapped Borrowed in `scope`. A
    /// void result is `None`.
    pub fn invoke(
        &self,
        scope: &mut Scope<'_>,
        closure: &ClosureHandle,
        args: &[HostValue],
    ) -> BridgeResult<Option<HostValue>> {
        let signature = closure.signature.as_ref();
        check_arguments(signature, args)?;

        let block = self.references.raw(&closure.handle)?;
        if block.is_null() {
            return Err(BridgeError::Invocation("closure is null".to_string()));
        }
        // SAFETY: `block` resolved through a live handle.
        let invoke = unsafe {
            if let Some(kind) = self.references.runtime().kind_of(block) {
                if kind != ForeignKind::Block {
                    return Err(BridgeError::Invocation(format!("{:?} is a {:?}, not a block", block, kind)));
                }
            }
            block::invoke_ptr(block)
        };
        if invoke.is_null() {
            return Err(BridgeError::Invocation(format!("block {:?} has no invoke function", block)));
        }

        let mut storage = Vec::with_capacity(args.len() + 1);
        storage.push(FfiArgValue::Pointer(block.as_ptr()));
        for arg in args {
            let handle = match arg {
                HostValue::Scalar(value) => {
                    storage.push(FfiArgValue::from_scalar(*value));
                    continue;
                }
                HostValue::Object(handle) => handle,
                HostValue::Closure(closure) => closure.handle(),
                HostValue::Collection(collection) => collection.handle(),
            };
            storage.push(FfiArgValue::Pointer(self.references.unwrap_unretained(handle)?.as_ptr()));
        }
        let ffi_args = storage.iter().map(FfiArgValue::as_arg).collect::<Vec<_>>();
        let code = CodePtr(invoke as *mut c_void);
        let cif = cached_block_cif(signature);

        log::trace!("invoking block {:?} {}", block, signature);
        take_fault();
        // SAFETY: the interface matches the recorded signature, the arguments
        // were checked against it, and storage outlives the call.
        let result = unsafe {
            match signature.result() {
                ValueType::Void => {
                    cif.call::<()>(code, &ffi_args);
                    None
                }
                ValueType::Object => Some(RawResult::Pointer(cif.call::<*mut c_void>(code, &ffi_args))),
                ValueType::Scalar(ScalarKind::F32) => {
                    Some(RawResult::Scalar(ScalarValue::F32(cif.call::<f32>(code, &ffi_args))))
                }
                ValueType::Scalar(ScalarKind::F64) => {
                    Some(RawResult::Scalar(ScalarValue::F64(cif.call::<f64>(code, &ffi_args))))
                }
                // libffi widens small integer results to a full register.
                ValueType::Scalar(kind) => Some(RawResult::Scalar(ScalarValue::from_register(
                    kind,
                    cif.call::<u64>(code, &ffi_args),
                ))),
            }
        };
        if let Some(fault) = take_fault() {
            return Err(BridgeError::Invocation(fault));
        }

        match result {
            None => Ok(None),
            Some(RawResult::Scalar(value)) => Ok(Some(HostValue::Scalar(value))),
            Some(RawResult::Pointer(ptr)) => {
                let handle = scope.wrap(RawRef::from_ptr(ptr), Ownership::Borrowed, Nullability::Nullable)?;
                Ok(Some(HostValue::Object(handle)))
            }
        }
    }

    /// Exposes a host function to the foreign side as a block, returned +1.
    ///
    /// The block owns the trampoline; it is freed when the block's count
    /// reaches zero.
    pub fn expose_host_function<F>(&self, signature: ClosureSignature, function: F) -> BridgeResult<RawRef>
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> BridgeResult<Option<HostValue>> + Send + Sync + 'static,
    {
        trampoline::expose(&self.references, signature, Box::new(function))
    }

    /// [`ClosureBridge::expose_host_function`], adopted into an Owned handle.
    pub fn expose_host_closure<F>(&self, signature: ClosureSignature, function: F) -> BridgeResult<ClosureHandle>
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> BridgeResult<Option<HostValue>> + Send + Sync + 'static,
    {
        let signature = Arc::new(signature);
        let raw = trampoline::expose(&self.references, signature.as_ref().clone(), Box::new(function))?;
        let handle = self.references.adopt(raw, Nullability::NonNull)?;
        Ok(ClosureHandle::new(handle, signature))
    }
}

enum RawResult {
    Scalar(ScalarValue),
    Pointer(*mut c_void),
}

fn check_arguments(signature: &ClosureSignature, args: &[HostValue]) -> BridgeResult<()> {
    if args.len() != signature.arity() {
        return Err(BridgeError::SignatureMismatch {
            expected: signature.clone(),
            found: format!("called with {} arguments", args.len()),
        });
    }
    for (index, (param, arg)) in signature.params().iter().zip(args).enumerate() {
        let fits = match (param, arg) {
            (ValueType::Scalar(kind), HostValue::Scalar(value)) => value.kind() == *kind,
            (ValueType::Object, HostValue::Scalar(_)) => false,
            (ValueType::Object, _) => true,
            _ => false,
        };
        if !fits {
            return Err(BridgeError::SignatureMismatch {
                expected: signature.clone(),
                found: format!("argument {} is {}", index, arg.describe()),
            });
        }
    }
    Ok(())
}

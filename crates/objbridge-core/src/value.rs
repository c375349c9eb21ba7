use std::fmt;

use objbridge_layout::{FieldKind, ScalarKind, StructTypeId};

use crate::closure::ClosureHandle;
use crate::collection::CollectionHandle;
use crate::reference::BridgedHandle;

/// A plain C value, held in the host's representation.
#[derive(Clone, Copy, PartialEq)]
pub enum ScalarValue {
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
    Bool(bool),
    Pointer(usize),
}

macro_rules! ne_bytes {
    ($ty:ty, $bytes:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        buf.copy_from_slice($bytes);
        <$ty>::from_ne_bytes(buf)
    }};
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::I8(_) => ScalarKind::I8,
            ScalarValue::U8(_) => ScalarKind::U8,
            ScalarValue::I16(_) => ScalarKind::I16,
            ScalarValue::U16(_) => ScalarKind::U16,
            ScalarValue::I32(_) => ScalarKind::I32,
            ScalarValue::U32(_) => ScalarKind::U32,
            ScalarValue::I64(_) => ScalarKind::I64,
            ScalarValue::U64(_) => ScalarKind::U64,
            ScalarValue::F32(_) => ScalarKind::F32,
            ScalarValue::F64(_) => ScalarKind::F64,
            ScalarValue::Bool(_) => ScalarKind::Bool,
            ScalarValue::Pointer(_) => ScalarKind::Pointer,
        }
    }

    /// Decodes a native-endian value. `bytes` must be exactly `kind.size_bytes()` long.
    pub fn read(kind: ScalarKind, bytes: &[u8]) -> Self {
        match kind {
            ScalarKind::I8 => ScalarValue::I8(ne_bytes!(i8, bytes)),
            ScalarKind::U8 => ScalarValue::U8(bytes[0]),
            ScalarKind::I16 => ScalarValue::I16(ne_bytes!(i16, bytes)),
            ScalarKind::U16 => ScalarValue::U16(ne_bytes!(u16, bytes)),
            ScalarKind::I32 => ScalarValue::I32(ne_bytes!(i32, bytes)),
            ScalarKind::U32 => ScalarValue::U32(ne_bytes!(u32, bytes)),
            ScalarKind::I64 => ScalarValue::I64(ne_bytes!(i64, bytes)),
            ScalarKind::U64 => ScalarValue::U64(ne_bytes!(u64, bytes)),
            ScalarKind::F32 => ScalarValue::F32(ne_bytes!(f32, bytes)),
            ScalarKind::F64 => ScalarValue::F64(ne_bytes!(f64, bytes)),
            ScalarKind::Bool => ScalarValue::Bool(bytes[0] != 0),
            ScalarKind::Pointer => ScalarValue::Pointer(ne_bytes!(usize, bytes)),
        }
    }

    /// Encodes into `out`, which must be exactly `self.kind().size_bytes()` long.
    pub fn write(&self, out: &mut [u8]) {
        match *self {
            ScalarValue::I8(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::U8(v) => out.copy_from_slice(&[v]),
            ScalarValue::I16(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::U16(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::I32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::U32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::I64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::U64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::F32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::F64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Bool(v) => out.copy_from_slice(&[v as u8]),
            ScalarValue::Pointer(v) => out.copy_from_slice(&v.to_ne_bytes()),
        }
    }

    /// The value zero-extended (or sign-extended for signed kinds) into a
    /// 64-bit register image, the way C widens small integer returns.
    pub(crate) fn to_register(self) -> u64 {
        match self {
            ScalarValue::I8(v) => v as i64 as u64,
            ScalarValue::U8(v) => v as u64,
            ScalarValue::I16(v) => v as i64 as u64,
            ScalarValue::U16(v) => v as u64,
            ScalarValue::I32(v) => v as i64 as u64,
            ScalarValue::U32(v) => v as u64,
            ScalarValue::I64(v) => v as u64,
            ScalarValue::U64(v) => v,
            ScalarValue::F32(v) => v.to_bits() as u64,
            ScalarValue::F64(v) => v.to_bits(),
            ScalarValue::Bool(v) => v as u64,
            ScalarValue::Pointer(v) => v as u64,
        }
    }

    /// Inverse of [`ScalarValue::to_register`] for integer kinds.
    pub(crate) fn from_register(kind: ScalarKind, bits: u64) -> Self {
        match kind {
            ScalarKind::I8 => ScalarValue::I8(bits as i8),
            ScalarKind::U8 => ScalarValue::U8(bits as u8),
            ScalarKind::I16 => ScalarValue::I16(bits as i16),
            ScalarKind::U16 => ScalarValue::U16(bits as u16),
            ScalarKind::I32 => ScalarValue::I32(bits as i32),
            ScalarKind::U32 => ScalarValue::U32(bits as u32),
            ScalarKind::I64 => ScalarValue::I64(bits as i64),
            ScalarKind::U64 => ScalarValue::U64(bits),
            ScalarKind::F32 => ScalarValue::F32(f32::from_bits(bits as u32)),
            ScalarKind::F64 => ScalarValue::F64(f64::from_bits(bits)),
            ScalarKind::Bool => ScalarValue::Bool(bits as u8 != 0),
            ScalarKind::Pointer => ScalarValue::Pointer(bits as usize),
        }
    }
}

impl fmt::Debug for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::I8(v) => write!(f, "{}i8", v),
            ScalarValue::U8(v) => write!(f, "{}u8", v),
            ScalarValue::I16(v) => write!(f, "{}i16", v),
            ScalarValue::U16(v) => write!(f, "{}u16", v),
            ScalarValue::I32(v) => write!(f, "{}i32", v),
            ScalarValue::U32(v) => write!(f, "{}u32", v),
            ScalarValue::I64(v) => write!(f, "{}i64", v),
            ScalarValue::U64(v) => write!(f, "{}u64", v),
            ScalarValue::F32(v) => write!(f, "{}f32", v),
            ScalarValue::F64(v) => write!(f, "{}f64", v),
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Pointer(v) => write!(f, "{:#x}", v),
        }
    }
}

/// A field or argument value on the host side.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Scalar(ScalarValue),
    Object(BridgedHandle),
    Closure(ClosureHandle),
    Collection(CollectionHandle),
}

impl HostValue {
    /// The handle behind any reference-carrying value.
    pub fn handle(&self) -> Option<&BridgedHandle> {
        match self {
            HostValue::Scalar(_) => None,
            HostValue::Object(handle) => Some(handle),
            HostValue::Closure(closure) => Some(closure.handle()),
            HostValue::Collection(collection) => Some(collection.handle()),
        }
    }

    /// Short description used in mismatch errors.
    pub fn describe(&self) -> String {
        match self {
            HostValue::Scalar(value) => value.kind().to_string(),
            HostValue::Object(_) => "object".to_string(),
            HostValue::Closure(closure) => format!("closure {}", closure.signature()),
            HostValue::Collection(collection) => collection.kind().to_string(),
        }
    }

    /// Checks that this value can be stored in a field of `kind`.
    pub(crate) fn check_kind(&self, kind: &FieldKind) -> Result<(), String> {
        let fits = match (kind, self) {
            (FieldKind::Scalar(expected), HostValue::Scalar(value)) => value.kind() == *expected,
            (FieldKind::ObjectRef | FieldKind::NullableObjectRef, HostValue::Object(_)) => true,
            (FieldKind::ClosureRef(expected), HostValue::Closure(closure)) => **expected == **closure.signature(),
            (FieldKind::CollectionRef(expected), HostValue::Collection(collection)) => *expected == collection.kind(),
            _ => false,
        };
        if fits {
            Ok(())
        } else {
            Err(format!("expected {}, found {}", kind, self.describe()))
        }
    }
}

impl From<ScalarValue> for HostValue {
    fn from(value: ScalarValue) -> Self {
        HostValue::Scalar(value)
    }
}

impl From<BridgedHandle> for HostValue {
    fn from(handle: BridgedHandle) -> Self {
        HostValue::Object(handle)
    }
}

impl From<ClosureHandle> for HostValue {
    fn from(closure: ClosureHandle) -> Self {
        HostValue::Closure(closure)
    }
}

impl From<CollectionHandle> for HostValue {
    fn from(collection: CollectionHandle) -> Self {
        HostValue::Collection(collection)
    }
}

/// A struct read into (or about to be written from) the host.
///
/// Fields keep the order they were read or inserted in. Names are unique;
/// [`HostStruct::set`] replaces an existing field of the same name.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStruct {
    type_id: StructTypeId,
    fields: Vec<(String, HostValue)>,
}

impl HostStruct {
    pub fn new(type_id: impl Into<StructTypeId>) -> Self {
        HostStruct { type_id: type_id.into(), fields: Vec::new() }
    }

    pub(crate) fn with_capacity(type_id: StructTypeId, capacity: usize) -> Self {
        HostStruct { type_id, fields: Vec::with_capacity(capacity) }
    }

    /// Builder form of [`HostStruct::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<HostValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<HostValue> {
        let index = self.fields.iter().position(|(existing, _)| existing == name)?;
        Some(self.fields.remove(index).1)
    }

    pub fn type_id(&self) -> &StructTypeId {
        &self.type_id
    }

    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.fields.iter().find(|(existing, _)| existing == name).map(|(_, value)| value)
    }

    pub fn fields(&self) -> &[(String, HostValue)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn scalar(&self, name: &str) -> Option<ScalarValue> {
        match self.get(name)? {
            HostValue::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn object(&self, name: &str) -> Option<&BridgedHandle> {
        match self.get(name)? {
            HostValue::Object(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn closure(&self, name: &str) -> Option<&ClosureHandle> {
        match self.get(name)? {
            HostValue::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionHandle> {
        match self.get(name)? {
            HostValue::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    pub(crate) fn push(&mut self, name: String, value: HostValue) {
        self.fields.push((name, value));
    }
}

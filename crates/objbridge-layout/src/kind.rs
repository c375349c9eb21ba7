use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::Arc;

use crate::LayoutError;

/// Plain C value types that are copied byte-for-byte between struct memory
/// and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// C `_Bool`, one byte.
    Bool,
    /// An untyped C pointer that the bridge does not reference count.
    Pointer,
}

impl ScalarKind {
    pub fn size_bytes(self) -> usize {
        match self {
            ScalarKind::I8 | ScalarKind::U8 | ScalarKind::Bool => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
            ScalarKind::Pointer => mem::size_of::<usize>(),
        }
    }

    /// Alignment of the scalar as a struct member on the host. Not always the
    /// size: i686 places 8-byte integers and doubles on 4-byte boundaries.
    pub fn align_bytes(self) -> usize {
        match self {
            ScalarKind::I8 | ScalarKind::U8 | ScalarKind::Bool => 1,
            ScalarKind::I16 | ScalarKind::U16 => mem::align_of::<u16>(),
            ScalarKind::I32 | ScalarKind::U32 => mem::align_of::<u32>(),
            ScalarKind::F32 => mem::align_of::<f32>(),
            ScalarKind::I64 | ScalarKind::U64 => mem::align_of::<u64>(),
            ScalarKind::F64 => mem::align_of::<f64>(),
            ScalarKind::Pointer => mem::align_of::<usize>(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::I8 => "i8",
            ScalarKind::U8 => "u8",
            ScalarKind::I16 => "i16",
            ScalarKind::U16 => "u16",
            ScalarKind::I32 => "i32",
            ScalarKind::U32 => "u32",
            ScalarKind::I64 => "i64",
            ScalarKind::U64 => "u64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::Bool => "bool",
            ScalarKind::Pointer => "pointer",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarKind {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "i8" => ScalarKind::I8,
            "u8" => ScalarKind::U8,
            "i16" => ScalarKind::I16,
            "u16" => ScalarKind::U16,
            "i32" => ScalarKind::I32,
            "u32" => ScalarKind::U32,
            "i64" => ScalarKind::I64,
            "u64" => ScalarKind::U64,
            "f32" => ScalarKind::F32,
            "f64" => ScalarKind::F64,
            "bool" => ScalarKind::Bool,
            "pointer" => ScalarKind::Pointer,
            other => return Err(LayoutError::UnknownKind(other.to_string())),
        })
    }
}

/// The foreign collection classes that are bridged as opaque handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Array,
    MutableArray,
    Set,
    Dictionary,
}

impl CollectionKind {
    pub fn name(self) -> &'static str {
        match self {
            CollectionKind::Array => "array",
            CollectionKind::MutableArray => "mutable-array",
            CollectionKind::Set => "set",
            CollectionKind::Dictionary => "dictionary",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value crossing a closure boundary: an argument or a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Only valid as a result type.
    Void,
    Scalar(ScalarKind),
    /// Any foreign object reference, passed as a pointer.
    Object,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Void => f.write_str("void"),
            ValueType::Scalar(kind) => write!(f, "{}", kind),
            ValueType::Object => f.write_str("object"),
        }
    }
}

impl FromStr for ValueType {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "void" => Ok(ValueType::Void),
            "object" => Ok(ValueType::Object),
            other => other.parse().map(ValueType::Scalar),
        }
    }
}

/// Shape of a foreign closure: what the call trampoline must marshal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClosureSignature {
    params: Vec<ValueType>,
    result: ValueType,
}

impl ClosureSignature {
    pub fn new(params: Vec<ValueType>, result: ValueType) -> Result<Self, LayoutError> {
        if params.iter().any(|p| *p == ValueType::Void) {
            return Err(LayoutError::VoidParameter);
        }
        Ok(ClosureSignature { params, result })
    }

    /// `int (^)(void)` and friends.
    pub fn nullary(result: ValueType) -> Self {
        ClosureSignature { params: Vec::new(), result }
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn result(&self) -> ValueType {
        self.result
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for ClosureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.result)
    }
}

/// How a struct field is bridged.
///
/// Pointer-typed members are split by what the bridge has to do with them:
/// plain objects must be non-null, nullable objects read back as the empty
/// handle, closures carry the signature their trampoline needs, and
/// collections keep their class so element access can be typed later.
/// Closure and collection fields accept null.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Scalar(ScalarKind),
    ObjectRef,
    NullableObjectRef,
    ClosureRef(Arc<ClosureSignature>),
    CollectionRef(CollectionKind),
}

impl FieldKind {
    pub fn size_bytes(&self) -> usize {
        match self {
            FieldKind::Scalar(kind) => kind.size_bytes(),
            _ => mem::size_of::<usize>(),
        }
    }

    pub fn align_bytes(&self) -> usize {
        match self {
            FieldKind::Scalar(kind) => kind.align_bytes(),
            _ => mem::align_of::<usize>(),
        }
    }

    /// True for every kind whose bytes hold a foreign reference.
    pub fn is_reference(&self) -> bool {
        !matches!(self, FieldKind::Scalar(_))
    }

    pub fn is_nullable(&self) -> bool {
        !matches!(self, FieldKind::ObjectRef | FieldKind::Scalar(_))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Scalar(kind) => write!(f, "{}", kind),
            FieldKind::ObjectRef => f.write_str("object"),
            FieldKind::NullableObjectRef => f.write_str("nullable-object"),
            FieldKind::ClosureRef(sig) => write!(f, "closure {}", sig),
            FieldKind::CollectionRef(kind) => write!(f, "{}", kind),
        }
    }
}

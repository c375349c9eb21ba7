use objbridge_foreign::{ForeignError, RawRef};
use objbridge_layout::{ClosureSignature, LayoutError, StructTypeId};
use thiserror::Error;

/// Errors surfaced by the bridge. None of them is transient; nothing is retried.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No layout registered for struct type `{0}`")]
    UnknownType(StructTypeId),

    #[error("Field `{field}` is non-nullable but holds null")]
    UnexpectedNull { field: String },

    #[error("Handle for {raw:?} was already released")]
    DoubleRelease { raw: RawRef },

    #[error("Handle for {raw:?} is no longer valid (released or its scope has ended)")]
    StaleHandle { raw: RawRef },

    #[error("Handle for {raw:?} is borrowed; only owned handles can be released explicitly")]
    NotOwned { raw: RawRef },

    #[error("Closure signature mismatch: expected {expected}, {found}")]
    SignatureMismatch { expected: ClosureSignature, found: String },

    #[error("Closure invocation failed: {0}")]
    Invocation(String),

    #[error("Value does not match the layout of `{type_id}`: {reason}")]
    LayoutMismatch { type_id: StructTypeId, reason: String },

    #[error("Struct `{type_id}` needs {needed} bytes but the memory region has {available}")]
    OutOfBounds {
        type_id: StructTypeId,
        needed: usize,
        available: usize,
    },

    #[error("Scope was opened on a different bridge")]
    ForeignScope,

    #[error("The live handle registry is full")]
    RegistryFull,

    #[error("Failed to start the reclaimer thread")]
    ReclaimerSpawn(#[source] std::io::Error),

    #[error("Foreign runtime error: {0}")]
    Foreign(#[from] ForeignError),

    #[error("Layout error: {0}")]
    Layout(LayoutError),
}

impl From<LayoutError> for BridgeError {
    fn from(error: LayoutError) -> Self {
        match error {
            LayoutError::UnknownType(type_id) => BridgeError::UnknownType(type_id),
            other => BridgeError::Layout(other),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

//! Field descriptor tables for C structs whose members reference foreign
//! objects.
//!
//! A [`StructLayout`] says where each member lives and how it must be bridged
//! ([`FieldKind`]); a [`LayoutTable`] maps struct types to their layouts.
//! Layouts come either from header-derived metadata ([`metadata`]) or from the
//! C-ABI computation in [`LayoutComputer`].

use thiserror::Error;

mod computer;
mod descriptor;
mod kind;
pub mod metadata;
mod table;

pub use computer::LayoutComputer;
pub use descriptor::{FieldDescriptor, StructLayout, StructTypeId};
pub use kind::{ClosureSignature, CollectionKind, FieldKind, ScalarKind, ValueType};
pub use table::LayoutTable;

/// Errors that can occur while building or querying layouts.
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("No layout registered for struct type `{0}`")]
    UnknownType(StructTypeId),

    #[error("Struct type `{0}` is already registered")]
    DuplicateType(StructTypeId),

    #[error("Invalid layout for `{type_id}`: {reason}")]
    InvalidLayout { type_id: StructTypeId, reason: String },

    #[error("Unknown field kind `{0}`")]
    UnknownKind(String),

    #[error("`void` can only be used as a closure result type")]
    VoidParameter,

    #[error("Layout computation failed: {0}")]
    RepcError(#[from] repc::Error),

    #[error("The host target is not known to the layout engine")]
    UnsupportedHost,

    #[error("Malformed struct metadata: {0}")]
    Metadata(#[from] toml::de::Error),

    #[error("Other layout error: {0}")]
    Other(String),
}

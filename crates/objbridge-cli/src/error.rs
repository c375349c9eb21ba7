use miette::Diagnostic;
use objbridge_core::{BridgeError, ConfigError};
use objbridge_layout::{LayoutError, StructTypeId};
use thiserror::Error;

/// CLI-specific error type that provides rich diagnostics
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error("Layout error: {source}")]
    #[diagnostic(code(objbridge::cli::layout))]
    Layout {
        #[from]
        source: LayoutError,
    },

    #[error("No struct named `{name}` in the project")]
    #[diagnostic(code(objbridge::cli::unknown_type), help("declared structs: {known}"))]
    UnknownType { name: String, known: String },

    #[error("Bridge error: {source}")]
    #[diagnostic(code(objbridge::cli::bridge))]
    Bridge {
        #[from]
        source: BridgeError,
    },

    #[error("{count} declared layout value(s) disagree with the C layout")]
    #[diagnostic(
        code(objbridge::cli::check),
        help("remove the explicit offsets to let objbridge compute them, or regenerate the metadata")
    )]
    LayoutDisagreement { count: usize },

    #[error("Round trip of `{type_id}` failed: {reason}")]
    #[diagnostic(code(objbridge::cli::roundtrip))]
    RoundTrip { type_id: StructTypeId, reason: String },
}

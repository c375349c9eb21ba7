//! Project configuration: bridge settings plus the struct metadata.
//!
//! ```toml
//! [bridge]
//! finalizer = "manual"
//!
//! [[struct]]
//! name = "Pair"
//! [[struct.field]]
//! name = "first"
//! kind = "object"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use miette::{Diagnostic, SourceSpan};
use objbridge_layout::metadata::{build_table, StructMetadata};
use objbridge_layout::{LayoutError, LayoutTable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How releases queued by dropped [`OwnedRef`](crate::OwnedRef)s are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizerMode {
    /// A background thread drains the queue as handles arrive.
    #[default]
    Thread,
    /// The host calls [`Bridge::reclaim`](crate::Bridge::reclaim) itself.
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub finalizer: FinalizerMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default, rename = "struct")]
    pub structs: Vec<StructMetadata>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read project file {path}")]
    #[diagnostic(code(objbridge::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid project file: {message}")]
    #[diagnostic(
        code(objbridge::config::parse),
        help("Struct metadata lives in [[struct]] tables with one [[struct.field]] per member")
    )]
    Parse {
        #[source_code]
        src: String,
        #[label("here")]
        span: Option<SourceSpan>,
        message: String,
    },

    #[error("Invalid struct layout: {0}")]
    #[diagnostic(code(objbridge::config::layout))]
    Layout(#[from] LayoutError),
}

impl ProjectConfig {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|err| ConfigError::Parse {
            src: source.to_string(),
            span: err.span().map(SourceSpan::from),
            message: err.message().to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config = Self::from_toml(&source)?;
        log::debug!("loaded {} with {} struct(s)", path.display(), config.structs.len());
        Ok(config)
    }

    /// Validates every struct and builds the descriptor table.
    pub fn layout_table(&self) -> Result<LayoutTable, ConfigError> {
        Ok(build_table(&self.structs)?)
    }
}

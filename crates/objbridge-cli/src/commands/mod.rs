pub mod check;
pub mod describe;
pub mod roundtrip;

use std::path::Path;
use std::sync::Arc;

use objbridge_core::ProjectConfig;
use objbridge_layout::{LayoutError, LayoutTable, StructLayout};

use crate::error::CliError;

pub(crate) fn load_project(path: &Path) -> Result<(ProjectConfig, LayoutTable), CliError> {
    let project = ProjectConfig::load(path)?;
    let table = project.layout_table()?;
    log::info!("loaded {} struct layout(s) from {}", table.len(), path.display());
    Ok((project, table))
}

/// Looks `name` up, listing the declared structs when it isn't there.
pub(crate) fn find_layout(table: &LayoutTable, name: &str) -> Result<Arc<StructLayout>, CliError> {
    match table.describe_named(name) {
        Ok(layout) => Ok(layout),
        Err(LayoutError::UnknownType(_)) => {
            let known: Vec<String> = table.layouts().iter().map(|l| l.type_id().to_string()).collect();
            Err(CliError::UnknownType { name: name.to_string(), known: known.join(", ") })
        }
        Err(err) => Err(err.into()),
    }
}

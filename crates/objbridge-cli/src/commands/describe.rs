use std::fmt::Write;
use std::path::Path;

use objbridge_layout::StructLayout;

use super::{find_layout, load_project};
use crate::error::CliError;

pub fn handle_describe(project: &Path, type_name: Option<&str>) -> Result<(), CliError> {
    let (_, table) = load_project(project)?;
    let layouts = match type_name {
        Some(name) => vec![find_layout(&table, name)?],
        None => table.layouts(),
    };
    for layout in layouts {
        print!("{}", render_layout(&layout));
    }
    Ok(())
}

/// One header line, then one line per field in declaration order.
pub(crate) fn render_layout(layout: &StructLayout) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} (size {}, align {})", layout.type_id(), layout.size(), layout.align());
    for field in layout.fields() {
        let _ = writeln!(
            out,
            "  {:>4} {:>3}  {}: {}",
            format!("+{}", field.byte_offset),
            field.byte_size,
            field.name,
            field.kind
        );
    }
    out
}

use std::fmt;
use std::path::Path;

use objbridge_core::ProjectConfig;
use objbridge_layout::metadata::StructMetadata;
use objbridge_layout::{LayoutComputer, LayoutError, StructTypeId};

use crate::error::CliError;

/// A declared value that differs from what the C rules produce.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Disagreement {
    type_id: StructTypeId,
    what: String,
    declared: usize,
    computed: usize,
}

impl fmt::Display for Disagreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} is declared as {} but the C layout gives {}",
            self.type_id, self.what, self.declared, self.computed
        )
    }
}

pub fn handle_check(project: &Path) -> Result<(), CliError> {
    let config = ProjectConfig::load(project)?;
    let computer = LayoutComputer::host()?;
    let disagreements = cross_check(&config.structs, &computer)?;
    for disagreement in &disagreements {
        println!("{}", disagreement);
    }
    if !disagreements.is_empty() {
        return Err(CliError::LayoutDisagreement { count: disagreements.len() });
    }

    let table = config.layout_table()?;
    println!("{}: {} layout(s) ok", project.display(), table.len());
    Ok(())
}

/// Recomputes every struct from its field kinds and compares the result with
/// whatever offsets, sizes and alignment the metadata declares.
pub(crate) fn cross_check(
    structs: &[StructMetadata],
    computer: &LayoutComputer,
) -> Result<Vec<Disagreement>, LayoutError> {
    let mut found = Vec::new();
    for metadata in structs {
        let type_id = StructTypeId::new(&metadata.name);
        let kinds = metadata
            .fields
            .iter()
            .map(|f| Ok((f.name.clone(), f.field_kind()?)))
            .collect::<Result<Vec<_>, LayoutError>>()?;
        let computed = computer.compute(type_id.clone(), &kinds)?;
        log::debug!("{} computes to {} bytes", type_id, computed.size());

        let mut compare = |what: String, declared: Option<usize>, computed: usize| {
            if let Some(declared) = declared.filter(|d| *d != computed) {
                found.push(Disagreement { type_id: type_id.clone(), what, declared, computed });
            }
        };
        for (field, descriptor) in metadata.fields.iter().zip(computed.fields()) {
            compare(format!("offset of `{}`", field.name), field.offset, descriptor.byte_offset);
            compare(format!("size of `{}`", field.name), field.size, descriptor.byte_size);
        }
        compare("struct size".to_string(), metadata.size, computed.size());
        compare("struct alignment".to_string(), metadata.align, computed.align());
    }
    Ok(found)
}

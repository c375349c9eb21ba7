//! Header-derived struct metadata as it arrives from the codegen step.
//!
//! A field either carries its `offset` (and optionally `size`) as emitted by
//! the header tool, or omits them and lets [`LayoutComputer`] lay the struct
//! out for the host ABI. Mixing both within one struct is rejected.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::computer::LayoutComputer;
use crate::descriptor::{FieldDescriptor, StructLayout, StructTypeId};
use crate::kind::{ClosureSignature, CollectionKind, FieldKind, ValueType};
use crate::table::LayoutTable;
use crate::LayoutError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructMetadata {
    /// C tag name of the struct.
    pub name: String,

    /// Total size in bytes. Required when offsets are given.
    #[serde(default)]
    pub size: Option<usize>,

    /// Alignment in bytes. Defaults to the largest field alignment.
    #[serde(default)]
    pub align: Option<usize>,

    #[serde(default, rename = "field")]
    pub fields: Vec<FieldMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,

    /// `object`, `nullable-object`, `closure`, `array`, `mutable-array`,
    /// `set`, `dictionary`, or a scalar name such as `i32`.
    pub kind: String,

    #[serde(default)]
    pub offset: Option<usize>,

    #[serde(default)]
    pub size: Option<usize>,

    /// Closure parameter types.
    #[serde(default)]
    pub params: Vec<String>,

    /// Closure result type.
    #[serde(default)]
    pub result: Option<String>,
}

impl FieldMetadata {
    pub fn field_kind(&self) -> Result<FieldKind, LayoutError> {
        Ok(match self.kind.as_str() {
            "object" => FieldKind::ObjectRef,
            "nullable-object" => FieldKind::NullableObjectRef,
            "array" => FieldKind::CollectionRef(CollectionKind::Array),
            "mutable-array" => FieldKind::CollectionRef(CollectionKind::MutableArray),
            "set" => FieldKind::CollectionRef(CollectionKind::Set),
            "dictionary" => FieldKind::CollectionRef(CollectionKind::Dictionary),
            "closure" => {
                let params = self
                    .params
                    .iter()
                    .map(|p| p.parse::<ValueType>())
                    .collect::<Result<Vec<_>, _>>()?;
                let result = match &self.result {
                    Some(result) => result.parse()?,
                    None => ValueType::Void,
                };
                FieldKind::ClosureRef(Arc::new(ClosureSignature::new(params, result)?))
            }
            scalar => FieldKind::Scalar(scalar.parse()?),
        })
    }
}

impl StructMetadata {
    /// Turns the metadata into a validated layout, computing offsets when the
    /// metadata doesn't carry them.
    pub fn to_layout(&self, computer: &LayoutComputer) -> Result<StructLayout, LayoutError> {
        let type_id = StructTypeId::new(&self.name);
        let with_offsets = self.fields.iter().filter(|f| f.offset.is_some()).count();

        if with_offsets == 0 {
            let fields = self
                .fields
                .iter()
                .map(|f| Ok((f.name.clone(), f.field_kind()?)))
                .collect::<Result<Vec<_>, LayoutError>>()?;
            let computed = computer.compute(type_id.clone(), &fields)?;
            if let Some(size) = self.size {
                if size != computed.size() {
                    return Err(LayoutError::InvalidLayout {
                        type_id,
                        reason: format!("declared size {} but the C layout is {} bytes", size, computed.size()),
                    });
                }
            }
            return Ok(computed);
        }

        if with_offsets != self.fields.len() {
            return Err(LayoutError::InvalidLayout {
                type_id,
                reason: "either every field or no field must declare an offset".to_string(),
            });
        }

        let mut descriptors = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let kind = field.field_kind()?;
            descriptors.push(FieldDescriptor {
                name: field.name.clone(),
                byte_offset: field.offset.unwrap_or_default(),
                byte_size: field.size.unwrap_or_else(|| kind.size_bytes()),
                byte_align: kind.align_bytes(),
                kind,
            });
        }
        let align = self.align.unwrap_or_else(|| {
            descriptors
                .iter()
                .map(|d| d.byte_align)
                .max()
                .unwrap_or(1)
        });
        let size = self.size.ok_or_else(|| LayoutError::InvalidLayout {
            type_id: type_id.clone(),
            reason: "metadata with explicit offsets must declare the struct size".to_string(),
        })?;
        StructLayout::new(type_id, descriptors, size, align)
    }
}

/// Builds a table from a list of struct descriptions.
pub fn build_table(structs: &[StructMetadata]) -> Result<LayoutTable, LayoutError> {
    let computer = LayoutComputer::host()?;
    let mut table = LayoutTable::new();
    for metadata in structs {
        table.register(metadata.to_layout(&computer)?)?;
    }
    Ok(table)
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    #[serde(default, rename = "struct")]
    structs: Vec<StructMetadata>,
}

/// Parses `[[struct]]` tables out of a TOML document. Other top-level tables
/// are ignored so the metadata can live next to other configuration.
pub fn parse_structs(source: &str) -> Result<Vec<StructMetadata>, LayoutError> {
    let file: MetadataFile = toml::from_str(source)?;
    Ok(file.structs)
}

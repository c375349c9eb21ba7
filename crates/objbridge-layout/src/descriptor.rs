use std::fmt;
use std::sync::Arc;

use crate::kind::FieldKind;
use crate::LayoutError;

/// Identifies a struct type by its C tag name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructTypeId(Arc<str>);

impl StructTypeId {
    pub fn new(name: &str) -> Self {
        StructTypeId(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StructTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StructTypeId {
    fn from(name: &str) -> Self {
        StructTypeId::new(name)
    }
}

/// One member of a C struct: where it lives and how it is bridged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub byte_offset: usize,
    pub byte_size: usize,
    /// Alignment the field needs inside the struct.
    pub byte_align: usize,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    /// A descriptor whose size and alignment are implied by its kind.
    pub fn new(name: impl Into<String>, byte_offset: usize, kind: FieldKind) -> Self {
        FieldDescriptor {
            name: name.into(),
            byte_offset,
            byte_size: kind.size_bytes(),
            byte_align: kind.align_bytes(),
            kind,
        }
    }

    pub fn end(&self) -> usize {
        self.byte_offset + self.byte_size
    }
}

/// Byte-level arrangement of a C struct.
///
/// Only constructible through [`StructLayout::new`], which checks that fields
/// are ordered, aligned, non-overlapping and fit inside `size`. Once built it
/// is immutable and shared read-only across marshalling calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    type_id: StructTypeId,
    fields: Box<[FieldDescriptor]>,
    size: usize,
    align: usize,
}

impl StructLayout {
    pub fn new(
        type_id: StructTypeId,
        fields: Vec<FieldDescriptor>,
        size: usize,
        align: usize,
    ) -> Result<Self, LayoutError> {
        let invalid = |reason: String| LayoutError::InvalidLayout {
            type_id: type_id.clone(),
            reason,
        };

        if align == 0 || !align.is_power_of_two() {
            return Err(invalid(format!("alignment {} is not a power of two", align)));
        }

        let mut previous_end = 0usize;
        let mut previous_offset = 0usize;
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("field `{}` is declared twice", field.name)));
            }
            if field.byte_size != field.kind.size_bytes() {
                return Err(invalid(format!(
                    "field `{}` is {} bytes but a {} is {} bytes",
                    field.name,
                    field.byte_size,
                    field.kind,
                    field.kind.size_bytes()
                )));
            }
            if field.byte_offset < previous_offset {
                return Err(invalid(format!(
                    "field `{}` at offset {} precedes the previous field",
                    field.name, field.byte_offset
                )));
            }
            if field.byte_offset < previous_end {
                return Err(invalid(format!(
                    "field `{}` at offset {} overlaps the previous field",
                    field.name, field.byte_offset
                )));
            }
            if field.byte_align == 0 || !field.byte_align.is_power_of_two() {
                return Err(invalid(format!(
                    "field `{}` has alignment {}, not a power of two",
                    field.name, field.byte_align
                )));
            }
            if field.byte_offset % field.byte_align != 0 {
                return Err(invalid(format!(
                    "field `{}` at offset {} is not {}-byte aligned",
                    field.name, field.byte_offset, field.byte_align
                )));
            }
            if field.end() > size {
                return Err(invalid(format!(
                    "field `{}` ends at byte {} past the struct size {}",
                    field.name,
                    field.end(),
                    size
                )));
            }
            previous_offset = field.byte_offset;
            previous_end = field.end();
        }

        Ok(StructLayout {
            type_id,
            fields: fields.into_boxed_slice(),
            size,
            align,
        })
    }

    pub fn type_id(&self) -> &StructTypeId {
        &self.type_id
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Offsets of every field holding a foreign reference.
    pub fn reference_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .filter(|f| f.kind.is_reference())
            .map(|f| f.byte_offset)
    }
}

impl fmt::Display for StructLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "struct {} (size {}, align {})", self.type_id, self.size, self.align)?;
        for field in self.fields.iter() {
            writeln!(
                f,
                "  {:>4} +{:<2} {:<16} {}",
                field.byte_offset, field.byte_size, field.name, field.kind
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{CollectionKind, ScalarKind};

    fn id() -> StructTypeId {
        StructTypeId::new("S")
    }

    #[test]
    fn rejects_overlapping_fields() {
        let fields = vec![
            FieldDescriptor::new("a", 0, FieldKind::ObjectRef),
            FieldDescriptor::new("b", 4, FieldKind::Scalar(ScalarKind::I32)),
        ];
        let err = StructLayout::new(id(), fields, 16, 8).unwrap_err();
        assert!(err.to_string().contains("overlaps"), "{}", err);
    }

    #[test]
    fn rejects_fields_past_the_end() {
        let fields = vec![FieldDescriptor::new("a", 8, FieldKind::CollectionRef(CollectionKind::Array))];
        assert!(StructLayout::new(id(), fields, 8, 8).is_err());
    }

    #[test]
    fn rejects_misaligned_and_unordered_fields() {
        let misaligned = vec![FieldDescriptor::new("a", 2, FieldKind::Scalar(ScalarKind::I32))];
        assert!(StructLayout::new(id(), misaligned, 8, 4).is_err());

        let unordered = vec![
            FieldDescriptor::new("a", 8, FieldKind::ObjectRef),
            FieldDescriptor::new("b", 0, FieldKind::ObjectRef),
        ];
        assert!(StructLayout::new(id(), unordered, 16, 8).is_err());
    }

    #[test]
    fn keeps_padding_outside_fields() {
        let fields = vec![
            FieldDescriptor::new("flag", 0, FieldKind::Scalar(ScalarKind::Bool)),
            FieldDescriptor::new("obj", 8, FieldKind::ObjectRef),
        ];
        let layout = StructLayout::new(id(), fields, 16, 8).unwrap();
        assert_eq!(layout.reference_offsets().collect::<Vec<_>>(), vec![8]);
        assert_eq!(layout.field("obj").unwrap().end(), 16);
    }

    #[test]
    fn field_alignment_can_be_smaller_than_its_size() {
        // `struct { int a; double b; }` on i686.
        let mut ratio = FieldDescriptor::new("b", 4, FieldKind::Scalar(ScalarKind::F64));
        ratio.byte_align = 4;
        let fields = vec![FieldDescriptor::new("a", 0, FieldKind::Scalar(ScalarKind::I32)), ratio];
        let layout = StructLayout::new(id(), fields, 12, 4).unwrap();
        assert_eq!(layout.field("b").unwrap().byte_offset, 4);

        let mut odd = FieldDescriptor::new("c", 0, FieldKind::Scalar(ScalarKind::I32));
        odd.byte_align = 3;
        assert!(StructLayout::new(id(), vec![odd], 4, 4).is_err());
    }
}

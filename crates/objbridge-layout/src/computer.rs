use repc::layout::{BuiltinType, Record, RecordField, RecordKind, Type, TypeVariant};
use repc::Target;

use crate::descriptor::{FieldDescriptor, StructLayout, StructTypeId};
use crate::kind::{FieldKind, ScalarKind};
use crate::LayoutError;

/// Computes C-compatible struct layouts with `repc`.
///
/// Header-derived metadata usually arrives with offsets already filled in; this
/// is used when it doesn't, and by `check` to cross-validate metadata that does.
pub struct LayoutComputer {
    target: Target,
}

impl LayoutComputer {
    /// A computer for the host ABI, the only ABI raw struct memory is read in.
    pub fn host() -> Result<Self, LayoutError> {
        let target = repc::HOST_TARGET.ok_or(LayoutError::UnsupportedHost)?;
        Ok(LayoutComputer { target })
    }

    /// Lays out `fields` in declaration order following the C struct rules.
    pub fn compute(
        &self,
        type_id: StructTypeId,
        fields: &[(String, FieldKind)],
    ) -> Result<StructLayout, LayoutError> {
        let record_fields = fields
            .iter()
            .map(|(_, kind)| RecordField {
                layout: None, // Filled in by repc
                annotations: vec![],
                named: true,
                bit_width: None,
                ty: repc_type(kind),
            })
            .collect();

        let struct_type = Type {
            layout: (),
            annotations: vec![],
            variant: TypeVariant::Record(Record {
                kind: RecordKind::Struct,
                fields: record_fields,
            }),
        };

        let computed = repc::compute_layout(self.target, &struct_type)?;

        let record = match computed.variant {
            TypeVariant::Record(record) => record,
            _ => return Err(LayoutError::Other("Expected record type".to_string())),
        };

        let mut descriptors = Vec::with_capacity(fields.len());
        for ((name, kind), field) in fields.iter().zip(record.fields.iter()) {
            let field_layout = field
                .layout
                .ok_or_else(|| LayoutError::Other(format!("repc left field `{}` without a layout", name)))?;
            descriptors.push(FieldDescriptor {
                name: name.clone(),
                byte_offset: (field_layout.offset_bits / 8) as usize,
                byte_size: (field_layout.size_bits / 8) as usize,
                byte_align: (field.ty.layout.field_alignment_bits / 8) as usize,
                kind: kind.clone(),
            });
        }

        log::trace!(
            "computed layout for {}: {} fields, {} bytes",
            type_id,
            descriptors.len(),
            computed.layout.size_bits / 8
        );

        StructLayout::new(
            type_id,
            descriptors,
            (computed.layout.size_bits / 8) as usize,
            (computed.layout.pointer_alignment_bits / 8) as usize,
        )
    }
}

fn repc_type(kind: &FieldKind) -> Type<()> {
    let builtin = match kind {
        FieldKind::Scalar(scalar) => match scalar {
            ScalarKind::I8 => BuiltinType::Char,
            ScalarKind::U8 | ScalarKind::Bool => BuiltinType::UnsignedChar,
            ScalarKind::I16 => BuiltinType::Short,
            ScalarKind::U16 => BuiltinType::UnsignedShort,
            ScalarKind::I32 => BuiltinType::Int,
            ScalarKind::U32 => BuiltinType::UnsignedInt,
            ScalarKind::I64 => BuiltinType::LongLong,
            ScalarKind::U64 => BuiltinType::UnsignedLongLong,
            ScalarKind::F32 => BuiltinType::Float,
            ScalarKind::F64 => BuiltinType::Double,
            ScalarKind::Pointer => BuiltinType::Pointer,
        },
        // Objects, blocks and collections are all `id`-sized pointers.
        _ => BuiltinType::Pointer,
    };
    Type {
        layout: (),
        annotations: vec![],
        variant: TypeVariant::Builtin(builtin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::CollectionKind;
    use std::mem::size_of;

    #[test]
    fn pads_small_scalars_before_pointers() {
        let computer = LayoutComputer::host().unwrap();
        let layout = computer
            .compute(
                "Padded".into(),
                &[
                    ("flag".to_string(), FieldKind::Scalar(ScalarKind::Bool)),
                    ("items".to_string(), FieldKind::CollectionRef(CollectionKind::Array)),
                    ("count".to_string(), FieldKind::Scalar(ScalarKind::I32)),
                ],
            )
            .unwrap();
        let ptr = size_of::<usize>();
        assert_eq!(layout.field("flag").unwrap().byte_offset, 0);
        assert_eq!(layout.field("items").unwrap().byte_offset, ptr);
        assert_eq!(layout.field("count").unwrap().byte_offset, 2 * ptr);
        assert_eq!(layout.size(), 3 * ptr);
        assert_eq!(layout.align(), ptr);
    }

    #[test]
    fn alignment_follows_the_widest_member() {
        let computer = LayoutComputer::host().unwrap();
        let small = computer
            .compute(
                "Small".into(),
                &[
                    ("a".to_string(), FieldKind::Scalar(ScalarKind::U8)),
                    ("b".to_string(), FieldKind::Scalar(ScalarKind::I16)),
                ],
            )
            .unwrap();
        assert_eq!(small.align(), 2);
        assert_eq!(small.size(), 4);

        let wide = computer
            .compute(
                "Wide".into(),
                &[
                    ("a".to_string(), FieldKind::Scalar(ScalarKind::I32)),
                    ("b".to_string(), FieldKind::Scalar(ScalarKind::F64)),
                ],
            )
            .unwrap();
        let double_align = std::mem::align_of::<f64>();
        assert_eq!(wide.align(), double_align);
        assert_eq!(wide.field("b").unwrap().byte_offset, double_align.max(4));
        assert_eq!(wide.field("b").unwrap().byte_align, double_align);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::{StructLayout, StructTypeId};
use crate::LayoutError;

/// The Field Descriptor Table: one immutable layout per struct type.
///
/// Built once from metadata and then shared (usually behind an `Arc`). Lookups
/// take `&self` and never lock, so any number of threads may describe types
/// concurrently.
#[derive(Debug, Default, Clone)]
pub struct LayoutTable {
    layouts: HashMap<StructTypeId, Arc<StructLayout>>,
}

impl LayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layout. Registering the same struct type twice is an error.
    pub fn register(&mut self, layout: StructLayout) -> Result<Arc<StructLayout>, LayoutError> {
        let type_id = layout.type_id().clone();
        if self.layouts.contains_key(&type_id) {
            return Err(LayoutError::DuplicateType(type_id));
        }
        log::debug!("registered layout {} ({} fields)", type_id, layout.fields().len());
        let layout = Arc::new(layout);
        self.layouts.insert(type_id, Arc::clone(&layout));
        Ok(layout)
    }

    /// Returns the layout registered for `type_id`.
    pub fn describe(&self, type_id: &StructTypeId) -> Result<Arc<StructLayout>, LayoutError> {
        self.layouts
            .get(type_id)
            .cloned()
            .ok_or_else(|| LayoutError::UnknownType(type_id.clone()))
    }

    /// Convenience lookup by C tag name.
    pub fn describe_named(&self, name: &str) -> Result<Arc<StructLayout>, LayoutError> {
        self.describe(&StructTypeId::new(name))
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// All registered layouts, sorted by type name.
    pub fn layouts(&self) -> Vec<Arc<StructLayout>> {
        let mut all: Vec<_> = self.layouts.values().cloned().collect();
        all.sort_by(|a, b| a.type_id().cmp(b.type_id()));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldDescriptor;
    use crate::kind::FieldKind;

    fn single(name: &str) -> StructLayout {
        StructLayout::new(
            StructTypeId::new(name),
            vec![FieldDescriptor::new("obj", 0, FieldKind::ObjectRef)],
            8,
            8,
        )
        .unwrap()
    }

    #[test]
    fn describe_is_deterministic() {
        let mut table = LayoutTable::new();
        table.register(single("A")).unwrap();
        let first = table.describe_named("A").unwrap();
        let second = table.describe_named("A").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_and_duplicate_types_fail() {
        let mut table = LayoutTable::new();
        table.register(single("A")).unwrap();
        assert!(matches!(table.describe_named("B"), Err(LayoutError::UnknownType(_))));
        assert!(matches!(table.register(single("A")), Err(LayoutError::DuplicateType(_))));
    }
}
